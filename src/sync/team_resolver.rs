//! Team-name resolution.
//!
//! External feeds spell clubs differently ("FC Porto", "Porto",
//! "Sporting CP", "Sporting Clube de Portugal"). Every candidate team is
//! scored by six methods; a method only counts when its raw score reaches
//! its own threshold, and its weighted score competes against every other
//! method and team. Pure and deterministic.

use serde::{Deserialize, Serialize};
use std::fmt;
use strsim::normalized_levenshtein;

use crate::db::models::Team;

/// Words dropped during normalization: legal forms, club affixes and
/// country-specific prefixes that vendors add or omit at will.
const AFFIXES: &[&str] = &[
    "fc", "cf", "afc", "sc", "ac", "as", "ss", "us", "cd", "ud", "sd", "ca", "rc", "rcd", "sv",
    "vfb", "vfl", "tsg", "fsv", "fk", "nk", "sk", "bk", "if", "ik", "club", "clube", "de", "calcio",
    "united", "utd", "real", "rugby", "1",
];

/// Resolution methods, in preference order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum MatchMethod {
    Exact,
    Alias,
    Fuzzy,
    Partial,
    TokenOverlap,
    Keyword,
}

impl MatchMethod {
    pub const CASCADE: [MatchMethod; 6] = [
        MatchMethod::Exact,
        MatchMethod::Alias,
        MatchMethod::Fuzzy,
        MatchMethod::Partial,
        MatchMethod::TokenOverlap,
        MatchMethod::Keyword,
    ];

    /// Minimum raw score for the method to count at all.
    pub fn threshold(self) -> f64 {
        match self {
            MatchMethod::Exact => 0.95,
            MatchMethod::Alias => 0.90,
            MatchMethod::Fuzzy => 0.70,
            MatchMethod::Partial => 0.60,
            MatchMethod::TokenOverlap => 0.50,
            MatchMethod::Keyword => 0.40,
        }
    }

    pub fn weight(self) -> f64 {
        match self {
            MatchMethod::Exact => 1.0,
            MatchMethod::Alias => 0.95,
            MatchMethod::Fuzzy => 0.90,
            MatchMethod::Partial => 0.80,
            MatchMethod::TokenOverlap => 0.70,
            MatchMethod::Keyword => 0.60,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            MatchMethod::Exact => "exact",
            MatchMethod::Alias => "alias",
            MatchMethod::Fuzzy => "fuzzy",
            MatchMethod::Partial => "partial",
            MatchMethod::TokenOverlap => "token_overlap",
            MatchMethod::Keyword => "keyword",
        }
    }
}

impl fmt::Display for MatchMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Best team found for an external name.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchCandidate<'a> {
    pub team: &'a Team,
    /// Weighted score in [0, 1]
    pub confidence: f64,
    pub method: MatchMethod,
}

/// Fold a character to its unaccented ASCII spelling where one exists.
fn fold_char(c: char, out: &mut String) {
    let folded = match c {
        'à' | 'á' | 'â' | 'ã' | 'ä' | 'å' | 'ā' | 'ą' | 'ă' => "a",
        'ç' | 'ć' | 'č' => "c",
        'ď' | 'đ' => "d",
        'è' | 'é' | 'ê' | 'ë' | 'ē' | 'ę' | 'ě' => "e",
        'ğ' => "g",
        'ì' | 'í' | 'î' | 'ï' | 'ı' | 'ī' => "i",
        'ł' | 'ľ' => "l",
        'ñ' | 'ń' | 'ň' => "n",
        'ò' | 'ó' | 'ô' | 'õ' | 'ö' | 'ø' | 'ō' | 'ő' => "o",
        'ř' => "r",
        'ś' | 'š' | 'ş' | 'ș' => "s",
        'ť' | 'ţ' | 'ț' => "t",
        'ù' | 'ú' | 'û' | 'ü' | 'ū' | 'ů' | 'ű' => "u",
        'ý' | 'ÿ' => "y",
        'ź' | 'ż' | 'ž' => "z",
        'ß' => "ss",
        'æ' => "ae",
        'œ' => "oe",
        'þ' => "th",
        _ => {
            out.push(c);
            return;
        }
    };
    out.push_str(folded);
}

/// Lowercase, strip diacritics and punctuation, collapse whitespace.
pub fn fold_text(text: &str) -> String {
    let mut folded = String::with_capacity(text.len());
    for c in text.chars().flat_map(char::to_lowercase) {
        fold_char(c, &mut folded);
    }

    let cleaned: String = folded
        .chars()
        .filter(|c| *c != '\'' && *c != '’')
        .map(|c| if c.is_alphanumeric() { c } else { ' ' })
        .collect();
    cleaned.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// [`fold_text`] plus removal of club affixes. Affixes are kept when
/// nothing else would remain.
pub fn normalize_name(name: &str) -> String {
    let cleaned = fold_text(name);
    let tokens: Vec<&str> = cleaned.split_whitespace().collect();
    let kept: Vec<&str> = tokens
        .iter()
        .copied()
        .filter(|t| !AFFIXES.contains(t))
        .collect();
    if kept.is_empty() {
        tokens.join(" ")
    } else {
        kept.join(" ")
    }
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

fn alias_score(external: &str, alias: &str) -> f64 {
    if external.is_empty() || alias.is_empty() {
        return 0.0;
    }
    let (shorter, longer) = if char_len(external) <= char_len(alias) {
        (external, alias)
    } else {
        (alias, external)
    };
    // Stubs such as "man" (from "Man Utd") are contained in too many names.
    if external == alias || (char_len(shorter) >= 4 && longer.contains(shorter)) {
        1.0
    } else {
        0.0
    }
}

fn partial_score(a: &str, b: &str) -> f64 {
    if a.is_empty() || b.is_empty() {
        return 0.0;
    }
    let (shorter, longer) = if char_len(a) <= char_len(b) { (a, b) } else { (b, a) };
    if longer.contains(shorter) {
        char_len(shorter) as f64 / char_len(longer) as f64
    } else {
        0.0
    }
}

fn token_overlap_score(external: &str, team: &str) -> f64 {
    let ext_words: Vec<&str> = external.split_whitespace().filter(|w| char_len(w) > 2).collect();
    let team_words: Vec<&str> = team.split_whitespace().filter(|w| char_len(w) > 2).collect();
    if ext_words.is_empty() || team_words.is_empty() {
        return 0.0;
    }
    let matched = ext_words
        .iter()
        .filter(|w| team_words.iter().any(|t| normalized_levenshtein(w, t) > 0.8))
        .count();
    matched as f64 / ext_words.len() as f64
}

fn keyword_score(external: &str, team: &str) -> f64 {
    let ext_tokens: Vec<&str> = external.split_whitespace().collect();
    let team_tokens: Vec<&str> = team.split_whitespace().collect();
    if ext_tokens.is_empty() || team_tokens.is_empty() {
        return 0.0;
    }
    let mut matched = 0usize;
    let mut long_hit = false;
    for e in &ext_tokens {
        if team_tokens.iter().any(|t| t.contains(e) || e.contains(t)) {
            matched += 1;
            long_hit |= char_len(e) >= 4;
        }
    }
    let raw = matched as f64 / ext_tokens.len() as f64;
    if long_hit {
        (raw * 1.2).min(1.0)
    } else {
        raw
    }
}

/// Raw score of one method for an already-normalized pair.
fn raw_score(method: MatchMethod, external: &str, team: &str, alias: Option<&str>) -> f64 {
    match method {
        MatchMethod::Exact => {
            if !external.is_empty() && external == team {
                1.0
            } else {
                0.0
            }
        }
        MatchMethod::Alias => alias.map(|a| alias_score(external, a)).unwrap_or(0.0),
        MatchMethod::Fuzzy => {
            if external.is_empty() || team.is_empty() {
                0.0
            } else {
                normalized_levenshtein(external, team)
            }
        }
        MatchMethod::Partial => partial_score(external, team),
        MatchMethod::TokenOverlap => token_overlap_score(external, team),
        MatchMethod::Keyword => keyword_score(external, team),
    }
}

/// Best weighted (confidence, method) for one team, if any method clears
/// its threshold.
pub fn score_team(external_name: &str, team: &Team) -> Option<(f64, MatchMethod)> {
    let external = normalize_name(external_name);
    score_normalized(&external, team)
}

fn score_normalized(external: &str, team: &Team) -> Option<(f64, MatchMethod)> {
    let name = normalize_name(&team.name);
    let alias = team.short_name.as_deref().map(normalize_name);

    let mut best: Option<(f64, MatchMethod)> = None;
    for method in MatchMethod::CASCADE {
        let raw = raw_score(method, external, &name, alias.as_deref());
        if raw < method.threshold() {
            continue;
        }
        let weighted = raw * method.weight();
        if best.map(|(score, _)| weighted > score).unwrap_or(true) {
            best = Some((weighted, method));
        }
    }
    best
}

/// Resolve an external team name against candidate teams.
///
/// Ties keep the earlier method in the cascade, then the lower team id, so
/// the result never depends on candidate order.
pub fn find_best_match<'a>(external_name: &str, candidates: &'a [Team]) -> Option<MatchCandidate<'a>> {
    let external = normalize_name(external_name);
    let mut best: Option<MatchCandidate<'a>> = None;
    for team in candidates {
        let Some((confidence, method)) = score_normalized(&external, team) else {
            continue;
        };
        let better = match &best {
            None => true,
            Some(b) => {
                confidence > b.confidence
                    || (confidence == b.confidence
                        && (method < b.method || (method == b.method && team.id < b.team.id)))
            }
        };
        if better {
            best = Some(MatchCandidate {
                team,
                confidence,
                method,
            });
        }
    }
    best
}

/// Raw name similarity used to orient a pairing when no method applies.
pub fn similarity(a: &str, b: &str) -> f64 {
    normalized_levenshtein(&normalize_name(a), &normalize_name(b))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::Sport;
    use approx::assert_relative_eq;

    fn team(id: i64, name: &str, short: Option<&str>) -> Team {
        Team {
            id,
            name: name.into(),
            short_name: short.map(Into::into),
            sport: Sport::Football,
        }
    }

    fn roster() -> Vec<Team> {
        vec![
            team(1, "Porto", None),
            team(2, "Sporting Clube de Portugal", Some("Sporting CP")),
            team(3, "Benfica", Some("SL Benfica")),
            team(4, "Manchester United", Some("Man Utd")),
            team(5, "Manchester City", Some("Man City")),
            team(6, "1. FC Köln", None),
        ]
    }

    #[test]
    fn test_normalize_strips_affixes_and_accents() {
        assert_eq!(normalize_name("FC Porto"), "porto");
        assert_eq!(normalize_name("  1. FC  Köln "), "koln");
        assert_eq!(normalize_name("Atlético Madrid"), "atletico madrid");
        assert_eq!(normalize_name("Real Madrid CF"), "madrid");
        assert_eq!(normalize_name("Newell's Old Boys"), "newells old boys");
        // Nothing but affixes: keep them.
        assert_eq!(normalize_name("Real"), "real");
    }

    #[test]
    fn test_exact_after_normalization() {
        let teams = roster();
        let m = find_best_match("FC Porto", &teams).unwrap();
        assert_eq!(m.team.id, 1);
        assert_eq!(m.method, MatchMethod::Exact);
        assert_relative_eq!(m.confidence, 1.0);

        let m = find_best_match("FC Köln", &teams).unwrap();
        assert_eq!(m.team.id, 6);
        assert_eq!(m.method, MatchMethod::Exact);
    }

    #[test]
    fn test_alias_match_clears_team_bar() {
        let teams = roster();
        let m = find_best_match("Sporting CP", &teams).unwrap();
        assert_eq!(m.team.id, 2);
        assert_eq!(m.method, MatchMethod::Alias);
        assert_relative_eq!(m.confidence, 0.95);
        assert!(m.confidence >= 0.90);
    }

    #[test]
    fn test_fuzzy_spelling_variant() {
        let teams = roster();
        let m = find_best_match("Benfika", &teams).unwrap();
        assert_eq!(m.team.id, 3);
        assert_eq!(m.method, MatchMethod::Fuzzy);
        // one edit over seven letters, weighted by 0.9
        assert_relative_eq!(m.confidence, (1.0 - 1.0 / 7.0) * 0.9, epsilon = 1e-9);
        assert!(m.confidence < 0.90);
    }

    #[test]
    fn test_manchester_clubs_stay_apart() {
        let teams = roster();
        assert_eq!(find_best_match("Man City", &teams).unwrap().team.id, 5);
        assert_eq!(find_best_match("Manchester City FC", &teams).unwrap().team.id, 5);
        assert_eq!(find_best_match("Manchester United", &teams).unwrap().team.id, 4);
        assert_eq!(find_best_match("Man Utd", &teams).unwrap().team.id, 4);
    }

    #[test]
    fn test_unrelated_name_has_no_candidate() {
        let teams = roster();
        assert!(find_best_match("Galatasaray", &teams).is_none());
        assert!(find_best_match("", &teams).is_none());
    }

    #[test]
    fn test_deterministic_regardless_of_order() {
        let teams = roster();
        let mut reversed = roster();
        reversed.reverse();
        for name in ["Porto", "Sporting", "Man", "Manchester", "Benfica Lisbon", "Koln"] {
            let a = find_best_match(name, &teams).map(|m| (m.team.id, m.method, m.confidence));
            let b = find_best_match(name, &reversed).map(|m| (m.team.id, m.method, m.confidence));
            assert_eq!(a, b, "{}", name);
            assert_eq!(a, find_best_match(name, &teams).map(|m| (m.team.id, m.method, m.confidence)));
        }
    }

    #[test]
    fn test_keyword_boost_is_capped() {
        assert_relative_eq!(keyword_score("benfica lisbon", "benfica"), 0.5 * 1.2);
        assert_relative_eq!(keyword_score("benfica", "benfica lisboa"), 1.0);
        assert_relative_eq!(keyword_score("ab", "xy"), 0.0);
    }

    #[test]
    fn test_token_overlap_ignores_short_words() {
        assert_relative_eq!(token_overlap_score("sporting portugal", "sporting portugal"), 1.0);
        assert_relative_eq!(token_overlap_score("st pauli", "pauli"), 1.0);
        assert_relative_eq!(token_overlap_score("go ahead eagles", "eagles"), 0.5);
    }
}
