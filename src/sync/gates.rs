//! Validation gates shared by the deterministic and the AI paths.

use chrono::{DateTime, Duration, Utc};
use strsim::normalized_levenshtein;

use super::settings::SyncSettings;
use super::team_resolver::{fold_text, score_team, similarity, MatchMethod};
use crate::db::models::{Game, Sport};
use crate::live_scores::ExternalMatch;

/// Competition keywords that only ever appear in rugby.
const RUGBY_KEYWORDS: &[&str] = &[
    "rugby",
    "top 14",
    "pro d2",
    "six nations",
    "6 nations",
    "premiership rugby",
    "rugby championship",
    "super rugby",
    "champions cup",
    "challenge cup",
    "urc",
    "united rugby championship",
    "pro14",
    "mitre 10",
    "currie cup",
];

/// Competition keywords that only ever appear in football.
const FOOTBALL_KEYWORDS: &[&str] = &[
    "premier league",
    "la liga",
    "laliga",
    "serie a",
    "bundesliga",
    "ligue 1",
    "ligue 2",
    "eredivisie",
    "primeira liga",
    "liga portugal",
    "champions league",
    "europa league",
    "conference league",
    "copa del rey",
    "fa cup",
    "efl",
    "mls",
    "copa libertadores",
    "world cup qualification",
];

/// Words too common across competitions to corroborate anything.
const GENERIC_COMPETITION_WORDS: &[&str] = &[
    "league", "liga", "ligue", "cup", "copa", "coupe", "division", "serie", "series", "championship",
    "trophy", "first", "second", "national", "the",
];

/// Absolute kickoff difference in whole minutes.
pub fn date_delta_minutes(kickoff: DateTime<Utc>, scheduled: DateTime<Utc>) -> i64 {
    (kickoff - scheduled).num_minutes().abs()
}

pub fn within_window(kickoff: DateTime<Utc>, scheduled: DateTime<Utc>, window: Duration) -> bool {
    (kickoff - scheduled).abs() <= window
}

fn contains_phrase(haystack: &str, phrase: &str) -> bool {
    format!(" {} ", haystack).contains(&format!(" {} ", phrase))
}

/// Whether a vendor competition name belongs to the other sport.
pub fn sport_conflict(competition: &str, sport: Sport) -> bool {
    let folded = fold_text(competition);
    if folded.is_empty() {
        return false;
    }
    let foreign = match sport {
        Sport::Football => RUGBY_KEYWORDS,
        Sport::Rugby => FOOTBALL_KEYWORDS,
    };
    foreign.iter().any(|k| contains_phrase(&folded, k))
}

fn significant_words(s: &str) -> Vec<&str> {
    s.split_whitespace()
        .filter(|w| w.chars().count() > 2 && !GENERIC_COMPETITION_WORDS.contains(w))
        .collect()
}

/// Corroboration between the vendor's competition name and ours. An empty
/// vendor name corroborates nothing.
pub fn competitions_consistent(external: &str, internal: &str) -> bool {
    let ext = fold_text(external);
    let int = fold_text(internal);
    if ext.is_empty() || int.is_empty() {
        return false;
    }
    if ext == int || ext.contains(&int) || int.contains(&ext) {
        return true;
    }
    if normalized_levenshtein(&ext, &int) >= 0.8 {
        return true;
    }
    let ext_words = significant_words(&ext);
    let int_words = significant_words(&int);
    if ext_words.is_empty() || int_words.is_empty() {
        return false;
    }
    let shared = ext_words
        .iter()
        .filter(|w| int_words.iter().any(|i| normalized_levenshtein(w, i) > 0.8))
        .count();
    shared as f64 / ext_words.len() as f64 >= 0.5
}

/// How the two vendor names map onto a game's teams.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Pairing {
    /// Vendor home team is our away team
    pub swapped: bool,
    /// Confidence of the vendor home name against its team
    pub home_confidence: f64,
    pub away_confidence: f64,
    /// `None` when the pairing came from an arbiter verdict
    pub home_method: Option<MatchMethod>,
    pub away_method: Option<MatchMethod>,
}

impl Pairing {
    pub fn confidence(&self) -> f64 {
        self.home_confidence.min(self.away_confidence)
    }
}

/// Resolve both vendor names against the two teams of one game, in either
/// orientation. Both sides must reach `bar`.
pub fn resolve_pairing(ext: &ExternalMatch, game: &Game, bar: f64) -> Option<Pairing> {
    let orient = |home_team, away_team, swapped| -> Option<Pairing> {
        let (hc, hm) = score_team(&ext.home_team, home_team)?;
        let (ac, am) = score_team(&ext.away_team, away_team)?;
        if hc < bar || ac < bar {
            return None;
        }
        Some(Pairing {
            swapped,
            home_confidence: hc,
            away_confidence: ac,
            home_method: Some(hm),
            away_method: Some(am),
        })
    };

    let straight = orient(&game.home, &game.away, false);
    let swapped = orient(&game.away, &game.home, true);
    match (straight, swapped) {
        (Some(s), Some(w)) if w.confidence() > s.confidence() => Some(w),
        (Some(s), _) => Some(s),
        (None, w) => w,
    }
}

/// Orientation for a pairing asserted by the arbiter, chosen by raw name
/// similarity. `confidence` becomes both side confidences unless the
/// verdict carried its own.
pub fn orient_by_similarity(
    ext: &ExternalMatch,
    game: &Game,
    confidence: f64,
    home_confidence: Option<f64>,
    away_confidence: Option<f64>,
) -> Pairing {
    let straight = similarity(&ext.home_team, &game.home.name)
        + similarity(&ext.away_team, &game.away.name);
    let crossed = similarity(&ext.home_team, &game.away.name)
        + similarity(&ext.away_team, &game.home.name);
    Pairing {
        swapped: crossed > straight,
        home_confidence: home_confidence.unwrap_or(confidence),
        away_confidence: away_confidence.unwrap_or(confidence),
        home_method: None,
        away_method: None,
    }
}

/// Outcome of the link-protection check.
#[derive(Debug, Clone, PartialEq)]
pub enum LinkCheck {
    /// No link, the same link, or a link cleared earlier this run
    Free,
    /// A different, stale link that this confidence may overwrite
    Overwrite { previous: String },
    /// A different link that must stay
    Protected { previous: String, reason: &'static str },
}

/// An existing link to another fixture is never overwritten while it is
/// fresh, and a stale one only at high confidence.
pub fn check_link(
    game: &Game,
    ext_id: &str,
    confidence: f64,
    cleared: bool,
    settings: &SyncSettings,
    now: DateTime<Utc>,
) -> LinkCheck {
    let previous = match &game.external_id {
        Some(id) if !cleared && id != ext_id => id.clone(),
        _ => return LinkCheck::Free,
    };
    let fresh = game
        .last_sync_at
        .map(|at| now - at <= settings.recent_sync_window)
        .unwrap_or(false);
    if fresh {
        LinkCheck::Protected {
            previous,
            reason: "linked fixture synced recently",
        }
    } else if confidence >= settings.thresholds.stale_link_override {
        LinkCheck::Overwrite { previous }
    } else {
        LinkCheck::Protected {
            previous,
            reason: "stale link needs higher confidence",
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::models::*;
    use crate::live_scores::tests::ext;
    use crate::live_scores::VendorPhase;
    use chrono::TimeZone;

    pub(crate) fn team(id: i64, name: &str, short: Option<&str>, sport: Sport) -> Team {
        Team {
            id,
            name: name.into(),
            short_name: short.map(Into::into),
            sport,
        }
    }

    /// LIVE Porto vs Sporting on 2024-05-12 18:00 UTC in the Primeira Liga.
    pub(crate) fn game(id: i64, home: Team, away: Team) -> Game {
        Game {
            id,
            competition: Competition {
                id: 1,
                name: "Primeira Liga".into(),
                sport: home.sport,
                scoring: ScoringSystem::default(),
            },
            home,
            away,
            scheduled_at: Utc.with_ymd_and_hms(2024, 5, 12, 18, 0, 0).unwrap(),
            status: GameStatus::Live,
            external_id: None,
            external_status: None,
            live_score: None,
            final_score: None,
            elapsed: None,
            decided_by: None,
            finish_source: None,
            finished_at: None,
            last_sync_at: None,
        }
    }

    pub(crate) fn porto_sporting(id: i64) -> Game {
        game(
            id,
            team(1, "Porto", None, Sport::Football),
            team(2, "Sporting Clube de Portugal", Some("Sporting CP"), Sport::Football),
        )
    }

    #[test]
    fn test_date_window() {
        let a = Utc.with_ymd_and_hms(2024, 5, 12, 18, 0, 0).unwrap();
        let b = a + Duration::minutes(45);
        assert_eq!(date_delta_minutes(a, b), 45);
        assert_eq!(date_delta_minutes(b, a), 45);
        assert!(within_window(b, a, Duration::hours(1)));
        assert!(!within_window(b, a, Duration::minutes(30)));
        assert!(within_window(a - Duration::days(7), a, Duration::days(7)));
    }

    #[test]
    fn test_cross_sport_keywords() {
        assert!(sport_conflict("Top 14", Sport::Football));
        assert!(sport_conflict("Six Nations", Sport::Football));
        assert!(sport_conflict("URC", Sport::Football));
        assert!(!sport_conflict("Primeira Liga", Sport::Football));
        assert!(!sport_conflict("", Sport::Football));
        assert!(sport_conflict("Premier League", Sport::Rugby));
        assert!(sport_conflict("UEFA Champions League", Sport::Rugby));
        assert!(!sport_conflict("Premiership Rugby", Sport::Rugby));
        assert!(!sport_conflict("Investec Champions Cup", Sport::Rugby));
        // whole words only
        assert!(!sport_conflict("Turcja Liga", Sport::Football));
    }

    #[test]
    fn test_competition_consistency() {
        assert!(competitions_consistent("Primeira Liga", "Primeira Liga"));
        assert!(competitions_consistent("UEFA Champions League", "Champions League"));
        assert!(competitions_consistent("Liga Portugal Betclic", "Liga Portugal"));
        assert!(competitions_consistent("Premier Leage", "Premier League"));
        assert!(!competitions_consistent("Premier League", "Champions League"));
        assert!(!competitions_consistent("", "Primeira Liga"));
        assert!(!competitions_consistent("Top 14", "Primeira Liga"));
    }

    #[test]
    fn test_pairing_either_orientation() {
        let g = porto_sporting(10);
        let straight = ext("1", "FC Porto", "Sporting CP", VendorPhase::InPlay);
        let p = resolve_pairing(&straight, &g, 0.90).unwrap();
        assert!(!p.swapped);
        assert_eq!(p.home_method, Some(MatchMethod::Exact));
        assert_eq!(p.away_method, Some(MatchMethod::Alias));

        let crossed = ext("1", "Sporting CP", "FC Porto", VendorPhase::InPlay);
        assert!(resolve_pairing(&crossed, &g, 0.90).unwrap().swapped);

        let wrong = ext("1", "Benfica", "Braga", VendorPhase::InPlay);
        assert!(resolve_pairing(&wrong, &g, 0.90).is_none());

        let half = ext("1", "FC Porto", "Braga", VendorPhase::InPlay);
        assert!(resolve_pairing(&half, &g, 0.90).is_none());
    }

    #[test]
    fn test_similarity_orientation() {
        let g = porto_sporting(10);
        let crossed = ext("1", "Sporting", "Porto", VendorPhase::InPlay);
        let p = orient_by_similarity(&crossed, &g, 0.97, None, Some(0.92));
        assert!(p.swapped);
        assert_eq!(p.home_confidence, 0.97);
        assert_eq!(p.away_confidence, 0.92);
        assert_eq!(p.confidence(), 0.92);
    }

    #[test]
    fn test_link_protection() {
        let now = Utc.with_ymd_and_hms(2024, 5, 12, 19, 0, 0).unwrap();
        let settings = SyncSettings::default();
        let mut g = porto_sporting(10);

        assert_eq!(check_link(&g, "42", 0.5, false, &settings, now), LinkCheck::Free);

        g.external_id = Some("42".into());
        g.last_sync_at = Some(now - Duration::minutes(2));
        assert_eq!(check_link(&g, "42", 0.5, false, &settings, now), LinkCheck::Free);
        assert!(matches!(
            check_link(&g, "77", 0.99, false, &settings, now),
            LinkCheck::Protected { .. }
        ));
        assert_eq!(check_link(&g, "77", 0.5, true, &settings, now), LinkCheck::Free);

        g.last_sync_at = Some(now - Duration::hours(2));
        assert!(matches!(
            check_link(&g, "77", 0.90, false, &settings, now),
            LinkCheck::Protected { .. }
        ));
        assert_eq!(
            check_link(&g, "77", 0.96, false, &settings, now),
            LinkCheck::Overwrite {
                previous: "42".into()
            }
        );
    }
}
