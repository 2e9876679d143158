//! Match reconciliation: one external batch against the tracked games.
//!
//! Each record climbs a cascade: direct external-id lookup, validation of
//! that id, then team-name fallback. Whatever none of them can pin down is
//! queued for arbitration. Every accepted pairing marks its game in the
//! [`RunLedger`], so no game is written twice in one pass.
//!
//! Pure: reads nothing but its arguments and writes nothing but its result.

use chrono::{DateTime, Utc};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::fmt;
use tracing::{debug, info, warn};

use super::gates::{
    check_link, date_delta_minutes, resolve_pairing, sport_conflict, within_window, LinkCheck,
    Pairing,
};
use super::settings::SyncSettings;
use super::team_resolver::{find_best_match, MatchCandidate, MatchMethod};
use super::transition::plan_update;
use crate::db::models::{AuditEntry, FinishSource, Game, GameStatus, GameUpdate, LinkReset, Sport, Team};
use crate::live_scores::ExternalMatch;

/// Games already handled in the current pass.
#[derive(Debug, Clone, Default)]
pub struct RunLedger {
    matched: BTreeSet<i64>,
}

impl RunLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, game_id: i64) -> bool {
        self.matched.contains(&game_id)
    }

    /// Returns false when the game was already marked.
    pub fn mark(&mut self, game_id: i64) -> bool {
        self.matched.insert(game_id)
    }

    pub fn is_empty(&self) -> bool {
        self.matched.is_empty()
    }
}

/// Gate that refused a record or one of its changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Gate {
    /// Another record already matched this game in this pass
    AlreadyMatched,
    /// Linked game's teams do not match the record's names
    IdTeams,
    /// Linked game's kickoff is outside the match window
    IdDateWindow,
    /// Competition name belongs to the other sport
    SportConflict,
    /// A team name did not resolve above the team bar
    TeamUnresolved,
    /// Zero or several tracked games hold both teams
    NoUniqueGame,
    /// The only game holding both teams is outside the match window
    DateWindow,
    /// The game is linked to another fixture that must be kept
    LinkConflict,
    /// FINISHED refused; other fields still applied
    FinishGate,
    /// Status would move backwards; other fields still applied
    StatusRegression,
    /// Arbiter picked a game that was not offered
    AiUnoffered,
    /// Arbiter confidence below the tier bar
    AiConfidence,
}

impl Gate {
    pub fn as_str(&self) -> &'static str {
        match self {
            Gate::AlreadyMatched => "ALREADY_MATCHED",
            Gate::IdTeams => "ID_TEAMS",
            Gate::IdDateWindow => "ID_DATE_WINDOW",
            Gate::SportConflict => "SPORT_CONFLICT",
            Gate::TeamUnresolved => "TEAM_UNRESOLVED",
            Gate::NoUniqueGame => "NO_UNIQUE_GAME",
            Gate::DateWindow => "DATE_WINDOW",
            Gate::LinkConflict => "LINK_CONFLICT",
            Gate::FinishGate => "FINISH_GATE",
            Gate::StatusRegression => "STATUS_REGRESSION",
            Gate::AiUnoffered => "AI_UNOFFERED",
            Gate::AiConfidence => "AI_CONFIDENCE",
        }
    }
}

impl fmt::Display for Gate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Rejection {
    pub source: String,
    pub external_id: String,
    pub game_id: Option<i64>,
    pub gate: Gate,
    pub confidence: Option<f64>,
    pub date_delta_minutes: Option<i64>,
    pub detail: String,
}

impl Rejection {
    pub(crate) fn new(ext: &ExternalMatch, gate: Gate, detail: impl Into<String>) -> Self {
        Rejection {
            source: ext.source.clone(),
            external_id: ext.id.clone(),
            game_id: None,
            gate,
            confidence: None,
            date_delta_minutes: None,
            detail: detail.into(),
        }
    }

    pub(crate) fn on_game(mut self, game: &Game, ext: &ExternalMatch) -> Self {
        self.game_id = Some(game.id);
        self.date_delta_minutes = Some(date_delta_minutes(ext.kickoff, game.scheduled_at));
        self
    }

    pub(crate) fn with_confidence(mut self, confidence: f64) -> Self {
        self.confidence = Some(confidence);
        self
    }

    pub fn audit(&self, run_id: &str) -> AuditEntry {
        AuditEntry {
            run_id: run_id.to_string(),
            source: self.source.clone(),
            external_id: self.external_id.clone(),
            game_id: self.game_id,
            gate: self.gate.as_str().to_string(),
            detail: self.detail.clone(),
            confidence: self.confidence,
            date_delta_minutes: self.date_delta_minutes,
        }
    }
}

/// Which step of the cascade produced a pairing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchPath {
    Id,
    Name,
    Ai,
}

impl MatchPath {
    pub fn as_str(&self) -> &'static str {
        match self {
            MatchPath::Id => "id",
            MatchPath::Name => "name",
            MatchPath::Ai => "ai",
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Evidence {
    pub path: MatchPath,
    pub pairing: Pairing,
    pub date_delta_minutes: i64,
}

/// A validated change ready to be written.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedUpdate {
    pub update: GameUpdate,
    pub source: String,
    pub external_id: String,
    pub evidence: Evidence,
}

impl PlannedUpdate {
    pub fn audit(&self, run_id: &str) -> AuditEntry {
        let method = |m: Option<MatchMethod>| m.map(|m| m.as_str()).unwrap_or("verdict");
        AuditEntry {
            run_id: run_id.to_string(),
            source: self.source.clone(),
            external_id: self.external_id.clone(),
            game_id: Some(self.update.game_id),
            gate: "ACCEPTED".to_string(),
            detail: format!(
                "path={} home={} away={}{} -> {}",
                self.evidence.path.as_str(),
                method(self.evidence.pairing.home_method),
                method(self.evidence.pairing.away_method),
                if self.evidence.pairing.swapped { " swapped" } else { "" },
                self.update.status
            ),
            confidence: Some(self.evidence.pairing.confidence()),
            date_delta_minutes: Some(self.evidence.date_delta_minutes),
        }
    }
}

/// A record no deterministic step could pair, with the games an arbiter
/// may choose from.
#[derive(Debug, Clone, PartialEq)]
pub struct Unresolved {
    pub ext: ExternalMatch,
    pub candidates: Vec<i64>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ReconcileOutcome {
    pub updates: Vec<PlannedUpdate>,
    pub resets: Vec<LinkReset>,
    pub rejections: Vec<Rejection>,
    pub unresolved: Vec<Unresolved>,
    /// Final games a record paired with; left alone
    pub skipped: Vec<i64>,
    /// Games whose pairing this pass reported full time but failed the
    /// finish gate; still open to the auto-finish sweep
    pub finish_refused: Vec<i64>,
}

impl ReconcileOutcome {
    /// Whether a reset for this game was planned earlier in the pass.
    pub fn link_cleared(&self, game_id: i64) -> bool {
        self.resets.iter().any(|r| r.game_id == game_id)
    }

    pub(crate) fn reject(&mut self, rejection: Rejection) {
        warn!(
            "[{}] {} rejected at {} (game {:?}, confidence {:?}, delta {:?} min): {}",
            rejection.source,
            rejection.external_id,
            rejection.gate,
            rejection.game_id,
            rejection.confidence.map(|c| (c * 100.0).round() / 100.0),
            rejection.date_delta_minutes,
            rejection.detail
        );
        self.rejections.push(rejection);
    }
}

/// Record a validated pairing: mark the game, plan its transition and keep
/// the update when it changes anything.
pub(crate) fn accept_pairing(
    out: &mut ReconcileOutcome,
    ledger: &mut RunLedger,
    game: &Game,
    ext: &ExternalMatch,
    pairing: Pairing,
    path: MatchPath,
    settings: &SyncSettings,
    now: DateTime<Utc>,
) {
    ledger.mark(game.id);
    if game.is_terminal() {
        debug!("{} is final; {} left alone", game.label(), ext.key());
        out.skipped.push(game.id);
        return;
    }

    let delta = date_delta_minutes(ext.kickoff, game.scheduled_at);
    let transition = plan_update(game, ext, &pairing, settings, now);
    if transition.rejected.iter().any(|f| f.gate == Gate::FinishGate) {
        out.finish_refused.push(game.id);
    }
    for field in transition.rejected {
        out.reject(
            Rejection::new(ext, field.gate, field.detail)
                .on_game(game, ext)
                .with_confidence(pairing.confidence()),
        );
    }

    if !transition.update.changes(game) && !out.link_cleared(game.id) {
        debug!("{} unchanged by {}", game.label(), ext.key());
        return;
    }
    debug!(
        "{} paired with {} via {} ({:.2})",
        game.label(),
        ext.key(),
        path.as_str(),
        pairing.confidence()
    );
    out.updates.push(PlannedUpdate {
        update: transition.update,
        source: ext.source.clone(),
        external_id: ext.id.clone(),
        evidence: Evidence {
            path,
            pairing,
            date_delta_minutes: delta,
        },
    });
}

struct Pass<'a> {
    games: &'a [Game],
    pools: HashMap<Sport, Vec<Team>>,
    settings: &'a SyncSettings,
    now: DateTime<Utc>,
    ledger: &'a mut RunLedger,
    out: ReconcileOutcome,
}

impl<'a> Pass<'a> {
    fn process(&mut self, ext: &ExternalMatch) {
        let games = self.games;
        let linked: Vec<&'a Game> = games
            .iter()
            .filter(|g| {
                g.sport() == ext.sport
                    && g.external_id.as_deref() == Some(ext.id.as_str())
                    && !self.out.link_cleared(g.id)
            })
            .collect();

        if let Some(first) = linked.first() {
            let Some(game) = linked.iter().copied().find(|g| !self.ledger.contains(g.id)) else {
                self.out.reject(
                    Rejection::new(ext, Gate::AlreadyMatched, "duplicate record for a matched game")
                        .on_game(first, ext),
                );
                return;
            };
            match self.validate_id(ext, game) {
                Ok(pairing) => {
                    self.accept(game, ext, pairing, MatchPath::Id);
                    return;
                }
                Err(rejection) => {
                    self.out.reject(rejection);
                    self.clear_link(game);
                }
            }
        }

        self.name_fallback(ext);
    }

    fn validate_id(&self, ext: &ExternalMatch, game: &Game) -> Result<Pairing, Rejection> {
        let bar = self.settings.thresholds.team_match;
        let Some(pairing) = resolve_pairing(ext, game, bar) else {
            return Err(Rejection::new(
                ext,
                Gate::IdTeams,
                format!(
                    "'{}' vs '{}' is not {} vs {}",
                    ext.home_team, ext.away_team, game.home.name, game.away.name
                ),
            )
            .on_game(game, ext));
        };
        if sport_conflict(&ext.competition, game.sport()) {
            return Err(Rejection::new(
                ext,
                Gate::SportConflict,
                format!("'{}' is not a {} competition", ext.competition, game.sport()),
            )
            .on_game(game, ext)
            .with_confidence(pairing.confidence()));
        }
        if !within_window(ext.kickoff, game.scheduled_at, self.settings.match_window) {
            return Err(Rejection::new(ext, Gate::IdDateWindow, "kickoff outside match window")
                .on_game(game, ext)
                .with_confidence(pairing.confidence()));
        }
        Ok(pairing)
    }

    /// Plan removal of a stale link; undo a vendor finish it caused while
    /// that is still recent.
    fn clear_link(&mut self, game: &Game) {
        let rollback_finish = self.settings.rollback_wrong_finishes
            && game.status == GameStatus::Finished
            && game.finish_source == Some(FinishSource::Vendor)
            && game
                .finished_at
                .map(|at| self.now - at <= self.settings.rollback_window)
                .unwrap_or(false);
        if rollback_finish {
            warn!(
                "{}: finish caused by stale link {:?} will be rolled back",
                game.label(),
                game.external_id
            );
            self.ledger.mark(game.id);
        } else {
            info!("{}: clearing stale link {:?}", game.label(), game.external_id);
        }
        self.out.resets.push(LinkReset {
            game_id: game.id,
            rollback_finish,
        });
    }

    fn name_fallback(&mut self, ext: &ExternalMatch) {
        let bar = self.settings.thresholds.team_match;
        let pool = self.pools.get(&ext.sport).map(Vec::as_slice).unwrap_or(&[]);
        let home = find_best_match(&ext.home_team, pool);
        let away = find_best_match(&ext.away_team, pool);

        let (home, away) = match (home, away) {
            (Some(h), Some(a)) if h.confidence >= bar && a.confidence >= bar && h.team.id != a.team.id => {
                (h, a)
            }
            (h, a) => {
                let weakest = match (h, a) {
                    (Some(h), Some(a)) => Some(h.confidence.min(a.confidence)),
                    (Some(c), None) | (None, Some(c)) => Some(c.confidence),
                    (None, None) => None,
                };
                let mut rejection = Rejection::new(
                    ext,
                    Gate::TeamUnresolved,
                    format!("{}; {}", describe(&ext.home_team, h), describe(&ext.away_team, a)),
                );
                rejection.confidence = weakest;
                self.out.reject(rejection);
                self.queue(ext);
                return;
            }
        };
        let (home_id, away_id) = (home.team.id, away.team.id);

        let games = self.games;
        let holding: Vec<&'a Game> = games
            .iter()
            .filter(|g| {
                g.sport() == ext.sport
                    && g.has_team(home_id)
                    && g.has_team(away_id)
                    && !self.ledger.contains(g.id)
            })
            .collect();
        let in_window: Vec<&'a Game> = holding
            .iter()
            .copied()
            .filter(|g| within_window(ext.kickoff, g.scheduled_at, self.settings.match_window))
            .collect();
        let confidence = home.confidence.min(away.confidence);

        let game = match in_window.as_slice() {
            [game] => *game,
            [] if !holding.is_empty() => {
                let nearest = holding
                    .iter()
                    .min_by_key(|g| date_delta_minutes(ext.kickoff, g.scheduled_at))
                    .copied();
                let mut rejection = Rejection::new(ext, Gate::DateWindow, "no game with both teams in match window")
                    .with_confidence(confidence);
                if let Some(g) = nearest {
                    rejection = rejection.on_game(g, ext);
                }
                self.out.reject(rejection);
                self.queue(ext);
                return;
            }
            many => {
                self.out.reject(
                    Rejection::new(
                        ext,
                        Gate::NoUniqueGame,
                        format!("{} tracked game(s) hold {} and {}", many.len(), home.team.name, away.team.name),
                    )
                    .with_confidence(confidence),
                );
                self.queue(ext);
                return;
            }
        };

        if sport_conflict(&ext.competition, game.sport()) {
            self.out.reject(
                Rejection::new(
                    ext,
                    Gate::SportConflict,
                    format!("'{}' is not a {} competition", ext.competition, game.sport()),
                )
                .on_game(game, ext)
                .with_confidence(confidence),
            );
            return;
        }

        let cleared = self.out.link_cleared(game.id);
        match check_link(game, &ext.id, confidence, cleared, self.settings, self.now) {
            LinkCheck::Free => {}
            LinkCheck::Overwrite { previous } => {
                info!("{}: replacing stale link {} with {}", game.label(), previous, ext.id);
            }
            LinkCheck::Protected { previous, reason } => {
                self.out.reject(
                    Rejection::new(ext, Gate::LinkConflict, format!("linked to {}: {}", previous, reason))
                        .on_game(game, ext)
                        .with_confidence(confidence),
                );
                return;
            }
        }

        let pairing = Pairing {
            swapped: game.home.id != home_id,
            home_confidence: home.confidence,
            away_confidence: away.confidence,
            home_method: Some(home.method),
            away_method: Some(away.method),
        };
        self.accept(game, ext, pairing, MatchPath::Name);
    }

    /// Queue a record for arbitration with the open games around its kickoff.
    fn queue(&mut self, ext: &ExternalMatch) {
        let games = self.games;
        let mut nearby: Vec<&Game> = games
            .iter()
            .filter(|g| {
                g.sport() == ext.sport
                    && !g.is_terminal()
                    && !self.ledger.contains(g.id)
                    && within_window(ext.kickoff, g.scheduled_at, self.settings.match_window)
            })
            .collect();
        nearby.sort_by_key(|g| (date_delta_minutes(ext.kickoff, g.scheduled_at), g.id));
        nearby.truncate(self.settings.ai_max_candidates);
        let candidates = nearby.iter().map(|g| g.id).collect();
        self.out.unresolved.push(Unresolved {
            ext: ext.clone(),
            candidates,
        });
    }

    fn accept(&mut self, game: &Game, ext: &ExternalMatch, pairing: Pairing, path: MatchPath) {
        accept_pairing(
            &mut self.out,
            self.ledger,
            game,
            ext,
            pairing,
            path,
            self.settings,
            self.now,
        );
    }
}

fn describe(name: &str, candidate: Option<MatchCandidate<'_>>) -> String {
    match candidate {
        Some(c) => format!(
            "'{}' ~ '{}' {:.2} ({})",
            name, c.team.name, c.confidence, c.method
        ),
        None => format!("'{}' unresolved", name),
    }
}

/// Team pools per sport: the roster plus any team of a tracked game the
/// roster lacks.
fn team_pools(games: &[Game], roster: &[Team]) -> HashMap<Sport, Vec<Team>> {
    let mut pools: HashMap<Sport, Vec<Team>> = HashMap::new();
    let mut seen = HashSet::new();
    let from_games = games.iter().flat_map(|g| [&g.home, &g.away]);
    for team in roster.iter().chain(from_games) {
        if seen.insert(team.id) {
            pools.entry(team.sport).or_default().push(team.clone());
        }
    }
    for pool in pools.values_mut() {
        pool.sort_by_key(|t| t.id);
    }
    pools
}

/// Reconcile one external batch against the tracked games.
///
/// Records are processed in batch order; `ledger` carries the games matched
/// so far and is left holding every game this pass touched.
pub fn reconcile(
    batch: &[ExternalMatch],
    games: &[Game],
    roster: &[Team],
    settings: &SyncSettings,
    now: DateTime<Utc>,
    ledger: &mut RunLedger,
) -> ReconcileOutcome {
    let mut pass = Pass {
        games,
        pools: team_pools(games, roster),
        settings,
        now,
        ledger,
        out: ReconcileOutcome::default(),
    };
    for ext in batch {
        if !settings.sports.contains(&ext.sport) {
            debug!("{} skipped: {} disabled", ext.key(), ext.sport);
            continue;
        }
        pass.process(ext);
    }
    pass.out
}
