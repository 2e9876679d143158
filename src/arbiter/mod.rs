//! Semantic fallback for records the deterministic cascade could not pair.
//!
//! One batched request per run. Verdicts are untrusted input: each one is
//! re-checked here against the candidates offered, the confidence bar of
//! the action it would trigger, the date window and link protection.

pub mod client;

pub use client::LlmArbiter;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::db::models::{Game, Sport};
use crate::live_scores::MatchStatus;
use crate::sync::gates::{check_link, orient_by_similarity, sport_conflict, within_window, LinkCheck};
use crate::sync::reconciler::{
    accept_pairing, Gate, MatchPath, ReconcileOutcome, Rejection, RunLedger, Unresolved,
};
use crate::sync::settings::{RiskTier, SyncSettings};

#[derive(Error, Debug)]
pub enum ArbiterError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),

    #[error("API error: {0}")]
    ApiError(String),

    #[error("Failed to parse response: {0}")]
    ParseError(String),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateGame {
    pub game_id: i64,
    pub home: String,
    pub away: String,
    pub kickoff: DateTime<Utc>,
    pub competition: String,
}

/// One unresolved vendor record with the games it may belong to.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ArbitrationRequest {
    /// `source:id` of the vendor record
    pub key: String,
    pub sport: Sport,
    pub external_home: String,
    pub external_away: String,
    pub kickoff: DateTime<Utc>,
    pub competition: String,
    pub candidates: Vec<CandidateGame>,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct ArbitrationVerdict {
    pub key: String,
    /// `None` when no candidate fits
    #[serde(default)]
    pub game_id: Option<i64>,
    #[serde(default)]
    pub confidence: f64,
    #[serde(default)]
    pub home_confidence: Option<f64>,
    #[serde(default)]
    pub away_confidence: Option<f64>,
}

/// External semantic matcher.
#[async_trait]
pub trait Arbiter: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    async fn arbitrate(
        &self,
        requests: &[ArbitrationRequest],
    ) -> Result<Vec<ArbitrationVerdict>, ArbiterError>;
}

/// Requests for every unresolved record that has at least one candidate.
pub fn build_requests(unresolved: &[Unresolved], games: &[Game]) -> Vec<ArbitrationRequest> {
    unresolved
        .iter()
        .filter_map(|u| {
            let candidates: Vec<CandidateGame> = u
                .candidates
                .iter()
                .filter_map(|id| games.iter().find(|g| g.id == *id))
                .map(|g| CandidateGame {
                    game_id: g.id,
                    home: g.home.name.clone(),
                    away: g.away.name.clone(),
                    kickoff: g.scheduled_at,
                    competition: g.competition.name.clone(),
                })
                .collect();
            if candidates.is_empty() {
                return None;
            }
            Some(ArbitrationRequest {
                key: u.ext.key(),
                sport: u.ext.sport,
                external_home: u.ext.home_team.clone(),
                external_away: u.ext.away_team.clone(),
                kickoff: u.ext.kickoff,
                competition: u.ext.competition.clone(),
                candidates,
            })
        })
        .collect()
}

fn tier_for(status: MatchStatus) -> RiskTier {
    match status {
        MatchStatus::Finished => RiskTier::PromoteFinished,
        MatchStatus::Live => RiskTier::UpdateLive,
        MatchStatus::Upcoming | MatchStatus::Cancelled => RiskTier::AttachId,
    }
}

fn valid_confidence(c: f64) -> bool {
    c.is_finite() && (0.0..=1.0).contains(&c)
}

/// Gate arbiter verdicts and turn the survivors into planned updates on
/// `out`. Returns how many verdicts were accepted.
pub fn accept_verdicts(
    unresolved: &[Unresolved],
    verdicts: &[ArbitrationVerdict],
    games: &[Game],
    settings: &SyncSettings,
    now: DateTime<Utc>,
    ledger: &mut RunLedger,
    out: &mut ReconcileOutcome,
) -> usize {
    let mut accepted = 0;
    for u in unresolved {
        let ext = &u.ext;
        let key = ext.key();
        let Some(verdict) = verdicts.iter().find(|v| v.key == key) else {
            continue;
        };
        let Some(game_id) = verdict.game_id else {
            debug!("Arbiter found no game for {}", key);
            continue;
        };

        let offered = u.candidates.contains(&game_id);
        let Some(game) = games.iter().find(|g| g.id == game_id).filter(|_| offered) else {
            out.reject(
                Rejection::new(ext, Gate::AiUnoffered, format!("verdict names game {}", game_id))
                    .with_confidence(verdict.confidence),
            );
            continue;
        };
        if ledger.contains(game.id) {
            out.reject(
                Rejection::new(ext, Gate::AlreadyMatched, "arbiter picked a matched game")
                    .on_game(game, ext)
                    .with_confidence(verdict.confidence),
            );
            continue;
        }

        let tier = tier_for(ext.status());
        let bar = settings.thresholds.bar(tier);
        let sides = [verdict.home_confidence, verdict.away_confidence];
        let confident = valid_confidence(verdict.confidence)
            && verdict.confidence >= bar
            && sides
                .iter()
                .flatten()
                .all(|c| valid_confidence(*c) && *c >= bar);
        if !confident {
            out.reject(
                Rejection::new(ext, Gate::AiConfidence, format!("{:?} needs {:.2}", tier, bar))
                    .on_game(game, ext)
                    .with_confidence(verdict.confidence),
            );
            continue;
        }

        if !within_window(ext.kickoff, game.scheduled_at, settings.match_window) {
            out.reject(
                Rejection::new(ext, Gate::DateWindow, "kickoff outside match window")
                    .on_game(game, ext)
                    .with_confidence(verdict.confidence),
            );
            continue;
        }
        if sport_conflict(&ext.competition, game.sport()) {
            out.reject(
                Rejection::new(
                    ext,
                    Gate::SportConflict,
                    format!("'{}' is not a {} competition", ext.competition, game.sport()),
                )
                .on_game(game, ext)
                .with_confidence(verdict.confidence),
            );
            continue;
        }

        let cleared = out.link_cleared(game.id);
        match check_link(game, &ext.id, verdict.confidence, cleared, settings, now) {
            LinkCheck::Free => {}
            LinkCheck::Overwrite { previous } => {
                info!("{}: arbiter replaces stale link {} with {}", game.label(), previous, ext.id);
            }
            LinkCheck::Protected { previous, reason } => {
                out.reject(
                    Rejection::new(ext, Gate::LinkConflict, format!("linked to {}: {}", previous, reason))
                        .on_game(game, ext)
                        .with_confidence(verdict.confidence),
                );
                continue;
            }
        }

        let pairing = orient_by_similarity(
            ext,
            game,
            verdict.confidence,
            verdict.home_confidence,
            verdict.away_confidence,
        );
        accept_pairing(out, ledger, game, ext, pairing, MatchPath::Ai, settings, now);
        accepted += 1;
    }
    accepted
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::models::{DecidedBy, GameStatus, ScorePair};
    use crate::live_scores::tests::ext;
    use crate::live_scores::VendorPhase;
    use crate::sync::gates::tests::porto_sporting;
    use chrono::{Duration, TimeZone};
    use std::sync::Mutex;

    /// Arbiter answering from a fixed verdict list and recording requests.
    pub(crate) struct FakeArbiter {
        pub verdicts: Vec<ArbitrationVerdict>,
        pub calls: Mutex<Vec<Vec<ArbitrationRequest>>>,
    }

    impl FakeArbiter {
        pub(crate) fn new(verdicts: Vec<ArbitrationVerdict>) -> Self {
            FakeArbiter {
                verdicts,
                calls: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl Arbiter for FakeArbiter {
        fn name(&self) -> &str {
            "fake"
        }

        async fn arbitrate(
            &self,
            requests: &[ArbitrationRequest],
        ) -> Result<Vec<ArbitrationVerdict>, ArbiterError> {
            self.calls.lock().unwrap().push(requests.to_vec());
            Ok(self.verdicts.clone())
        }
    }

    pub(crate) fn verdict(key: &str, game_id: Option<i64>, confidence: f64) -> ArbitrationVerdict {
        ArbitrationVerdict {
            key: key.into(),
            game_id,
            confidence,
            home_confidence: None,
            away_confidence: None,
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 12, 19, 0, 0).unwrap()
    }

    fn unresolved(phase: VendorPhase, candidates: Vec<i64>) -> Unresolved {
        Unresolved {
            ext: ext("42", "Dragões", "Leões", phase),
            candidates,
        }
    }

    fn gate(
        u: &Unresolved,
        v: ArbitrationVerdict,
        games: &[Game],
    ) -> (usize, ReconcileOutcome, RunLedger) {
        let mut ledger = RunLedger::new();
        let mut out = ReconcileOutcome::default();
        let n = accept_verdicts(
            std::slice::from_ref(u),
            &[v],
            games,
            &SyncSettings::default(),
            now(),
            &mut ledger,
            &mut out,
        );
        (n, out, ledger)
    }

    #[test]
    fn test_requests_skip_records_without_candidates() {
        let games = vec![porto_sporting(10)];
        let reqs = build_requests(
            &[
                unresolved(VendorPhase::InPlay, vec![10]),
                unresolved(VendorPhase::InPlay, vec![]),
            ],
            &games,
        );
        assert_eq!(reqs.len(), 1);
        assert_eq!(reqs[0].key, "test:42");
        assert_eq!(reqs[0].candidates[0].home, "Porto");
    }

    #[test]
    fn test_live_verdict_accepted_at_update_bar() {
        let games = vec![porto_sporting(10)];
        let u = unresolved(VendorPhase::InPlay, vec![10]);
        let (n, out, ledger) = gate(&u, verdict("test:42", Some(10), 0.91), &games);
        assert_eq!(n, 1);
        assert!(ledger.contains(10));
        let planned = &out.updates[0];
        assert_eq!(planned.evidence.path, MatchPath::Ai);
        assert_eq!(planned.update.status, GameStatus::Live);
        assert_eq!(planned.update.external_id.as_deref(), Some("42"));
    }

    #[test]
    fn test_finish_needs_the_highest_bar() {
        let games = vec![porto_sporting(10)];
        let mut u = unresolved(VendorPhase::Finished(DecidedBy::Regulation), vec![10]);
        u.ext.score = Some(ScorePair::new(2, 1));

        let (n, out, _) = gate(&u, verdict("test:42", Some(10), 0.93), &games);
        assert_eq!(n, 0);
        assert_eq!(out.rejections[0].gate, Gate::AiConfidence);
        assert!(out.updates.is_empty());

        let (n, out, _) = gate(&u, verdict("test:42", Some(10), 0.96), &games);
        assert_eq!(n, 1);
        assert_eq!(out.updates[0].update.status, GameStatus::Finished);
    }

    #[test]
    fn test_upcoming_attach_uses_lowest_bar() {
        let mut g = porto_sporting(10);
        g.status = GameStatus::Upcoming;
        let u = unresolved(VendorPhase::NotStarted, vec![10]);
        let (n, out, _) = gate(&u, verdict("test:42", Some(10), 0.86), &[g]);
        assert_eq!(n, 1);
        assert_eq!(out.updates[0].update.status, GameStatus::Upcoming);
    }

    #[test]
    fn test_per_team_confidence_must_also_clear() {
        let games = vec![porto_sporting(10)];
        let u = unresolved(VendorPhase::InPlay, vec![10]);
        let mut v = verdict("test:42", Some(10), 0.95);
        v.away_confidence = Some(0.6);
        let (n, out, _) = gate(&u, v, &games);
        assert_eq!(n, 0);
        assert_eq!(out.rejections[0].gate, Gate::AiConfidence);
    }

    #[test]
    fn test_unoffered_and_bogus_verdicts() {
        let games = vec![porto_sporting(10), porto_sporting(11)];
        let u = unresolved(VendorPhase::InPlay, vec![10]);
        let (n, out, _) = gate(&u, verdict("test:42", Some(11), 0.99), &games);
        assert_eq!(n, 0);
        assert_eq!(out.rejections[0].gate, Gate::AiUnoffered);

        let (n, out, _) = gate(&u, verdict("test:42", Some(10), f64::NAN), &games);
        assert_eq!(n, 0);
        assert_eq!(out.rejections[0].gate, Gate::AiConfidence);

        let (n, out, _) = gate(&u, verdict("test:42", None, 0.99), &games);
        assert_eq!(n, 0);
        assert!(out.rejections.is_empty());
    }

    #[test]
    fn test_date_window_revalidated() {
        let games = vec![porto_sporting(10)];
        let mut u = unresolved(VendorPhase::InPlay, vec![10]);
        u.ext.kickoff = u.ext.kickoff + Duration::days(9);
        let (n, out, _) = gate(&u, verdict("test:42", Some(10), 0.99), &games);
        assert_eq!(n, 0);
        assert_eq!(out.rejections[0].gate, Gate::DateWindow);
    }

    #[test]
    fn test_recent_foreign_link_never_overwritten() {
        let mut g = porto_sporting(10);
        g.external_id = Some("7".into());
        g.last_sync_at = Some(now() - Duration::minutes(5));
        let u = unresolved(VendorPhase::InPlay, vec![10]);
        let (n, out, _) = gate(&u, verdict("test:42", Some(10), 0.99), &[g.clone()]);
        assert_eq!(n, 0);
        assert_eq!(out.rejections[0].gate, Gate::LinkConflict);

        g.last_sync_at = Some(now() - Duration::hours(3));
        let (n, _, _) = gate(&u, verdict("test:42", Some(10), 0.93), &[g.clone()]);
        assert_eq!(n, 0);
        let (n, _, _) = gate(&u, verdict("test:42", Some(10), 0.97), &[g]);
        assert_eq!(n, 1);
    }
}
