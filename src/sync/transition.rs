//! Status and score transitions for a validated pairing.
//!
//! Allowed moves, from the game's current status:
//!
//! | vendor phase                    | UPCOMING / RESCHEDULED | LIVE             |
//! |---------------------------------|------------------------|------------------|
//! | in play, break                  | LIVE                   | LIVE             |
//! | finished (gate passed)          | FINISHED               | FINISHED         |
//! | finished (gate failed)          | unchanged              | LIVE, scores     |
//! | not started                     | UPCOMING               | UPCOMING, reset  |
//! | postponed                       | RESCHEDULED            | UPCOMING, reset  |
//! | suspended, interrupted, ...     | CANCELLED              | LIVE (rejected)  |
//!
//! A FINISHED game without a final score only moves on a passed finish gate.

use chrono::{DateTime, Utc};

use super::gates::{competitions_consistent, date_delta_minutes, within_window, Pairing};
use super::reconciler::Gate;
use super::settings::SyncSettings;
use crate::db::models::{FinalResult, FinishSource, Game, GameStatus, GameUpdate, ScorePair};
use crate::live_scores::{ExternalMatch, VendorPhase};

/// A field-level refusal: the record was applied, one change was not.
#[derive(Debug, Clone, PartialEq)]
pub struct FieldRejection {
    pub gate: Gate,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub update: GameUpdate,
    pub rejected: Vec<FieldRejection>,
}

/// FINISHED needs a score, a kickoff close to the schedule and a
/// corroborating competition name.
fn finish_gate(
    game: &Game,
    ext: &ExternalMatch,
    score: Option<ScorePair>,
    settings: &SyncSettings,
) -> Result<ScorePair, String> {
    if !within_window(ext.kickoff, game.scheduled_at, settings.finish_window) {
        return Err(format!(
            "kickoff {} min from schedule",
            date_delta_minutes(ext.kickoff, game.scheduled_at)
        ));
    }
    if !competitions_consistent(&ext.competition, &game.competition.name) {
        return Err(format!(
            "competition '{}' does not corroborate '{}'",
            ext.competition, game.competition.name
        ));
    }
    score.ok_or_else(|| format!("{} reported without a score", ext.raw_status))
}

/// Post-state of `game` after applying `ext`.
pub fn plan_update(
    game: &Game,
    ext: &ExternalMatch,
    pairing: &Pairing,
    settings: &SyncSettings,
    now: DateTime<Utc>,
) -> Transition {
    let vendor_score = ext
        .authoritative_score()
        .map(|s| if pairing.swapped { s.swapped() } else { s });

    let mut update = GameUpdate {
        game_id: game.id,
        status: game.status,
        external_id: Some(ext.id.clone()),
        external_status: Some(ext.raw_status.clone()),
        live_score: game.live_score,
        elapsed: game.elapsed,
        finish: None,
        last_sync_at: Some(now),
    };
    let mut rejected = Vec::new();
    let regression = |from: GameStatus| FieldRejection {
        gate: Gate::StatusRegression,
        detail: format!("{} ignored for a {} game", ext.raw_status, from),
    };
    let in_play = matches!(game.status, GameStatus::Live | GameStatus::Finished);

    match ext.phase {
        VendorPhase::InPlay | VendorPhase::Break => {
            if game.status == GameStatus::Finished {
                rejected.push(regression(game.status));
            } else {
                update.status = GameStatus::Live;
            }
            // a confirmed live match without a score has not scored yet
            update.live_score = Some(vendor_score.unwrap_or_default());
            update.elapsed = ext.elapsed;
        }
        VendorPhase::Finished(_) => match finish_gate(game, ext, vendor_score, settings) {
            Ok(score) => {
                update.status = GameStatus::Finished;
                update.live_score = Some(score);
                update.elapsed = ext.elapsed;
                update.finish = Some(FinalResult {
                    score,
                    decided_by: ext.decided_by(),
                    source: FinishSource::Vendor,
                    finished_at: now,
                });
            }
            Err(detail) => {
                rejected.push(FieldRejection {
                    gate: Gate::FinishGate,
                    detail,
                });
                if in_play {
                    if let Some(score) = vendor_score {
                        update.live_score = Some(score);
                    }
                    update.elapsed = ext.elapsed;
                }
            }
        },
        VendorPhase::NotStarted | VendorPhase::Postponed => match game.status {
            GameStatus::Live => {
                update.status = GameStatus::Upcoming;
                update.live_score = None;
                update.elapsed = None;
            }
            GameStatus::Finished => rejected.push(regression(game.status)),
            _ => {
                update.status = if ext.phase == VendorPhase::Postponed {
                    GameStatus::Rescheduled
                } else {
                    GameStatus::Upcoming
                };
            }
        },
        VendorPhase::Suspended
        | VendorPhase::Interrupted
        | VendorPhase::Cancelled
        | VendorPhase::Abandoned => {
            if in_play {
                rejected.push(regression(game.status));
                if let Some(score) = vendor_score {
                    update.live_score = Some(score);
                }
            } else {
                update.status = GameStatus::Cancelled;
            }
        }
    }

    Transition { update, rejected }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::DecidedBy;
    use crate::live_scores::tests::ext;
    use crate::sync::gates::tests::porto_sporting;
    use chrono::{Duration, TimeZone};

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 5, 12, 20, 0, 0).unwrap()
    }

    fn straight() -> Pairing {
        Pairing {
            swapped: false,
            home_confidence: 1.0,
            away_confidence: 0.95,
            home_method: None,
            away_method: None,
        }
    }

    fn swapped() -> Pairing {
        Pairing {
            swapped: true,
            ..straight()
        }
    }

    #[test]
    fn test_halftime_without_score_goes_live_at_nil_nil() {
        let mut game = porto_sporting(1);
        game.status = GameStatus::Upcoming;
        let mut m = ext("42", "FC Porto", "Sporting CP", VendorPhase::Break);
        m.raw_status = "HT".into();
        m.score = None;
        m.elapsed = None;

        let t = plan_update(&game, &m, &straight(), &SyncSettings::default(), now());
        assert!(t.rejected.is_empty());
        assert_eq!(t.update.status, GameStatus::Live);
        assert_eq!(t.update.live_score, Some(ScorePair::new(0, 0)));
        assert_eq!(t.update.elapsed, None);
        assert_eq!(t.update.external_id.as_deref(), Some("42"));
        assert_eq!(t.update.external_status.as_deref(), Some("HT"));
    }

    #[test]
    fn test_full_time_finishes_with_oriented_score() {
        let game = porto_sporting(1);
        let mut m = ext("42", "Sporting CP", "FC Porto", VendorPhase::Finished(DecidedBy::Regulation));
        m.score = Some(ScorePair::new(1, 2));

        let t = plan_update(&game, &m, &swapped(), &SyncSettings::default(), now());
        assert_eq!(t.update.status, GameStatus::Finished);
        let finish = t.update.finish.unwrap();
        assert_eq!(finish.score, ScorePair::new(2, 1));
        assert_eq!(finish.source, FinishSource::Vendor);
        assert_eq!(finish.finished_at, now());
        assert_eq!(t.update.live_score, Some(ScorePair::new(2, 1)));
    }

    #[test]
    fn test_after_extra_time_uses_extra_time_score() {
        let game = porto_sporting(1);
        let mut m = ext("42", "FC Porto", "Sporting CP", VendorPhase::Finished(DecidedBy::ExtraTime));
        m.score = Some(ScorePair::new(1, 1));
        m.extra_time_score = Some(ScorePair::new(2, 1));

        let t = plan_update(&game, &m, &straight(), &SyncSettings::default(), now());
        let finish = t.update.finish.unwrap();
        assert_eq!(finish.score, ScorePair::new(2, 1));
        assert_eq!(finish.decided_by, DecidedBy::ExtraTime);
    }

    #[test]
    fn test_finish_gate_keeps_live_but_refreshes_score() {
        let mut game = porto_sporting(1);
        game.live_score = Some(ScorePair::new(1, 1));
        let mut m = ext("42", "FC Porto", "Sporting CP", VendorPhase::Finished(DecidedBy::Regulation));
        m.kickoff = game.scheduled_at + Duration::minutes(45);
        m.score = Some(ScorePair::new(2, 1));
        m.elapsed = Some(90);

        let t = plan_update(&game, &m, &straight(), &SyncSettings::default(), now());
        assert_eq!(t.update.status, GameStatus::Live);
        assert!(t.update.finish.is_none());
        assert_eq!(t.update.live_score, Some(ScorePair::new(2, 1)));
        assert_eq!(t.update.elapsed, Some(90));
        assert_eq!(t.rejected.len(), 1);
        assert_eq!(t.rejected[0].gate, Gate::FinishGate);
    }

    #[test]
    fn test_finish_gate_on_upcoming_leaves_it_untouched() {
        let mut game = porto_sporting(1);
        game.status = GameStatus::Upcoming;
        let mut m = ext("42", "FC Porto", "Sporting CP", VendorPhase::Finished(DecidedBy::Regulation));
        m.competition = "Taça da Liga".into();

        let t = plan_update(&game, &m, &straight(), &SyncSettings::default(), now());
        assert_eq!(t.update.status, GameStatus::Upcoming);
        assert_eq!(t.update.live_score, None);
        assert_eq!(t.rejected[0].gate, Gate::FinishGate);
    }

    #[test]
    fn test_live_reverts_only_on_not_started_or_postponed() {
        let mut game = porto_sporting(1);
        game.live_score = Some(ScorePair::new(1, 0));
        game.elapsed = Some(30);

        let ns = ext("42", "FC Porto", "Sporting CP", VendorPhase::NotStarted);
        let t = plan_update(&game, &ns, &straight(), &SyncSettings::default(), now());
        assert_eq!(t.update.status, GameStatus::Upcoming);
        assert_eq!(t.update.live_score, None);
        assert_eq!(t.update.elapsed, None);

        for phase in [
            VendorPhase::Suspended,
            VendorPhase::Interrupted,
            VendorPhase::Cancelled,
            VendorPhase::Abandoned,
        ] {
            let m = ext("42", "FC Porto", "Sporting CP", phase);
            let t = plan_update(&game, &m, &straight(), &SyncSettings::default(), now());
            assert_eq!(t.update.status, GameStatus::Live, "{:?}", phase);
            assert_eq!(t.rejected[0].gate, Gate::StatusRegression);
        }
    }

    #[test]
    fn test_upcoming_postponed_and_cancelled() {
        let mut game = porto_sporting(1);
        game.status = GameStatus::Upcoming;

        let pst = ext("42", "FC Porto", "Sporting CP", VendorPhase::Postponed);
        let t = plan_update(&game, &pst, &straight(), &SyncSettings::default(), now());
        assert_eq!(t.update.status, GameStatus::Rescheduled);

        let canc = ext("42", "FC Porto", "Sporting CP", VendorPhase::Cancelled);
        let t = plan_update(&game, &canc, &straight(), &SyncSettings::default(), now());
        assert_eq!(t.update.status, GameStatus::Cancelled);
        assert!(t.rejected.is_empty());

        game.status = GameStatus::Rescheduled;
        let ns = ext("42", "FC Porto", "Sporting CP", VendorPhase::NotStarted);
        let t = plan_update(&game, &ns, &straight(), &SyncSettings::default(), now());
        assert_eq!(t.update.status, GameStatus::Upcoming);
    }

    #[test]
    fn test_unchanged_record_is_a_no_op() {
        let mut game = porto_sporting(1);
        game.external_id = Some("42".into());
        game.external_status = Some("1H".into());
        game.live_score = Some(ScorePair::new(0, 0));
        game.elapsed = Some(30);

        let m = ext("42", "FC Porto", "Sporting CP", VendorPhase::InPlay);
        let t = plan_update(&game, &m, &straight(), &SyncSettings::default(), now());
        assert!(!t.update.changes(&game));
    }
}
