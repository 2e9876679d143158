use chrono::{DateTime, Utc};
use tracing::info;

use super::reconciler::{ReconcileOutcome, RunLedger};
use super::settings::SyncSettings;
use crate::db::models::{DecidedBy, FinalResult, FinishSource, Game, GameStatus, GameUpdate};

/// Close LIVE games no record settled this run once their sport's timeout
/// since kickoff has passed. The last known live score becomes final.
///
/// A game whose only pairing was a full-time record refused by the finish
/// gate still qualifies; the score that record carried wins over the stored
/// one. Games with a pending link reset are left for the next run so the
/// reset is not overwritten by a stale link.
pub fn sweep(
    games: &[Game],
    ledger: &RunLedger,
    outcome: &ReconcileOutcome,
    settings: &SyncSettings,
    now: DateTime<Utc>,
) -> Vec<GameUpdate> {
    games
        .iter()
        .filter(|g| g.status == GameStatus::Live)
        .filter(|g| settings.sports.contains(&g.sport()))
        .filter(|g| !ledger.contains(g.id) || outcome.finish_refused.contains(&g.id))
        .filter(|g| !outcome.link_cleared(g.id))
        .filter(|g| now - g.scheduled_at > settings.auto_finish.timeout(g.sport()))
        .map(|g| {
            let planned = outcome
                .updates
                .iter()
                .map(|p| &p.update)
                .find(|u| u.game_id == g.id);
            let score = planned
                .and_then(|u| u.live_score)
                .or(g.live_score)
                .unwrap_or_default();
            info!(
                "{} still LIVE {} min after kickoff; auto-finishing at {}",
                g.label(),
                (now - g.scheduled_at).num_minutes(),
                score
            );
            let finish = Some(FinalResult {
                score,
                decided_by: DecidedBy::Regulation,
                source: FinishSource::AutoFinish,
                finished_at: now,
            });
            match planned {
                Some(u) => GameUpdate {
                    status: GameStatus::Finished,
                    live_score: Some(score),
                    finish,
                    ..u.clone()
                },
                None => GameUpdate {
                    game_id: g.id,
                    status: GameStatus::Finished,
                    external_id: g.external_id.clone(),
                    external_status: g.external_status.clone(),
                    live_score: Some(score),
                    elapsed: g.elapsed,
                    finish,
                    last_sync_at: g.last_sync_at,
                },
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{LinkReset, ScorePair, Sport};
    use crate::sync::gates::tests::{game, porto_sporting, team};
    use crate::sync::gates::Pairing;
    use crate::sync::reconciler::{Evidence, MatchPath, PlannedUpdate};
    use chrono::Duration;

    fn none() -> ReconcileOutcome {
        ReconcileOutcome::default()
    }

    #[test]
    fn test_stale_live_game_is_finished_with_last_score() {
        let mut g = porto_sporting(10);
        g.live_score = Some(ScorePair::new(1, 1));
        let now = g.scheduled_at + Duration::minutes(181);

        let updates = sweep(&[g], &RunLedger::new(), &none(), &SyncSettings::default(), now);
        assert_eq!(updates.len(), 1);
        let finish = updates[0].finish.unwrap();
        assert_eq!(finish.score, ScorePair::new(1, 1));
        assert_eq!(finish.source, FinishSource::AutoFinish);
        assert_eq!(finish.decided_by, DecidedBy::Regulation);
        assert_eq!(updates[0].status, GameStatus::Finished);
    }

    #[test]
    fn test_timeout_is_per_sport() {
        let football = porto_sporting(10);
        let rugby = game(
            11,
            team(5, "Stade Toulousain", None, Sport::Rugby),
            team(6, "Racing 92", None, Sport::Rugby),
        );
        let now = football.scheduled_at + Duration::minutes(150);

        let updates = sweep(
            &[football, rugby],
            &RunLedger::new(),
            &none(),
            &SyncSettings::default(),
            now,
        );
        let ids: Vec<i64> = updates.iter().map(|u| u.game_id).collect();
        assert_eq!(ids, vec![11]);
        // no live score known: nil-nil
        assert_eq!(updates[0].live_score, Some(ScorePair::new(0, 0)));
    }

    #[test]
    fn test_matched_or_reset_games_are_spared() {
        let g = porto_sporting(10);
        let now = g.scheduled_at + Duration::hours(5);
        let mut ledger = RunLedger::new();
        ledger.mark(10);
        assert!(sweep(&[g.clone()], &ledger, &none(), &SyncSettings::default(), now).is_empty());

        let mut reset = ReconcileOutcome::default();
        reset.resets.push(LinkReset {
            game_id: 10,
            rollback_finish: false,
        });
        assert!(sweep(&[g], &RunLedger::new(), &reset, &SyncSettings::default(), now).is_empty());
    }

    #[test]
    fn test_refused_full_time_does_not_shield_game() {
        let mut g = porto_sporting(10);
        g.live_score = Some(ScorePair::new(1, 1));
        let now = g.scheduled_at + Duration::hours(4);
        let mut ledger = RunLedger::new();
        ledger.mark(10);

        let mut outcome = ReconcileOutcome::default();
        outcome.finish_refused.push(10);
        outcome.updates.push(PlannedUpdate {
            update: GameUpdate {
                game_id: 10,
                status: GameStatus::Live,
                external_id: Some("42".into()),
                external_status: Some("FT".into()),
                live_score: Some(ScorePair::new(2, 1)),
                elapsed: Some(90),
                finish: None,
                last_sync_at: Some(now),
            },
            source: "api-football".into(),
            external_id: "42".into(),
            evidence: Evidence {
                path: MatchPath::Id,
                pairing: Pairing {
                    swapped: false,
                    home_confidence: 1.0,
                    away_confidence: 1.0,
                    home_method: None,
                    away_method: None,
                },
                date_delta_minutes: 0,
            },
        });

        let updates = sweep(&[g], &ledger, &outcome, &SyncSettings::default(), now);
        assert_eq!(updates.len(), 1);
        assert_eq!(updates[0].status, GameStatus::Finished);
        assert_eq!(updates[0].external_id.as_deref(), Some("42"));
        let finish = updates[0].finish.unwrap();
        assert_eq!(finish.score, ScorePair::new(2, 1));
        assert_eq!(finish.source, FinishSource::AutoFinish);
    }

    #[test]
    fn test_only_live_games_qualify() {
        let mut g = porto_sporting(10);
        g.status = GameStatus::Upcoming;
        let now = g.scheduled_at + Duration::hours(5);
        assert!(sweep(&[g], &RunLedger::new(), &none(), &SyncSettings::default(), now).is_empty());
    }
}
