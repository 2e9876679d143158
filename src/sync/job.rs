use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::auto_finish;
use super::reconciler::{reconcile, ReconcileOutcome, RunLedger};
use super::settings::SyncSettings;
use crate::arbiter::{accept_verdicts, build_requests, Arbiter};
use crate::db::models::{AuditEntry, Game, GameStatus, SyncReport};
use crate::db::Database;
use crate::live_scores::{collect_batch, fetch_by_ids, MatchSource};

/// One reconciliation pass over every enabled source.
pub struct SyncJob {
    db: Database,
    sources: Vec<Arc<dyn MatchSource>>,
    arbiter: Option<Arc<dyn Arbiter>>,
    settings: SyncSettings,
}

impl SyncJob {
    pub fn new(
        db: Database,
        sources: Vec<Arc<dyn MatchSource>>,
        arbiter: Option<Arc<dyn Arbiter>>,
        settings: SyncSettings,
    ) -> Self {
        SyncJob {
            db,
            sources,
            arbiter,
            settings,
        }
    }

    pub async fn run_once(&self) -> Result<SyncReport> {
        self.run_at(Utc::now()).await
    }

    /// Run a pass as of `now`. Vendor and write failures are counted in the
    /// report; only failing to read the tracked games aborts the run.
    pub async fn run_at(&self, now: DateTime<Utc>) -> Result<SyncReport> {
        let mut report = SyncReport {
            run_id: Uuid::new_v4().to_string(),
            started_at: Some(now),
            ..SyncReport::default()
        };
        let settings = &self.settings;

        let games = self
            .db
            .list_tracked_games(&settings.sports, now, settings.rollback_window)
            .context("Failed to load tracked games")?;
        let mut roster = Vec::new();
        for sport in &settings.sports {
            roster.extend(
                self.db
                    .list_teams(*sport)
                    .with_context(|| format!("Failed to load {} teams", sport))?,
            );
        }
        debug!("{} tracked game(s), {} team(s)", games.len(), roster.len());

        let sources: Vec<Arc<dyn MatchSource>> = self
            .sources
            .iter()
            .filter(|s| settings.sports.contains(&s.sport()))
            .cloned()
            .collect();
        let mut batch = collect_batch(&sources, now.date_naive(), settings.lookback_days).await;

        // LIVE games the feeds stopped listing are looked up one by one.
        let missing: Vec<_> = games
            .iter()
            .filter(|g| g.status == GameStatus::Live)
            .filter_map(|g| g.external_id.as_ref().map(|id| (g.sport(), id.clone())))
            .filter(|(sport, id)| !batch.iter().any(|m| m.sport == *sport && &m.id == id))
            .collect();
        if !missing.is_empty() {
            debug!("Looking up {} LIVE fixture(s) by id", missing.len());
            fetch_by_ids(&sources, &missing, &mut batch).await;
        }
        report.external_matches = batch.len();

        let mut ledger = RunLedger::new();
        let mut outcome = reconcile(&batch, &games, &roster, settings, now, &mut ledger);

        if settings.ai_enabled {
            if let Some(arbiter) = &self.arbiter {
                report.ai_accepted = self
                    .arbitrate(arbiter.as_ref(), &games, now, &mut ledger, &mut outcome)
                    .await;
            }
        }
        report.unmatched = outcome.unresolved.len().saturating_sub(report.ai_accepted);

        let auto_finished = auto_finish::sweep(&games, &ledger, &outcome, settings, now);

        let mut audit: Vec<AuditEntry> = outcome
            .rejections
            .iter()
            .map(|r| r.audit(&report.run_id))
            .collect();
        report.rejected = outcome.rejections.len();

        for reset in &outcome.resets {
            match self.db.reset_external_link(reset) {
                Ok(written) => {
                    report.link_resets += 1;
                    report.bets_scored += written.bets_scored;
                }
                Err(e) => {
                    error!("Failed to reset link on game {}: {:#}", reset.game_id, e);
                    report.failures += 1;
                }
            }
        }

        for planned in &outcome.updates {
            match self.db.apply_game_update(&planned.update) {
                Ok(written) if written.skipped => {
                    info!("Game {} finished elsewhere; update dropped", planned.update.game_id);
                }
                Ok(written) => {
                    report.updated += 1;
                    if planned.update.finish.is_some() {
                        report.finished += 1;
                    }
                    report.bets_scored += written.bets_scored;
                    audit.push(planned.audit(&report.run_id));
                }
                Err(e) => {
                    error!("Failed to update game {}: {:#}", planned.update.game_id, e);
                    report.failures += 1;
                }
            }
        }

        for update in &auto_finished {
            match self.db.apply_game_update(update) {
                Ok(written) if written.skipped => {
                    info!("Game {} finished elsewhere; auto-finish dropped", update.game_id);
                }
                Ok(written) => {
                    report.auto_finished += 1;
                    report.bets_scored += written.bets_scored;
                    audit.push(AuditEntry {
                        run_id: report.run_id.clone(),
                        source: "auto-finish".to_string(),
                        external_id: update.external_id.clone().unwrap_or_default(),
                        game_id: Some(update.game_id),
                        gate: "AUTO_FINISHED".to_string(),
                        detail: format!(
                            "closed at {}",
                            update.live_score.unwrap_or_default()
                        ),
                        confidence: None,
                        date_delta_minutes: None,
                    });
                }
                Err(e) => {
                    error!("Failed to auto-finish game {}: {:#}", update.game_id, e);
                    report.failures += 1;
                }
            }
        }

        for entry in &audit {
            if let Err(e) = self.db.insert_audit(entry) {
                warn!("Failed to write audit row for {}: {:#}", entry.external_id, e);
            }
        }

        report.finished_at = Some(Utc::now());
        self.db
            .record_run(&report)
            .context("Failed to record sync run")?;

        info!(
            "Sync {}: {} record(s), {} updated ({} finished), {} auto-finished, {} link reset(s), \
             {} rejected, {} unmatched, {} via arbiter, {} bet(s) scored, {} failure(s)",
            report.run_id,
            report.external_matches,
            report.updated,
            report.finished,
            report.auto_finished,
            report.link_resets,
            report.rejected,
            report.unmatched,
            report.ai_accepted,
            report.bets_scored,
            report.failures
        );
        Ok(report)
    }

    /// One batched arbitration call. A failing arbiter leaves every record
    /// unmatched.
    async fn arbitrate(
        &self,
        arbiter: &dyn Arbiter,
        games: &[Game],
        now: DateTime<Utc>,
        ledger: &mut RunLedger,
        outcome: &mut ReconcileOutcome,
    ) -> usize {
        let requests = build_requests(&outcome.unresolved, games);
        if requests.is_empty() {
            return 0;
        }
        info!(
            "Asking {} about {} unresolved record(s)",
            arbiter.name(),
            requests.len()
        );
        let verdicts = match arbiter.arbitrate(&requests).await {
            Ok(v) => v,
            Err(e) => {
                warn!("Arbiter {} failed: {}", arbiter.name(), e);
                return 0;
            }
        };
        let unresolved = std::mem::take(&mut outcome.unresolved);
        let accepted = accept_verdicts(
            &unresolved,
            &verdicts,
            games,
            &self.settings,
            now,
            ledger,
            outcome,
        );
        outcome.unresolved = unresolved;
        accepted
    }
}
