use chrono::Duration;

use crate::db::models::Sport;

/// Confidence bars, one per risk tier of the action a match would trigger.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    /// Attach an external id to a game without changing its status
    pub attach_id: f64,
    /// Move a game to LIVE or refresh its live score
    pub update_live: f64,
    /// Promote a game to FINISHED (rescores bets)
    pub promote_finished: f64,
    /// Minimum resolver confidence for each of the two team names
    pub team_match: f64,
    /// Overwrite an existing, stale external id on a game
    pub stale_link_override: f64,
}

impl Default for Thresholds {
    fn default() -> Self {
        Thresholds {
            attach_id: 0.85,
            update_live: 0.90,
            promote_finished: 0.95,
            team_match: 0.90,
            stale_link_override: 0.95,
        }
    }
}

/// What applying a match would do, from least to most dangerous.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum RiskTier {
    AttachId,
    UpdateLive,
    PromoteFinished,
}

impl Thresholds {
    pub fn bar(&self, tier: RiskTier) -> f64 {
        match tier {
            RiskTier::AttachId => self.attach_id,
            RiskTier::UpdateLive => self.update_live,
            RiskTier::PromoteFinished => self.promote_finished,
        }
    }
}

/// Minutes after kickoff at which a game still LIVE is closed by the sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AutoFinishPolicy {
    pub football: Duration,
    pub rugby: Duration,
}

impl Default for AutoFinishPolicy {
    fn default() -> Self {
        AutoFinishPolicy {
            football: Duration::minutes(180),
            rugby: Duration::minutes(140),
        }
    }
}

impl AutoFinishPolicy {
    pub fn timeout(&self, sport: Sport) -> Duration {
        match sport {
            Sport::Football => self.football,
            Sport::Rugby => self.rugby,
        }
    }
}

/// Everything the reconciliation pass may vary on. Built once from the
/// command line and passed in; nothing below reads the environment.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncSettings {
    /// Sports whose sources are enabled this run
    pub sports: Vec<Sport>,
    pub thresholds: Thresholds,
    /// Largest kickoff difference for any pairing
    pub match_window: Duration,
    /// Largest kickoff difference for a FINISHED promotion
    pub finish_window: Duration,
    /// A link refreshed within this window is never overwritten
    pub recent_sync_window: Duration,
    /// Vendor finishes younger than this can still be rolled back
    pub rollback_window: Duration,
    pub rollback_wrong_finishes: bool,
    pub auto_finish: AutoFinishPolicy,
    pub ai_enabled: bool,
    /// Days before today covered by the date-range side query
    pub lookback_days: i64,
    /// Most candidate games offered to the arbiter per unresolved record
    pub ai_max_candidates: usize,
}

impl Default for SyncSettings {
    fn default() -> Self {
        SyncSettings {
            sports: Sport::ALL.to_vec(),
            thresholds: Thresholds::default(),
            match_window: Duration::days(7),
            finish_window: Duration::minutes(30),
            recent_sync_window: Duration::minutes(10),
            rollback_window: Duration::hours(24),
            rollback_wrong_finishes: true,
            auto_finish: AutoFinishPolicy::default(),
            ai_enabled: false,
            lookback_days: 1,
            ai_max_candidates: 8,
        }
    }
}
