use clap::{ArgAction, Parser};
use std::time::Duration;

use crate::db::models::Sport;
use crate::live_scores::RetryPolicy;
use crate::sync::{AutoFinishPolicy, SyncSettings, Thresholds};

/// Live match reconciliation job for the prediction league
#[derive(Parser, Debug, Clone)]
#[command(name = "live-sync", version, about)]
pub struct Config {
    /// SQLite database path
    #[arg(long, env = "DATABASE_PATH", default_value = "predictions.db")]
    pub database_path: String,

    /// Seconds between passes; 0 runs a single pass and exits
    #[arg(long, env = "SYNC_INTERVAL_SECS", default_value = "0")]
    pub interval_secs: u64,

    /// Create the schema and exit
    #[arg(long, default_value = "false")]
    pub init_db: bool,

    /// Days before today covered by the recently-finished query
    #[arg(long, env = "SYNC_LOOKBACK_DAYS", default_value = "1")]
    pub lookback_days: i64,

    // ── Vendors ──────────────────────────────────────────────────────────────

    /// Sync football games
    #[arg(long, env = "FOOTBALL_ENABLED", default_value = "true", action = ArgAction::Set)]
    pub football_enabled: bool,

    /// API-Football base URL
    #[arg(
        long,
        env = "FOOTBALL_API_URL",
        default_value = "https://v3.football.api-sports.io"
    )]
    pub football_api_url: String,

    /// API-Football key
    #[arg(long, env = "FOOTBALL_API_KEY")]
    pub football_api_key: Option<String>,

    /// Sync rugby games
    #[arg(long, env = "RUGBY_ENABLED", default_value = "true", action = ArgAction::Set)]
    pub rugby_enabled: bool,

    /// API-Rugby base URL
    #[arg(
        long,
        env = "RUGBY_API_URL",
        default_value = "https://v1.rugby.api-sports.io"
    )]
    pub rugby_api_url: String,

    /// API-Rugby key
    #[arg(long, env = "RUGBY_API_KEY")]
    pub rugby_api_key: Option<String>,

    /// Per-request vendor timeout in seconds
    #[arg(long, env = "VENDOR_TIMEOUT_SECS", default_value = "15")]
    pub vendor_timeout_secs: u64,

    /// Attempts per vendor request, first one included
    #[arg(long, env = "VENDOR_MAX_ATTEMPTS", default_value = "4")]
    pub vendor_max_attempts: u32,

    /// Base backoff between vendor retries in milliseconds
    #[arg(long, env = "VENDOR_BACKOFF_MS", default_value = "500")]
    pub vendor_backoff_ms: u64,

    // ── Confidence bars ──────────────────────────────────────────────────────

    /// Minimum confidence to attach an external id without a status change
    #[arg(long, env = "THRESHOLD_ATTACH_ID", default_value = "0.85")]
    pub threshold_attach_id: f64,

    /// Minimum confidence to move a game to LIVE or refresh its score
    #[arg(long, env = "THRESHOLD_UPDATE_LIVE", default_value = "0.90")]
    pub threshold_update_live: f64,

    /// Minimum confidence to promote a game to FINISHED
    #[arg(long, env = "THRESHOLD_PROMOTE_FINISHED", default_value = "0.95")]
    pub threshold_promote_finished: f64,

    /// Minimum resolver confidence for each team name
    #[arg(long, env = "THRESHOLD_TEAM_MATCH", default_value = "0.90")]
    pub threshold_team_match: f64,

    /// Minimum confidence to overwrite another game's stale external id
    #[arg(long, env = "THRESHOLD_STALE_LINK", default_value = "0.95")]
    pub threshold_stale_link: f64,

    // ── Windows ──────────────────────────────────────────────────────────────

    /// Largest kickoff difference for any pairing, in days
    #[arg(long, env = "MATCH_WINDOW_DAYS", default_value = "7")]
    pub match_window_days: i64,

    /// Largest kickoff difference for a FINISHED promotion, in minutes
    #[arg(long, env = "FINISH_WINDOW_MINUTES", default_value = "30")]
    pub finish_window_minutes: i64,

    /// Links refreshed this recently are never overwritten, in minutes
    #[arg(long, env = "RECENT_SYNC_MINUTES", default_value = "10")]
    pub recent_sync_minutes: i64,

    /// How long a vendor finish stays reversible, in hours
    #[arg(long, env = "ROLLBACK_WINDOW_HOURS", default_value = "24")]
    pub rollback_window_hours: i64,

    /// Roll back finishes caused by a reused external id
    #[arg(long, env = "ROLLBACK_WRONG_FINISHES", default_value = "true", action = ArgAction::Set)]
    pub rollback_wrong_finishes: bool,

    /// Minutes after kickoff before a football game still LIVE is closed
    #[arg(long, env = "FOOTBALL_AUTO_FINISH_MINUTES", default_value = "180")]
    pub football_auto_finish_minutes: i64,

    /// Minutes after kickoff before a rugby game still LIVE is closed
    #[arg(long, env = "RUGBY_AUTO_FINISH_MINUTES", default_value = "140")]
    pub rugby_auto_finish_minutes: i64,

    // ── Arbiter ──────────────────────────────────────────────────────────────

    /// Ask the language model about records no deterministic step paired
    #[arg(long, env = "AI_ENABLED", default_value = "false")]
    pub ai_enabled: bool,

    /// Ollama-compatible endpoint
    #[arg(long, env = "AI_ENDPOINT", default_value = "http://localhost:11434")]
    pub ai_endpoint: String,

    /// Model name passed to the endpoint
    #[arg(long, env = "AI_MODEL", default_value = "llama3.1:8b")]
    pub ai_model: String,

    /// Arbiter request timeout in seconds
    #[arg(long, env = "AI_TIMEOUT_SECS", default_value = "60")]
    pub ai_timeout_secs: u64,

    /// Candidate games offered per unresolved record
    #[arg(long, env = "AI_MAX_CANDIDATES", default_value = "8")]
    pub ai_max_candidates: usize,
}

impl Config {
    pub fn validate(&self) -> anyhow::Result<()> {
        let bars = [
            ("threshold_attach_id", self.threshold_attach_id),
            ("threshold_update_live", self.threshold_update_live),
            ("threshold_promote_finished", self.threshold_promote_finished),
            ("threshold_team_match", self.threshold_team_match),
            ("threshold_stale_link", self.threshold_stale_link),
        ];
        for (name, value) in bars {
            if !(0.0..=1.0).contains(&value) {
                anyhow::bail!("{} must be between 0.0 and 1.0", name);
            }
        }
        if self.threshold_attach_id > self.threshold_update_live
            || self.threshold_update_live > self.threshold_promote_finished
        {
            anyhow::bail!("thresholds must not decrease with risk: attach_id <= update_live <= promote_finished");
        }
        if !self.football_enabled && !self.rugby_enabled {
            anyhow::bail!("at least one of football or rugby must be enabled");
        }
        if self.lookback_days < 0 {
            anyhow::bail!("lookback_days must not be negative");
        }
        if self.match_window_days <= 0 || self.finish_window_minutes <= 0 {
            anyhow::bail!("date windows must be positive");
        }
        if self.finish_window_minutes > self.match_window_days * 24 * 60 {
            anyhow::bail!("finish_window_minutes must fit inside the match window");
        }
        if self.recent_sync_minutes < 0 || self.rollback_window_hours < 0 {
            anyhow::bail!("recent_sync_minutes and rollback_window_hours must not be negative");
        }
        if self.football_auto_finish_minutes <= 0 || self.rugby_auto_finish_minutes <= 0 {
            anyhow::bail!("auto-finish timeouts must be positive");
        }
        if self.vendor_max_attempts == 0 {
            anyhow::bail!("vendor_max_attempts must be at least 1");
        }
        if self.ai_enabled && self.ai_max_candidates == 0 {
            anyhow::bail!("ai_max_candidates must be at least 1 when the arbiter is enabled");
        }
        Ok(())
    }

    pub fn enabled_sports(&self) -> Vec<Sport> {
        Sport::ALL
            .into_iter()
            .filter(|sport| match sport {
                Sport::Football => self.football_enabled,
                Sport::Rugby => self.rugby_enabled,
            })
            .collect()
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        let base_delay = Duration::from_millis(self.vendor_backoff_ms);
        RetryPolicy {
            max_attempts: self.vendor_max_attempts,
            base_delay,
            max_delay: base_delay.saturating_mul(16),
        }
    }

    pub fn sync_settings(&self) -> SyncSettings {
        SyncSettings {
            sports: self.enabled_sports(),
            thresholds: Thresholds {
                attach_id: self.threshold_attach_id,
                update_live: self.threshold_update_live,
                promote_finished: self.threshold_promote_finished,
                team_match: self.threshold_team_match,
                stale_link_override: self.threshold_stale_link,
            },
            match_window: chrono::Duration::days(self.match_window_days),
            finish_window: chrono::Duration::minutes(self.finish_window_minutes),
            recent_sync_window: chrono::Duration::minutes(self.recent_sync_minutes),
            rollback_window: chrono::Duration::hours(self.rollback_window_hours),
            rollback_wrong_finishes: self.rollback_wrong_finishes,
            auto_finish: AutoFinishPolicy {
                football: chrono::Duration::minutes(self.football_auto_finish_minutes),
                rugby: chrono::Duration::minutes(self.rugby_auto_finish_minutes),
            },
            ai_enabled: self.ai_enabled,
            lookback_days: self.lookback_days,
            ai_max_candidates: self.ai_max_candidates,
        }
    }
}
