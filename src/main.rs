use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

mod arbiter;
mod config;
mod db;
mod live_scores;
mod sync;

use arbiter::{Arbiter, LlmArbiter};
use config::Config;
use db::models::Sport;
use db::Database;
use live_scores::{ApiSportsClient, FootballAdapter, MatchSource, RugbyAdapter};
use sync::SyncJob;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialise tracing / logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let config = Config::parse();
    config.validate()?;

    // Open database (creates the schema when missing)
    let db = Database::open(&config.database_path)?;
    info!("Database opened: {}", config.database_path);
    if config.init_db {
        info!("Schema ready; exiting");
        return Ok(());
    }

    let settings = config.sync_settings();
    let timeout = Duration::from_secs(config.vendor_timeout_secs);
    let retry = config.retry_policy();

    // One source per enabled sport
    let mut sources: Vec<Arc<dyn MatchSource>> = Vec::new();
    for sport in &settings.sports {
        match sport {
            Sport::Football => {
                if config.football_api_key.is_none() {
                    warn!("FOOTBALL_API_KEY not set; API-Football will likely refuse requests");
                }
                sources.push(Arc::new(ApiSportsClient::new(
                    FootballAdapter::new(),
                    &config.football_api_url,
                    config.football_api_key.clone(),
                    timeout,
                    retry,
                )?));
            }
            Sport::Rugby => {
                if config.rugby_api_key.is_none() {
                    warn!("RUGBY_API_KEY not set; API-Rugby will likely refuse requests");
                }
                sources.push(Arc::new(ApiSportsClient::new(
                    RugbyAdapter::new(),
                    &config.rugby_api_url,
                    config.rugby_api_key.clone(),
                    timeout,
                    retry,
                )?));
            }
        }
    }
    info!("Configured {} match source(s)", sources.len());

    let arbiter: Option<Arc<dyn Arbiter>> = if config.ai_enabled {
        let arbiter = LlmArbiter::new(
            &config.ai_endpoint,
            &config.ai_model,
            Duration::from_secs(config.ai_timeout_secs),
        )?;
        info!("Arbiter enabled: {} at {}", config.ai_model, config.ai_endpoint);
        Some(Arc::new(arbiter))
    } else {
        None
    };

    let job = SyncJob::new(db, sources, arbiter, settings);

    if config.interval_secs == 0 {
        job.run_once().await?;
        return Ok(());
    }

    info!("Syncing every {}s (Ctrl-C to stop)", config.interval_secs);
    let mut interval = tokio::time::interval(Duration::from_secs(config.interval_secs));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = interval.tick() => {
                if let Err(e) = job.run_once().await {
                    error!("Sync run failed: {:#}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Shutting down");
                break;
            }
        }
    }

    Ok(())
}
