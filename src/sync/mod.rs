//! Reconciliation of vendor match records with the app's games.
//!
//! A run collects one batch of records, pairs each with at most one game
//! (direct id first, then team names, then the optional arbiter), plans the
//! allowed transitions and writes them. LIVE games nobody reported for too
//! long are closed by the auto-finish sweep.

pub mod auto_finish;
pub mod gates;
pub mod job;
pub mod reconciler;
pub mod scoring;
pub mod settings;
pub mod team_resolver;
pub mod transition;

pub use job::SyncJob;
pub use settings::{AutoFinishPolicy, SyncSettings, Thresholds};
