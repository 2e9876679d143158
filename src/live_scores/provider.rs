use async_trait::async_trait;
use chrono::NaiveDate;

use super::{ExternalMatch, VendorPhase};
use crate::db::models::Sport;

/// Normalizes one vendor's raw payloads. Pure; never touches storage.
pub trait VendorAdapter: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    fn sport(&self) -> Sport;

    /// API path segment for fixture listings, e.g. `"fixtures"`.
    fn resource(&self) -> &str;

    /// Whether the vendor supports a `live=all` filter on `resource()`.
    fn supports_live_filter(&self) -> bool;

    /// Fixed status-code table. `None` for codes the vendor never documented.
    fn map_status(&self, code: &str) -> Option<VendorPhase>;

    /// Turn a raw response body into canonical records, skipping bad ones.
    fn normalize(&self, payload: &serde_json::Value) -> Vec<ExternalMatch>;
}

/// Trait that every external match feed must implement.
///
/// Implementations retry transient failures themselves and return empty
/// results when they give up: absence means "no data this run", never an
/// error that halts reconciliation.
#[async_trait]
pub trait MatchSource: Send + Sync {
    /// Human-readable name for logging.
    fn name(&self) -> &str;

    fn sport(&self) -> Sport;

    async fn get_live_matches(&self) -> Vec<ExternalMatch>;

    /// Fixtures scheduled between `start` and `end`, both inclusive.
    async fn get_matches_by_date_range(&self, start: NaiveDate, end: NaiveDate)
        -> Vec<ExternalMatch>;

    async fn get_match_by_id(&self, id: &str) -> Option<ExternalMatch>;
}
