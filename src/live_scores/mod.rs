pub mod client;
pub mod football;
pub mod provider;
pub mod rugby;

pub use client::{ApiSportsClient, RetryPolicy};
pub use football::FootballAdapter;
pub use provider::{MatchSource, VendorAdapter};
pub use rugby::RugbyAdapter;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{debug, info, warn};

use crate::db::models::{DecidedBy, ScorePair, Sport};

/// Status of an external match after mapping the vendor code.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MatchStatus {
    Upcoming,
    Live,
    Finished,
    Cancelled,
}

/// Every vendor status code lands in exactly one phase; the phase then
/// decides the coarse `MatchStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum VendorPhase {
    NotStarted,
    /// A period is being played (halves, extra time, shootout in progress)
    InPlay,
    /// Halftime or a break between periods; the clock is stopped
    Break,
    Finished(DecidedBy),
    Postponed,
    Suspended,
    Interrupted,
    Cancelled,
    Abandoned,
}

impl VendorPhase {
    pub fn status(self) -> MatchStatus {
        match self {
            VendorPhase::NotStarted => MatchStatus::Upcoming,
            VendorPhase::InPlay | VendorPhase::Break => MatchStatus::Live,
            VendorPhase::Finished(_) => MatchStatus::Finished,
            VendorPhase::Postponed
            | VendorPhase::Suspended
            | VendorPhase::Interrupted
            | VendorPhase::Cancelled
            | VendorPhase::Abandoned => MatchStatus::Cancelled,
        }
    }

    pub fn is_in_progress(self) -> bool {
        matches!(self, VendorPhase::InPlay | VendorPhase::Break)
    }

    /// The only phases allowed to send a LIVE game back to UPCOMING.
    pub fn reverts_live(self) -> bool {
        matches!(self, VendorPhase::NotStarted | VendorPhase::Postponed)
    }
}

/// One fixture as reported by a vendor, normalized. Never persisted as is.
#[derive(Debug, Clone, PartialEq)]
pub struct ExternalMatch {
    /// Adapter that produced the record
    pub source: String,
    pub sport: Sport,
    /// Vendor fixture id (reused by vendors across seasons)
    pub id: String,
    pub phase: VendorPhase,
    /// Raw vendor code, e.g. "HT"
    pub raw_status: String,
    pub elapsed: Option<i32>,
    pub home_team: String,
    pub away_team: String,
    /// Regular-time score; `None` means no score yet
    pub score: Option<ScorePair>,
    /// Score after extra time; overrides `score` when present
    pub extra_time_score: Option<ScorePair>,
    pub kickoff: DateTime<Utc>,
    /// Corroborating signal only, never an identity key
    pub competition: String,
}

impl ExternalMatch {
    pub fn status(&self) -> MatchStatus {
        self.phase.status()
    }

    /// Extra-time score when the match went there, else the regular score.
    /// Shootout goals are never part of either.
    pub fn authoritative_score(&self) -> Option<ScorePair> {
        self.extra_time_score.or(self.score)
    }

    pub fn decided_by(&self) -> DecidedBy {
        match self.phase {
            VendorPhase::Finished(DecidedBy::Regulation) if self.extra_time_score.is_some() => {
                DecidedBy::ExtraTime
            }
            VendorPhase::Finished(decided) => decided,
            _ if self.extra_time_score.is_some() => DecidedBy::ExtraTime,
            _ => DecidedBy::Regulation,
        }
    }

    /// Key used to deduplicate records across queries and to address AI verdicts.
    pub fn key(&self) -> String {
        format!("{}:{}", self.source, self.id)
    }
}

// ── Raw payload pieces shared by the API-Sports family ───────────────────────

/// Fixture ids arrive as numbers from one endpoint and strings from another.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawId {
    Num(u64),
    Text(String),
}

impl RawId {
    pub(crate) fn into_string(self) -> Option<String> {
        match self {
            RawId::Num(n) => Some(n.to_string()),
            RawId::Text(s) if !s.trim().is_empty() => Some(s.trim().to_string()),
            RawId::Text(_) => None,
        }
    }
}

/// Status either nested (`{"short":"HT","elapsed":45}`) or a bare code.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawStatus {
    Detailed {
        short: String,
        #[serde(default)]
        elapsed: Option<i32>,
    },
    Code(String),
}

impl RawStatus {
    pub(crate) fn code(&self) -> &str {
        match self {
            RawStatus::Detailed { short, .. } => short,
            RawStatus::Code(code) => code,
        }
    }

    pub(crate) fn elapsed(&self) -> Option<i32> {
        match self {
            RawStatus::Detailed { elapsed, .. } => *elapsed,
            RawStatus::Code(_) => None,
        }
    }
}

/// One side of a score: bare number, `{"total": n}`, or a numeric string.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub(crate) enum RawScore {
    Num(i32),
    Nested {
        #[serde(default)]
        total: Option<i32>,
    },
    Text(String),
}

impl RawScore {
    fn value(&self) -> Option<i32> {
        match self {
            RawScore::Num(n) => Some(*n),
            RawScore::Nested { total } => *total,
            RawScore::Text(s) => s.trim().parse().ok(),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct RawPair {
    #[serde(default)]
    pub home: Option<RawScore>,
    #[serde(default)]
    pub away: Option<RawScore>,
}

impl RawPair {
    /// Both sides or nothing.
    pub(crate) fn pair(&self) -> Option<ScorePair> {
        ScorePair::from_parts(
            self.home.as_ref().and_then(RawScore::value),
            self.away.as_ref().and_then(RawScore::value),
        )
    }
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawNamed {
    pub name: String,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct RawTeams {
    pub home: RawNamed,
    pub away: RawNamed,
}

/// Unix timestamp preferred, ISO date as fallback.
pub(crate) fn kickoff_from(timestamp: Option<i64>, date: Option<&str>) -> Option<DateTime<Utc>> {
    if let Some(ts) = timestamp {
        if let Some(dt) = Utc.timestamp_opt(ts, 0).single() {
            return Some(dt);
        }
    }
    let date = date?;
    DateTime::parse_from_rfc3339(date)
        .map(|d| d.with_timezone(&Utc))
        .ok()
}

/// Split an API-Sports style payload into records and normalize each one on
/// its own, so a single malformed record is skipped instead of failing the
/// whole batch.
pub(crate) fn normalize_records<R, F>(
    source: &str,
    payload: &serde_json::Value,
    mut convert: F,
) -> Vec<ExternalMatch>
where
    R: DeserializeOwned,
    F: FnMut(R) -> Result<ExternalMatch, String>,
{
    let records: Vec<&serde_json::Value> = match payload {
        serde_json::Value::Array(items) => items.iter().collect(),
        serde_json::Value::Object(obj) => match obj.get("response") {
            Some(serde_json::Value::Array(items)) => items.iter().collect(),
            Some(single @ serde_json::Value::Object(_)) => vec![single],
            Some(_) => vec![],
            None => vec![payload],
        },
        _ => vec![],
    };

    let mut out = Vec::with_capacity(records.len());
    for (idx, record) in records.into_iter().enumerate() {
        let parsed = R::deserialize(record)
            .map_err(|e| e.to_string())
            .and_then(&mut convert);
        match parsed {
            Ok(m) => out.push(m),
            Err(reason) => warn!("[{}] Skipping malformed record #{}: {}", source, idx, reason),
        }
    }
    out
}

// ── Batch collection ─────────────────────────────────────────────────────────

/// Fetch one run's worth of external matches from every source concurrently.
///
/// Live records come first, then the date-range side query (recently
/// finished fixtures). A side-query record for a fixture already seen live is
/// dropped. A failing source simply contributes nothing.
pub async fn collect_batch(
    sources: &[Arc<dyn MatchSource>],
    today: NaiveDate,
    lookback_days: i64,
) -> Vec<ExternalMatch> {
    let start = today - chrono::Duration::days(lookback_days.max(0));

    let fetches: Vec<_> = sources
        .iter()
        .map(|source| {
            let source = Arc::clone(source);
            async move {
                let live = source.get_live_matches().await;
                let recent = source.get_matches_by_date_range(start, today).await;
                (source.name().to_string(), live, recent)
            }
        })
        .collect();
    let results = futures_util::future::join_all(fetches).await;

    let mut live_all = Vec::new();
    let mut recent_all = Vec::new();
    for (name, live, recent) in results {
        info!(
            "[{}] {} live record(s), {} from date range",
            name,
            live.len(),
            recent.len()
        );
        live_all.extend(live);
        recent_all.extend(recent);
    }

    let mut seen = HashSet::new();
    let mut batch = Vec::with_capacity(live_all.len() + recent_all.len());
    for m in live_all.into_iter().chain(recent_all) {
        if seen.insert(m.key()) {
            batch.push(m);
        } else {
            debug!("Duplicate record {} dropped", m.key());
        }
    }
    batch
}

/// Look up individual fixtures by id (LIVE games the feeds no longer list)
/// and append whatever comes back.
pub async fn fetch_by_ids(
    sources: &[Arc<dyn MatchSource>],
    wanted: &[(Sport, String)],
    batch: &mut Vec<ExternalMatch>,
) {
    let mut seen: HashSet<String> = batch.iter().map(ExternalMatch::key).collect();
    for (sport, id) in wanted {
        for source in sources.iter().filter(|s| s.sport() == *sport) {
            if let Some(m) = source.get_match_by_id(id).await {
                if seen.insert(m.key()) {
                    debug!("[{}] Fetched {} by id", source.name(), id);
                    batch.push(m);
                }
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use std::sync::Mutex;

    pub(crate) fn ext(id: &str, home: &str, away: &str, phase: VendorPhase) -> ExternalMatch {
        ExternalMatch {
            source: "test".into(),
            sport: Sport::Football,
            id: id.into(),
            phase,
            raw_status: "1H".into(),
            elapsed: Some(30),
            home_team: home.into(),
            away_team: away.into(),
            score: Some(ScorePair::new(0, 0)),
            extra_time_score: None,
            kickoff: Utc.with_ymd_and_hms(2024, 5, 12, 18, 0, 0).unwrap(),
            competition: "Primeira Liga".into(),
        }
    }

    /// In-process source serving canned records.
    pub(crate) struct FakeSource {
        pub sport: Sport,
        pub live: Vec<ExternalMatch>,
        pub recent: Vec<ExternalMatch>,
        pub by_id: Vec<ExternalMatch>,
        pub id_lookups: Mutex<Vec<String>>,
    }

    impl FakeSource {
        pub(crate) fn new(live: Vec<ExternalMatch>) -> Self {
            FakeSource {
                sport: Sport::Football,
                live,
                recent: vec![],
                by_id: vec![],
                id_lookups: Mutex::new(vec![]),
            }
        }
    }

    #[async_trait]
    impl MatchSource for FakeSource {
        fn name(&self) -> &str {
            "test"
        }

        fn sport(&self) -> Sport {
            self.sport
        }

        async fn get_live_matches(&self) -> Vec<ExternalMatch> {
            self.live.clone()
        }

        async fn get_matches_by_date_range(
            &self,
            _start: NaiveDate,
            _end: NaiveDate,
        ) -> Vec<ExternalMatch> {
            self.recent.clone()
        }

        async fn get_match_by_id(&self, id: &str) -> Option<ExternalMatch> {
            self.id_lookups.lock().unwrap().push(id.to_string());
            self.by_id.iter().find(|m| m.id == id).cloned()
        }
    }

    #[test]
    fn test_phase_status_table() {
        assert_eq!(VendorPhase::Break.status(), MatchStatus::Live);
        assert_eq!(VendorPhase::InPlay.status(), MatchStatus::Live);
        assert_eq!(
            VendorPhase::Finished(DecidedBy::Penalties).status(),
            MatchStatus::Finished
        );
        assert_eq!(VendorPhase::Postponed.status(), MatchStatus::Cancelled);
        assert_eq!(VendorPhase::Abandoned.status(), MatchStatus::Cancelled);
        assert!(VendorPhase::Postponed.reverts_live());
        assert!(!VendorPhase::Cancelled.reverts_live());
    }

    #[test]
    fn test_finished_phases_keyed_by_decision() {
        use std::collections::HashSet;
        let phases: HashSet<VendorPhase> = [
            VendorPhase::Finished(DecidedBy::Regulation),
            VendorPhase::Finished(DecidedBy::ExtraTime),
            VendorPhase::Finished(DecidedBy::Penalties),
            VendorPhase::Finished(DecidedBy::Penalties),
            VendorPhase::Break,
        ]
        .into_iter()
        .collect();
        assert_eq!(phases.len(), 4);
        let decisions: HashSet<DecidedBy> = phases
            .iter()
            .filter_map(|p| match p {
                VendorPhase::Finished(d) => Some(*d),
                _ => None,
            })
            .collect();
        assert_eq!(decisions.len(), 3);
    }

    #[test]
    fn test_extra_time_score_wins() {
        let mut m = ext("1", "A", "B", VendorPhase::Finished(DecidedBy::ExtraTime));
        m.score = Some(ScorePair::new(1, 1));
        m.extra_time_score = Some(ScorePair::new(2, 1));
        assert_eq!(m.authoritative_score(), Some(ScorePair::new(2, 1)));
        assert_eq!(m.decided_by(), DecidedBy::ExtraTime);

        m.phase = VendorPhase::Finished(DecidedBy::Regulation);
        assert_eq!(m.decided_by(), DecidedBy::ExtraTime);
    }

    #[test]
    fn test_normalize_records_skips_bad_entries() {
        #[derive(Deserialize)]
        struct R {
            id: u64,
        }
        let payload = serde_json::json!({"response": [{"id": 1}, {"id": "x"}, {"id": 3}]});
        let out = normalize_records::<R, _>("t", &payload, |r| {
            Ok(ext(&r.id.to_string(), "A", "B", VendorPhase::InPlay))
        });
        let ids: Vec<_> = out.iter().map(|m| m.id.as_str()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }

    #[tokio::test]
    async fn test_collect_batch_orders_live_first_and_dedups() {
        let mut src = FakeSource::new(vec![ext("1", "A", "B", VendorPhase::InPlay)]);
        src.recent = vec![
            ext("1", "A", "B", VendorPhase::Finished(DecidedBy::Regulation)),
            ext("2", "C", "D", VendorPhase::Finished(DecidedBy::Regulation)),
        ];
        let sources: Vec<Arc<dyn MatchSource>> = vec![Arc::new(src)];
        let batch = collect_batch(&sources, NaiveDate::from_ymd_opt(2024, 5, 12).unwrap(), 1).await;
        assert_eq!(batch.len(), 2);
        assert_eq!(batch[0].phase, VendorPhase::InPlay);
        assert_eq!(batch[1].id, "2");
    }
}
