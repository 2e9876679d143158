//! API-Rugby (v1) adapter.
//!
//! `scores` carries running totals including overtime; each side is either a
//! bare number or `{"total": n}` depending on the endpoint. When the
//! `periods.overtime` block is filled, the total is the extra-time score and
//! the regular-time score is the total minus overtime points.

use serde::Deserialize;

use super::provider::VendorAdapter;
use super::{kickoff_from, normalize_records, ExternalMatch, RawId, RawNamed, RawPair, RawStatus, RawTeams, VendorPhase};
use crate::db::models::{DecidedBy, ScorePair, Sport};

#[derive(Debug, Deserialize)]
struct RawGame {
    id: Option<RawId>,
    date: Option<String>,
    timestamp: Option<i64>,
    status: Option<RawStatus>,
    league: Option<RawNamed>,
    teams: Option<RawTeams>,
    scores: Option<RawPair>,
    periods: Option<Periods>,
}

#[derive(Debug, Deserialize)]
struct Periods {
    overtime: Option<RawPair>,
}

#[derive(Debug, Clone, Default)]
pub struct RugbyAdapter;

impl RugbyAdapter {
    pub fn new() -> Self {
        RugbyAdapter
    }

    fn convert(&self, raw: RawGame) -> Result<ExternalMatch, String> {
        let id = raw
            .id
            .and_then(RawId::into_string)
            .ok_or("missing game id")?;
        let status = raw
            .status
            .ok_or_else(|| format!("game {}: missing status", id))?;
        let code = status.code().trim().to_ascii_uppercase();
        let phase = self
            .map_status(&code)
            .ok_or_else(|| format!("game {}: unknown status '{}'", id, code))?;
        let teams = raw
            .teams
            .ok_or_else(|| format!("game {}: missing teams", id))?;
        if teams.home.name.trim().is_empty() || teams.away.name.trim().is_empty() {
            return Err(format!("game {}: blank team name", id));
        }
        let kickoff = kickoff_from(raw.timestamp, raw.date.as_deref())
            .ok_or_else(|| format!("game {}: missing kickoff", id))?;

        let total = raw.scores.as_ref().and_then(RawPair::pair);
        let overtime = raw
            .periods
            .as_ref()
            .and_then(|p| p.overtime.as_ref())
            .and_then(RawPair::pair);
        let (score, extra_time_score) = match (total, overtime) {
            (Some(total), Some(ot)) => (
                Some(ScorePair::new(total.home - ot.home, total.away - ot.away)),
                Some(total),
            ),
            (total, _) => (total, None),
        };

        Ok(ExternalMatch {
            source: self.name().to_string(),
            sport: Sport::Rugby,
            id,
            phase,
            raw_status: code,
            elapsed: status.elapsed(),
            home_team: teams.home.name.trim().to_string(),
            away_team: teams.away.name.trim().to_string(),
            score,
            extra_time_score,
            kickoff,
            competition: raw.league.map(|l| l.name).unwrap_or_default(),
        })
    }
}

impl VendorAdapter for RugbyAdapter {
    fn name(&self) -> &str {
        "API-Rugby"
    }

    fn sport(&self) -> Sport {
        Sport::Rugby
    }

    fn resource(&self) -> &str {
        "games"
    }

    fn supports_live_filter(&self) -> bool {
        false
    }

    fn map_status(&self, code: &str) -> Option<VendorPhase> {
        let phase = match code.trim().to_ascii_uppercase().as_str() {
            "NS" | "TBD" => VendorPhase::NotStarted,
            "1H" | "2H" | "ET" | "PT" | "LIVE" => VendorPhase::InPlay,
            "HT" | "BT" => VendorPhase::Break,
            "FT" | "AW" | "AWD" => VendorPhase::Finished(DecidedBy::Regulation),
            "AET" => VendorPhase::Finished(DecidedBy::ExtraTime),
            "PEN" | "AP" => VendorPhase::Finished(DecidedBy::Penalties),
            "POST" | "PST" => VendorPhase::Postponed,
            "SUSP" => VendorPhase::Suspended,
            "INTR" | "INT" => VendorPhase::Interrupted,
            "CANC" => VendorPhase::Cancelled,
            "ABD" => VendorPhase::Abandoned,
            _ => return None,
        };
        Some(phase)
    }

    fn normalize(&self, payload: &serde_json::Value) -> Vec<ExternalMatch> {
        normalize_records(self.name(), payload, |raw: RawGame| self.convert(raw))
    }
}
