//! API-Football (v3) adapter.
//!
//! Records arrive nested (`fixture`/`teams`/`goals`/`score`) from the REST
//! endpoints and occasionally flat (`id`/`status`/`homeTeam`/`awayTeam`) from
//! the livescore push relay. Both shapes deserialize into [`RawFixture`].

use serde::Deserialize;

use super::provider::VendorAdapter;
use super::{kickoff_from, normalize_records, ExternalMatch, RawId, RawNamed, RawPair, RawStatus, RawTeams, VendorPhase};
use crate::db::models::{DecidedBy, Sport};

#[derive(Debug, Deserialize)]
struct RawFixture {
    fixture: Option<FixtureInfo>,
    // flat shape
    id: Option<RawId>,
    date: Option<String>,
    timestamp: Option<i64>,
    status: Option<RawStatus>,
    #[serde(rename = "homeTeam")]
    home_team: Option<String>,
    #[serde(rename = "awayTeam")]
    away_team: Option<String>,
    // both shapes
    league: Option<RawNamed>,
    teams: Option<RawTeams>,
    goals: Option<RawPair>,
    score: Option<ScoreBreakdown>,
}

#[derive(Debug, Deserialize)]
struct FixtureInfo {
    id: RawId,
    date: Option<String>,
    timestamp: Option<i64>,
    status: Option<RawStatus>,
}

/// Only extra time is read; `penalty` (shootout) is never authoritative.
#[derive(Debug, Deserialize)]
struct ScoreBreakdown {
    extratime: Option<RawPair>,
}

#[derive(Debug, Clone, Default)]
pub struct FootballAdapter;

impl FootballAdapter {
    pub fn new() -> Self {
        FootballAdapter
    }

    fn convert(&self, raw: RawFixture) -> Result<ExternalMatch, String> {
        let (id, date, timestamp, status) = match raw.fixture {
            Some(f) => (Some(f.id), f.date, f.timestamp, f.status),
            None => (raw.id, raw.date, raw.timestamp, raw.status),
        };
        let id = id
            .and_then(RawId::into_string)
            .ok_or("missing fixture id")?;
        let status = status.ok_or_else(|| format!("fixture {}: missing status", id))?;
        let code = status.code().trim().to_ascii_uppercase();
        let phase = self
            .map_status(&code)
            .ok_or_else(|| format!("fixture {}: unknown status '{}'", id, code))?;

        let (home_team, away_team) = match (raw.teams, raw.home_team, raw.away_team) {
            (Some(teams), _, _) => (teams.home.name, teams.away.name),
            (None, Some(home), Some(away)) => (home, away),
            _ => return Err(format!("fixture {}: missing team names", id)),
        };
        if home_team.trim().is_empty() || away_team.trim().is_empty() {
            return Err(format!("fixture {}: blank team name", id));
        }

        let kickoff = kickoff_from(timestamp, date.as_deref())
            .ok_or_else(|| format!("fixture {}: missing kickoff", id))?;

        Ok(ExternalMatch {
            source: self.name().to_string(),
            sport: Sport::Football,
            id,
            phase,
            raw_status: code,
            elapsed: status.elapsed(),
            home_team: home_team.trim().to_string(),
            away_team: away_team.trim().to_string(),
            score: raw.goals.as_ref().and_then(RawPair::pair),
            extra_time_score: raw
                .score
                .as_ref()
                .and_then(|s| s.extratime.as_ref())
                .and_then(RawPair::pair),
            kickoff,
            competition: raw.league.map(|l| l.name).unwrap_or_default(),
        })
    }
}

impl VendorAdapter for FootballAdapter {
    fn name(&self) -> &str {
        "API-Football"
    }

    fn sport(&self) -> Sport {
        Sport::Football
    }

    fn resource(&self) -> &str {
        "fixtures"
    }

    fn supports_live_filter(&self) -> bool {
        true
    }

    fn map_status(&self, code: &str) -> Option<VendorPhase> {
        let phase = match code.trim().to_ascii_uppercase().as_str() {
            "TBD" | "NS" => VendorPhase::NotStarted,
            "1H" | "2H" | "ET" | "P" | "LIVE" => VendorPhase::InPlay,
            "HT" | "BT" => VendorPhase::Break,
            "FT" | "AWD" | "WO" => VendorPhase::Finished(DecidedBy::Regulation),
            "AET" => VendorPhase::Finished(DecidedBy::ExtraTime),
            "PEN" => VendorPhase::Finished(DecidedBy::Penalties),
            "PST" => VendorPhase::Postponed,
            "SUSP" => VendorPhase::Suspended,
            "INT" => VendorPhase::Interrupted,
            "CANC" => VendorPhase::Cancelled,
            "ABD" => VendorPhase::Abandoned,
            _ => return None,
        };
        Some(phase)
    }

    fn normalize(&self, payload: &serde_json::Value) -> Vec<ExternalMatch> {
        normalize_records(self.name(), payload, |raw: RawFixture| self.convert(raw))
    }
}
