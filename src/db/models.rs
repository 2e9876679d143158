use chrono::{DateTime, Utc};
use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSql, ToSqlOutput, ValueRef};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Implements text round-tripping (Display, FromStr, rusqlite ToSql/FromSql)
/// for a fieldless enum stored as an upper-case tag.
macro_rules! text_enum {
    ($ty:ident { $($variant:ident => $tag:literal),+ $(,)? }) => {
        impl $ty {
            pub fn as_str(&self) -> &'static str {
                match self {
                    $($ty::$variant => $tag,)+
                }
            }
        }

        impl fmt::Display for $ty {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.as_str())
            }
        }

        impl FromStr for $ty {
            type Err = anyhow::Error;

            fn from_str(s: &str) -> anyhow::Result<Self> {
                match s.trim().to_ascii_uppercase().as_str() {
                    $($tag => Ok($ty::$variant),)+
                    other => anyhow::bail!("unknown {} '{}'", stringify!($ty), other),
                }
            }
        }

        impl ToSql for $ty {
            fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
                Ok(ToSqlOutput::from(self.as_str()))
            }
        }

        impl FromSql for $ty {
            fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
                value
                    .as_str()?
                    .parse()
                    .map_err(|e: anyhow::Error| FromSqlError::Other(e.into()))
            }
        }
    };
}

/// Sport partition. Teams, competitions and vendor feeds never cross it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Sport {
    Football,
    Rugby,
}

text_enum!(Sport {
    Football => "FOOTBALL",
    Rugby => "RUGBY",
});

impl Sport {
    pub const ALL: [Sport; 2] = [Sport::Football, Sport::Rugby];
}

/// Internal game lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum GameStatus {
    Upcoming,
    Live,
    Finished,
    Cancelled,
    Rescheduled,
}

text_enum!(GameStatus {
    Upcoming => "UPCOMING",
    Live => "LIVE",
    Finished => "FINISHED",
    Cancelled => "CANCELLED",
    Rescheduled => "RESCHEDULED",
});

/// How a finished game was decided.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DecidedBy {
    Regulation,
    ExtraTime,
    Penalties,
}

text_enum!(DecidedBy {
    Regulation => "REGULATION",
    ExtraTime => "EXTRA_TIME",
    Penalties => "PENALTIES",
});

/// Who moved a game to FINISHED.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FinishSource {
    /// A validated vendor record reported full time
    Vendor,
    /// The stale-LIVE sweep closed the game with its last known score
    AutoFinish,
}

text_enum!(FinishSource {
    Vendor => "VENDOR",
    AutoFinish => "AUTO_FINISH",
});

/// Home/away score pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ScorePair {
    pub home: i32,
    pub away: i32,
}

impl ScorePair {
    pub fn new(home: i32, away: i32) -> Self {
        ScorePair { home, away }
    }

    /// Same score seen from the other side.
    pub fn swapped(self) -> Self {
        ScorePair {
            home: self.away,
            away: self.home,
        }
    }

    /// Builds a pair only when both sides are known.
    pub fn from_parts(home: Option<i32>, away: Option<i32>) -> Option<Self> {
        Some(ScorePair::new(home?, away?))
    }
}

impl fmt::Display for ScorePair {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.home, self.away)
    }
}

/// Points awarded per prediction tier within a competition
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScoringSystem {
    /// Exact score predicted
    pub exact: i32,
    /// Right goal difference (football) or right winner with a close margin (rugby)
    pub difference: i32,
    /// Right winner or draw
    pub outcome: i32,
}

impl Default for ScoringSystem {
    fn default() -> Self {
        ScoringSystem {
            exact: 3,
            difference: 2,
            outcome: 1,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Team {
    pub id: i64,
    pub name: String,
    /// Short name or alias, e.g. "Sporting CP"
    pub short_name: Option<String>,
    pub sport: Sport,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Competition {
    pub id: i64,
    pub name: String,
    pub sport: Sport,
    pub scoring: ScoringSystem,
}

/// A tracked game with its team and competition joins.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Game {
    pub id: i64,
    pub competition: Competition,
    pub home: Team,
    pub away: Team,
    pub scheduled_at: DateTime<Utc>,
    pub status: GameStatus,
    /// Vendor fixture id. Vendors reuse ids across seasons, so this is a hint.
    pub external_id: Option<String>,
    /// Raw vendor status code ("HT", "1H", "FT", ...)
    pub external_status: Option<String>,
    pub live_score: Option<ScorePair>,
    pub final_score: Option<ScorePair>,
    /// Minutes played. `None` while LIVE means halftime.
    pub elapsed: Option<i32>,
    pub decided_by: Option<DecidedBy>,
    pub finish_source: Option<FinishSource>,
    pub finished_at: Option<DateTime<Utc>>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl Game {
    pub fn sport(&self) -> Sport {
        self.competition.sport
    }

    /// FINISHED with a final score: never touched again by the sync job.
    pub fn is_terminal(&self) -> bool {
        self.status == GameStatus::Finished && self.final_score.is_some()
    }

    pub fn has_team(&self, team_id: i64) -> bool {
        self.home.id == team_id || self.away.id == team_id
    }

    pub fn label(&self) -> String {
        format!("#{} {} vs {}", self.id, self.home.name, self.away.name)
    }
}

/// Row data for inserting a new game (fixture imports, tests).
#[derive(Debug, Clone)]
pub struct NewGame {
    pub competition_id: i64,
    pub home_team_id: i64,
    pub away_team_id: i64,
    pub scheduled_at: DateTime<Utc>,
    pub status: GameStatus,
    pub external_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bet {
    pub id: i64,
    pub user_id: i64,
    pub game_id: i64,
    pub predicted: ScorePair,
    /// `None` until the game is finished
    pub points: Option<i32>,
    pub scored_at: Option<DateTime<Utc>>,
}

/// Per-user leaderboard counters for one competition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserCompetitionStats {
    pub user_id: i64,
    pub competition_id: i64,
    pub total_points: i64,
    pub exact_scores: i64,
    pub correct_outcomes: i64,
    pub scored_bets: i64,
}

/// Final result attached to a FINISHED transition.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FinalResult {
    pub score: ScorePair,
    pub decided_by: DecidedBy,
    pub source: FinishSource,
    pub finished_at: DateTime<Utc>,
}

/// Post-state of every live field the sync job owns on one game.
/// Applied atomically together with bet rescoring when `finish` is set.
#[derive(Debug, Clone, PartialEq)]
pub struct GameUpdate {
    pub game_id: i64,
    pub status: GameStatus,
    pub external_id: Option<String>,
    pub external_status: Option<String>,
    pub live_score: Option<ScorePair>,
    pub elapsed: Option<i32>,
    pub finish: Option<FinalResult>,
    pub last_sync_at: Option<DateTime<Utc>>,
}

impl GameUpdate {
    /// Whether writing this update would change anything but the sync stamp.
    pub fn changes(&self, game: &Game) -> bool {
        self.status != game.status
            || self.external_id != game.external_id
            || self.external_status != game.external_status
            || self.live_score != game.live_score
            || self.elapsed != game.elapsed
            || self.finish.map(|f| f.score) != game.final_score
    }
}

/// Removal of a stale external link, optionally undoing a finish it caused.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkReset {
    pub game_id: i64,
    pub rollback_finish: bool,
}

/// One audit row: an accepted match or a rejected gate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub run_id: String,
    pub source: String,
    pub external_id: String,
    pub game_id: Option<i64>,
    pub gate: String,
    pub detail: String,
    pub confidence: Option<f64>,
    pub date_delta_minutes: Option<i64>,
}

/// Counters for one reconciliation pass
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncReport {
    pub run_id: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub external_matches: usize,
    pub updated: usize,
    pub finished: usize,
    pub auto_finished: usize,
    pub rejected: usize,
    pub unmatched: usize,
    pub ai_accepted: usize,
    pub link_resets: usize,
    pub bets_scored: usize,
    pub failures: usize,
}
