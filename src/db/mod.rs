use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, Connection, OptionalExtension, ToSql, Transaction};
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use tracing::debug;

pub mod models;
use models::*;

use crate::sync::scoring::calculate_bet_points;

/// Thread-safe SQLite connection pool (single connection with mutex)
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

/// What a single game write did to the bets on that game.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriteOutcome {
    pub bets_scored: usize,
    pub users_refreshed: usize,
    /// The game was already final when the write landed; nothing changed
    pub skipped: bool,
}

impl Database {
    /// Open (or create) the SQLite database at the given path
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open database at {}", path))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
        let db = Database {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.run_migrations()?;
        Ok(db)
    }

    /// Run schema migrations (idempotent)
    fn run_migrations(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(SCHEMA_SQL)?;
        Ok(())
    }

    // ── Seeding ──────────────────────────────────────────────────────────────

    pub fn insert_competition(
        &self,
        name: &str,
        sport: Sport,
        scoring: ScoringSystem,
    ) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO competitions (name, sport, scoring_exact, scoring_difference, scoring_outcome)
             VALUES (?1,?2,?3,?4,?5)",
            params![name, sport, scoring.exact, scoring.difference, scoring.outcome],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_team(&self, name: &str, short_name: Option<&str>, sport: Sport) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO teams (name, short_name, sport) VALUES (?1,?2,?3)",
            params![name, short_name, sport],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_game(&self, game: &NewGame) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO games (competition_id, home_team_id, away_team_id, scheduled_at, status, external_id)
             VALUES (?1,?2,?3,?4,?5,?6)",
            params![
                game.competition_id,
                game.home_team_id,
                game.away_team_id,
                game.scheduled_at,
                game.status,
                game.external_id,
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    pub fn insert_bet(&self, user_id: i64, game_id: i64, predicted: ScorePair) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO bets (user_id, game_id, predicted_home, predicted_away) VALUES (?1,?2,?3,?4)",
            params![user_id, game_id, predicted.home, predicted.away],
        )?;
        Ok(conn.last_insert_rowid())
    }

    // ── Games ────────────────────────────────────────────────────────────────

    /// Games the sync job may look at this run: everything not yet final,
    /// plus vendor-finished games recent enough to still be rolled back.
    pub fn list_tracked_games(
        &self,
        sports: &[Sport],
        now: DateTime<Utc>,
        rollback_window: Duration,
    ) -> Result<Vec<Game>> {
        if sports.is_empty() {
            return Ok(Vec::new());
        }
        let placeholders: Vec<String> = (0..sports.len()).map(|i| format!("?{}", i + 2)).collect();
        let sql = format!(
            "{} WHERE c.sport IN ({})
               AND (g.status IN ('UPCOMING','LIVE','RESCHEDULED')
                    OR (g.status = 'FINISHED'
                        AND (g.home_score IS NULL OR g.away_score IS NULL
                             OR (g.finish_source = 'VENDOR' AND g.finished_at >= ?1))))
             ORDER BY g.scheduled_at, g.id",
            GAME_SELECT,
            placeholders.join(",")
        );
        let cutoff = now - rollback_window;
        let mut args: Vec<&dyn ToSql> = vec![&cutoff];
        args.extend(sports.iter().map(|s| s as &dyn ToSql));

        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&sql)?;
        let games = stmt
            .query_map(args.as_slice(), map_game)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(games)
    }

    pub fn get_game(&self, id: i64) -> Result<Option<Game>> {
        let conn = self.conn.lock().unwrap();
        let game = conn
            .query_row(
                &format!("{} WHERE g.id = ?1", GAME_SELECT),
                params![id],
                map_game,
            )
            .optional()?;
        Ok(game)
    }

    /// Every team of one sport, ordered by id.
    pub fn list_teams(&self, sport: Sport) -> Result<Vec<Team>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT id, name, short_name, sport FROM teams WHERE sport=?1 ORDER BY id")?;
        let teams = stmt
            .query_map(params![sport], |row| {
                Ok(Team {
                    id: row.get(0)?,
                    name: row.get(1)?,
                    short_name: row.get(2)?,
                    sport: row.get(3)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(teams)
    }

    /// Write one game's live fields; on a FINISHED transition also rescore
    /// its bets and refresh the leaderboard rows, all in one transaction.
    ///
    /// A game that is FINISHED with a final score is never rewritten, even
    /// by an update planned from an older snapshot; such writes come back
    /// with `skipped` set.
    pub fn apply_game_update(&self, update: &GameUpdate) -> Result<WriteOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let final_score = update.finish.map(|f| f.score);
        let changed = tx.execute(
            "UPDATE games SET
                status=?1, external_id=?2, external_status=?3,
                live_home_score=?4, live_away_score=?5, elapsed=?6,
                home_score=?7, away_score=?8, decided_by=?9,
                finish_source=?10, finished_at=?11, last_sync_at=?12
             WHERE id=?13 AND NOT (status='FINISHED' AND home_score IS NOT NULL)",
            params![
                update.status,
                update.external_id,
                update.external_status,
                update.live_score.map(|s| s.home),
                update.live_score.map(|s| s.away),
                update.elapsed,
                final_score.map(|s| s.home),
                final_score.map(|s| s.away),
                update.finish.map(|f| f.decided_by),
                update.finish.map(|f| f.source),
                update.finish.map(|f| f.finished_at),
                update.last_sync_at,
                update.game_id,
            ],
        )?;
        if changed == 0 {
            let exists = tx
                .query_row("SELECT 1 FROM games WHERE id=?1", params![update.game_id], |_| Ok(()))
                .optional()?
                .is_some();
            if !exists {
                anyhow::bail!("game {} not found", update.game_id);
            }
            debug!("Game {} is final; write skipped", update.game_id);
            return Ok(WriteOutcome {
                skipped: true,
                ..WriteOutcome::default()
            });
        }

        let outcome = match update.finish {
            Some(finish) => score_bets(&tx, update.game_id, finish.score, finish.finished_at)?,
            None => WriteOutcome::default(),
        };

        tx.commit()?;
        Ok(outcome)
    }

    /// Drop a stale external link. With `rollback_finish` the game goes back
    /// to UPCOMING and every point it produced is withdrawn.
    pub fn reset_external_link(&self, reset: &LinkReset) -> Result<WriteOutcome> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let mut outcome = WriteOutcome::default();
        if reset.rollback_finish {
            tx.execute(
                "UPDATE games SET
                    status='UPCOMING', external_id=NULL, external_status=NULL,
                    live_home_score=NULL, live_away_score=NULL, elapsed=NULL,
                    home_score=NULL, away_score=NULL, decided_by=NULL,
                    finish_source=NULL, finished_at=NULL
                 WHERE id=?1",
                params![reset.game_id],
            )?;
            let users = bet_users(&tx, reset.game_id)?;
            outcome.bets_scored = tx.execute(
                "UPDATE bets SET points=NULL, scored_at=NULL WHERE game_id=?1",
                params![reset.game_id],
            )?;
            let competition_id = game_competition(&tx, reset.game_id)?;
            for user_id in &users {
                refresh_user_stats(&tx, *user_id, competition_id, Utc::now())?;
            }
            outcome.users_refreshed = users.len();
        } else {
            tx.execute(
                "UPDATE games SET external_id=NULL, external_status=NULL WHERE id=?1",
                params![reset.game_id],
            )?;
        }

        tx.commit()?;
        Ok(outcome)
    }

    // ── Bets & leaderboard ───────────────────────────────────────────────────

    pub fn list_bets(&self, game_id: i64) -> Result<Vec<Bet>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, game_id, predicted_home, predicted_away, points, scored_at
             FROM bets WHERE game_id=?1 ORDER BY id",
        )?;
        let bets = stmt
            .query_map(params![game_id], map_bet)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(bets)
    }

    pub fn get_user_stats(
        &self,
        user_id: i64,
        competition_id: i64,
    ) -> Result<Option<UserCompetitionStats>> {
        let conn = self.conn.lock().unwrap();
        let stats = conn
            .query_row(
                "SELECT user_id, competition_id, total_points, exact_scores, correct_outcomes, scored_bets
                 FROM user_competition_stats WHERE user_id=?1 AND competition_id=?2",
                params![user_id, competition_id],
                |row| {
                    Ok(UserCompetitionStats {
                        user_id: row.get(0)?,
                        competition_id: row.get(1)?,
                        total_points: row.get(2)?,
                        exact_scores: row.get(3)?,
                        correct_outcomes: row.get(4)?,
                        scored_bets: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(stats)
    }

    // ── Audit ────────────────────────────────────────────────────────────────

    pub fn insert_audit(&self, entry: &AuditEntry) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_audit (
                run_id, source, external_id, game_id, gate, detail,
                confidence, date_delta_minutes, created_at
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9)",
            params![
                entry.run_id,
                entry.source,
                entry.external_id,
                entry.game_id,
                entry.gate,
                entry.detail,
                entry.confidence,
                entry.date_delta_minutes,
                Utc::now(),
            ],
        )?;
        Ok(())
    }

    pub fn list_audit(&self, run_id: &str) -> Result<Vec<AuditEntry>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT run_id, source, external_id, game_id, gate, detail, confidence, date_delta_minutes
             FROM sync_audit WHERE run_id=?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![run_id], |row| {
                Ok(AuditEntry {
                    run_id: row.get(0)?,
                    source: row.get(1)?,
                    external_id: row.get(2)?,
                    game_id: row.get(3)?,
                    gate: row.get(4)?,
                    detail: row.get(5)?,
                    confidence: row.get(6)?,
                    date_delta_minutes: row.get(7)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }

    pub fn record_run(&self, report: &SyncReport) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO sync_runs (
                run_id, started_at, finished_at, external_matches, updated, finished,
                auto_finished, rejected, unmatched, ai_accepted, link_resets,
                bets_scored, failures
             ) VALUES (?1,?2,?3,?4,?5,?6,?7,?8,?9,?10,?11,?12,?13)",
            params![
                report.run_id,
                report.started_at,
                report.finished_at,
                report.external_matches as i64,
                report.updated as i64,
                report.finished as i64,
                report.auto_finished as i64,
                report.rejected as i64,
                report.unmatched as i64,
                report.ai_accepted as i64,
                report.link_resets as i64,
                report.bets_scored as i64,
                report.failures as i64,
            ],
        )?;
        Ok(())
    }
}

// ── Transaction helpers ───────────────────────────────────────────────────────

fn score_bets(
    tx: &Transaction,
    game_id: i64,
    actual: ScorePair,
    now: DateTime<Utc>,
) -> Result<WriteOutcome> {
    let (competition_id, sport, scoring) = tx.query_row(
        "SELECT c.id, c.sport, c.scoring_exact, c.scoring_difference, c.scoring_outcome
         FROM games g JOIN competitions c ON c.id = g.competition_id
         WHERE g.id=?1",
        params![game_id],
        |row| {
            Ok((
                row.get::<_, i64>(0)?,
                row.get::<_, Sport>(1)?,
                ScoringSystem {
                    exact: row.get(2)?,
                    difference: row.get(3)?,
                    outcome: row.get(4)?,
                },
            ))
        },
    )?;

    let bets = {
        let mut stmt = tx.prepare(
            "SELECT id, user_id, game_id, predicted_home, predicted_away, points, scored_at
             FROM bets WHERE game_id=?1",
        )?;
        let rows = stmt
            .query_map(params![game_id], map_bet)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        rows
    };

    let mut users = BTreeSet::new();
    for bet in &bets {
        let points = calculate_bet_points(bet.predicted, actual, &scoring, sport);
        tx.execute(
            "UPDATE bets SET points=?1, scored_at=?2 WHERE id=?3",
            params![points, now, bet.id],
        )?;
        users.insert(bet.user_id);
    }
    for user_id in &users {
        refresh_user_stats(tx, *user_id, competition_id, now)?;
    }
    debug!(
        "Scored {} bet(s) on game {} ({} user(s))",
        bets.len(),
        game_id,
        users.len()
    );

    Ok(WriteOutcome {
        bets_scored: bets.len(),
        users_refreshed: users.len(),
        skipped: false,
    })
}

/// Recompute a user's competition counters from scratch so repeated scoring
/// of the same game never double counts.
fn refresh_user_stats(
    tx: &Transaction,
    user_id: i64,
    competition_id: i64,
    now: DateTime<Utc>,
) -> Result<()> {
    let (total_points, exact_scores, correct_outcomes, scored_bets): (i64, i64, i64, i64) = tx
        .query_row(
            "SELECT COALESCE(SUM(b.points),0),
                    COALESCE(SUM(CASE WHEN b.predicted_home=g.home_score
                                       AND b.predicted_away=g.away_score THEN 1 ELSE 0 END),0),
                    COALESCE(SUM(CASE WHEN b.points > 0 THEN 1 ELSE 0 END),0),
                    COUNT(*)
             FROM bets b JOIN games g ON g.id = b.game_id
             WHERE b.user_id=?1 AND g.competition_id=?2 AND b.points IS NOT NULL",
            params![user_id, competition_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
    tx.execute(
        "INSERT INTO user_competition_stats (
            user_id, competition_id, total_points, exact_scores,
            correct_outcomes, scored_bets, updated_at
         ) VALUES (?1,?2,?3,?4,?5,?6,?7)
         ON CONFLICT(user_id, competition_id) DO UPDATE SET
            total_points=excluded.total_points,
            exact_scores=excluded.exact_scores,
            correct_outcomes=excluded.correct_outcomes,
            scored_bets=excluded.scored_bets,
            updated_at=excluded.updated_at",
        params![
            user_id,
            competition_id,
            total_points,
            exact_scores,
            correct_outcomes,
            scored_bets,
            now
        ],
    )?;
    Ok(())
}

fn bet_users(tx: &Transaction, game_id: i64) -> Result<Vec<i64>> {
    let mut stmt = tx.prepare("SELECT DISTINCT user_id FROM bets WHERE game_id=?1")?;
    let users = stmt
        .query_map(params![game_id], |row| row.get(0))?
        .collect::<rusqlite::Result<Vec<i64>>>()?;
    Ok(users)
}

fn game_competition(tx: &Transaction, game_id: i64) -> Result<i64> {
    let id = tx.query_row(
        "SELECT competition_id FROM games WHERE id=?1",
        params![game_id],
        |row| row.get(0),
    )?;
    Ok(id)
}

// ── SQL helpers ────────────────────────────────────────────────────────────────

const GAME_SELECT: &str = "
SELECT g.id, g.scheduled_at, g.status, g.external_id, g.external_status,
       g.live_home_score, g.live_away_score, g.home_score, g.away_score, g.elapsed,
       g.decided_by, g.finish_source, g.finished_at, g.last_sync_at,
       c.id, c.name, c.sport, c.scoring_exact, c.scoring_difference, c.scoring_outcome,
       h.id, h.name, h.short_name, h.sport,
       a.id, a.name, a.short_name, a.sport
FROM games g
JOIN competitions c ON c.id = g.competition_id
JOIN teams h ON h.id = g.home_team_id
JOIN teams a ON a.id = g.away_team_id";

fn map_game(row: &rusqlite::Row) -> rusqlite::Result<Game> {
    Ok(Game {
        id: row.get(0)?,
        scheduled_at: row.get(1)?,
        status: row.get(2)?,
        external_id: row.get(3)?,
        external_status: row.get(4)?,
        live_score: ScorePair::from_parts(row.get(5)?, row.get(6)?),
        final_score: ScorePair::from_parts(row.get(7)?, row.get(8)?),
        elapsed: row.get(9)?,
        decided_by: row.get(10)?,
        finish_source: row.get(11)?,
        finished_at: row.get(12)?,
        last_sync_at: row.get(13)?,
        competition: Competition {
            id: row.get(14)?,
            name: row.get(15)?,
            sport: row.get(16)?,
            scoring: ScoringSystem {
                exact: row.get(17)?,
                difference: row.get(18)?,
                outcome: row.get(19)?,
            },
        },
        home: Team {
            id: row.get(20)?,
            name: row.get(21)?,
            short_name: row.get(22)?,
            sport: row.get(23)?,
        },
        away: Team {
            id: row.get(24)?,
            name: row.get(25)?,
            short_name: row.get(26)?,
            sport: row.get(27)?,
        },
    })
}

fn map_bet(row: &rusqlite::Row) -> rusqlite::Result<Bet> {
    Ok(Bet {
        id: row.get(0)?,
        user_id: row.get(1)?,
        game_id: row.get(2)?,
        predicted: ScorePair::new(row.get(3)?, row.get(4)?),
        points: row.get(5)?,
        scored_at: row.get(6)?,
    })
}

/// SQLite schema (idempotent CREATE IF NOT EXISTS)
pub const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS competitions (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    name               TEXT    NOT NULL,
    sport              TEXT    NOT NULL,
    scoring_exact      INTEGER NOT NULL DEFAULT 3,
    scoring_difference INTEGER NOT NULL DEFAULT 2,
    scoring_outcome    INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS teams (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    name       TEXT    NOT NULL,
    short_name TEXT,
    sport      TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS games (
    id               INTEGER PRIMARY KEY AUTOINCREMENT,
    competition_id   INTEGER NOT NULL,
    home_team_id     INTEGER NOT NULL,
    away_team_id     INTEGER NOT NULL,
    scheduled_at     TEXT    NOT NULL,
    status           TEXT    NOT NULL DEFAULT 'UPCOMING',
    external_id      TEXT,
    external_status  TEXT,
    live_home_score  INTEGER,
    live_away_score  INTEGER,
    home_score       INTEGER,
    away_score       INTEGER,
    elapsed          INTEGER,
    decided_by       TEXT,
    finish_source    TEXT,
    finished_at      TEXT,
    last_sync_at     TEXT,
    FOREIGN KEY (competition_id) REFERENCES competitions(id),
    FOREIGN KEY (home_team_id) REFERENCES teams(id),
    FOREIGN KEY (away_team_id) REFERENCES teams(id)
);

CREATE TABLE IF NOT EXISTS bets (
    id             INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id        INTEGER NOT NULL,
    game_id        INTEGER NOT NULL,
    predicted_home INTEGER NOT NULL,
    predicted_away INTEGER NOT NULL,
    points         INTEGER,
    scored_at      TEXT,
    FOREIGN KEY (game_id) REFERENCES games(id)
);

CREATE TABLE IF NOT EXISTS user_competition_stats (
    user_id          INTEGER NOT NULL,
    competition_id   INTEGER NOT NULL,
    total_points     INTEGER NOT NULL DEFAULT 0,
    exact_scores     INTEGER NOT NULL DEFAULT 0,
    correct_outcomes INTEGER NOT NULL DEFAULT 0,
    scored_bets      INTEGER NOT NULL DEFAULT 0,
    updated_at       TEXT    NOT NULL,
    PRIMARY KEY (user_id, competition_id)
);

CREATE TABLE IF NOT EXISTS sync_audit (
    id                 INTEGER PRIMARY KEY AUTOINCREMENT,
    run_id             TEXT    NOT NULL,
    source             TEXT    NOT NULL,
    external_id        TEXT    NOT NULL,
    game_id            INTEGER,
    gate               TEXT    NOT NULL,
    detail             TEXT    NOT NULL,
    confidence         REAL,
    date_delta_minutes INTEGER,
    created_at         TEXT    NOT NULL
);

CREATE TABLE IF NOT EXISTS sync_runs (
    run_id           TEXT    PRIMARY KEY,
    started_at       TEXT,
    finished_at      TEXT,
    external_matches INTEGER NOT NULL,
    updated          INTEGER NOT NULL,
    finished         INTEGER NOT NULL,
    auto_finished    INTEGER NOT NULL,
    rejected         INTEGER NOT NULL,
    unmatched        INTEGER NOT NULL,
    ai_accepted      INTEGER NOT NULL,
    link_resets      INTEGER NOT NULL,
    bets_scored      INTEGER NOT NULL,
    failures         INTEGER NOT NULL
);

CREATE INDEX IF NOT EXISTS idx_games_status ON games(status);
CREATE INDEX IF NOT EXISTS idx_games_external ON games(external_id);
CREATE INDEX IF NOT EXISTS idx_bets_game ON bets(game_id);
CREATE INDEX IF NOT EXISTS idx_sync_audit_run ON sync_audit(run_id);
"#;
