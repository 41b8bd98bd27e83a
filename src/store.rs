//! Optional verdict persistence, keyed by a run table identifier.
//!
//! Absent by default; enabled by the hidden store flag. The previous run's
//! outcomes are used to flag regressions in the final report.

use std::collections::HashMap;

use anyhow::Result;
use chrono::Utc;
use r2d2::Pool as R2D2Pool;
use r2d2_sqlite::SqliteConnectionManager;
use rusqlite::Connection;

use crate::report::{Outcome, Verdict};

pub type Pool = R2D2Pool<SqliteConnectionManager>;

/// Default database path, created in the working directory.
pub const DEFAULT_DB_PATH: &str = "TestCase.db";

pub struct ResultStore {
    pool: Pool,
    table: String,
}

impl ResultStore {
    /// Open (or create) the verdict database for the given table identifier.
    pub fn open(path: &str, table: &str) -> Result<Self> {
        let manager = SqliteConnectionManager::file(path).with_init(|c| {
            c.execute_batch(
                "PRAGMA journal_mode = WAL;
                 PRAGMA synchronous = NORMAL;
                 PRAGMA busy_timeout = 5000;",
            )
        });
        let pool = R2D2Pool::new(manager)?;

        let conn = pool.get()?;
        migrate(&conn)?;

        Ok(Self {
            pool,
            table: table.to_string(),
        })
    }

    /// Append one run's verdicts.
    pub fn record(&self, verdicts: &[Verdict]) -> Result<()> {
        let conn = self.pool.get()?;
        let created_at = Utc::now().to_rfc3339();
        for v in verdicts {
            conn.execute(
                "INSERT INTO verdicts (tbl, case_id, outcome, retries, reason, elapsed_ms, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                rusqlite::params![
                    self.table,
                    v.case_id,
                    v.outcome.to_string(),
                    v.retries,
                    v.reason,
                    v.elapsed.as_millis() as i64,
                    created_at
                ],
            )?;
        }
        Ok(())
    }

    /// Most recent recorded outcome per case for this table.
    pub fn last_outcomes(&self) -> Result<HashMap<String, Outcome>> {
        let conn = self.pool.get()?;
        let mut stmt = conn.prepare(
            "SELECT case_id, outcome FROM verdicts
             WHERE tbl = ?1
               AND id IN (SELECT MAX(id) FROM verdicts WHERE tbl = ?1 GROUP BY case_id)",
        )?;
        let rows = stmt.query_map(rusqlite::params![self.table], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut outcomes = HashMap::new();
        for row in rows {
            let (case_id, outcome) = row?;
            if let Ok(outcome) = outcome.parse::<Outcome>() {
                outcomes.insert(case_id, outcome);
            }
        }
        Ok(outcomes)
    }
}

fn migrate(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS verdicts (
            id INTEGER PRIMARY KEY,
            tbl TEXT NOT NULL,
            case_id TEXT NOT NULL,
            outcome TEXT NOT NULL,
            retries INTEGER NOT NULL DEFAULT 0,
            reason TEXT,
            elapsed_ms INTEGER,
            created_at TEXT NOT NULL DEFAULT (datetime('now'))
        );

        CREATE INDEX IF NOT EXISTS idx_verdicts_tbl_case ON verdicts(tbl, case_id);",
    )?;
    Ok(())
}
