// SQLite persistence for resumable client state.

use std::sync::{Mutex, MutexGuard};

use anyhow::{Context, Result};
use rusqlite::{params, Connection};

use crate::protocol::{MatchId, QuestionId};

/// SQLite-backed store for the match to resume after a restart and the
/// questions already answered in it.
pub struct Database {
    conn: Mutex<Connection>,
}

impl Database {
    /// Open (or create) a SQLite database at `path` and ensure all tables
    /// exist. Pass `":memory:"` for an ephemeral in-memory database.
    pub fn open(path: &str) -> Result<Self> {
        let conn = Connection::open(path)
            .with_context(|| format!("failed to open database at {path}"))?;

        conn.execute_batch(
            "PRAGMA journal_mode = WAL;
             PRAGMA busy_timeout = 5000;",
        )
        .context("failed to set database pragmas")?;

        conn.execute_batch(
            "
            CREATE TABLE IF NOT EXISTS client_state (
                key   TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS submissions (
                match_id     INTEGER NOT NULL,
                question_id  INTEGER NOT NULL,
                submitted_at TEXT NOT NULL DEFAULT (strftime('%Y-%m-%dT%H:%M:%fZ', 'now')),
                PRIMARY KEY (match_id, question_id)
            );
            ",
        )
        .context("failed to create database schema")?;

        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Panics if the mutex is poisoned.
    fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().expect("database mutex poisoned")
    }

    // ------------------------------------------------------------------
    // Key-value state
    // ------------------------------------------------------------------

    const LAST_MATCH_KEY: &'static str = "last_match_id";

    /// Persist a JSON value under `key`, replacing any previous value.
    pub fn save_state(&self, key: &str, value: &serde_json::Value) -> Result<()> {
        let conn = self.conn();
        let json_str =
            serde_json::to_string(value).context("failed to serialize state value")?;
        conn.execute(
            "INSERT OR REPLACE INTO client_state (key, value) VALUES (?1, ?2)",
            params![key, json_str],
        )
        .context("failed to save state")?;
        Ok(())
    }

    /// Load a previously saved JSON value. `None` if the key is absent.
    pub fn load_state(&self, key: &str) -> Result<Option<serde_json::Value>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare("SELECT value FROM client_state WHERE key = ?1")
            .context("failed to prepare load_state query")?;

        let mut rows = stmt
            .query_map(params![key], |row| row.get::<_, String>(0))
            .context("failed to query client state")?;

        match rows.next() {
            Some(row_result) => {
                let json_str = row_result.context("failed to read state row")?;
                let value = serde_json::from_str(&json_str)
                    .context("failed to deserialize state value")?;
                Ok(Some(value))
            }
            None => Ok(None),
        }
    }

    pub fn set_last_match_id(&self, match_id: MatchId) -> Result<()> {
        self.save_state(Self::LAST_MATCH_KEY, &serde_json::Value::from(match_id))
    }

    /// The match the client was in when it last stopped, if any.
    pub fn last_match_id(&self) -> Result<Option<MatchId>> {
        let value = self.load_state(Self::LAST_MATCH_KEY)?;
        Ok(value.and_then(|v| v.as_i64()))
    }

    /// Forget the resumable match and its submissions.
    pub fn clear_last_match(&self) -> Result<()> {
        let mut conn = self.conn();
        let tx = conn.transaction().context("failed to begin transaction")?;
        tx.execute(
            "DELETE FROM client_state WHERE key = ?1",
            params![Self::LAST_MATCH_KEY],
        )
        .context("failed to delete last match id")?;
        tx.execute("DELETE FROM submissions", [])
            .context("failed to delete submissions")?;
        tx.commit().context("failed to commit clear_last_match")?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Submissions
    // ------------------------------------------------------------------

    /// Record that an answer left for `question_id`. Re-recording is a no-op.
    pub fn record_submission(&self, match_id: MatchId, question_id: QuestionId) -> Result<()> {
        let conn = self.conn();
        conn.execute(
            "INSERT OR IGNORE INTO submissions (match_id, question_id) VALUES (?1, ?2)",
            params![match_id, question_id],
        )
        .context("failed to record submission")?;
        Ok(())
    }

    pub fn load_submissions(&self, match_id: MatchId) -> Result<Vec<QuestionId>> {
        let conn = self.conn();
        let mut stmt = conn
            .prepare(
                "SELECT question_id FROM submissions WHERE match_id = ?1 ORDER BY question_id",
            )
            .context("failed to prepare load_submissions query")?;

        let ids = stmt
            .query_map(params![match_id], |row| row.get(0))
            .context("failed to query submissions")?
            .collect::<std::result::Result<Vec<QuestionId>, _>>()
            .context("failed to map submission rows")?;

        Ok(ids)
    }
}
