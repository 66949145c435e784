//! Persisted shadow of the Session Registry (SPEC_FULL.md §4.D, §6).
//!
//! A thin `rusqlite` wrapper; the connection and statements live behind
//! the Registry and are never exposed directly. Blocking calls are run
//! via `tokio::task::spawn_blocking` so synchronous `rusqlite` I/O never
//! stalls the async runtime (§5).

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};

use crate::error::{RelayError, Result};

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS sessions (
    id TEXT PRIMARY KEY,
    agent_session_id TEXT,
    working_directory TEXT NOT NULL,
    created_at TEXT NOT NULL,
    closed_at TEXT
);
CREATE TABLE IF NOT EXISTS messages (
    session_id TEXT NOT NULL,
    seq INTEGER NOT NULL,
    kind TEXT NOT NULL,
    content TEXT NOT NULL,
    ts TEXT NOT NULL,
    aux_json TEXT,
    PRIMARY KEY (session_id, seq)
);
";

/// One row of the `sessions` table.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub id: String,
    pub agent_session_id: Option<String>,
    pub working_directory: String,
    pub created_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl SessionRow {
    pub fn is_active(&self) -> bool {
        self.closed_at.is_none()
    }
}

/// Synchronous SQLite-backed store. `rusqlite::Connection` is `Send` but
/// not `Sync`, so the connection is held behind a `Mutex` to let
/// `Arc<Storage>` be shared across the `spawn_blocking` tasks that call
/// into it concurrently; every call is still a single blocking-thread
/// operation, never awaited while held.
pub struct Storage {
    conn: Mutex<Connection>,
}

impl Storage {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                RelayError::Config(format!("creating database directory {}: {e}", parent.display()))
            })?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    #[cfg(test)]
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    pub fn insert_session(
        &self,
        id: &str,
        agent_session_id: Option<&str>,
        working_directory: &str,
        created_at: DateTime<Utc>,
    ) -> Result<()> {
        self.conn.lock().unwrap().execute(
            "INSERT INTO sessions (id, agent_session_id, working_directory, created_at, closed_at)
             VALUES (?1, ?2, ?3, ?4, NULL)",
            params![id, agent_session_id, working_directory, created_at.to_rfc3339()],
        )?;
        Ok(())
    }

    pub fn delete_session(&self, id: &str) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute("DELETE FROM sessions WHERE id = ?1", params![id])?;
        Ok(())
    }

    pub fn close_session(&self, id: &str, closed_at: DateTime<Utc>) -> Result<()> {
        self.conn.lock().unwrap().execute(
            "UPDATE sessions SET closed_at = ?1 WHERE id = ?2",
            params![closed_at.to_rfc3339(), id],
        )?;
        Ok(())
    }

    pub fn get_session(&self, id: &str) -> Result<Option<SessionRow>> {
        self.conn
            .lock()
            .unwrap()
            .query_row(
                "SELECT id, agent_session_id, working_directory, created_at, closed_at
                 FROM sessions WHERE id = ?1",
                params![id],
                row_to_session,
            )
            .optional()
            .map_err(RelayError::from)
    }

    pub fn list_sessions(&self) -> Result<Vec<SessionRow>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, agent_session_id, working_directory, created_at, closed_at
             FROM sessions ORDER BY created_at DESC",
        )?;
        let rows = stmt.query_map([], row_to_session)?;
        let mut out = Vec::new();
        for row in rows {
            out.push(row?);
        }
        Ok(out)
    }

    /// Close every row with `closed_at IS NULL` at the given timestamp
    /// (startup reconciliation, §4.D/§7).
    pub fn close_all_open_sessions(&self, closed_at: DateTime<Utc>) -> Result<usize> {
        let affected = self.conn.lock().unwrap().execute(
            "UPDATE sessions SET closed_at = ?1 WHERE closed_at IS NULL",
            params![closed_at.to_rfc3339()],
        )?;
        Ok(affected)
    }
}

fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    let created_at: String = row.get(3)?;
    let closed_at: Option<String> = row.get(4)?;
    Ok(SessionRow {
        id: row.get(0)?,
        agent_session_id: row.get(1)?,
        working_directory: row.get(2)?,
        created_at: parse_rfc3339(&created_at, row, 3)?,
        closed_at: closed_at
            .map(|s| parse_rfc3339(&s, row, 4))
            .transpose()?,
    })
}

fn parse_rfc3339(
    raw: &str,
    _row: &rusqlite::Row<'_>,
    idx: usize,
) -> rusqlite::Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(idx, rusqlite::types::Type::Text, Box::new(e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_get_close_round_trip() {
        let storage = Storage::open_in_memory().unwrap();
        let now = Utc::now();
        storage.insert_session("s1", None, "/w", now).unwrap();
        let row = storage.get_session("s1").unwrap().unwrap();
        assert!(row.is_active());
        storage.close_session("s1", now).unwrap();
        let row = storage.get_session("s1").unwrap().unwrap();
        assert!(!row.is_active());
    }

    #[test]
    fn reconciliation_closes_every_open_session() {
        let storage = Storage::open_in_memory().unwrap();
        let now = Utc::now();
        storage.insert_session("s1", None, "/w1", now).unwrap();
        storage.insert_session("s2", None, "/w2", now).unwrap();
        storage.close_session("s2", now).unwrap();
        let affected = storage.close_all_open_sessions(now).unwrap();
        assert_eq!(affected, 1);
        assert!(!storage.get_session("s1").unwrap().unwrap().is_active());
    }

    #[test]
    fn list_orders_by_created_at_descending() {
        let storage = Storage::open_in_memory().unwrap();
        let t1 = Utc::now() - chrono::Duration::seconds(10);
        let t2 = Utc::now();
        storage.insert_session("older", None, "/w", t1).unwrap();
        storage.insert_session("newer", None, "/w", t2).unwrap();
        let rows = storage.list_sessions().unwrap();
        assert_eq!(rows[0].id, "newer");
        assert_eq!(rows[1].id, "older");
    }
}
