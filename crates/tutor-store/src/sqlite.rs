//! SQLite connection, schema and column codecs

use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{Connection, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, warn};

use crate::{StoreError, StoreResult};

/// SQLite-based store
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    /// Open or create a store at the given path
    pub fn open(path: impl AsRef<Path>) -> StoreResult<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000;")?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        debug!(path = %path.display(), "Store opened");
        Ok(store)
    }

    /// Create an in-memory store (for testing)
    pub fn in_memory() -> StoreResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> StoreResult<()> {
        let conn = self.conn()?;

        conn.execute_batch(
            r#"
            PRAGMA foreign_keys = ON;

            CREATE TABLE IF NOT EXISTS pairings (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                teacher_id TEXT NOT NULL,
                will_continue INTEGER,
                created_at TEXT NOT NULL
            );

            -- Sessions are never hard-deleted
            CREATE TABLE IF NOT EXISTS sessions (
                id TEXT PRIMARY KEY,
                pairing_id TEXT NOT NULL REFERENCES pairings(id),
                scheduled_at TEXT NOT NULL,
                duration_minutes INTEGER NOT NULL,
                status TEXT NOT NULL,
                kind TEXT NOT NULL,
                teacher_attended INTEGER NOT NULL DEFAULT 0,
                student_attended INTEGER NOT NULL DEFAULT 0,
                meeting_link TEXT,
                reschedule_request_count INTEGER NOT NULL DEFAULT 0
                    CHECK (reschedule_request_count BETWEEN 0 AND 4),
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS reschedule_requests (
                id TEXT PRIMARY KEY,
                session_id TEXT NOT NULL REFERENCES sessions(id),
                requested_by TEXT NOT NULL,
                old_date TEXT NOT NULL,
                candidate_dates_json TEXT NOT NULL,
                status TEXT NOT NULL,
                resulting_date TEXT,
                created_at TEXT NOT NULL,
                responded_at TEXT
            );

            -- Durable one-shot jobs; the name is the idempotency key
            CREATE TABLE IF NOT EXISTS scheduled_jobs (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL UNIQUE,
                fires_at TEXT NOT NULL,
                kind TEXT NOT NULL,
                payload_json TEXT NOT NULL,
                status TEXT NOT NULL,
                last_error TEXT,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS balances (
                user_id TEXT PRIMARY KEY,
                remaining_sessions INTEGER NOT NULL CHECK (remaining_sessions >= 0)
            );

            -- History log (append-only)
            CREATE TABLE IF NOT EXISTS history (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                timestamp TEXT NOT NULL,
                event_json TEXT NOT NULL
            );

            -- Indexes
            CREATE INDEX IF NOT EXISTS idx_pairings_teacher ON pairings(teacher_id);
            CREATE INDEX IF NOT EXISTS idx_sessions_pairing ON sessions(pairing_id);
            CREATE INDEX IF NOT EXISTS idx_reschedule_session ON reschedule_requests(session_id);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_reschedule_one_pending
                ON reschedule_requests(session_id) WHERE status = 'PENDING';
            CREATE INDEX IF NOT EXISTS idx_jobs_fires_at ON scheduled_jobs(fires_at);
            CREATE INDEX IF NOT EXISTS idx_history_timestamp ON history(timestamp);
            "#,
        )?;

        debug!("Store schema initialized");
        Ok(())
    }

    /// Lock the connection
    pub fn conn(&self) -> StoreResult<MutexGuard<'_, Connection>> {
        self.conn
            .lock()
            .map_err(|_| StoreError::Database("store lock poisoned".into()))
    }

    /// Run `f` inside one transaction. Any error rolls everything back.
    pub fn with_tx<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<StoreError>,
    {
        let mut conn = self.conn()?;
        let tx = conn.transaction().map_err(StoreError::from)?;
        let out = f(&*tx)?;
        tx.commit().map_err(StoreError::from)?;
        Ok(out)
    }

    /// Run read-only work on the connection without a transaction
    pub fn read<T, E, F>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce(&Connection) -> Result<T, E>,
        E: From<StoreError>,
    {
        let conn = self.conn()?;
        f(&*conn)
    }

    /// Check if store is healthy
    pub fn is_healthy(&self) -> bool {
        match self.conn.lock() {
            Ok(conn) => conn.query_row("SELECT 1", [], |_| Ok(())).is_ok(),
            Err(_) => {
                warn!("Store lock poisoned");
                false
            }
        }
    }
}

fn conversion_failure<E>(idx: usize, e: E) -> rusqlite::Error
where
    E: std::error::Error + Send + Sync + 'static,
{
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e))
}

/// Read a text column and parse it (ids, tags, instants).
pub(crate) fn text_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value: String = row.get(idx)?;
    value.parse().map_err(|e| conversion_failure(idx, e))
}

/// Nullable variant of [`text_col`]
pub(crate) fn opt_text_col<T>(row: &Row<'_>, idx: usize) -> rusqlite::Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let value: Option<String> = row.get(idx)?;
    value
        .map(|v| v.parse().map_err(|e| conversion_failure(idx, e)))
        .transpose()
}

pub(crate) fn instant_col(row: &Row<'_>, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    text_col(row, idx)
}

pub(crate) fn json_col<T: DeserializeOwned>(row: &Row<'_>, idx: usize) -> rusqlite::Result<T> {
    let value: String = row.get(idx)?;
    serde_json::from_str(&value).map_err(|e| conversion_failure(idx, e))
}

pub(crate) fn instant_text(dt: &DateTime<Utc>) -> String {
    tutor_util::format_instant(dt)
}
