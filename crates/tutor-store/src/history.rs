//! History log types and repository

use chrono::{DateTime, Utc};
use rusqlite::{Connection, params};
use serde::{Deserialize, Serialize};
use tracing::debug;
use tutor_api::{JobKind, Party, RescheduleStatus, SessionStatus};
use tutor_util::{JobId, PairingId, RequestId, SessionId};

use crate::sqlite::{instant_col, instant_text, json_col};
use crate::StoreResult;

/// Types of history events
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum HistoryEventType {
    /// Service started
    ServiceStarted,

    /// Service stopped
    ServiceStopped,

    /// Boot-time job replay finished
    JobsReplayed {
        armed: usize,
        fired: usize,
        dropped: usize,
    },

    /// Job callback ran to completion
    JobCompleted {
        job_id: JobId,
        name: String,
        kind: JobKind,
    },

    /// Job callback failed; the job is not retried
    JobFailed {
        job_id: JobId,
        name: String,
        kind: JobKind,
        error: String,
    },

    /// Notification job found too late to be useful
    JobDropped {
        job_id: JobId,
        name: String,
        kind: JobKind,
        fires_at: DateTime<Utc>,
    },

    /// Stale job rows removed
    JobsSwept { removed: usize },

    SessionCreated {
        session_id: SessionId,
        pairing_id: PairingId,
        scheduled_at: DateTime<Utc>,
    },

    SessionTransitioned {
        session_id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
        actor: String,
    },

    RescheduleRequested {
        request_id: RequestId,
        session_id: SessionId,
        requested_by: Party,
    },

    RescheduleResolved {
        request_id: RequestId,
        session_id: SessionId,
        status: RescheduleStatus,
        resulting_date: Option<DateTime<Utc>>,
    },

    RescheduleCancelled {
        request_id: RequestId,
        session_id: SessionId,
    },

    /// Client connected
    ClientConnected {
        client_id: String,
        role: String,
        uid: Option<u32>,
    },

    /// Client disconnected
    ClientDisconnected { client_id: String },
}

/// Full history entry with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Row id, assigned by the store
    pub id: i64,

    pub timestamp: DateTime<Utc>,

    pub event: HistoryEventType,
}

impl HistoryEntry {
    pub fn new(event: HistoryEventType, timestamp: DateTime<Utc>) -> Self {
        Self {
            id: 0, // Will be set by store
            timestamp,
            event,
        }
    }
}

pub struct HistoryRepo;

impl HistoryRepo {
    /// Append an entry, returning its row id
    pub fn append(conn: &Connection, entry: &HistoryEntry) -> StoreResult<i64> {
        let event_json = serde_json::to_string(&entry.event)?;
        conn.execute(
            "INSERT INTO history (timestamp, event_json) VALUES (?1, ?2)",
            params![instant_text(&entry.timestamp), event_json],
        )?;

        let id = conn.last_insert_rowid();
        debug!(history_id = id, "History entry appended");
        Ok(id)
    }

    /// Shorthand for appending an event at `timestamp`
    pub fn record(
        conn: &Connection,
        event: HistoryEventType,
        timestamp: DateTime<Utc>,
    ) -> StoreResult<i64> {
        Self::append(conn, &HistoryEntry::new(event, timestamp))
    }

    /// Most recent entries, newest first
    pub fn recent(conn: &Connection, limit: usize) -> StoreResult<Vec<HistoryEntry>> {
        let mut stmt =
            conn.prepare("SELECT id, timestamp, event_json FROM history ORDER BY id DESC LIMIT ?1")?;

        let rows = stmt.query_map([limit as i64], |row| {
            Ok(HistoryEntry {
                id: row.get(0)?,
                timestamp: instant_col(row, 1)?,
                event: json_col(row, 2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
