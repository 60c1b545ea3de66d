//! Deferred job types
//!
//! The set of job kinds is closed: every persisted job carries a
//! [`JobPayload`] variant, and dispatching a job is an exhaustive `match`
//! over that enum. There is no string-keyed callback lookup.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tutor_util::{JobId, RequestId, SessionId};

stored_enum!(
    /// Discriminant of [`JobPayload`], stored alongside the payload
    JobKind {
        SessionReminder => "SESSION_REMINDER",
        SessionStart => "SESSION_START",
        SessionFinish => "SESSION_FINISH",
        RescheduleTimeout => "RESCHEDULE_TIMEOUT",
    }
);

impl JobKind {
    /// Jobs whose only effect is telling someone something. A late reminder
    /// is worse than none, so these are dropped when found badly overdue.
    pub fn is_notification_only(&self) -> bool {
        matches!(self, JobKind::SessionReminder | JobKind::SessionStart)
    }
}

stored_enum!(
    /// Persisted job status. Completion is signalled by deleting the row,
    /// so COMPLETE is only ever transient.
    JobStatus {
        Queued => "QUEUED",
        Complete => "COMPLETE",
        Failed => "FAILED",
    }
);

/// What a job does when it fires
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum JobPayload {
    /// Remind both parties ahead of the session
    SessionReminder { session_id: SessionId },
    /// Tell both parties the session window has opened
    SessionStart { session_id: SessionId },
    /// Finalize a session left open when its window closes
    SessionFinish { session_id: SessionId },
    /// Expire an unanswered reschedule request
    RescheduleTimeout { request_id: RequestId },
}

impl JobPayload {
    pub fn kind(&self) -> JobKind {
        match self {
            JobPayload::SessionReminder { .. } => JobKind::SessionReminder,
            JobPayload::SessionStart { .. } => JobKind::SessionStart,
            JobPayload::SessionFinish { .. } => JobKind::SessionFinish,
            JobPayload::RescheduleTimeout { .. } => JobKind::RescheduleTimeout,
        }
    }

    /// Canonical unique name. Scheduling the same payload twice replaces the
    /// earlier job instead of adding a second one.
    pub fn job_name(&self) -> String {
        match self {
            JobPayload::SessionReminder { session_id } => format!("session#{} Reminder", session_id),
            JobPayload::SessionStart { session_id } => format!("session#{} Start", session_id),
            JobPayload::SessionFinish { session_id } => format!("session#{} Finish", session_id),
            JobPayload::RescheduleTimeout { request_id } => {
                format!("reschedule#{} NoResponse", request_id)
            }
        }
    }
}

/// A job about to be written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewJob {
    pub name: String,
    pub fires_at: DateTime<Utc>,
    pub payload: JobPayload,
}

impl NewJob {
    pub fn new(name: impl Into<String>, fires_at: DateTime<Utc>, payload: JobPayload) -> Self {
        Self {
            name: name.into(),
            fires_at,
            payload,
        }
    }

    /// Job named after its payload
    pub fn for_payload(payload: JobPayload, fires_at: DateTime<Utc>) -> Self {
        Self {
            name: payload.job_name(),
            fires_at,
            payload,
        }
    }
}

/// A persisted, named, one-shot unit of deferred work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub id: JobId,
    pub name: String,
    pub fires_at: DateTime<Utc>,
    pub kind: JobKind,
    pub payload: JobPayload,
    pub status: JobStatus,
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
}
