//! Realtime events pushed to subscribed parties

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tutor_util::{RequestId, SessionId};

use crate::{Party, RescheduleRequest, RescheduleStatus, Session, SessionStatus, API_VERSION};

/// Event envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub api_version: u32,
    pub timestamp: DateTime<Utc>,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(payload: EventPayload) -> Self {
        Self {
            api_version: API_VERSION,
            timestamp: tutor_util::now(),
            payload,
        }
    }

    /// Event stamped with an explicit time
    pub fn at(payload: EventPayload, timestamp: DateTime<Utc>) -> Self {
        Self {
            api_version: API_VERSION,
            timestamp,
            payload,
        }
    }

    pub fn name(&self) -> &'static str {
        self.payload.name()
    }
}

/// Everything a party can be told in realtime
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventPayload {
    SessionCreated {
        session: Session,
    },

    SessionStatusChanged {
        session_id: SessionId,
        from: SessionStatus,
        to: SessionStatus,
    },

    MeetingLinkSet {
        session_id: SessionId,
        meeting_link: String,
    },

    AttendanceRecorded {
        session_id: SessionId,
        party: Party,
        attended: bool,
    },

    /// Fired by the reminder job ahead of the session
    SessionReminder {
        session_id: SessionId,
        scheduled_at: DateTime<Utc>,
    },

    /// Fired by the start job when the window opens
    SessionStarting {
        session_id: SessionId,
        meeting_link: Option<String>,
    },

    RescheduleRequested {
        request: RescheduleRequest,
    },

    /// Request left PENDING: approved, declined, or timed out
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
}

impl EventPayload {
    /// Stable event name
    pub fn name(&self) -> &'static str {
        match self {
            EventPayload::SessionCreated { .. } => "session_created",
            EventPayload::SessionStatusChanged { .. } => "session_status_changed",
            EventPayload::MeetingLinkSet { .. } => "meeting_link_set",
            EventPayload::AttendanceRecorded { .. } => "attendance_recorded",
            EventPayload::SessionReminder { .. } => "session_reminder",
            EventPayload::SessionStarting { .. } => "session_starting",
            EventPayload::RescheduleRequested { .. } => "reschedule_requested",
            EventPayload::RescheduleResolved { .. } => "reschedule_resolved",
            EventPayload::RescheduleCancelled { .. } => "reschedule_cancelled",
        }
    }
}
