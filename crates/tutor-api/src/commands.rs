//! Command types for the tutord protocol

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tutor_util::{ClientId, PairingId, RequestId, SessionId, TeacherId, UserId};

use crate::{
    Actor, HealthStatus, Pairing, Recipient, RescheduleDecision, RescheduleRequest, ScheduledJob,
    Session, SessionDetail, SessionKind, SessionStatus, SlotConflict, API_VERSION,
};

/// Request wrapper with metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// Request ID for correlation
    pub request_id: u64,
    /// API version
    pub api_version: u32,
    /// The command
    pub command: Command,
}

impl Request {
    pub fn new(request_id: u64, command: Command) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            command,
        }
    }
}

/// Response wrapper
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Corresponding request ID
    pub request_id: u64,
    /// API version
    pub api_version: u32,
    /// Response payload or error
    pub result: ResponseResult,
}

impl Response {
    pub fn success(request_id: u64, payload: ResponsePayload) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Ok(payload),
        }
    }

    pub fn error(request_id: u64, error: ErrorInfo) -> Self {
        Self {
            request_id,
            api_version: API_VERSION,
            result: ResponseResult::Err(error),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResponseResult {
    Ok(ResponsePayload),
    Err(ErrorInfo),
}

/// Error information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub code: ErrorCode,
    /// Finer-grained stable code, e.g. `conflict.overlap`
    pub reason: Option<String>,
    pub message: String,
}

impl ErrorInfo {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            reason: None,
            message: message.into(),
        }
    }

    pub fn with_reason(mut self, reason: impl Into<String>) -> Self {
        self.reason = Some(reason.into());
        self
    }
}

/// Error codes for the protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCode {
    InvalidRequest,
    Validation,
    Conflict,
    Unauthorized,
    NotFound,
    PermissionDenied,
    StoreError,
    InternalError,
}

/// Client role, derived from peer credentials
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientRole {
    /// Same uid as the daemon (or root): may manage pairings and balances
    Admin,
    /// Front-end acting for students and teachers
    Client,
}

impl ClientRole {
    pub fn can_administer(&self) -> bool {
        matches!(self, ClientRole::Admin)
    }
}

/// Client connection info (set by IPC layer)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientInfo {
    pub client_id: ClientId,
    pub role: ClientRole,
    /// Unix UID if available
    pub uid: Option<u32>,
}

impl ClientInfo {
    pub fn new(role: ClientRole) -> Self {
        Self {
            client_id: ClientId::new(),
            role,
            uid: None,
        }
    }

    pub fn with_uid(mut self, uid: u32) -> Self {
        self.uid = Some(uid);
        self
    }
}

/// All possible commands from clients
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Command {
    // Admin commands
    /// Record a student–teacher pairing created by the user service
    RegisterPairing { user_id: UserId, teacher_id: TeacherId },

    /// Set a student's remaining paid sessions (billing owns the number)
    SetBalance { user_id: UserId, remaining_sessions: u32 },

    /// List queued and failed deferred jobs
    ListJobs,

    // Booking
    CreateSession {
        pairing_id: PairingId,
        scheduled_at: DateTime<Utc>,
        duration_minutes: u32,
        kind: SessionKind,
    },

    CreateSessionSeries {
        pairing_id: PairingId,
        first_at: DateTime<Utc>,
        duration_minutes: u32,
        count: u32,
        every_days: u32,
        kind: SessionKind,
    },

    CheckAvailability {
        teacher_id: TeacherId,
        candidates: Vec<DateTime<Utc>>,
        duration_minutes: u32,
    },

    GetSession { session_id: SessionId },

    // Lifecycle
    SetMeetingLink {
        session_id: SessionId,
        actor: Actor,
        meeting_link: String,
    },

    RecordAttendance {
        session_id: SessionId,
        actor: Actor,
        attended: bool,
    },

    TransitionStatus {
        session_id: SessionId,
        actor: Actor,
        target: SessionStatus,
    },

    RecordContinuation {
        pairing_id: PairingId,
        actor: Actor,
        will_continue: bool,
    },

    // Negotiation
    RequestReschedule {
        session_id: SessionId,
        actor: Actor,
        /// RFC 3339 instants, validated server-side
        candidate_dates: Vec<String>,
    },

    RespondToReschedule {
        request_id: RequestId,
        actor: Actor,
        decision: RescheduleDecision,
        chosen_date: Option<String>,
    },

    CancelReschedule { request_id: RequestId, actor: Actor },

    // Streaming
    /// Subscribe to events addressed to `recipient`
    SubscribeEvents { recipient: Recipient },

    UnsubscribeEvents,

    GetHealth,

    /// Ping for keepalive
    Ping,
}

impl Command {
    pub fn requires_admin(&self) -> bool {
        matches!(
            self,
            Command::RegisterPairing { .. } | Command::SetBalance { .. } | Command::ListJobs
        )
    }
}

/// Response payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ResponsePayload {
    PairingRegistered { pairing: Pairing },
    BalanceSet,
    Jobs { jobs: Vec<ScheduledJob> },
    SessionCreated { session: Session },
    SeriesCreated { sessions: Vec<Session> },
    Availability { conflicts: Vec<SlotConflict> },
    Session(SessionDetail),
    SessionUpdated { session: Session },
    PairingUpdated { pairing: Pairing },
    RescheduleRequested { request: RescheduleRequest },
    RescheduleResolved { request: RescheduleRequest },
    RescheduleCancelled,
    Subscribed { client_id: ClientId },
    Unsubscribed,
    Health(HealthStatus),
    Pong,
}
