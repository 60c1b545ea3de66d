//! Shared domain types for tutord

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tutor_util::{PairingId, RequestId, SessionId, TeacherId, TimeSpan, UserId};

stored_enum!(
    /// Lifecycle status of a session
    SessionStatus {
        Pending => "PENDING",
        Ongoing => "ONGOING",
        Taken => "TAKEN",
        UserAbsent => "USER_ABSENT",
        TeacherAbsent => "TEACHER_ABSENT",
    }
);

impl SessionStatus {
    /// TAKEN and both absence states only leave via an approved reschedule.
    pub fn is_finalized(&self) -> bool {
        matches!(
            self,
            SessionStatus::Taken | SessionStatus::UserAbsent | SessionStatus::TeacherAbsent
        )
    }

    pub fn is_absence(&self) -> bool {
        matches!(self, SessionStatus::UserAbsent | SessionStatus::TeacherAbsent)
    }

    /// The party whose absence this status records
    pub fn absent_party(&self) -> Option<Party> {
        match self {
            SessionStatus::UserAbsent => Some(Party::User),
            SessionStatus::TeacherAbsent => Some(Party::Teacher),
            _ => None,
        }
    }
}

stored_enum!(
    /// Booking type of a session
    SessionKind {
        Free => "FREE",
        Paid => "PAID",
        Unassigned => "UNASSIGNED",
    }
);

stored_enum!(
    /// One side of a pairing
    Party {
        User => "USER",
        Teacher => "TEACHER",
    }
);

impl Party {
    pub fn counterpart(&self) -> Party {
        match self {
            Party::User => Party::Teacher,
            Party::Teacher => Party::User,
        }
    }
}

stored_enum!(
    /// Status of a reschedule request
    RescheduleStatus {
        Pending => "PENDING",
        Approved => "APPROVED",
        Declined => "DECLINED",
        NoResponse => "NO_RESPONSE",
    }
);

/// Answer given by the counterpart of a reschedule request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RescheduleDecision {
    Approved,
    Declined,
}

/// Who is performing an operation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "role", content = "id", rename_all = "snake_case")]
pub enum Actor {
    User(UserId),
    Teacher(TeacherId),
    /// Deferred jobs acting on behalf of the service
    System,
}

impl Actor {
    pub fn party(&self) -> Option<Party> {
        match self {
            Actor::User(_) => Some(Party::User),
            Actor::Teacher(_) => Some(Party::Teacher),
            Actor::System => None,
        }
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Actor::User(id) => write!(f, "user:{}", id),
            Actor::Teacher(id) => write!(f, "teacher:{}", id),
            Actor::System => f.write_str("system"),
        }
    }
}

/// Addressee of a notification or realtime event
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "role", content = "id", rename_all = "snake_case")]
pub enum Recipient {
    User(UserId),
    Teacher(TeacherId),
}

impl std::fmt::Display for Recipient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Recipient::User(id) => write!(f, "user:{}", id),
            Recipient::Teacher(id) => write!(f, "teacher:{}", id),
        }
    }
}

/// Durable student–teacher relationship
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Pairing {
    pub id: PairingId,
    pub user_id: UserId,
    pub teacher_id: TeacherId,
    /// Recorded after a trial session; `None` until the student answers
    pub will_continue: Option<bool>,
    pub created_at: DateTime<Utc>,
}

impl Pairing {
    /// Which side of this pairing `actor` is on, if any
    pub fn party_of(&self, actor: &Actor) -> Option<Party> {
        match actor {
            Actor::User(id) if *id == self.user_id => Some(Party::User),
            Actor::Teacher(id) if *id == self.teacher_id => Some(Party::Teacher),
            _ => None,
        }
    }

    pub fn recipient(&self, party: Party) -> Recipient {
        match party {
            Party::User => Recipient::User(self.user_id.clone()),
            Party::Teacher => Recipient::Teacher(self.teacher_id.clone()),
        }
    }

    pub fn recipients(&self) -> [Recipient; 2] {
        [self.recipient(Party::User), self.recipient(Party::Teacher)]
    }
}

/// One scheduled meeting between a student and a teacher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub id: SessionId,
    pub pairing_id: PairingId,
    pub scheduled_at: DateTime<Utc>,
    pub duration_minutes: u32,
    pub status: SessionStatus,
    pub kind: SessionKind,
    pub teacher_attended: bool,
    pub student_attended: bool,
    pub meeting_link: Option<String>,
    pub reschedule_request_count: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    /// A fresh PENDING session
    pub fn new(
        pairing_id: PairingId,
        scheduled_at: DateTime<Utc>,
        duration_minutes: u32,
        kind: SessionKind,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id: SessionId::new(),
            pairing_id,
            scheduled_at,
            duration_minutes,
            status: SessionStatus::Pending,
            kind,
            teacher_attended: false,
            student_attended: false,
            meeting_link: None,
            reschedule_request_count: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// The session window `[scheduled_at, scheduled_at + duration)`
    pub fn span(&self) -> TimeSpan {
        TimeSpan::from_minutes(self.scheduled_at, self.duration_minutes)
    }

    pub fn ends_at(&self) -> DateTime<Utc> {
        self.span().end
    }
}

/// Session joined with its pairing; the shape every authorization check reads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionDetail {
    pub session: Session,
    pub pairing: Pairing,
}

impl SessionDetail {
    pub fn teacher_id(&self) -> &TeacherId {
        &self.pairing.teacher_id
    }
}

/// Proposal of alternate times for an existing session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RescheduleRequest {
    pub id: RequestId,
    pub session_id: SessionId,
    pub requested_by: Party,
    pub old_date: DateTime<Utc>,
    /// Ascending, de-duplicated, never empty
    pub candidate_dates: Vec<DateTime<Utc>>,
    pub status: RescheduleStatus,
    pub resulting_date: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub responded_at: Option<DateTime<Utc>>,
}

/// An existing commitment that collides with a candidate slot
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConflict {
    /// The candidate start that was rejected
    pub candidate: DateTime<Utc>,
    /// The session it collides with; `None` when it collides with another
    /// candidate of the same batch
    pub session_id: Option<SessionId>,
    pub existing: TimeSpan,
}

/// Service health
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthStatus {
    pub live: bool,
    pub ready: bool,
    pub store_healthy: bool,
    pub armed_jobs: usize,
}
