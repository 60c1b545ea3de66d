//! Engine error taxonomy

use thiserror::Error;
use tutor_api::{RescheduleStatus, SessionStatus, SlotConflict};
use tutor_store::StoreError;
use tutor_util::{RequestId, SessionId};

/// Business-rule violation that depends on current state
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConflictReason {
    #[error("slot overlaps {} existing commitment(s)", conflicts.len())]
    Overlap { conflicts: Vec<SlotConflict> },

    #[error("session already has pending reschedule request {request_id}")]
    DuplicatePending { request_id: RequestId },

    #[error("reschedule request limit of {limit} reached")]
    RequestLimit { limit: u32 },

    #[error("too close to start to reschedule")]
    TooCloseToStart,

    #[error("cannot move session from {from} to {to}: {detail}")]
    IllegalTransition {
        from: SessionStatus,
        to: SessionStatus,
        detail: String,
    },

    #[error("reschedule request is already {status}")]
    RequestResolved { status: RescheduleStatus },

    #[error("session is already finalized as {status}")]
    AlreadyFinalized { status: SessionStatus },

    #[error("teacher already has session {ongoing} in progress")]
    TeacherBusy { ongoing: SessionId },

    #[error("outside the session window")]
    OutsideWindow,

    #[error("no prepaid sessions left")]
    InsufficientBalance,

    #[error("no trial session of this pairing has been taken")]
    NoCompletedTrial,
}

impl ConflictReason {
    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            ConflictReason::Overlap { .. } => "conflict.overlap",
            ConflictReason::DuplicatePending { .. } => "conflict.duplicate_pending",
            ConflictReason::RequestLimit { .. } => "conflict.request_limit",
            ConflictReason::TooCloseToStart => "conflict.too_close_to_start",
            ConflictReason::IllegalTransition { .. }
            | ConflictReason::RequestResolved { .. }
            | ConflictReason::NoCompletedTrial => "conflict.illegal_transition",
            ConflictReason::AlreadyFinalized { .. } => "conflict.already_finalized",
            ConflictReason::TeacherBusy { .. } => "conflict.teacher_busy",
            ConflictReason::OutsideWindow => "conflict.outside_window",
            ConflictReason::InsufficientBalance => "conflict.insufficient_balance",
        }
    }
}

/// Errors returned by engine operations. None of them are retried.
#[derive(Debug, Error)]
pub enum CoreError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("conflict: {0}")]
    Conflict(ConflictReason),

    #[error("not authorized: {0}")]
    Authorization(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("store error: {0}")]
    Store(String),
}

impl CoreError {
    pub fn validation(message: impl Into<String>) -> Self {
        CoreError::Validation(message.into())
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        CoreError::Authorization(message.into())
    }

    pub fn not_found(what: impl Into<String>) -> Self {
        CoreError::NotFound(what.into())
    }

    /// Stable machine-readable code
    pub fn code(&self) -> &'static str {
        match self {
            CoreError::Validation(_) => "validation",
            CoreError::Conflict(reason) => reason.code(),
            CoreError::Authorization(_) => "unauthorized",
            CoreError::NotFound(_) => "not_found",
            CoreError::Store(_) => "store",
        }
    }

    pub fn conflict_reason(&self) -> Option<&ConflictReason> {
        match self {
            CoreError::Conflict(reason) => Some(reason),
            _ => None,
        }
    }
}

impl From<ConflictReason> for CoreError {
    fn from(reason: ConflictReason) -> Self {
        CoreError::Conflict(reason)
    }
}

impl From<StoreError> for CoreError {
    fn from(e: StoreError) -> Self {
        match e {
            StoreError::NotFound(what) => CoreError::NotFound(what),
            other => CoreError::Store(other.to_string()),
        }
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(CoreError::validation("x").code(), "validation");
        assert_eq!(CoreError::unauthorized("x").code(), "unauthorized");
        assert_eq!(CoreError::not_found("x").code(), "not_found");
        assert_eq!(
            CoreError::from(ConflictReason::TooCloseToStart).code(),
            "conflict.too_close_to_start"
        );
        assert_eq!(
            CoreError::from(ConflictReason::RequestResolved {
                status: RescheduleStatus::Declined
            })
            .code(),
            "conflict.illegal_transition"
        );
        assert_eq!(
            CoreError::from(StoreError::Database("locked".into())).code(),
            "store"
        );
    }
}
