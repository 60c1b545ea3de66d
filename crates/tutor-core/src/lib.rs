//! Session lifecycle engine for tutord
//!
//! This crate provides:
//! - Interval checking for teacher availability
//! - The session state machine and its guard table
//! - Reschedule negotiation between student and teacher
//! - Booking of single sessions and recurring series
//! - Callbacks for the deferred jobs the scheduler fires
//!
//! [`SessionEngine`] is the entry point; every mutating operation runs in
//! one store transaction and arms timers only after it commits.

mod booking;
mod callbacks;
mod engine;
mod error;
mod interval;
mod outbox;
mod reschedule;
mod session;

pub use booking::*;
pub use callbacks::*;
pub use engine::*;
pub use error::*;
pub use interval::*;
pub use outbox::*;
pub use reschedule::{
    check_absence_candidates, check_request, check_responder, ensure_pending, parse_candidates,
    reset_to, timeout_at, validate_choice,
};
pub use session::{
    apply_attendance, apply_meeting_link, apply_transition_in, check_transition,
    ensure_participant, finish_target,
};
