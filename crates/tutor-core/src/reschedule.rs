//! Reschedule negotiation rules
//!
//! Pure checks over a loaded session and request. The engine runs them
//! inside its transaction and writes the result.

use chrono::{DateTime, Utc};
use tutor_api::{Party, RescheduleRequest, RescheduleStatus, Session, SessionStatus};
use tutor_config::SchedulingPolicy;

use crate::error::{ConflictReason, CoreError, CoreResult};

/// Whether `party` may open a new request on `session` at `now`
pub fn check_request(
    session: &Session,
    party: Party,
    policy: &SchedulingPolicy,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    if session.reschedule_request_count >= policy.max_reschedule_requests {
        return Err(ConflictReason::RequestLimit {
            limit: policy.max_reschedule_requests,
        }
        .into());
    }

    if !session.status.is_finalized() && now >= session.scheduled_at - policy.reschedule_cutoff {
        return Err(ConflictReason::TooCloseToStart.into());
    }

    if session.status == SessionStatus::Taken {
        return Err(ConflictReason::AlreadyFinalized {
            status: session.status,
        }
        .into());
    }

    if session.status.absent_party() == Some(party) {
        return Err(ConflictReason::IllegalTransition {
            from: session.status,
            to: SessionStatus::Pending,
            detail: "the absent party cannot reschedule".to_string(),
        }
        .into());
    }

    Ok(())
}

/// Parse, bound and normalise proposed dates: ascending, no duplicates.
pub fn parse_candidates(
    raw: &[String],
    policy: &SchedulingPolicy,
    now: DateTime<Utc>,
) -> CoreResult<Vec<DateTime<Utc>>> {
    if raw.is_empty() {
        return Err(CoreError::validation("at least one candidate date is required"));
    }

    let earliest = now + policy.min_candidate_lead;
    let mut candidates = Vec::with_capacity(raw.len());

    for value in raw {
        let instant = tutor_util::parse_instant(value).ok_or_else(|| {
            CoreError::validation(format!("candidate date is not RFC 3339: {:?}", value))
        })?;
        if instant <= now {
            return Err(CoreError::validation(format!(
                "candidate date {} is in the past",
                value
            )));
        }
        if instant < earliest {
            return Err(CoreError::validation(format!(
                "candidate date {} is less than {} minutes away",
                value,
                policy.min_candidate_lead.num_minutes()
            )));
        }
        candidates.push(instant);
    }

    candidates.sort();
    candidates.dedup();
    Ok(candidates)
}

/// Sessions that ended in an absence can only move forward in time
pub fn check_absence_candidates(session: &Session, candidates: &[DateTime<Utc>]) -> CoreResult<()> {
    if !session.status.is_absence() {
        return Ok(());
    }
    match candidates.iter().find(|c| **c <= session.scheduled_at) {
        Some(c) => Err(CoreError::validation(format!(
            "candidate {} is not after the missed session",
            tutor_util::format_instant(c)
        ))),
        None => Ok(()),
    }
}

/// When an unanswered request expires: at the end of the session window,
/// or at the earliest candidate when that window is already over.
pub fn timeout_at(
    session: &Session,
    candidates: &[DateTime<Utc>],
    now: DateTime<Utc>,
) -> DateTime<Utc> {
    let end = session.ends_at();
    if end > now {
        return end;
    }
    candidates.first().copied().unwrap_or(end)
}

/// Responses come from the other side of the pairing only
pub fn check_responder(request: &RescheduleRequest, party: Option<Party>) -> CoreResult<()> {
    match party {
        Some(party) if party == request.requested_by.counterpart() => Ok(()),
        Some(_) => Err(CoreError::unauthorized(
            "the requester cannot answer their own reschedule request",
        )),
        None => Err(CoreError::unauthorized(
            "reschedule requests are answered by the counterpart",
        )),
    }
}

pub fn ensure_pending(request: &RescheduleRequest) -> CoreResult<()> {
    if request.status != RescheduleStatus::Pending {
        return Err(ConflictReason::RequestResolved {
            status: request.status,
        }
        .into());
    }
    Ok(())
}

/// A request can only move a session that is not running or taken
pub fn check_approvable(session: &Session) -> CoreResult<()> {
    match session.status {
        SessionStatus::Taken => Err(ConflictReason::AlreadyFinalized {
            status: session.status,
        }
        .into()),
        SessionStatus::Ongoing => Err(ConflictReason::IllegalTransition {
            from: session.status,
            to: SessionStatus::Pending,
            detail: "session is in progress".to_string(),
        }
        .into()),
        _ => Ok(()),
    }
}

/// The approved date must be exactly one of the proposed candidates and
/// still in the future.
pub fn validate_choice(
    request: &RescheduleRequest,
    chosen: Option<&str>,
    now: DateTime<Utc>,
) -> CoreResult<DateTime<Utc>> {
    let raw = chosen.ok_or_else(|| CoreError::validation("chosen_date is required to approve"))?;
    let instant = tutor_util::parse_instant(raw)
        .ok_or_else(|| CoreError::validation(format!("chosen_date is not RFC 3339: {:?}", raw)))?;

    if !request.candidate_dates.contains(&instant) {
        return Err(CoreError::validation(format!(
            "{} is not one of the proposed dates",
            raw
        )));
    }
    if instant <= now {
        return Err(CoreError::validation(format!("{} has already passed", raw)));
    }
    Ok(instant)
}

/// Move a session to its approved date and reopen it
pub fn reset_to(session: &mut Session, new_start: DateTime<Utc>, now: DateTime<Utc>) {
    session.scheduled_at = new_start;
    session.status = SessionStatus::Pending;
    session.teacher_attended = false;
    session.student_attended = false;
    session.meeting_link = None;
    session.updated_at = now;
}
