//! Booking rules and per-session job staging

use chrono::{DateTime, Duration, Utc};
use tutor_api::{JobPayload, NewJob, Session};
use tutor_config::SchedulingPolicy;
use tutor_scheduler::JobPlan;
use tutor_store::{Connection, StoreResult};
use tutor_util::TimeSpan;

use crate::error::{CoreError, CoreResult};

pub fn validate_duration(duration_minutes: u32, policy: &SchedulingPolicy) -> CoreResult<()> {
    if duration_minutes < policy.min_duration_minutes || duration_minutes > policy.max_duration_minutes
    {
        return Err(CoreError::validation(format!(
            "duration must be between {} and {} minutes, got {}",
            policy.min_duration_minutes, policy.max_duration_minutes, duration_minutes
        )));
    }
    Ok(())
}

pub fn validate_start(scheduled_at: DateTime<Utc>, now: DateTime<Utc>) -> CoreResult<()> {
    if scheduled_at <= now {
        return Err(CoreError::validation(format!(
            "session start {} is not in the future",
            tutor_util::format_instant(&scheduled_at)
        )));
    }
    Ok(())
}

/// The whole window `[start, start + duration)` must be representable
pub fn validate_window(start: DateTime<Utc>, duration_minutes: u32) -> CoreResult<TimeSpan> {
    TimeSpan::checked_from_minutes(start, duration_minutes).ok_or_else(|| {
        CoreError::validation(format!(
            "session starting {} ends outside the supported date range",
            tutor_util::format_instant(&start)
        ))
    })
}

/// Start times of a recurring series
pub fn series_starts(
    first_at: DateTime<Utc>,
    count: u32,
    every_days: u32,
    policy: &SchedulingPolicy,
) -> CoreResult<Vec<DateTime<Utc>>> {
    if count == 0 || count > policy.max_series_length {
        return Err(CoreError::validation(format!(
            "series length must be between 1 and {}, got {}",
            policy.max_series_length, count
        )));
    }
    if every_days == 0 {
        return Err(CoreError::validation("series interval must be at least one day"));
    }

    let out_of_range = || {
        CoreError::validation(format!(
            "series of {} sessions every {} days runs past the supported date range",
            count, every_days
        ))
    };
    let step = Duration::try_days(i64::from(every_days)).ok_or_else(out_of_range)?;

    (0..count)
        .map(|i| {
            i32::try_from(i)
                .ok()
                .and_then(|i| step.checked_mul(i))
                .and_then(|offset| first_at.checked_add_signed(offset))
                .ok_or_else(out_of_range)
        })
        .collect()
}

/// Stage the reminder, start and finish jobs of `session`, replacing any
/// earlier ones by name. A reminder whose time has passed is cancelled.
pub fn stage_session_jobs(
    plan: &mut JobPlan,
    conn: &Connection,
    session: &Session,
    policy: &SchedulingPolicy,
    now: DateTime<Utc>,
) -> StoreResult<()> {
    let reminder = JobPayload::SessionReminder {
        session_id: session.id.clone(),
    };
    match session.scheduled_at.checked_sub_signed(policy.reminder_lead) {
        Some(remind_at) if remind_at > now => {
            plan.schedule(conn, NewJob::for_payload(reminder, remind_at), now)?;
        }
        _ => {
            plan.cancel(conn, &reminder.job_name())?;
        }
    }

    let start = JobPayload::SessionStart {
        session_id: session.id.clone(),
    };
    plan.schedule(conn, NewJob::for_payload(start, session.scheduled_at), now)?;

    let finish = JobPayload::SessionFinish {
        session_id: session.id.clone(),
    };
    plan.schedule(conn, NewJob::for_payload(finish, session.ends_at()), now)?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use tutor_api::{JobKind, Pairing, SessionKind};
    use tutor_store::{JobRepo, PairingRepo, SessionRepo, SqliteStore};
    use tutor_util::{PairingId, TeacherId, UserId};

    fn start() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap()
    }

    #[test]
    fn duration_bounds() {
        let policy = SchedulingPolicy::default();
        assert!(validate_duration(15, &policy).is_ok());
        assert!(validate_duration(240, &policy).is_ok());
        assert!(validate_duration(14, &policy).is_err());
        assert!(validate_duration(241, &policy).is_err());
    }

    #[test]
    fn series_is_evenly_spaced() {
        let policy = SchedulingPolicy::default();
        let starts = series_starts(start(), 3, 7, &policy).unwrap();
        assert_eq!(
            starts,
            vec![start(), start() + Duration::days(7), start() + Duration::days(14)]
        );

        assert!(series_starts(start(), 0, 7, &policy).is_err());
        assert!(series_starts(start(), 53, 7, &policy).is_err());
        assert!(series_starts(start(), 2, 0, &policy).is_err());
    }

    #[test]
    fn huge_series_interval_is_rejected() {
        let policy = SchedulingPolicy::default();
        let err = series_starts(start(), 2, u32::MAX, &policy).unwrap_err();
        assert_eq!(err.code(), "validation");

        // A single occurrence never moves
        assert_eq!(series_starts(start(), 1, u32::MAX, &policy).unwrap(), vec![start()]);
    }

    #[test]
    fn window_must_fit_the_calendar() {
        assert_eq!(
            validate_window(start(), 45).unwrap(),
            TimeSpan::from_minutes(start(), 45)
        );
        let err = validate_window(DateTime::<Utc>::MAX_UTC, 45).unwrap_err();
        assert_eq!(err.code(), "validation");
    }

    fn stored_session(conn: &Connection) -> Session {
        let pairing = Pairing {
            id: PairingId::new(),
            user_id: UserId::new("u1"),
            teacher_id: TeacherId::new("t1"),
            will_continue: None,
            created_at: start() - Duration::days(30),
        };
        PairingRepo::insert(conn, &pairing).unwrap();
        let session = Session::new(pairing.id, start(), 45, SessionKind::Free, start() - Duration::days(1));
        SessionRepo::insert(conn, &session).unwrap();
        session
    }

    #[test]
    fn stages_three_jobs() {
        let store = SqliteStore::in_memory().unwrap();
        let conn = store.conn().unwrap();
        let session = stored_session(&conn);
        let policy = SchedulingPolicy::default();

        let mut plan = JobPlan::new();
        stage_session_jobs(&mut plan, &conn, &session, &policy, start() - Duration::days(1)).unwrap();

        let jobs = JobRepo::list_queued(&conn).unwrap();
        let kinds: Vec<JobKind> = jobs.iter().map(|j| j.kind).collect();
        assert_eq!(
            kinds,
            vec![JobKind::SessionReminder, JobKind::SessionStart, JobKind::SessionFinish]
        );
        assert_eq!(jobs[0].fires_at, start() - Duration::minutes(30));
        assert_eq!(jobs[2].fires_at, start() + Duration::minutes(45));
        assert_eq!(plan.to_arm().len(), 3);
    }

    #[test]
    fn late_booking_skips_reminder() {
        let store = SqliteStore::in_memory().unwrap();
        let conn = store.conn().unwrap();
        let session = stored_session(&conn);
        let policy = SchedulingPolicy::default();

        let mut plan = JobPlan::new();
        stage_session_jobs(&mut plan, &conn, &session, &policy, start() - Duration::minutes(20))
            .unwrap();

        assert_eq!(JobRepo::list_queued(&conn).unwrap().len(), 2);
        assert_eq!(plan.to_arm().len(), 2);
        assert_eq!(plan.to_disarm().len(), 1);
    }
}
