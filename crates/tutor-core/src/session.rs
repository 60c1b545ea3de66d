//! Session state machine
//!
//! Every legal status change is a row in [`EDGES`]. A transition is checked
//! against the table, then written together with its side effects (balance
//! decrement, history entry) in the caller's transaction.

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::info;
use tutor_api::{
    Actor, EventPayload, Party, RescheduleStatus, SessionDetail, SessionKind, SessionStatus,
};
use tutor_notify::TemplateKey;
use tutor_store::{
    BalanceRepo, Connection, HistoryEventType, HistoryRepo, RescheduleRepo, SessionRepo,
};

use crate::error::{ConflictReason, CoreError, CoreResult};
use crate::outbox::Outbox;

/// Who may request an edge
#[derive(Debug, Clone, Copy)]
struct Actors {
    user: bool,
    teacher: bool,
    system: bool,
}

impl Actors {
    const TEACHER: Actors = Actors {
        user: false,
        teacher: true,
        system: false,
    };
    const TEACHER_OR_SYSTEM: Actors = Actors {
        user: false,
        teacher: true,
        system: true,
    };
    const ANY: Actors = Actors {
        user: true,
        teacher: true,
        system: true,
    };

    fn allows(&self, actor: &Actor) -> bool {
        match actor {
            Actor::User(_) => self.user,
            Actor::Teacher(_) => self.teacher,
            Actor::System => self.system,
        }
    }
}

/// Precondition attached to an edge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Requirement {
    /// `now` inside the session window and a meeting link set
    StartWindow,
    /// The session window has begun
    Started,
    /// The session window has fully elapsed
    WindowElapsed,
    TeacherAttended,
    TeacherNotAttended,
}

struct Edge {
    from: &'static [SessionStatus],
    to: SessionStatus,
    actors: Actors,
    requires: &'static [Requirement],
}

const EDGES: &[Edge] = &[
    Edge {
        from: &[SessionStatus::Pending],
        to: SessionStatus::Ongoing,
        actors: Actors::TEACHER,
        requires: &[Requirement::StartWindow],
    },
    Edge {
        from: &[SessionStatus::Ongoing],
        to: SessionStatus::Taken,
        actors: Actors::TEACHER_OR_SYSTEM,
        requires: &[Requirement::TeacherAttended],
    },
    Edge {
        from: &[SessionStatus::Pending, SessionStatus::Ongoing],
        to: SessionStatus::UserAbsent,
        actors: Actors::TEACHER_OR_SYSTEM,
        requires: &[Requirement::WindowElapsed, Requirement::TeacherAttended],
    },
    // Mutual absence has no status of its own; a teacher who never showed
    // up is recorded as TEACHER_ABSENT whatever the student did.
    Edge {
        from: &[SessionStatus::Pending, SessionStatus::Ongoing],
        to: SessionStatus::TeacherAbsent,
        actors: Actors::ANY,
        requires: &[Requirement::Started, Requirement::TeacherNotAttended],
    },
];

fn find_edge(from: SessionStatus, to: SessionStatus) -> Option<&'static Edge> {
    EDGES.iter().find(|edge| edge.to == to && edge.from.contains(&from))
}

/// Reject actors that are neither a party of the pairing nor the system
pub fn ensure_participant(detail: &SessionDetail, actor: &Actor) -> CoreResult<Option<Party>> {
    match actor {
        Actor::System => Ok(None),
        _ => detail
            .pairing
            .party_of(actor)
            .map(Some)
            .ok_or_else(|| {
                CoreError::unauthorized(format!(
                    "{} is not part of session {}",
                    actor, detail.session.id
                ))
            }),
    }
}

/// Check `target` against the guard table without touching anything
pub fn check_transition(
    detail: &SessionDetail,
    target: SessionStatus,
    actor: &Actor,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    let session = &detail.session;
    let from = session.status;

    if from.is_finalized() {
        return Err(ConflictReason::AlreadyFinalized { status: from }.into());
    }

    let illegal = |why: &str| -> CoreError {
        ConflictReason::IllegalTransition {
            from,
            to: target,
            detail: why.to_string(),
        }
        .into()
    };

    if from == target {
        return Err(illegal("session is already in that status"));
    }

    let edge = find_edge(from, target).ok_or_else(|| illegal("no such transition"))?;

    if !edge.actors.allows(actor) {
        return Err(CoreError::unauthorized(format!(
            "{} may not move a session to {}",
            actor, target
        )));
    }

    for requirement in edge.requires {
        match requirement {
            Requirement::StartWindow => {
                if !session.span().contains(now) {
                    return Err(ConflictReason::OutsideWindow.into());
                }
                if session.meeting_link.is_none() {
                    return Err(illegal("meeting link not set"));
                }
            }
            Requirement::Started => {
                if now < session.scheduled_at {
                    return Err(ConflictReason::OutsideWindow.into());
                }
            }
            Requirement::WindowElapsed => {
                if !session.span().has_elapsed(now) {
                    return Err(ConflictReason::OutsideWindow.into());
                }
            }
            Requirement::TeacherAttended => {
                if !session.teacher_attended {
                    return Err(illegal("teacher attendance not recorded"));
                }
            }
            Requirement::TeacherNotAttended => {
                if session.teacher_attended {
                    return Err(illegal("teacher attended"));
                }
            }
        }
    }

    Ok(())
}

/// Validate and write a status change with its side effects.
///
/// On success `detail` holds the written session. Nothing is written on
/// error; the caller's transaction rolls back anything partial.
pub fn apply_transition_in(
    conn: &Connection,
    detail: &mut SessionDetail,
    target: SessionStatus,
    actor: &Actor,
    now: DateTime<Utc>,
    outbox: &mut Outbox,
) -> CoreResult<()> {
    ensure_participant(detail, actor)?;
    check_transition(detail, target, actor, now)?;

    let from = detail.session.status;

    match target {
        SessionStatus::Ongoing => {
            if let Some(ongoing) =
                SessionRepo::find_ongoing_for_teacher(conn, detail.teacher_id(), &detail.session.id)?
            {
                return Err(ConflictReason::TeacherBusy { ongoing }.into());
            }
            detail.session.teacher_attended = true;
        }
        SessionStatus::Taken if detail.session.kind == SessionKind::Paid => {
            if !BalanceRepo::decrement(conn, &detail.pairing.user_id)? {
                return Err(ConflictReason::InsufficientBalance.into());
            }
        }
        _ => {}
    }

    detail.session.status = target;
    detail.session.updated_at = now;
    SessionRepo::update(conn, &detail.session)?;
    if target == SessionStatus::Taken {
        close_pending_request(conn, detail, now, outbox)?;
    }

    HistoryRepo::record(
        conn,
        HistoryEventType::SessionTransitioned {
            session_id: detail.session.id.clone(),
            from,
            to: target,
            actor: actor.to_string(),
        },
        now,
    )?;

    outbox.emit_pair(
        &detail.pairing,
        EventPayload::SessionStatusChanged {
            session_id: detail.session.id.clone(),
            from,
            to: target,
        },
    );
    if target.is_finalized() {
        outbox.notify_pair(
            &detail.pairing,
            TemplateKey::SessionFinalized,
            json!({
                "session_id": detail.session.id,
                "status": target,
                "scheduled_at": detail.session.scheduled_at,
            }),
        );
    }

    info!(
        session_id = %detail.session.id,
        from = %from,
        to = %target,
        actor = %actor,
        "Session transitioned"
    );
    Ok(())
}

/// A taken session can no longer move, so an unanswered request on it ends
/// without a response. Its timeout job finds it resolved and does nothing.
fn close_pending_request(
    conn: &Connection,
    detail: &SessionDetail,
    now: DateTime<Utc>,
    outbox: &mut Outbox,
) -> CoreResult<()> {
    let Some(mut request) = RescheduleRepo::find_pending_for_session(conn, &detail.session.id)?
    else {
        return Ok(());
    };

    request.status = RescheduleStatus::NoResponse;
    request.responded_at = Some(now);
    RescheduleRepo::update_outcome(conn, &request)?;
    HistoryRepo::record(
        conn,
        HistoryEventType::RescheduleResolved {
            request_id: request.id.clone(),
            session_id: request.session_id.clone(),
            status: request.status,
            resulting_date: None,
        },
        now,
    )?;
    outbox.emit_pair(
        &detail.pairing,
        EventPayload::RescheduleResolved {
            request_id: request.id.clone(),
            session_id: request.session_id.clone(),
            status: request.status,
            resulting_date: None,
        },
    );
    info!(request_id = %request.id, session_id = %detail.session.id, "Reschedule request closed by finalization");
    Ok(())
}

/// Status the finish job moves an unfinalized session to, if any
pub fn finish_target(detail: &SessionDetail) -> Option<SessionStatus> {
    let session = &detail.session;
    match (session.status, session.teacher_attended) {
        (SessionStatus::Pending, false) => Some(SessionStatus::TeacherAbsent),
        (SessionStatus::Pending, true) => Some(SessionStatus::UserAbsent),
        (SessionStatus::Ongoing, true) => Some(SessionStatus::Taken),
        _ => None,
    }
}

/// Record one party's attendance flag.
///
/// The teacher sets `teacher_attended`, the user sets `student_attended`.
pub fn apply_attendance(
    detail: &mut SessionDetail,
    actor: &Actor,
    attended: bool,
    now: DateTime<Utc>,
) -> CoreResult<Party> {
    let party = ensure_participant(detail, actor)?
        .ok_or_else(|| CoreError::unauthorized("attendance is recorded by a party"))?;

    let session = &mut detail.session;
    if session.status.is_finalized() {
        return Err(ConflictReason::AlreadyFinalized {
            status: session.status,
        }
        .into());
    }
    if now < session.scheduled_at {
        return Err(ConflictReason::OutsideWindow.into());
    }

    match party {
        Party::Teacher => session.teacher_attended = attended,
        Party::User => session.student_attended = attended,
    }
    session.updated_at = now;
    Ok(party)
}

/// Set the meeting link. Teacher of the pairing only.
pub fn apply_meeting_link(
    detail: &mut SessionDetail,
    actor: &Actor,
    link: &str,
    now: DateTime<Utc>,
) -> CoreResult<()> {
    if ensure_participant(detail, actor)? != Some(Party::Teacher) {
        return Err(CoreError::unauthorized("only the teacher sets the meeting link"));
    }

    let session = &mut detail.session;
    if session.status.is_finalized() {
        return Err(ConflictReason::AlreadyFinalized {
            status: session.status,
        }
        .into());
    }

    let link = link.trim();
    if !is_http_url(link) {
        return Err(CoreError::validation(format!(
            "meeting link must be an http(s) URL: {:?}",
            link
        )));
    }

    session.meeting_link = Some(link.to_string());
    session.updated_at = now;
    Ok(())
}

fn is_http_url(link: &str) -> bool {
    let rest = link
        .strip_prefix("https://")
        .or_else(|| link.strip_prefix("http://"));
    match rest {
        Some(rest) => {
            let host = rest.split(['/', '?', '#']).next().unwrap_or_default();
            !host.is_empty() && !link.chars().any(char::is_whitespace)
        }
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use tutor_api::{Pairing, Session};
    use tutor_store::{PairingRepo, SqliteStore};
    use tutor_util::{PairingId, TeacherId, UserId};

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap()
    }

    fn detail(kind: SessionKind) -> SessionDetail {
        let pairing = Pairing {
            id: PairingId::new(),
            user_id: UserId::new("u1"),
            teacher_id: TeacherId::new("t1"),
            will_continue: None,
            created_at: t0() - Duration::days(10),
        };
        let session = Session::new(pairing.id.clone(), t0(), 30, kind, t0() - Duration::days(1));
        SessionDetail { session, pairing }
    }

    fn teacher() -> Actor {
        Actor::Teacher(TeacherId::new("t1"))
    }

    fn user() -> Actor {
        Actor::User(UserId::new("u1"))
    }

    fn seeded(store: &SqliteStore, detail: &SessionDetail) {
        let conn = store.conn().unwrap();
        PairingRepo::insert(&conn, &detail.pairing).unwrap();
        SessionRepo::insert(&conn, &detail.session).unwrap();
    }

    #[test]
    fn start_needs_window_and_link() {
        let mut d = detail(SessionKind::Free);

        let early = check_transition(&d, SessionStatus::Ongoing, &teacher(), t0() - Duration::minutes(1));
        assert_eq!(early.unwrap_err().code(), "conflict.outside_window");

        let no_link = check_transition(&d, SessionStatus::Ongoing, &teacher(), t0());
        assert_eq!(no_link.unwrap_err().code(), "conflict.illegal_transition");

        d.session.meeting_link = Some("https://meet.example/abc".into());
        assert!(check_transition(&d, SessionStatus::Ongoing, &teacher(), t0()).is_ok());

        let late = check_transition(&d, SessionStatus::Ongoing, &teacher(), t0() + Duration::minutes(30));
        assert_eq!(late.unwrap_err().code(), "conflict.outside_window");
    }

    #[test]
    fn only_teacher_starts() {
        let mut d = detail(SessionKind::Free);
        d.session.meeting_link = Some("https://meet.example/abc".into());

        let err = check_transition(&d, SessionStatus::Ongoing, &user(), t0()).unwrap_err();
        assert_eq!(err.code(), "unauthorized");
        let err = check_transition(&d, SessionStatus::Ongoing, &Actor::System, t0()).unwrap_err();
        assert_eq!(err.code(), "unauthorized");
    }

    #[test]
    fn taken_requires_ongoing() {
        let mut d = detail(SessionKind::Free);
        d.session.teacher_attended = true;

        let err = check_transition(&d, SessionStatus::Taken, &teacher(), t0()).unwrap_err();
        assert_eq!(err.code(), "conflict.illegal_transition");

        d.session.status = SessionStatus::Ongoing;
        assert!(check_transition(&d, SessionStatus::Taken, &teacher(), t0()).is_ok());
        assert!(check_transition(&d, SessionStatus::Taken, &Actor::System, t0()).is_ok());
    }

    #[test]
    fn finalized_and_same_status_are_rejected() {
        let mut d = detail(SessionKind::Free);
        let err = check_transition(&d, SessionStatus::Pending, &teacher(), t0()).unwrap_err();
        assert_eq!(err.code(), "conflict.illegal_transition");

        d.session.status = SessionStatus::UserAbsent;
        let err = check_transition(&d, SessionStatus::TeacherAbsent, &teacher(), t0()).unwrap_err();
        assert_eq!(err.code(), "conflict.already_finalized");
    }

    #[test]
    fn absence_edges_follow_attendance() {
        let mut d = detail(SessionKind::Free);
        let after = t0() + Duration::minutes(31);

        let err = check_transition(&d, SessionStatus::UserAbsent, &teacher(), after).unwrap_err();
        assert_eq!(err.code(), "conflict.illegal_transition");
        assert!(check_transition(&d, SessionStatus::TeacherAbsent, &user(), after).is_ok());

        let before = check_transition(&d, SessionStatus::TeacherAbsent, &user(), t0() - Duration::minutes(5));
        assert_eq!(before.unwrap_err().code(), "conflict.outside_window");

        d.session.teacher_attended = true;
        let during = check_transition(&d, SessionStatus::UserAbsent, &teacher(), t0() + Duration::minutes(10));
        assert_eq!(during.unwrap_err().code(), "conflict.outside_window");
        assert!(check_transition(&d, SessionStatus::UserAbsent, &teacher(), after).is_ok());
        let err = check_transition(&d, SessionStatus::TeacherAbsent, &user(), after).unwrap_err();
        assert_eq!(err.code(), "conflict.illegal_transition");
    }

    #[test]
    fn strangers_are_unauthorized() {
        let d = detail(SessionKind::Free);
        let stranger = Actor::Teacher(TeacherId::new("t2"));
        let err = ensure_participant(&d, &stranger).unwrap_err();
        assert_eq!(err.code(), "unauthorized");
    }

    #[test]
    fn starting_records_teacher_attendance() {
        let store = SqliteStore::in_memory().unwrap();
        let mut d = detail(SessionKind::Free);
        d.session.meeting_link = Some("https://meet.example/abc".into());
        seeded(&store, &d);

        let mut outbox = Outbox::new();
        let conn = store.conn().unwrap();
        apply_transition_in(&conn, &mut d, SessionStatus::Ongoing, &teacher(), t0(), &mut outbox)
            .unwrap();

        let stored = SessionRepo::get(&conn, &d.session.id).unwrap().unwrap();
        assert_eq!(stored.status, SessionStatus::Ongoing);
        assert!(stored.teacher_attended);
        assert!(!outbox.is_empty());
    }

    #[test]
    fn teacher_cannot_run_two_sessions_at_once() {
        let store = SqliteStore::in_memory().unwrap();
        let mut first = detail(SessionKind::Free);
        first.session.status = SessionStatus::Ongoing;
        seeded(&store, &first);

        let mut second = first.clone();
        second.session = Session::new(
            first.pairing.id.clone(),
            t0(),
            30,
            SessionKind::Free,
            t0() - Duration::days(1),
        );
        second.session.meeting_link = Some("https://meet.example/b".into());
        {
            let conn = store.conn().unwrap();
            SessionRepo::insert(&conn, &second.session).unwrap();
        }

        let conn = store.conn().unwrap();
        let err = apply_transition_in(
            &conn,
            &mut second,
            SessionStatus::Ongoing,
            &teacher(),
            t0(),
            &mut Outbox::new(),
        )
        .unwrap_err();
        assert_eq!(
            err.conflict_reason(),
            Some(&ConflictReason::TeacherBusy {
                ongoing: first.session.id.clone()
            })
        );
    }

    #[test]
    fn paid_session_consumes_balance() {
        let store = SqliteStore::in_memory().unwrap();
        let mut d = detail(SessionKind::Paid);
        d.session.status = SessionStatus::Ongoing;
        d.session.teacher_attended = true;
        seeded(&store, &d);

        let conn = store.conn().unwrap();
        let err = apply_transition_in(&conn, &mut d.clone(), SessionStatus::Taken, &teacher(), t0(), &mut Outbox::new())
            .unwrap_err();
        assert_eq!(err.code(), "conflict.insufficient_balance");

        BalanceRepo::set(&conn, &d.pairing.user_id, 2).unwrap();
        apply_transition_in(&conn, &mut d, SessionStatus::Taken, &teacher(), t0(), &mut Outbox::new())
            .unwrap();
        assert_eq!(BalanceRepo::get(&conn, &d.pairing.user_id).unwrap(), Some(1));
    }

    #[test]
    fn finish_mapping() {
        let mut d = detail(SessionKind::Free);
        assert_eq!(finish_target(&d), Some(SessionStatus::TeacherAbsent));

        d.session.teacher_attended = true;
        assert_eq!(finish_target(&d), Some(SessionStatus::UserAbsent));

        d.session.status = SessionStatus::Ongoing;
        assert_eq!(finish_target(&d), Some(SessionStatus::Taken));

        d.session.teacher_attended = false;
        assert_eq!(finish_target(&d), None);

        d.session.status = SessionStatus::Taken;
        assert_eq!(finish_target(&d), None);
    }

    #[test]
    fn attendance_is_per_party() {
        let mut d = detail(SessionKind::Free);

        let err = apply_attendance(&mut d, &user(), true, t0() - Duration::minutes(1)).unwrap_err();
        assert_eq!(err.code(), "conflict.outside_window");

        assert_eq!(apply_attendance(&mut d, &user(), true, t0()).unwrap(), Party::User);
        assert!(d.session.student_attended);
        assert!(!d.session.teacher_attended);

        assert_eq!(apply_attendance(&mut d, &teacher(), true, t0()).unwrap(), Party::Teacher);
        assert!(d.session.teacher_attended);

        let err = apply_attendance(&mut d, &Actor::System, true, t0()).unwrap_err();
        assert_eq!(err.code(), "unauthorized");
    }

    #[test]
    fn meeting_link_rules() {
        let mut d = detail(SessionKind::Free);

        let err = apply_meeting_link(&mut d, &user(), "https://meet.example/x", t0()).unwrap_err();
        assert_eq!(err.code(), "unauthorized");

        let err = apply_meeting_link(&mut d, &teacher(), "ftp://meet.example/x", t0()).unwrap_err();
        assert_eq!(err.code(), "validation");
        let err = apply_meeting_link(&mut d, &teacher(), "https://", t0()).unwrap_err();
        assert_eq!(err.code(), "validation");

        apply_meeting_link(&mut d, &teacher(), " https://meet.example/x ", t0()).unwrap();
        assert_eq!(d.session.meeting_link.as_deref(), Some("https://meet.example/x"));

        d.session.status = SessionStatus::Taken;
        let err = apply_meeting_link(&mut d, &teacher(), "https://meet.example/y", t0()).unwrap_err();
        assert_eq!(err.code(), "conflict.already_finalized");
    }
}
