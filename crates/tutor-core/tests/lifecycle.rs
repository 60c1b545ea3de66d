//! End-to-end lifecycle tests for the session engine

use chrono::{DateTime, Duration, TimeZone, Utc};
use std::path::Path;
use std::sync::Arc;
use tutor_api::{
    Actor, JobPayload, Pairing, Recipient, RescheduleDecision, RescheduleStatus, SessionKind,
    SessionStatus,
};
use tutor_config::SchedulingPolicy;
use tutor_core::{ConflictReason, SessionEngine};
use tutor_notify::{RecordingEmitter, RecordingNotifier, TemplateKey};
use tutor_store::SqliteStore;
use tutor_util::{TeacherId, UserId, format_instant};

/// Start of the session most tests revolve around
fn t() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2025, 1, 1, 10, 0, 0).unwrap()
}

fn mins(n: i64) -> Duration {
    Duration::minutes(n)
}

async fn advance(minutes: u64) {
    tokio::time::sleep(std::time::Duration::from_secs(minutes * 60)).await;
}

fn teacher() -> Actor {
    Actor::Teacher(TeacherId::new("t1"))
}

fn user() -> Actor {
    Actor::User(UserId::new("u1"))
}

fn user_recipient() -> Recipient {
    Recipient::User(UserId::new("u1"))
}

struct Harness {
    engine: SessionEngine,
    notifier: Arc<RecordingNotifier>,
    emitter: Arc<RecordingEmitter>,
    pairing: Pairing,
}

impl Harness {
    fn new() -> Self {
        Self::on(Arc::new(SqliteStore::in_memory().unwrap()), None)
    }

    fn on(store: Arc<SqliteStore>, pairing: Option<Pairing>) -> Self {
        let notifier = Arc::new(RecordingNotifier::new());
        let emitter = Arc::new(RecordingEmitter::new());
        let engine = SessionEngine::build(
            store,
            notifier.clone(),
            emitter.clone(),
            SchedulingPolicy::default(),
        );
        let pairing = match pairing {
            Some(p) => p,
            None => engine
                .register_pairing(UserId::new("u1"), TeacherId::new("t1"), t() - Duration::days(30))
                .unwrap(),
        };
        Self {
            engine,
            notifier,
            emitter,
            pairing,
        }
    }

    fn reopen(path: &Path, pairing: Pairing) -> Self {
        Self::on(Arc::new(SqliteStore::open(path).unwrap()), Some(pairing))
    }

    async fn book(&self, at: DateTime<Utc>, minutes: u32, now: DateTime<Utc>) -> tutor_api::Session {
        self.engine
            .create_session(&self.pairing.id, at, minutes, SessionKind::Paid, now)
            .await
            .unwrap()
    }
}

fn candidates(dates: &[DateTime<Utc>]) -> Vec<String> {
    dates.iter().map(format_instant).collect()
}

#[tokio::test(start_paused = true)]
async fn start_needs_link_and_window() {
    let h = Harness::new();
    let session = h.book(t(), 30, t() - Duration::days(2)).await;

    let err = h
        .engine
        .transition_status(&session.id, &teacher(), SessionStatus::Ongoing, t() - mins(1))
        .await
        .unwrap_err();
    assert!(err.conflict_reason().is_some());

    h.engine
        .set_meeting_link(&session.id, &teacher(), "https://meet.example/r1", t() - mins(1))
        .await
        .unwrap();

    let started = h
        .engine
        .transition_status(&session.id, &teacher(), SessionStatus::Ongoing, t())
        .await
        .unwrap();
    assert_eq!(started.status, SessionStatus::Ongoing);
    assert!(started.teacher_attended);
    assert!(h.emitter.names_for(&user_recipient()).contains(&"session_status_changed"));
}

#[tokio::test(start_paused = true)]
async fn reschedule_cutoff() {
    let h = Harness::new();
    let first = h.book(t(), 30, t() - Duration::days(2)).await;
    let second = h.book(t() + mins(120), 30, t() - Duration::days(2)).await;
    let options = candidates(&[t() + Duration::days(1), t() + Duration::days(2)]);

    let request = h
        .engine
        .request_reschedule(&first.id, &user(), &options, t() - mins(15))
        .await
        .unwrap();
    assert_eq!(request.status, RescheduleStatus::Pending);
    assert_eq!(request.candidate_dates.len(), 2);

    let err = h
        .engine
        .request_reschedule(&second.id, &user(), &options, second.scheduled_at - mins(5))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "conflict.too_close_to_start");
}

#[tokio::test(start_paused = true)]
async fn one_pending_request_per_session() {
    let h = Harness::new();
    let session = h.book(t(), 30, t() - Duration::days(2)).await;
    let now = t() - Duration::days(1);

    let first = h
        .engine
        .request_reschedule(&session.id, &user(), &candidates(&[t() + Duration::days(1)]), now)
        .await
        .unwrap();

    let err = h
        .engine
        .request_reschedule(&session.id, &teacher(), &candidates(&[t() + Duration::days(2)]), now)
        .await
        .unwrap_err();
    assert_eq!(
        err.conflict_reason(),
        Some(&ConflictReason::DuplicatePending {
            request_id: first.id.clone()
        })
    );
    assert_eq!(h.engine.list_requests(&session.id).unwrap().len(), 1);
    assert_eq!(
        h.engine.get_session(&session.id).unwrap().session.reschedule_request_count,
        1
    );
}

#[tokio::test(start_paused = true)]
async fn approving_an_unproposed_date_changes_nothing() {
    let h = Harness::new();
    let session = h.book(t(), 30, t() - Duration::days(2)).await;
    let now = t() - Duration::days(1);
    let request = h
        .engine
        .request_reschedule(&session.id, &user(), &candidates(&[t() + Duration::days(1)]), now)
        .await
        .unwrap();
    let before = h.engine.get_session(&session.id).unwrap();

    let err = h
        .engine
        .respond_to_reschedule(
            &request.id,
            &teacher(),
            RescheduleDecision::Approved,
            Some(&format_instant(&(t() + Duration::days(3)))),
            now,
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation");

    assert_eq!(h.engine.get_session(&session.id).unwrap(), before);
    let requests = h.engine.list_requests(&session.id).unwrap();
    assert_eq!(requests[0].status, RescheduleStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn reminder_survives_restart_and_fires_once() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tutord.db");

    let (session, pairing) = {
        let h = Harness::on(Arc::new(SqliteStore::open(&path).unwrap()), None);
        let session = h.book(t(), 30, t() - mins(120)).await;
        h.engine.scheduler().shutdown();
        (session, h.pairing)
    };

    let h = Harness::reopen(&path, pairing);
    let summary = h.engine.replay_pending(t() - mins(40)).await.unwrap();
    assert_eq!(summary.armed, 3);
    assert_eq!(summary.fired, 0);

    let reminder = JobPayload::SessionReminder {
        session_id: session.id.clone(),
    }
    .job_name();
    assert_eq!(h.engine.scheduler().armed_at(&reminder), Some(t() - mins(30)));

    advance(9).await;
    assert_eq!(h.notifier.count(TemplateKey::SessionReminder), 0);

    advance(2).await;
    assert_eq!(h.notifier.count(TemplateKey::SessionReminder), 2);

    advance(15).await;
    assert_eq!(h.notifier.count(TemplateKey::SessionReminder), 2);
    assert!(!h.engine.scheduler().is_armed(&reminder));
}

#[tokio::test(start_paused = true)]
async fn overlapping_booking_commits_nothing() {
    let h = Harness::new();
    let now = t() - Duration::days(2);
    let other = h
        .engine
        .register_pairing(UserId::new("u2"), TeacherId::new("t1"), now)
        .unwrap();

    h.book(t(), 60, now).await;
    let jobs_before = h.engine.list_jobs().unwrap().len();

    let err = h
        .engine
        .create_session(&other.id, t() + mins(30), 60, SessionKind::Free, now)
        .await
        .unwrap_err();
    match err.conflict_reason() {
        Some(ConflictReason::Overlap { conflicts }) => assert_eq!(conflicts.len(), 1),
        other => panic!("expected overlap, got {:?}", other),
    }

    assert_eq!(h.engine.list_jobs().unwrap().len(), jobs_before);
    let free = h
        .engine
        .check_availability(&TeacherId::new("t1"), &[t() + mins(60)], 60)
        .unwrap();
    assert!(free.is_empty());
}

#[tokio::test(start_paused = true)]
async fn series_is_all_or_nothing() {
    let h = Harness::new();
    let now = t() - Duration::days(2);
    h.book(t() + Duration::days(14), 30, now).await;

    let err = h
        .engine
        .create_session_series(&h.pairing.id, t(), 30, 4, 7, SessionKind::Paid, now)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "conflict.overlap");
    assert_eq!(h.engine.list_jobs().unwrap().len(), 3);

    let sessions = h
        .engine
        .create_session_series(&h.pairing.id, t() + mins(60), 30, 4, 7, SessionKind::Paid, now)
        .await
        .unwrap();
    assert_eq!(sessions.len(), 4);
    assert_eq!(sessions[3].scheduled_at, t() + mins(60) + Duration::days(21));
    assert_eq!(h.engine.list_jobs().unwrap().len(), 15);
}

#[tokio::test(start_paused = true)]
async fn approval_moves_session_and_rearms_jobs() {
    let h = Harness::new();
    let session = h.book(t(), 30, t() - Duration::days(2)).await;
    let now = t() - Duration::days(1);
    let new_date = t() + Duration::days(2);

    let request = h
        .engine
        .request_reschedule(
            &session.id,
            &user(),
            &candidates(&[t() + Duration::days(1), new_date]),
            now,
        )
        .await
        .unwrap();
    let timeout = JobPayload::RescheduleTimeout {
        request_id: request.id.clone(),
    }
    .job_name();
    assert!(h.engine.scheduler().is_armed(&timeout));
    assert_eq!(
        h.notifier.sent_to(&Recipient::Teacher(TeacherId::new("t1"))),
        vec![TemplateKey::SessionBooked, TemplateKey::RescheduleRequested]
    );

    let resolved = h
        .engine
        .respond_to_reschedule(
            &request.id,
            &teacher(),
            RescheduleDecision::Approved,
            Some(&format_instant(&new_date)),
            now,
        )
        .await
        .unwrap();
    assert_eq!(resolved.status, RescheduleStatus::Approved);
    assert_eq!(resolved.resulting_date, Some(new_date));

    let moved = h.engine.get_session(&session.id).unwrap().session;
    assert_eq!(moved.scheduled_at, new_date);
    assert_eq!(moved.status, SessionStatus::Pending);
    assert_eq!(moved.reschedule_request_count, 1);

    let start = JobPayload::SessionStart {
        session_id: session.id.clone(),
    }
    .job_name();
    assert_eq!(h.engine.scheduler().armed_at(&start), Some(new_date));
    assert!(!h.engine.scheduler().is_armed(&timeout));
    assert_eq!(h.engine.list_jobs().unwrap().len(), 3);
    assert_eq!(h.notifier.sent_to(&user_recipient()).last(), Some(&TemplateKey::RescheduleApproved));
}

#[tokio::test(start_paused = true)]
async fn requester_cannot_answer_and_decline_leaves_session() {
    let h = Harness::new();
    let session = h.book(t(), 30, t() - Duration::days(2)).await;
    let now = t() - Duration::days(1);
    let request = h
        .engine
        .request_reschedule(&session.id, &teacher(), &candidates(&[t() + Duration::days(1)]), now)
        .await
        .unwrap();

    let err = h
        .engine
        .respond_to_reschedule(&request.id, &teacher(), RescheduleDecision::Declined, None, now)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "unauthorized");

    let declined = h
        .engine
        .respond_to_reschedule(&request.id, &user(), RescheduleDecision::Declined, None, now)
        .await
        .unwrap();
    assert_eq!(declined.status, RescheduleStatus::Declined);
    assert_eq!(declined.responded_at, Some(now));
    assert_eq!(h.engine.get_session(&session.id).unwrap().session.scheduled_at, t());

    let err = h
        .engine
        .respond_to_reschedule(&request.id, &user(), RescheduleDecision::Declined, None, now)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "conflict.illegal_transition");
}

#[tokio::test(start_paused = true)]
async fn cancel_returns_the_request_slot() {
    let h = Harness::new();
    let session = h.book(t(), 30, t() - Duration::days(2)).await;
    let now = t() - Duration::days(1);
    let request = h
        .engine
        .request_reschedule(&session.id, &user(), &candidates(&[t() + Duration::days(1)]), now)
        .await
        .unwrap();

    let err = h
        .engine
        .cancel_reschedule(&request.id, &teacher(), now)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "unauthorized");

    h.engine.cancel_reschedule(&request.id, &user(), now).await.unwrap();
    assert!(h.engine.list_requests(&session.id).unwrap().is_empty());
    assert_eq!(
        h.engine.get_session(&session.id).unwrap().session.reschedule_request_count,
        0
    );
    assert_eq!(h.engine.list_jobs().unwrap().len(), 3);
}

#[tokio::test(start_paused = true)]
async fn request_limit_caps_negotiation() {
    let h = Harness::new();
    let session = h.book(t(), 30, t() - Duration::days(10)).await;
    let now = t() - Duration::days(9);

    for day in 1..=4 {
        let request = h
            .engine
            .request_reschedule(&session.id, &user(), &candidates(&[t() + Duration::days(day)]), now)
            .await
            .unwrap();
        h.engine
            .respond_to_reschedule(&request.id, &teacher(), RescheduleDecision::Declined, None, now)
            .await
            .unwrap();
    }

    let err = h
        .engine
        .request_reschedule(&session.id, &user(), &candidates(&[t() + Duration::days(5)]), now)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "conflict.request_limit");
    assert_eq!(
        h.engine.get_session(&session.id).unwrap().session.reschedule_request_count,
        4
    );
}

#[tokio::test(start_paused = true)]
async fn finish_job_marks_missing_teacher_absent() {
    let h = Harness::new();
    let session = h.book(t(), 30, t() - mins(60)).await;

    advance(31).await;
    assert_eq!(h.notifier.count(TemplateKey::SessionReminder), 2);

    advance(70).await;
    let finished = h.engine.get_session(&session.id).unwrap().session;
    assert_eq!(finished.status, SessionStatus::TeacherAbsent);
    assert_eq!(h.notifier.count(TemplateKey::SessionStarting), 2);
    assert_eq!(h.notifier.count(TemplateKey::SessionFinalized), 2);
    assert!(h.engine.list_jobs().unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn finish_job_takes_paid_session() {
    let h = Harness::new();
    h.engine.set_balance(&UserId::new("u1"), 3).unwrap();
    let session = h.book(t(), 30, t() - mins(60)).await;
    h.engine
        .set_meeting_link(&session.id, &teacher(), "https://meet.example/r1", t() - mins(60))
        .await
        .unwrap();

    advance(61).await;
    h.engine
        .transition_status(&session.id, &teacher(), SessionStatus::Ongoing, t() + mins(1))
        .await
        .unwrap();

    advance(40).await;
    let finished = h.engine.get_session(&session.id).unwrap().session;
    assert_eq!(finished.status, SessionStatus::Taken);
    assert_eq!(h.engine.balance(&UserId::new("u1")).unwrap(), Some(2));

    let err = h
        .engine
        .transition_status(&session.id, &teacher(), SessionStatus::UserAbsent, t() + mins(45))
        .await
        .unwrap_err();
    assert_eq!(err.code(), "conflict.already_finalized");
}

#[tokio::test(start_paused = true)]
async fn unanswered_request_expires() {
    let h = Harness::new();
    let session = h.book(t(), 30, t() - mins(60)).await;
    let request = h
        .engine
        .request_reschedule(
            &session.id,
            &user(),
            &candidates(&[t() + Duration::days(1)]),
            t() - mins(60),
        )
        .await
        .unwrap();

    advance(100).await;
    let requests = h.engine.list_requests(&session.id).unwrap();
    assert_eq!(requests[0].id, request.id);
    assert_eq!(requests[0].status, RescheduleStatus::NoResponse);
    assert!(h.notifier.sent_to(&user_recipient()).contains(&TemplateKey::RescheduleNoResponse));
}

#[tokio::test(start_paused = true)]
async fn absent_session_can_be_rebooked_by_the_other_party() {
    let h = Harness::new();
    let session = h.book(t(), 30, t() - Duration::days(2)).await;
    let after = t() + mins(45);

    h.engine
        .record_attendance(&session.id, &teacher(), true, t() + mins(5))
        .await
        .unwrap();
    h.engine
        .transition_status(&session.id, &teacher(), SessionStatus::UserAbsent, after)
        .await
        .unwrap();

    let options = candidates(&[t() + Duration::days(1)]);
    let err = h
        .engine
        .request_reschedule(&session.id, &user(), &options, after)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "conflict.illegal_transition");

    let request = h
        .engine
        .request_reschedule(&session.id, &teacher(), &options, after)
        .await
        .unwrap();
    h.engine
        .respond_to_reschedule(
            &request.id,
            &user(),
            RescheduleDecision::Approved,
            Some(&options[0]),
            after,
        )
        .await
        .unwrap();

    let reopened = h.engine.get_session(&session.id).unwrap().session;
    assert_eq!(reopened.status, SessionStatus::Pending);
    assert!(!reopened.teacher_attended);
    assert_eq!(reopened.scheduled_at, t() + Duration::days(1));
}

#[tokio::test(start_paused = true)]
async fn continuation_needs_a_taken_trial() {
    let h = Harness::new();
    let now = t() - Duration::days(2);
    let trial = h
        .engine
        .create_session(&h.pairing.id, t(), 30, SessionKind::Free, now)
        .await
        .unwrap();

    let err = h
        .engine
        .record_continuation(&h.pairing.id, &user(), true)
        .unwrap_err();
    assert_eq!(err.code(), "conflict.illegal_transition");

    h.engine
        .set_meeting_link(&trial.id, &teacher(), "https://meet.example/trial", now)
        .await
        .unwrap();
    h.engine
        .transition_status(&trial.id, &teacher(), SessionStatus::Ongoing, t())
        .await
        .unwrap();
    h.engine
        .transition_status(&trial.id, &teacher(), SessionStatus::Taken, t() + mins(25))
        .await
        .unwrap();

    let err = h
        .engine
        .record_continuation(&h.pairing.id, &teacher(), true)
        .unwrap_err();
    assert_eq!(err.code(), "unauthorized");

    let pairing = h
        .engine
        .record_continuation(&h.pairing.id, &user(), false)
        .unwrap();
    assert_eq!(pairing.will_continue, Some(false));
}

/// Books a paid session with a link and a pending user request proposing `t() + 2d`
async fn session_with_pending_request(h: &Harness) -> (tutor_api::Session, tutor_api::RescheduleRequest) {
    h.engine.set_balance(&UserId::new("u1"), 3).unwrap();
    let session = h.book(t(), 30, t() - Duration::days(2)).await;
    h.engine
        .set_meeting_link(&session.id, &teacher(), "https://meet.example/r1", t() - Duration::days(2))
        .await
        .unwrap();
    let request = h
        .engine
        .request_reschedule(
            &session.id,
            &user(),
            &candidates(&[t() + Duration::days(2)]),
            t() - Duration::days(1),
        )
        .await
        .unwrap();
    (session, request)
}

#[tokio::test(start_paused = true)]
async fn approving_during_an_ongoing_session_is_rejected() {
    let h = Harness::new();
    let (session, request) = session_with_pending_request(&h).await;
    h.engine
        .transition_status(&session.id, &teacher(), SessionStatus::Ongoing, t())
        .await
        .unwrap();

    let chosen = format_instant(&(t() + Duration::days(2)));
    let err = h
        .engine
        .respond_to_reschedule(
            &request.id,
            &teacher(),
            RescheduleDecision::Approved,
            Some(&chosen),
            t() + mins(5),
        )
        .await
        .unwrap_err();
    assert_eq!(err.code(), "conflict.illegal_transition");

    let current = h.engine.get_session(&session.id).unwrap().session;
    assert_eq!(current.status, SessionStatus::Ongoing);
    assert_eq!(current.scheduled_at, t());
    assert_eq!(h.engine.list_requests(&session.id).unwrap()[0].status, RescheduleStatus::Pending);
}

#[tokio::test(start_paused = true)]
async fn taking_a_session_closes_its_pending_request() {
    let h = Harness::new();
    let (session, request) = session_with_pending_request(&h).await;
    h.engine
        .transition_status(&session.id, &teacher(), SessionStatus::Ongoing, t())
        .await
        .unwrap();
    h.engine
        .transition_status(&session.id, &teacher(), SessionStatus::Taken, t() + mins(10))
        .await
        .unwrap();

    let requests = h.engine.list_requests(&session.id).unwrap();
    assert_eq!(requests[0].id, request.id);
    assert_eq!(requests[0].status, RescheduleStatus::NoResponse);
    assert_eq!(requests[0].responded_at, Some(t() + mins(10)));

    let chosen = format_instant(&(t() + Duration::days(2)));
    let err = h
        .engine
        .respond_to_reschedule(
            &request.id,
            &teacher(),
            RescheduleDecision::Approved,
            Some(&chosen),
            t() + mins(15),
        )
        .await
        .unwrap_err();
    assert!(matches!(
        err.conflict_reason(),
        Some(ConflictReason::RequestResolved {
            status: RescheduleStatus::NoResponse
        })
    ));

    let current = h.engine.get_session(&session.id).unwrap().session;
    assert_eq!(current.status, SessionStatus::Taken);
    assert_eq!(current.scheduled_at, t());
    assert_eq!(h.engine.balance(&UserId::new("u1")).unwrap(), Some(2));

    assert_eq!(h.notifier.count(TemplateKey::RescheduleNoResponse), 0);
}

#[tokio::test(start_paused = true)]
async fn series_past_the_calendar_is_rejected() {
    let h = Harness::new();
    let now = t() - Duration::days(2);

    let err = h
        .engine
        .create_session_series(&h.pairing.id, t(), 45, 2, u32::MAX, SessionKind::Free, now)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation");
    assert!(h.engine.list_jobs().unwrap().is_empty());

    let err = h
        .engine
        .create_session(&h.pairing.id, DateTime::<Utc>::MAX_UTC - mins(10), 45, SessionKind::Free, now)
        .await
        .unwrap_err();
    assert_eq!(err.code(), "validation");
}
