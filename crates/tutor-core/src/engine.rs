//! Session engine: every externally visible operation
//!
//! Each mutating operation runs in one store transaction. Job rows are
//! written inside it through a [`JobPlan`]; timers are armed and outbound
//! messages sent only after the commit.

use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};
use tutor_api::{
    Actor, EventPayload, HealthStatus, JobPayload, NewJob, Pairing, Party, RescheduleDecision,
    RescheduleRequest, RescheduleStatus, ScheduledJob, Session, SessionDetail, SessionKind,
    SessionStatus, SlotConflict,
};
use tutor_config::SchedulingPolicy;
use tutor_notify::{Notifier, RealtimeEmitter, TemplateKey};
use tutor_scheduler::{JobPlan, JobScheduler, ReplaySummary, SchedulerConfig};
use tutor_store::{
    BalanceRepo, Connection, HistoryEntry, HistoryEventType, HistoryRepo, PairingRepo,
    RescheduleRepo, SessionRepo, SqliteStore,
};
use tutor_util::{PairingId, RequestId, SessionId, TeacherId, UserId};

use crate::booking::{
    series_starts, stage_session_jobs, validate_duration, validate_start, validate_window,
};
use crate::callbacks::JobCallbacks;
use crate::error::{ConflictReason, CoreError, CoreResult};
use crate::interval::{CommitmentFilter, find_conflicts};
use crate::outbox::Outbox;
use crate::reschedule;
use crate::session::{self, ensure_participant};

/// Booking, lifecycle and negotiation operations over one store
pub struct SessionEngine {
    store: Arc<SqliteStore>,
    scheduler: JobScheduler,
    notifier: Arc<dyn Notifier>,
    emitter: Arc<dyn RealtimeEmitter>,
    policy: SchedulingPolicy,
}

impl SessionEngine {
    pub fn new(
        store: Arc<SqliteStore>,
        scheduler: JobScheduler,
        notifier: Arc<dyn Notifier>,
        emitter: Arc<dyn RealtimeEmitter>,
        policy: SchedulingPolicy,
    ) -> Self {
        Self {
            store,
            scheduler,
            notifier,
            emitter,
            policy,
        }
    }

    /// Wire the job callbacks, the scheduler and the engine over one store
    pub fn build(
        store: Arc<SqliteStore>,
        notifier: Arc<dyn Notifier>,
        emitter: Arc<dyn RealtimeEmitter>,
        policy: SchedulingPolicy,
    ) -> Self {
        let callbacks = JobCallbacks::new(store.clone(), notifier.clone(), emitter.clone());
        let scheduler = JobScheduler::new(
            store.clone(),
            Arc::new(callbacks),
            SchedulerConfig {
                notification_grace: policy.notification_grace,
                stale_job_retention: policy.stale_job_retention,
            },
        );
        Self::new(store, scheduler, notifier, emitter, policy)
    }

    pub fn policy(&self) -> &SchedulingPolicy {
        &self.policy
    }

    pub fn scheduler(&self) -> &JobScheduler {
        &self.scheduler
    }

    /// Run `f` in a transaction; on commit apply its job plan and deliver
    /// its outbox.
    async fn commit<T, F>(&self, now: DateTime<Utc>, f: F) -> CoreResult<T>
    where
        F: FnOnce(&Connection, &mut JobPlan, &mut Outbox) -> CoreResult<T>,
    {
        let mut plan = JobPlan::new();
        let mut outbox = Outbox::new();
        let out = self
            .store
            .with_tx(|conn| f(conn, &mut plan, &mut outbox))?;

        self.scheduler.apply(plan, now);
        outbox
            .deliver(self.notifier.as_ref(), self.emitter.as_ref(), now)
            .await;
        Ok(out)
    }

    fn filter<'a>(&self, exclude: Option<&'a SessionId>) -> CommitmentFilter<'a> {
        CommitmentFilter {
            exclude,
            absences_block: self.policy.absent_sessions_block_slots,
        }
    }

    // Admin

    pub fn register_pairing(
        &self,
        user_id: UserId,
        teacher_id: TeacherId,
        now: DateTime<Utc>,
    ) -> CoreResult<Pairing> {
        let pairing = Pairing {
            id: PairingId::new(),
            user_id,
            teacher_id,
            will_continue: None,
            created_at: now,
        };
        self.store
            .with_tx(|conn| PairingRepo::insert(conn, &pairing))?;
        info!(
            pairing_id = %pairing.id,
            user_id = %pairing.user_id,
            teacher_id = %pairing.teacher_id,
            "Pairing registered"
        );
        Ok(pairing)
    }

    pub fn set_balance(&self, user_id: &UserId, remaining: u32) -> CoreResult<()> {
        self.store
            .with_tx(|conn| BalanceRepo::set(conn, user_id, remaining))?;
        info!(user_id = %user_id, remaining, "Balance set");
        Ok(())
    }

    pub fn list_jobs(&self) -> CoreResult<Vec<ScheduledJob>> {
        Ok(self.scheduler.list_jobs()?)
    }

    pub fn recent_history(&self, limit: usize) -> CoreResult<Vec<HistoryEntry>> {
        Ok(self.store.read(|conn| HistoryRepo::recent(conn, limit))?)
    }

    pub fn health(&self) -> HealthStatus {
        let store_healthy = self.store.is_healthy();
        HealthStatus {
            live: true,
            ready: store_healthy && self.scheduler.has_replayed(),
            store_healthy,
            armed_jobs: self.scheduler.armed_count(),
        }
    }

    // Reads

    pub fn get_session(&self, session_id: &SessionId) -> CoreResult<SessionDetail> {
        self.store.read(|conn| load_detail(conn, session_id))
    }

    pub fn list_requests(&self, session_id: &SessionId) -> CoreResult<Vec<RescheduleRequest>> {
        Ok(self
            .store
            .read(|conn| RescheduleRepo::list_for_session(conn, session_id))?)
    }

    pub fn balance(&self, user_id: &UserId) -> CoreResult<Option<u32>> {
        Ok(self.store.read(|conn| BalanceRepo::get(conn, user_id))?)
    }

    // Booking

    pub async fn create_session(
        &self,
        pairing_id: &PairingId,
        scheduled_at: DateTime<Utc>,
        duration_minutes: u32,
        kind: SessionKind,
        now: DateTime<Utc>,
    ) -> CoreResult<Session> {
        let mut sessions = self
            .create_sessions(pairing_id, &[scheduled_at], duration_minutes, kind, now)
            .await?;
        sessions
            .pop()
            .ok_or_else(|| CoreError::Store("session batch came back empty".into()))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_session_series(
        &self,
        pairing_id: &PairingId,
        first_at: DateTime<Utc>,
        duration_minutes: u32,
        count: u32,
        every_days: u32,
        kind: SessionKind,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<Session>> {
        let starts = series_starts(first_at, count, every_days, &self.policy)?;
        self.create_sessions(pairing_id, &starts, duration_minutes, kind, now)
            .await
    }

    /// All-or-nothing insert of sessions at `starts`
    async fn create_sessions(
        &self,
        pairing_id: &PairingId,
        starts: &[DateTime<Utc>],
        duration_minutes: u32,
        kind: SessionKind,
        now: DateTime<Utc>,
    ) -> CoreResult<Vec<Session>> {
        validate_duration(duration_minutes, &self.policy)?;
        for start in starts {
            validate_start(*start, now)?;
            validate_window(*start, duration_minutes)?;
        }

        let sessions = self
            .commit(now, |conn, plan, outbox| {
                let pairing = PairingRepo::get(conn, pairing_id)?
                    .ok_or_else(|| CoreError::not_found(format!("pairing {}", pairing_id)))?;

                let existing = SessionRepo::list_for_teacher(conn, &pairing.teacher_id)?;
                let conflicts = find_conflicts(starts, duration_minutes, &existing, self.filter(None));
                if !conflicts.is_empty() {
                    return Err(ConflictReason::Overlap { conflicts }.into());
                }

                let mut created = Vec::with_capacity(starts.len());
                for start in starts {
                    let session = Session::new(pairing.id.clone(), *start, duration_minutes, kind, now);
                    SessionRepo::insert(conn, &session)?;
                    stage_session_jobs(plan, conn, &session, &self.policy, now)?;
                    HistoryRepo::record(
                        conn,
                        HistoryEventType::SessionCreated {
                            session_id: session.id.clone(),
                            pairing_id: pairing.id.clone(),
                            scheduled_at: session.scheduled_at,
                        },
                        now,
                    )?;

                    outbox.emit_pair(
                        &pairing,
                        EventPayload::SessionCreated {
                            session: session.clone(),
                        },
                    );
                    outbox.notify_pair(
                        &pairing,
                        TemplateKey::SessionBooked,
                        json!({
                            "session_id": session.id,
                            "scheduled_at": session.scheduled_at,
                            "duration_minutes": session.duration_minutes,
                        }),
                    );
                    created.push(session);
                }
                Ok(created)
            })
            .await?;

        info!(
            pairing_id = %pairing_id,
            count = sessions.len(),
            kind = %kind,
            "Sessions booked"
        );
        Ok(sessions)
    }

    /// Read-only interval check for a teacher
    pub fn check_availability(
        &self,
        teacher_id: &TeacherId,
        candidates: &[DateTime<Utc>],
        duration_minutes: u32,
    ) -> CoreResult<Vec<SlotConflict>> {
        validate_duration(duration_minutes, &self.policy)?;
        if candidates.is_empty() {
            return Err(CoreError::validation("at least one candidate is required"));
        }
        for candidate in candidates {
            validate_window(*candidate, duration_minutes)?;
        }
        let existing = self
            .store
            .read(|conn| SessionRepo::list_for_teacher(conn, teacher_id))?;
        Ok(find_conflicts(
            candidates,
            duration_minutes,
            &existing,
            self.filter(None),
        ))
    }

    // Lifecycle

    pub async fn transition_status(
        &self,
        session_id: &SessionId,
        actor: &Actor,
        target: SessionStatus,
        now: DateTime<Utc>,
    ) -> CoreResult<Session> {
        self.commit(now, |conn, _plan, outbox| {
            let mut detail = load_detail(conn, session_id)?;
            session::apply_transition_in(conn, &mut detail, target, actor, now, outbox)?;
            Ok(detail.session)
        })
        .await
    }

    pub async fn record_attendance(
        &self,
        session_id: &SessionId,
        actor: &Actor,
        attended: bool,
        now: DateTime<Utc>,
    ) -> CoreResult<Session> {
        self.commit(now, |conn, _plan, outbox| {
            let mut detail = load_detail(conn, session_id)?;
            let party = session::apply_attendance(&mut detail, actor, attended, now)?;
            SessionRepo::update(conn, &detail.session)?;

            outbox.emit_pair(
                &detail.pairing,
                EventPayload::AttendanceRecorded {
                    session_id: session_id.clone(),
                    party,
                    attended,
                },
            );
            debug!(session_id = %session_id, party = %party, attended, "Attendance recorded");
            Ok(detail.session)
        })
        .await
    }

    pub async fn set_meeting_link(
        &self,
        session_id: &SessionId,
        actor: &Actor,
        meeting_link: &str,
        now: DateTime<Utc>,
    ) -> CoreResult<Session> {
        self.commit(now, |conn, _plan, outbox| {
            let mut detail = load_detail(conn, session_id)?;
            session::apply_meeting_link(&mut detail, actor, meeting_link, now)?;
            SessionRepo::update(conn, &detail.session)?;

            if let Some(link) = &detail.session.meeting_link {
                outbox.emit_pair(
                    &detail.pairing,
                    EventPayload::MeetingLinkSet {
                        session_id: session_id.clone(),
                        meeting_link: link.clone(),
                    },
                );
            }
            info!(session_id = %session_id, "Meeting link set");
            Ok(detail.session)
        })
        .await
    }

    /// Record whether the student continues after a trial
    pub fn record_continuation(
        &self,
        pairing_id: &PairingId,
        actor: &Actor,
        will_continue: bool,
    ) -> CoreResult<Pairing> {
        let pairing = self.store.with_tx(|conn| {
            let mut pairing = PairingRepo::get(conn, pairing_id)?
                .ok_or_else(|| CoreError::not_found(format!("pairing {}", pairing_id)))?;

            if pairing.party_of(actor) != Some(Party::User) {
                return Err(CoreError::unauthorized(
                    "only the student of the pairing records continuation",
                ));
            }

            let trial_taken = SessionRepo::list_for_pairing(conn, pairing_id)?
                .iter()
                .any(|s| s.kind == SessionKind::Free && s.status == SessionStatus::Taken);
            if !trial_taken {
                return Err(ConflictReason::NoCompletedTrial.into());
            }

            PairingRepo::set_will_continue(conn, pairing_id, will_continue)?;
            pairing.will_continue = Some(will_continue);
            Ok(pairing)
        })?;

        info!(pairing_id = %pairing_id, will_continue, "Continuation recorded");
        Ok(pairing)
    }

    // Negotiation

    pub async fn request_reschedule(
        &self,
        session_id: &SessionId,
        actor: &Actor,
        candidate_dates: &[String],
        now: DateTime<Utc>,
    ) -> CoreResult<RescheduleRequest> {
        let request = self
            .commit(now, |conn, plan, outbox| {
                let mut detail = load_detail(conn, session_id)?;
                let party = ensure_participant(&detail, actor)?.ok_or_else(|| {
                    CoreError::unauthorized("reschedule requests come from a party")
                })?;

                reschedule::check_request(&detail.session, party, &self.policy, now)?;
                let candidates = reschedule::parse_candidates(candidate_dates, &self.policy, now)?;
                reschedule::check_absence_candidates(&detail.session, &candidates)?;

                if let Some(pending) = RescheduleRepo::find_pending_for_session(conn, session_id)? {
                    return Err(ConflictReason::DuplicatePending {
                        request_id: pending.id,
                    }
                    .into());
                }

                let expires_at = reschedule::timeout_at(&detail.session, &candidates, now);
                let request = RescheduleRequest {
                    id: RequestId::new(),
                    session_id: session_id.clone(),
                    requested_by: party,
                    old_date: detail.session.scheduled_at,
                    candidate_dates: candidates,
                    status: RescheduleStatus::Pending,
                    resulting_date: None,
                    created_at: now,
                    responded_at: None,
                };
                RescheduleRepo::insert(conn, &request)?;

                detail.session.reschedule_request_count += 1;
                detail.session.updated_at = now;
                SessionRepo::update(conn, &detail.session)?;

                let timeout = JobPayload::RescheduleTimeout {
                    request_id: request.id.clone(),
                };
                plan.schedule(conn, NewJob::for_payload(timeout, expires_at), now)?;

                HistoryRepo::record(
                    conn,
                    HistoryEventType::RescheduleRequested {
                        request_id: request.id.clone(),
                        session_id: session_id.clone(),
                        requested_by: party,
                    },
                    now,
                )?;

                outbox.emit_pair(
                    &detail.pairing,
                    EventPayload::RescheduleRequested {
                        request: request.clone(),
                    },
                );
                outbox.notify(
                    detail.pairing.recipient(party.counterpart()),
                    TemplateKey::RescheduleRequested,
                    json!({
                        "request_id": request.id,
                        "session_id": session_id,
                        "old_date": request.old_date,
                        "candidate_dates": request.candidate_dates,
                    }),
                );
                Ok(request)
            })
            .await?;

        info!(
            request_id = %request.id,
            session_id = %session_id,
            requested_by = %request.requested_by,
            candidates = request.candidate_dates.len(),
            "Reschedule requested"
        );
        Ok(request)
    }

    pub async fn respond_to_reschedule(
        &self,
        request_id: &RequestId,
        actor: &Actor,
        decision: RescheduleDecision,
        chosen_date: Option<&str>,
        now: DateTime<Utc>,
    ) -> CoreResult<RescheduleRequest> {
        let request = self
            .commit(now, |conn, plan, outbox| {
                let mut request = load_request(conn, request_id)?;
                let mut detail = load_detail(conn, &request.session_id)?;

                let party = ensure_participant(&detail, actor)?;
                reschedule::check_responder(&request, party)?;
                reschedule::ensure_pending(&request)?;

                let timeout_name = JobPayload::RescheduleTimeout {
                    request_id: request.id.clone(),
                }
                .job_name();

                match decision {
                    RescheduleDecision::Declined => {
                        request.status = RescheduleStatus::Declined;
                        request.responded_at = Some(now);
                        RescheduleRepo::update_outcome(conn, &request)?;
                        plan.cancel(conn, &timeout_name)?;
                    }
                    RescheduleDecision::Approved => {
                        reschedule::check_approvable(&detail.session)?;
                        let chosen = reschedule::validate_choice(&request, chosen_date, now)?;
                        validate_window(chosen, detail.session.duration_minutes)?;

                        let existing = SessionRepo::list_for_teacher(conn, detail.teacher_id())?;
                        let conflicts = find_conflicts(
                            &[chosen],
                            detail.session.duration_minutes,
                            &existing,
                            self.filter(Some(&detail.session.id)),
                        );
                        if !conflicts.is_empty() {
                            return Err(ConflictReason::Overlap { conflicts }.into());
                        }

                        request.status = RescheduleStatus::Approved;
                        request.resulting_date = Some(chosen);
                        request.responded_at = Some(now);
                        RescheduleRepo::update_outcome(conn, &request)?;

                        let from = detail.session.status;
                        reschedule::reset_to(&mut detail.session, chosen, now);
                        SessionRepo::update(conn, &detail.session)?;
                        if from != SessionStatus::Pending {
                            HistoryRepo::record(
                                conn,
                                HistoryEventType::SessionTransitioned {
                                    session_id: detail.session.id.clone(),
                                    from,
                                    to: SessionStatus::Pending,
                                    actor: actor.to_string(),
                                },
                                now,
                            )?;
                        }

                        plan.cancel(conn, &timeout_name)?;
                        stage_session_jobs(plan, conn, &detail.session, &self.policy, now)?;
                    }
                }

                HistoryRepo::record(
                    conn,
                    HistoryEventType::RescheduleResolved {
                        request_id: request.id.clone(),
                        session_id: request.session_id.clone(),
                        status: request.status,
                        resulting_date: request.resulting_date,
                    },
                    now,
                )?;

                outbox.emit_pair(
                    &detail.pairing,
                    EventPayload::RescheduleResolved {
                        request_id: request.id.clone(),
                        session_id: request.session_id.clone(),
                        status: request.status,
                        resulting_date: request.resulting_date,
                    },
                );
                let template = match request.status {
                    RescheduleStatus::Approved => TemplateKey::RescheduleApproved,
                    _ => TemplateKey::RescheduleDeclined,
                };
                outbox.notify(
                    detail.pairing.recipient(request.requested_by),
                    template,
                    json!({
                        "request_id": request.id,
                        "session_id": request.session_id,
                        "resulting_date": request.resulting_date,
                    }),
                );
                Ok(request)
            })
            .await?;

        info!(
            request_id = %request_id,
            session_id = %request.session_id,
            status = %request.status,
            "Reschedule resolved"
        );
        Ok(request)
    }

    /// Withdraw a pending request. Only the requester may cancel.
    pub async fn cancel_reschedule(
        &self,
        request_id: &RequestId,
        actor: &Actor,
        now: DateTime<Utc>,
    ) -> CoreResult<()> {
        self.commit(now, |conn, plan, outbox| {
            let request = load_request(conn, request_id)?;
            let mut detail = load_detail(conn, &request.session_id)?;

            if ensure_participant(&detail, actor)? != Some(request.requested_by) {
                return Err(CoreError::unauthorized(
                    "only the requester can cancel a reschedule request",
                ));
            }
            reschedule::ensure_pending(&request)?;

            RescheduleRepo::delete(conn, &request.id)?;
            detail.session.reschedule_request_count =
                detail.session.reschedule_request_count.saturating_sub(1);
            detail.session.updated_at = now;
            SessionRepo::update(conn, &detail.session)?;

            let timeout_name = JobPayload::RescheduleTimeout {
                request_id: request.id.clone(),
            }
            .job_name();
            plan.cancel(conn, &timeout_name)?;

            HistoryRepo::record(
                conn,
                HistoryEventType::RescheduleCancelled {
                    request_id: request.id.clone(),
                    session_id: request.session_id.clone(),
                },
                now,
            )?;

            outbox.emit_pair(
                &detail.pairing,
                EventPayload::RescheduleCancelled {
                    request_id: request.id.clone(),
                    session_id: request.session_id.clone(),
                },
            );
            outbox.notify(
                detail.pairing.recipient(request.requested_by.counterpart()),
                TemplateKey::RescheduleCancelled,
                json!({
                    "request_id": request.id,
                    "session_id": request.session_id,
                }),
            );
            Ok(())
        })
        .await?;

        info!(request_id = %request_id, "Reschedule cancelled");
        Ok(())
    }

    // Jobs

    /// Schedule a standalone job in its own transaction
    pub fn schedule(&self, job: NewJob, now: DateTime<Utc>) -> CoreResult<ScheduledJob> {
        Ok(self.scheduler.schedule(job, now)?)
    }

    pub fn cancel(&self, name: &str) -> CoreResult<bool> {
        Ok(self.scheduler.cancel(name)?)
    }

    pub async fn replay_pending(&self, now: DateTime<Utc>) -> CoreResult<ReplaySummary> {
        Ok(self.scheduler.replay_pending(now).await?)
    }

    pub fn sweep(&self, now: DateTime<Utc>) -> CoreResult<usize> {
        Ok(self.scheduler.sweep(now)?)
    }
}

pub(crate) fn load_detail(conn: &Connection, session_id: &SessionId) -> CoreResult<SessionDetail> {
    SessionRepo::get_detail(conn, session_id)?
        .ok_or_else(|| CoreError::not_found(format!("session {}", session_id)))
}

pub(crate) fn load_request(conn: &Connection, request_id: &RequestId) -> CoreResult<RescheduleRequest> {
    RescheduleRepo::get(conn, request_id)?
        .ok_or_else(|| CoreError::not_found(format!("reschedule request {}", request_id)))
}
