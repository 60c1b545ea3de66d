//! Business effects of deferred jobs
//!
//! Dispatch is an exhaustive match over [`JobPayload`]. Callbacks never arm
//! jobs themselves, so they only need the store and the outbound seams.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::sync::Arc;
use tracing::{debug, info};
use tutor_api::{Actor, EventPayload, JobPayload, RescheduleStatus, ScheduledJob, SessionStatus};
use tutor_notify::{Notifier, RealtimeEmitter, TemplateKey};
use tutor_scheduler::{HandlerError, JobHandler};
use tutor_store::{Connection, HistoryEventType, HistoryRepo, RescheduleRepo, SqliteStore};
use tutor_util::{RequestId, SessionId};

use crate::engine::load_detail;
use crate::error::CoreResult;
use crate::outbox::Outbox;
use crate::session::{apply_transition_in, finish_target};

/// [`JobHandler`] for every job kind
pub struct JobCallbacks {
    store: Arc<SqliteStore>,
    notifier: Arc<dyn Notifier>,
    emitter: Arc<dyn RealtimeEmitter>,
}

impl JobCallbacks {
    pub fn new(
        store: Arc<SqliteStore>,
        notifier: Arc<dyn Notifier>,
        emitter: Arc<dyn RealtimeEmitter>,
    ) -> Self {
        Self {
            store,
            notifier,
            emitter,
        }
    }

    async fn run<F>(&self, now: DateTime<Utc>, f: F) -> CoreResult<()>
    where
        F: FnOnce(&Connection, &mut Outbox) -> CoreResult<()>,
    {
        let mut outbox = Outbox::new();
        self.store.with_tx(|conn| f(conn, &mut outbox))?;
        outbox
            .deliver(self.notifier.as_ref(), self.emitter.as_ref(), now)
            .await;
        Ok(())
    }

    async fn remind(&self, session_id: &SessionId, now: DateTime<Utc>) -> CoreResult<()> {
        self.run(now, |conn, outbox| {
            let detail = load_detail(conn, session_id)?;
            if detail.session.status != SessionStatus::Pending {
                debug!(session_id = %session_id, status = %detail.session.status, "Reminder not needed");
                return Ok(());
            }

            outbox.notify_pair(
                &detail.pairing,
                TemplateKey::SessionReminder,
                json!({
                    "session_id": session_id,
                    "scheduled_at": detail.session.scheduled_at,
                    "meeting_link": detail.session.meeting_link,
                }),
            );
            outbox.emit_pair(
                &detail.pairing,
                EventPayload::SessionReminder {
                    session_id: session_id.clone(),
                    scheduled_at: detail.session.scheduled_at,
                },
            );
            Ok(())
        })
        .await
    }

    async fn start(&self, session_id: &SessionId, now: DateTime<Utc>) -> CoreResult<()> {
        self.run(now, |conn, outbox| {
            let detail = load_detail(conn, session_id)?;
            if detail.session.status != SessionStatus::Pending {
                debug!(session_id = %session_id, status = %detail.session.status, "Start notice not needed");
                return Ok(());
            }

            outbox.notify_pair(
                &detail.pairing,
                TemplateKey::SessionStarting,
                json!({
                    "session_id": session_id,
                    "meeting_link": detail.session.meeting_link,
                }),
            );
            outbox.emit_pair(
                &detail.pairing,
                EventPayload::SessionStarting {
                    session_id: session_id.clone(),
                    meeting_link: detail.session.meeting_link.clone(),
                },
            );
            Ok(())
        })
        .await
    }

    async fn finish(&self, session_id: &SessionId, now: DateTime<Utc>) -> CoreResult<()> {
        self.run(now, |conn, outbox| {
            let mut detail = load_detail(conn, session_id)?;
            match finish_target(&detail) {
                Some(target) => {
                    apply_transition_in(conn, &mut detail, target, &Actor::System, now, outbox)?;
                    info!(session_id = %session_id, status = %target, "Session auto-finalized");
                }
                None => {
                    debug!(session_id = %session_id, status = %detail.session.status, "Nothing to finalize");
                }
            }
            Ok(())
        })
        .await
    }

    async fn expire(&self, request_id: &RequestId, now: DateTime<Utc>) -> CoreResult<()> {
        self.run(now, |conn, outbox| {
            let Some(mut request) = RescheduleRepo::get(conn, request_id)? else {
                debug!(request_id = %request_id, "Reschedule request gone");
                return Ok(());
            };
            if request.status != RescheduleStatus::Pending {
                debug!(request_id = %request_id, status = %request.status, "Reschedule already resolved");
                return Ok(());
            }

            let detail = load_detail(conn, &request.session_id)?;
            request.status = RescheduleStatus::NoResponse;
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

            outbox.notify(
                detail.pairing.recipient(request.requested_by),
                TemplateKey::RescheduleNoResponse,
                json!({
                    "request_id": request.id,
                    "session_id": request.session_id,
                }),
            );
            outbox.emit_pair(
                &detail.pairing,
                EventPayload::RescheduleResolved {
                    request_id: request.id.clone(),
                    session_id: request.session_id.clone(),
                    status: request.status,
                    resulting_date: None,
                },
            );
            info!(request_id = %request_id, "Reschedule request expired without response");
            Ok(())
        })
        .await
    }
}

#[async_trait]
impl JobHandler for JobCallbacks {
    async fn handle(&self, job: &ScheduledJob, now: DateTime<Utc>) -> Result<(), HandlerError> {
        let result = match &job.payload {
            JobPayload::SessionReminder { session_id } => self.remind(session_id, now).await,
            JobPayload::SessionStart { session_id } => self.start(session_id, now).await,
            JobPayload::SessionFinish { session_id } => self.finish(session_id, now).await,
            JobPayload::RescheduleTimeout { request_id } => self.expire(request_id, now).await,
        };
        result.map_err(HandlerError::from)
    }
}
