//! Notifier and emitter traits

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};
use tutor_api::{Event, Recipient};

/// Errors from the notification dispatcher
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Recipient unreachable: {0}")]
    Unreachable(String),

    #[error("Template rendering failed: {0}")]
    Template(String),

    #[error("Dispatch failed: {0}")]
    Internal(String),
}

pub type DispatchResult<T> = Result<T, DispatchError>;

/// Message templates the engine can ask the dispatcher to render
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TemplateKey {
    SessionBooked,
    SessionReminder,
    SessionStarting,
    SessionFinalized,
    RescheduleRequested,
    RescheduleApproved,
    RescheduleDeclined,
    RescheduleNoResponse,
    RescheduleCancelled,
}

impl TemplateKey {
    pub fn as_str(&self) -> &'static str {
        match self {
            TemplateKey::SessionBooked => "session_booked",
            TemplateKey::SessionReminder => "session_reminder",
            TemplateKey::SessionStarting => "session_starting",
            TemplateKey::SessionFinalized => "session_finalized",
            TemplateKey::RescheduleRequested => "reschedule_requested",
            TemplateKey::RescheduleApproved => "reschedule_approved",
            TemplateKey::RescheduleDeclined => "reschedule_declined",
            TemplateKey::RescheduleNoResponse => "reschedule_no_response",
            TemplateKey::RescheduleCancelled => "reschedule_cancelled",
        }
    }
}

impl std::fmt::Display for TemplateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// External notification dispatcher
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send(
        &self,
        recipient: &Recipient,
        template: TemplateKey,
        data: serde_json::Value,
    ) -> DispatchResult<()>;
}

/// Live event sink. Delivery is best effort; an absent listener is not an
/// error.
pub trait RealtimeEmitter: Send + Sync {
    fn emit(&self, recipient: &Recipient, event: Event);
}

/// Send a notification, logging instead of returning any failure
pub async fn notify_logged(
    notifier: &dyn Notifier,
    recipient: &Recipient,
    template: TemplateKey,
    data: serde_json::Value,
) {
    if let Err(e) = notifier.send(recipient, template, data).await {
        warn!(recipient = %recipient, template = %template, error = %e, "Notification failed");
    }
}

/// Default notifier: writes every notification to the log
#[derive(Debug, Default)]
pub struct TracingNotifier;

#[async_trait]
impl Notifier for TracingNotifier {
    async fn send(
        &self,
        recipient: &Recipient,
        template: TemplateKey,
        data: serde_json::Value,
    ) -> DispatchResult<()> {
        info!(recipient = %recipient, template = %template, data = %data, "Notification");
        Ok(())
    }
}

/// Emitter that discards everything
#[derive(Debug, Default)]
pub struct NullEmitter;

impl RealtimeEmitter for NullEmitter {
    fn emit(&self, _recipient: &Recipient, _event: Event) {}
}
