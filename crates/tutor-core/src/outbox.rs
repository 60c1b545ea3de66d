//! Notifications and realtime events staged until commit

use chrono::{DateTime, Utc};
use tutor_api::{Event, EventPayload, Pairing, Recipient};
use tutor_notify::{notify_logged, Notifier, RealtimeEmitter, TemplateKey};

/// Outbound messages collected during a transaction. Nothing is sent unless
/// the transaction commits.
#[derive(Debug, Default)]
pub struct Outbox {
    notifications: Vec<(Recipient, TemplateKey, serde_json::Value)>,
    events: Vec<(Recipient, EventPayload)>,
}

impl Outbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn notify(&mut self, recipient: Recipient, template: TemplateKey, data: serde_json::Value) {
        self.notifications.push((recipient, template, data));
    }

    /// Notify both parties of the pairing
    pub fn notify_pair(&mut self, pairing: &Pairing, template: TemplateKey, data: serde_json::Value) {
        for recipient in pairing.recipients() {
            self.notify(recipient, template, data.clone());
        }
    }

    pub fn emit(&mut self, recipient: Recipient, payload: EventPayload) {
        self.events.push((recipient, payload));
    }

    /// Emit to both parties of the pairing
    pub fn emit_pair(&mut self, pairing: &Pairing, payload: EventPayload) {
        for recipient in pairing.recipients() {
            self.emit(recipient, payload.clone());
        }
    }

    pub fn is_empty(&self) -> bool {
        self.notifications.is_empty() && self.events.is_empty()
    }

    /// Send everything. Failures are logged by the notifier seam and never
    /// reach the caller.
    pub async fn deliver(
        self,
        notifier: &dyn Notifier,
        emitter: &dyn RealtimeEmitter,
        now: DateTime<Utc>,
    ) {
        for (recipient, payload) in self.events {
            emitter.emit(&recipient, Event::at(payload, now));
        }
        for (recipient, template, data) in self.notifications {
            notify_logged(notifier, &recipient, template, data).await;
        }
    }
}
