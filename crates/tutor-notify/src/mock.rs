//! Recording notifier and emitter for testing

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tutor_api::{Event, Recipient};

use crate::{DispatchError, DispatchResult, Notifier, RealtimeEmitter, TemplateKey};

/// A notification captured by [`RecordingNotifier`]
#[derive(Debug, Clone)]
pub struct SentNotification {
    pub recipient: Recipient,
    pub template: TemplateKey,
    pub data: serde_json::Value,
}

/// Notifier that keeps everything it is asked to send
#[derive(Debug, Default)]
pub struct RecordingNotifier {
    sent: Mutex<Vec<SentNotification>>,

    /// Configure send to fail (the attempt is still recorded)
    fail: AtomicBool,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_failing(&self, fail: bool) {
        self.fail.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<SentNotification> {
        self.sent.lock().unwrap().clone()
    }

    pub fn sent_to(&self, recipient: &Recipient) -> Vec<TemplateKey> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|n| &n.recipient == recipient)
            .map(|n| n.template)
            .collect()
    }

    pub fn count(&self, template: TemplateKey) -> usize {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|n| n.template == template)
            .count()
    }

    pub fn clear(&self) {
        self.sent.lock().unwrap().clear();
    }
}

#[async_trait]
impl Notifier for RecordingNotifier {
    async fn send(
        &self,
        recipient: &Recipient,
        template: TemplateKey,
        data: serde_json::Value,
    ) -> DispatchResult<()> {
        self.sent.lock().unwrap().push(SentNotification {
            recipient: recipient.clone(),
            template,
            data,
        });

        if self.fail.load(Ordering::SeqCst) {
            return Err(DispatchError::Internal("Mock dispatch failure".into()));
        }
        Ok(())
    }
}

/// Emitter that keeps every event with its recipient
#[derive(Debug, Default)]
pub struct RecordingEmitter {
    events: Mutex<Vec<(Recipient, Event)>>,
}

impl RecordingEmitter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<(Recipient, Event)> {
        self.events.lock().unwrap().clone()
    }

    /// Event names delivered to `recipient`, in order
    pub fn names_for(&self, recipient: &Recipient) -> Vec<&'static str> {
        self.events
            .lock()
            .unwrap()
            .iter()
            .filter(|(r, _)| r == recipient)
            .map(|(_, e)| e.name())
            .collect()
    }

    pub fn clear(&self) {
        self.events.lock().unwrap().clear();
    }
}

impl RealtimeEmitter for RecordingEmitter {
    fn emit(&self, recipient: &Recipient, event: Event) {
        self.events.lock().unwrap().push((recipient.clone(), event));
    }
}
