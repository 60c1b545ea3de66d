//! Durable job scheduler for tutord
//!
//! Jobs are named, one-shot, and persisted in the store before a timer is
//! armed for them. The in-memory timer table is rebuilt from the store at
//! boot with [`JobScheduler::replay_pending`].
//!
//! Writes that belong to a business transaction go through a [`JobPlan`]:
//! rows are staged inside the transaction and timers change only after it
//! commits, via [`JobScheduler::apply`].

mod plan;
mod scheduler;

pub use plan::*;
pub use scheduler::*;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tutor_api::ScheduledJob;

/// Error returned by a job callback
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Runs the business effect of a job when it fires
#[async_trait]
pub trait JobHandler: Send + Sync {
    /// `now` is the logical firing time: the job's `fires_at` for timers,
    /// the replay time for overdue jobs run at boot.
    async fn handle(&self, job: &ScheduledJob, now: DateTime<Utc>) -> Result<(), HandlerError>;
}
