//! Timer table and job dispatch

use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use tutor_api::{JobStatus, NewJob, ScheduledJob};
use tutor_store::{HistoryEventType, HistoryRepo, JobRepo, SqliteStore, StoreResult};

use crate::{JobHandler, JobPlan};

/// Scheduler tuning, normally taken from the scheduling policy
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Notification-only jobs more overdue than this at replay are dropped
    pub notification_grace: Duration,
    /// QUEUED rows overdue by more than this are removed by the sweep
    pub stale_job_retention: Duration,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            notification_grace: Duration::hours(1),
            stale_job_retention: Duration::weeks(1),
        }
    }
}

/// What boot-time replay did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReplaySummary {
    pub armed: usize,
    pub fired: usize,
    pub dropped: usize,
}

/// Result of one dispatch attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FireOutcome {
    Completed,
    Failed,
    /// Row gone, replaced, or no longer queued
    Skipped,
}

struct ArmedTimer {
    seq: u64,
    fires_at: DateTime<Utc>,
    handle: JoinHandle<()>,
}

struct Inner {
    store: Arc<SqliteStore>,
    handler: Arc<dyn JobHandler>,
    config: SchedulerConfig,
    timers: Mutex<HashMap<String, ArmedTimer>>,
    next_seq: AtomicU64,
    replayed: AtomicBool,
}

/// Owns the in-memory timers for persisted jobs. Cheap to clone.
#[derive(Clone)]
pub struct JobScheduler {
    inner: Arc<Inner>,
}

impl JobScheduler {
    pub fn new(
        store: Arc<SqliteStore>,
        handler: Arc<dyn JobHandler>,
        config: SchedulerConfig,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                handler,
                config,
                timers: Mutex::new(HashMap::new()),
                next_seq: AtomicU64::new(1),
                replayed: AtomicBool::new(false),
            }),
        }
    }

    /// Apply a committed plan: abort cancelled timers, then arm new ones.
    pub fn apply(&self, plan: JobPlan, now: DateTime<Utc>) {
        let (disarm, arm) = plan.into_parts();
        for name in disarm {
            self.disarm(&name);
        }
        for job in arm {
            self.arm(job, now);
        }
    }

    /// Schedule a job in its own transaction. Idempotent by name.
    pub fn schedule(&self, job: NewJob, now: DateTime<Utc>) -> StoreResult<ScheduledJob> {
        let mut plan = JobPlan::new();
        let row = self
            .inner
            .store
            .with_tx(|conn| plan.schedule(conn, job, now))?;
        self.apply(plan, now);
        Ok(row)
    }

    /// Cancel a job by name. Unknown names are a no-op.
    pub fn cancel(&self, name: &str) -> StoreResult<bool> {
        let mut plan = JobPlan::new();
        let existed = self.inner.store.with_tx(|conn| plan.cancel(conn, name))?;
        self.apply(plan, tutor_util::now());
        Ok(existed)
    }

    /// Rebuild timers from the store. Runs once per process; later calls
    /// return an empty summary.
    ///
    /// Future jobs are armed. Overdue jobs are dispatched inline, one at a
    /// time, in firing order, except notification-only jobs past the grace
    /// window, which are deleted unrun.
    pub async fn replay_pending(&self, now: DateTime<Utc>) -> StoreResult<ReplaySummary> {
        if self.inner.replayed.swap(true, Ordering::SeqCst) {
            warn!("Job replay already ran for this process");
            return Ok(ReplaySummary::default());
        }

        let jobs = self.inner.store.read(JobRepo::list_queued)?;
        info!(count = jobs.len(), "Replaying queued jobs");

        let mut summary = ReplaySummary::default();
        for job in jobs {
            if job.fires_at > now {
                self.arm(job, now);
                summary.armed += 1;
            } else if job.kind.is_notification_only()
                && now - job.fires_at > self.inner.config.notification_grace
            {
                self.inner.drop_overdue(&job, now)?;
                summary.dropped += 1;
            } else {
                self.inner.fire(&job.name, job.fires_at, now).await;
                summary.fired += 1;
            }
        }

        self.inner.store.with_tx(|conn| {
            HistoryRepo::record(
                conn,
                HistoryEventType::JobsReplayed {
                    armed: summary.armed,
                    fired: summary.fired,
                    dropped: summary.dropped,
                },
                now,
            )
        })?;

        info!(
            armed = summary.armed,
            fired = summary.fired,
            dropped = summary.dropped,
            "Job replay complete"
        );
        Ok(summary)
    }

    /// Remove FAILED rows and QUEUED rows overdue beyond the retention
    /// window that have no live timer. Returns the number removed.
    pub fn sweep(&self, now: DateTime<Utc>) -> StoreResult<usize> {
        let cutoff = now - self.inner.config.stale_job_retention;
        let stale = self.inner.store.read(|conn| JobRepo::list_stale(conn, cutoff))?;

        let victims: Vec<String> = {
            let timers = self.inner.timers();
            stale
                .into_iter()
                .filter(|job| job.status == JobStatus::Failed || !timers.contains_key(&job.name))
                .map(|job| job.name)
                .collect()
        };

        if victims.is_empty() {
            debug!("Job sweep found nothing to remove");
            return Ok(0);
        }

        let removed = self.inner.store.with_tx(|conn| {
            let mut removed = 0;
            for name in &victims {
                if JobRepo::delete_by_name(conn, name)? {
                    removed += 1;
                }
            }
            HistoryRepo::record(conn, HistoryEventType::JobsSwept { removed }, now)?;
            Ok::<_, tutor_store::StoreError>(removed)
        })?;

        info!(removed, "Stale jobs swept");
        Ok(removed)
    }

    /// Every persisted job, in firing order
    pub fn list_jobs(&self) -> StoreResult<Vec<ScheduledJob>> {
        self.inner.store.read(JobRepo::list_all)
    }

    /// Whether boot-time replay has run
    pub fn has_replayed(&self) -> bool {
        self.inner.replayed.load(Ordering::SeqCst)
    }

    pub fn armed_count(&self) -> usize {
        self.inner.timers().len()
    }

    pub fn is_armed(&self, name: &str) -> bool {
        self.inner.timers().contains_key(name)
    }

    /// Firing time of the live timer for `name`
    pub fn armed_at(&self, name: &str) -> Option<DateTime<Utc>> {
        self.inner.timers().get(name).map(|t| t.fires_at)
    }

    /// Abort every timer. Rows stay QUEUED for the next boot.
    pub fn shutdown(&self) {
        let mut timers = self.inner.timers();
        let count = timers.len();
        for (_, timer) in timers.drain() {
            timer.handle.abort();
        }
        info!(count, "Job timers aborted");
    }

    fn arm(&self, job: ScheduledJob, now: DateTime<Utc>) {
        let delay = (job.fires_at - now).to_std().unwrap_or_default();
        let seq = self.inner.next_seq.fetch_add(1, Ordering::SeqCst);
        let name = job.name.clone();
        let fires_at = job.fires_at;

        // Hold the table while spawning so the task cannot release its entry
        // before it is inserted.
        let mut timers = self.inner.timers();
        if let Some(previous) = timers.remove(&name) {
            previous.handle.abort();
            debug!(job = %name, "Replaced armed timer");
        }

        let inner = Arc::clone(&self.inner);
        let task_name = name.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            inner.release(&task_name, seq);
            inner.fire(&task_name, fires_at, fires_at).await;
        });

        timers.insert(
            name.clone(),
            ArmedTimer {
                seq,
                fires_at,
                handle,
            },
        );
        info!(job = %name, kind = %job.kind, fires_at = %fires_at, "Job armed");
    }

    fn disarm(&self, name: &str) {
        if let Some(timer) = self.inner.timers().remove(name) {
            timer.handle.abort();
            info!(job = %name, "Job timer cancelled");
        }
    }
}

impl Inner {
    fn timers(&self) -> MutexGuard<'_, HashMap<String, ArmedTimer>> {
        self.timers.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Forget the timer entry for `name` if it is still the one numbered `seq`
    fn release(&self, name: &str, seq: u64) {
        let mut timers = self.timers();
        if timers.get(name).is_some_and(|t| t.seq == seq) {
            timers.remove(name);
        }
    }

    /// Dispatch the job named `name` if its row still matches `fires_at`.
    async fn fire(&self, name: &str, fires_at: DateTime<Utc>, now: DateTime<Utc>) -> FireOutcome {
        let job = match self.store.read(|conn| JobRepo::get_by_name(conn, name)) {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(job = %name, "Job row gone, skipping");
                return FireOutcome::Skipped;
            }
            Err(e) => {
                error!(job = %name, error = %e, "Failed to load job");
                return FireOutcome::Skipped;
            }
        };

        if job.fires_at != fires_at || job.status != JobStatus::Queued {
            debug!(job = %name, "Stale timer, skipping");
            return FireOutcome::Skipped;
        }

        info!(job_id = %job.id, job = %name, kind = %job.kind, "Job firing");

        match self.handler.handle(&job, now).await {
            Ok(()) => {
                let result = self.store.with_tx(|conn| {
                    JobRepo::delete_fired(conn, name, fires_at)?;
                    HistoryRepo::record(
                        conn,
                        HistoryEventType::JobCompleted {
                            job_id: job.id.clone(),
                            name: job.name.clone(),
                            kind: job.kind,
                        },
                        now,
                    )
                });
                if let Err(e) = result {
                    error!(job = %name, error = %e, "Failed to record job completion");
                }
                FireOutcome::Completed
            }
            Err(cause) => {
                let message = cause.to_string();
                error!(job_id = %job.id, job = %name, error = %message, "Job failed");

                let result = self.store.with_tx(|conn| {
                    JobRepo::delete_fired(conn, name, fires_at)?;
                    HistoryRepo::record(
                        conn,
                        HistoryEventType::JobFailed {
                            job_id: job.id.clone(),
                            name: job.name.clone(),
                            kind: job.kind,
                            error: message.clone(),
                        },
                        now,
                    )
                });
                if let Err(e) = result {
                    error!(job = %name, error = %e, "Failed to record job failure");
                    // Left for the sweep
                    if let Err(e) = self
                        .store
                        .read(|conn| JobRepo::mark_failed(conn, name, fires_at, &message))
                    {
                        error!(job = %name, error = %e, "Failed to mark job failed");
                    }
                }
                FireOutcome::Failed
            }
        }
    }

    fn drop_overdue(&self, job: &ScheduledJob, now: DateTime<Utc>) -> StoreResult<()> {
        warn!(
            job_id = %job.id,
            job = %job.name,
            kind = %job.kind,
            fires_at = %job.fires_at,
            "Dropping overdue notification job"
        );
        self.store.with_tx(|conn| {
            JobRepo::delete_by_name(conn, &job.name)?;
            HistoryRepo::record(
                conn,
                HistoryEventType::JobDropped {
                    job_id: job.id.clone(),
                    name: job.name.clone(),
                    kind: job.kind,
                    fires_at: job.fires_at,
                },
                now,
            )?;
            Ok(())
        })
    }
}
