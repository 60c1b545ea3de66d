//! Post-commit job plan

use chrono::{DateTime, Utc};
use tutor_api::{NewJob, ScheduledJob};
use tutor_store::{Connection, JobRepo, StoreResult};

/// Timer changes staged inside a transaction, applied after it commits.
///
/// The latest call for a name wins: scheduling a name drops an earlier
/// cancel for it and vice versa.
#[derive(Debug, Default)]
pub struct JobPlan {
    arm: Vec<ScheduledJob>,
    disarm: Vec<String>,
}

impl JobPlan {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write (or replace) the job row and stage its timer
    pub fn schedule(
        &mut self,
        conn: &Connection,
        job: NewJob,
        now: DateTime<Utc>,
    ) -> StoreResult<ScheduledJob> {
        let row = JobRepo::upsert(conn, &job, now)?;
        self.disarm.retain(|name| *name != row.name);
        self.arm.retain(|armed| armed.name != row.name);
        self.arm.push(row.clone());
        Ok(row)
    }

    /// Delete the job row and stage the timer abort. Unknown names are a
    /// no-op on the row; the abort is staged regardless.
    pub fn cancel(&mut self, conn: &Connection, name: &str) -> StoreResult<bool> {
        let existed = JobRepo::delete_by_name(conn, name)?;
        self.arm.retain(|armed| armed.name != name);
        if !self.disarm.iter().any(|n| n == name) {
            self.disarm.push(name.to_string());
        }
        Ok(existed)
    }

    pub fn is_empty(&self) -> bool {
        self.arm.is_empty() && self.disarm.is_empty()
    }

    pub fn to_arm(&self) -> &[ScheduledJob] {
        &self.arm
    }

    pub fn to_disarm(&self) -> &[String] {
        &self.disarm
    }

    pub(crate) fn into_parts(self) -> (Vec<String>, Vec<ScheduledJob>) {
        (self.disarm, self.arm)
    }
}
