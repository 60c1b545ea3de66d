//! Durable job repository
//!
//! Plain CRUD over `scheduled_jobs`. Timers live in the scheduler; this
//! module only knows rows.

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;
use tutor_api::{JobStatus, NewJob, ScheduledJob};
use tutor_util::JobId;

use crate::sqlite::{instant_col, instant_text, json_col, text_col};
use crate::{StoreError, StoreResult};

const COLUMNS: &str = "id, name, fires_at, kind, payload_json, status, last_error, created_at";

pub struct JobRepo;

impl JobRepo {
    /// Insert a QUEUED job, or replace the job that already holds this name.
    /// A replaced job keeps its id and gets the new time and payload.
    pub fn upsert(conn: &Connection, job: &NewJob, now: DateTime<Utc>) -> StoreResult<ScheduledJob> {
        conn.execute(
            &format!(
                "INSERT INTO scheduled_jobs ({COLUMNS})
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, NULL, ?7)
                 ON CONFLICT(name) DO UPDATE SET
                    fires_at = excluded.fires_at,
                    kind = excluded.kind,
                    payload_json = excluded.payload_json,
                    status = excluded.status,
                    last_error = NULL"
            ),
            params![
                JobId::new().to_string(),
                job.name,
                instant_text(&job.fires_at),
                job.payload.kind().as_str(),
                serde_json::to_string(&job.payload)?,
                JobStatus::Queued.as_str(),
                instant_text(&now),
            ],
        )?;

        debug!(job = %job.name, fires_at = %job.fires_at, "Job row written");
        Self::get_by_name(conn, &job.name)?
            .ok_or_else(|| StoreError::NotFound(format!("job {}", job.name)))
    }

    pub fn get_by_name(conn: &Connection, name: &str) -> StoreResult<Option<ScheduledJob>> {
        let job = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM scheduled_jobs WHERE name = ?1"),
                [name],
                Self::map_row,
            )
            .optional()?;
        Ok(job)
    }

    /// Delete by name. Returns whether a row existed.
    pub fn delete_by_name(conn: &Connection, name: &str) -> StoreResult<bool> {
        let changed = conn.execute("DELETE FROM scheduled_jobs WHERE name = ?1", [name])?;
        Ok(changed > 0)
    }

    /// Delete the row only if it still describes the run that just fired.
    /// A job re-scheduled under the same name while its previous run was in
    /// flight survives.
    pub fn delete_fired(conn: &Connection, name: &str, fires_at: DateTime<Utc>) -> StoreResult<bool> {
        let changed = conn.execute(
            "DELETE FROM scheduled_jobs WHERE name = ?1 AND fires_at = ?2",
            params![name, instant_text(&fires_at)],
        )?;
        Ok(changed > 0)
    }

    pub fn mark_failed(
        conn: &Connection,
        name: &str,
        fires_at: DateTime<Utc>,
        error: &str,
    ) -> StoreResult<()> {
        conn.execute(
            "UPDATE scheduled_jobs SET status = ?3, last_error = ?4
             WHERE name = ?1 AND fires_at = ?2",
            params![name, instant_text(&fires_at), JobStatus::Failed.as_str(), error],
        )?;
        Ok(())
    }

    /// QUEUED jobs in firing order
    pub fn list_queued(conn: &Connection) -> StoreResult<Vec<ScheduledJob>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM scheduled_jobs
             WHERE status = ?1
             ORDER BY fires_at, created_at"
        ))?;
        let rows = stmt.query_map([JobStatus::Queued.as_str()], Self::map_row)?;
        let mut jobs = rows.collect::<Result<Vec<_>, _>>()?;
        // Text order breaks down once fractional seconds appear
        jobs.sort_by_key(|job| (job.fires_at, job.created_at));
        Ok(jobs)
    }

    pub fn list_all(conn: &Connection) -> StoreResult<Vec<ScheduledJob>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM scheduled_jobs ORDER BY fires_at, created_at"
        ))?;
        let rows = stmt.query_map([], Self::map_row)?;
        let mut jobs = rows.collect::<Result<Vec<_>, _>>()?;
        jobs.sort_by_key(|job| (job.fires_at, job.created_at));
        Ok(jobs)
    }

    /// Candidates for the stale-job sweep: every FAILED row, plus QUEUED
    /// rows that should have fired before `cutoff`.
    pub fn list_stale(conn: &Connection, cutoff: DateTime<Utc>) -> StoreResult<Vec<ScheduledJob>> {
        let queued = Self::list_queued(conn)?
            .into_iter()
            .filter(|job| job.fires_at < cutoff);

        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM scheduled_jobs WHERE status = ?1"
        ))?;
        let failed = stmt
            .query_map([JobStatus::Failed.as_str()], Self::map_row)?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(failed.into_iter().chain(queued).collect())
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<ScheduledJob> {
        Ok(ScheduledJob {
            id: text_col(row, 0)?,
            name: row.get(1)?,
            fires_at: instant_col(row, 2)?,
            kind: text_col(row, 3)?,
            payload: json_col(row, 4)?,
            status: text_col(row, 5)?,
            last_error: row.get(6)?,
            created_at: instant_col(row, 7)?,
        })
    }
}
