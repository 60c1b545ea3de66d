//! Reschedule request repository

use chrono::{DateTime, Utc};
use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;
use tutor_api::{RescheduleRequest, RescheduleStatus};
use tutor_util::{RequestId, SessionId};

use crate::sqlite::{instant_col, instant_text, json_col, opt_text_col, text_col};
use crate::{StoreError, StoreResult};

const COLUMNS: &str = "id, session_id, requested_by, old_date, candidate_dates_json, status, \
     resulting_date, created_at, responded_at";

pub struct RescheduleRepo;

impl RescheduleRepo {
    pub fn insert(conn: &Connection, request: &RescheduleRequest) -> StoreResult<()> {
        let candidates = request
            .candidate_dates
            .iter()
            .map(instant_text)
            .collect::<Vec<_>>();

        conn.execute(
            &format!("INSERT INTO reschedule_requests ({COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)"),
            params![
                request.id.to_string(),
                request.session_id.to_string(),
                request.requested_by.as_str(),
                instant_text(&request.old_date),
                serde_json::to_string(&candidates)?,
                request.status.as_str(),
                request.resulting_date.as_ref().map(instant_text),
                instant_text(&request.created_at),
                request.responded_at.as_ref().map(instant_text),
            ],
        )?;
        debug!(request_id = %request.id, session_id = %request.session_id, "Reschedule request inserted");
        Ok(())
    }

    /// Persist the outcome columns (status, resulting date, response time)
    pub fn update_outcome(conn: &Connection, request: &RescheduleRequest) -> StoreResult<()> {
        let changed = conn.execute(
            "UPDATE reschedule_requests
             SET status = ?2, resulting_date = ?3, responded_at = ?4
             WHERE id = ?1",
            params![
                request.id.to_string(),
                request.status.as_str(),
                request.resulting_date.as_ref().map(instant_text),
                request.responded_at.as_ref().map(instant_text),
            ],
        )?;
        if changed == 0 {
            return Err(StoreError::NotFound(format!("reschedule request {}", request.id)));
        }
        Ok(())
    }

    pub fn delete(conn: &Connection, id: &RequestId) -> StoreResult<bool> {
        let changed = conn.execute(
            "DELETE FROM reschedule_requests WHERE id = ?1",
            [id.to_string()],
        )?;
        Ok(changed > 0)
    }

    pub fn get(conn: &Connection, id: &RequestId) -> StoreResult<Option<RescheduleRequest>> {
        let request = conn
            .query_row(
                &format!("SELECT {COLUMNS} FROM reschedule_requests WHERE id = ?1"),
                [id.to_string()],
                Self::map_row,
            )
            .optional()?;
        Ok(request)
    }

    pub fn find_pending_for_session(
        conn: &Connection,
        session_id: &SessionId,
    ) -> StoreResult<Option<RescheduleRequest>> {
        let request = conn
            .query_row(
                &format!(
                    "SELECT {COLUMNS} FROM reschedule_requests
                     WHERE session_id = ?1 AND status = ?2"
                ),
                params![session_id.to_string(), RescheduleStatus::Pending.as_str()],
                Self::map_row,
            )
            .optional()?;
        Ok(request)
    }

    pub fn list_for_session(
        conn: &Connection,
        session_id: &SessionId,
    ) -> StoreResult<Vec<RescheduleRequest>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {COLUMNS} FROM reschedule_requests
             WHERE session_id = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map([session_id.to_string()], Self::map_row)?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<RescheduleRequest> {
        let candidates: Vec<String> = json_col(row, 4)?;
        let candidate_dates = candidates
            .iter()
            .map(|c| {
                c.parse::<DateTime<Utc>>().map_err(|e| {
                    rusqlite::Error::FromSqlConversionFailure(
                        4,
                        rusqlite::types::Type::Text,
                        Box::new(e),
                    )
                })
            })
            .collect::<rusqlite::Result<Vec<_>>>()?;

        Ok(RescheduleRequest {
            id: text_col(row, 0)?,
            session_id: text_col(row, 1)?,
            requested_by: text_col(row, 2)?,
            old_date: instant_col(row, 3)?,
            candidate_dates,
            status: text_col(row, 5)?,
            resulting_date: opt_text_col(row, 6)?,
            created_at: instant_col(row, 7)?,
            responded_at: opt_text_col(row, 8)?,
        })
    }
}
