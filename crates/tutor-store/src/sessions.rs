//! Session repository
//!
//! Sessions are never deleted. Reads that need authorization data use
//! [`SessionRepo::get_detail`], which joins the pairing in one query.

use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;
use tutor_api::{Session, SessionDetail, SessionStatus};
use tutor_util::{PairingId, SessionId, TeacherId};

use crate::pairings::PairingRepo;
use crate::sqlite::{instant_col, instant_text, text_col};
use crate::{StoreError, StoreResult};

const SESSION_COLUMNS: &str = "s.id, s.pairing_id, s.scheduled_at, s.duration_minutes, \
     s.status, s.kind, s.teacher_attended, s.student_attended, s.meeting_link, \
     s.reschedule_request_count, s.created_at, s.updated_at";

const PAIRING_COLUMNS: &str = "p.id, p.user_id, p.teacher_id, p.will_continue, p.created_at";

pub struct SessionRepo;

impl SessionRepo {
    pub fn insert(conn: &Connection, session: &Session) -> StoreResult<()> {
        conn.execute(
            "INSERT INTO sessions (
                id, pairing_id, scheduled_at, duration_minutes, status, kind,
                teacher_attended, student_attended, meeting_link,
                reschedule_request_count, created_at, updated_at
             ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                session.id.to_string(),
                session.pairing_id.to_string(),
                instant_text(&session.scheduled_at),
                session.duration_minutes,
                session.status.as_str(),
                session.kind.as_str(),
                session.teacher_attended,
                session.student_attended,
                session.meeting_link,
                session.reschedule_request_count,
                instant_text(&session.created_at),
                instant_text(&session.updated_at),
            ],
        )?;
        debug!(session_id = %session.id, scheduled_at = %session.scheduled_at, "Session inserted");
        Ok(())
    }

    /// Write every mutable column of `session`
    pub fn update(conn: &Connection, session: &Session) -> StoreResult<()> {
        let changed = conn.execute(
            "UPDATE sessions SET
                scheduled_at = ?2,
                duration_minutes = ?3,
                status = ?4,
                teacher_attended = ?5,
                student_attended = ?6,
                meeting_link = ?7,
                reschedule_request_count = ?8,
                updated_at = ?9
             WHERE id = ?1",
            params![
                session.id.to_string(),
                instant_text(&session.scheduled_at),
                session.duration_minutes,
                session.status.as_str(),
                session.teacher_attended,
                session.student_attended,
                session.meeting_link,
                session.reschedule_request_count,
                instant_text(&session.updated_at),
            ],
        )?;

        if changed == 0 {
            return Err(StoreError::NotFound(format!("session {}", session.id)));
        }
        debug!(session_id = %session.id, status = %session.status, "Session updated");
        Ok(())
    }

    pub fn get(conn: &Connection, id: &SessionId) -> StoreResult<Option<Session>> {
        let session = conn
            .query_row(
                &format!("SELECT {SESSION_COLUMNS} FROM sessions s WHERE s.id = ?1"),
                [id.to_string()],
                |row| Self::map_at(row, 0),
            )
            .optional()?;
        Ok(session)
    }

    /// Session joined with its pairing
    pub fn get_detail(conn: &Connection, id: &SessionId) -> StoreResult<Option<SessionDetail>> {
        let detail = conn
            .query_row(
                &format!(
                    "SELECT {SESSION_COLUMNS}, {PAIRING_COLUMNS}
                     FROM sessions s JOIN pairings p ON p.id = s.pairing_id
                     WHERE s.id = ?1"
                ),
                [id.to_string()],
                |row| {
                    Ok(SessionDetail {
                        session: Self::map_at(row, 0)?,
                        pairing: PairingRepo::map_at(row, 12)?,
                    })
                },
            )
            .optional()?;
        Ok(detail)
    }

    /// Every session taught by `teacher_id`, ordered by start
    pub fn list_for_teacher(conn: &Connection, teacher_id: &TeacherId) -> StoreResult<Vec<Session>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS}
             FROM sessions s JOIN pairings p ON p.id = s.pairing_id
             WHERE p.teacher_id = ?1
             ORDER BY s.scheduled_at"
        ))?;
        let rows = stmt.query_map([teacher_id.as_str()], |row| Self::map_at(row, 0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    pub fn list_for_pairing(conn: &Connection, pairing_id: &PairingId) -> StoreResult<Vec<Session>> {
        let mut stmt = conn.prepare(&format!(
            "SELECT {SESSION_COLUMNS} FROM sessions s
             WHERE s.pairing_id = ?1
             ORDER BY s.scheduled_at"
        ))?;
        let rows = stmt.query_map([pairing_id.to_string()], |row| Self::map_at(row, 0))?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    /// The teacher's ONGOING session other than `except`, if any
    pub fn find_ongoing_for_teacher(
        conn: &Connection,
        teacher_id: &TeacherId,
        except: &SessionId,
    ) -> StoreResult<Option<SessionId>> {
        let id = conn
            .query_row(
                "SELECT s.id FROM sessions s JOIN pairings p ON p.id = s.pairing_id
                 WHERE p.teacher_id = ?1 AND s.status = ?2 AND s.id != ?3
                 LIMIT 1",
                params![
                    teacher_id.as_str(),
                    SessionStatus::Ongoing.as_str(),
                    except.to_string()
                ],
                |row| text_col(row, 0),
            )
            .optional()?;
        Ok(id)
    }

    fn map_at(row: &Row<'_>, offset: usize) -> rusqlite::Result<Session> {
        Ok(Session {
            id: text_col(row, offset)?,
            pairing_id: text_col(row, offset + 1)?,
            scheduled_at: instant_col(row, offset + 2)?,
            duration_minutes: row.get(offset + 3)?,
            status: text_col(row, offset + 4)?,
            kind: text_col(row, offset + 5)?,
            teacher_attended: row.get(offset + 6)?,
            student_attended: row.get(offset + 7)?,
            meeting_link: row.get(offset + 8)?,
            reschedule_request_count: row.get(offset + 9)?,
            created_at: instant_col(row, offset + 10)?,
            updated_at: instant_col(row, offset + 11)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::SqliteStore;
    use chrono::{Duration, TimeZone, Utc};
    use tutor_api::{Pairing, SessionKind};
    use tutor_util::UserId;

    fn pairing(teacher: &str) -> Pairing {
        Pairing {
            id: PairingId::new(),
            user_id: UserId::new("u1"),
            teacher_id: TeacherId::new(teacher),
            will_continue: None,
            created_at: Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap(),
        }
    }

    #[test]
    fn session_round_trips_with_detail() {
        let store = SqliteStore::in_memory().unwrap();
        let conn = store.conn().unwrap();
        let pairing = pairing("t1");
        PairingRepo::insert(&conn, &pairing).unwrap();

        let at = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        let mut session = Session::new(pairing.id.clone(), at, 60, SessionKind::Paid, at);
        SessionRepo::insert(&conn, &session).unwrap();

        let detail = SessionRepo::get_detail(&conn, &session.id).unwrap().unwrap();
        assert_eq!(detail.session, session);
        assert_eq!(detail.pairing, pairing);

        session.status = SessionStatus::Ongoing;
        session.teacher_attended = true;
        session.meeting_link = Some("https://meet.example/abc".into());
        session.updated_at = at + Duration::minutes(1);
        SessionRepo::update(&conn, &session).unwrap();

        let loaded = SessionRepo::get(&conn, &session.id).unwrap().unwrap();
        assert_eq!(loaded, session);
    }

    #[test]
    fn update_unknown_session_is_not_found() {
        let store = SqliteStore::in_memory().unwrap();
        let conn = store.conn().unwrap();
        let session = Session::new(PairingId::new(), Utc::now(), 60, SessionKind::Free, Utc::now());
        assert!(matches!(
            SessionRepo::update(&conn, &session),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn teacher_listing_and_ongoing_lookup() {
        let store = SqliteStore::in_memory().unwrap();
        let conn = store.conn().unwrap();
        let p1 = pairing("t1");
        let p2 = pairing("t2");
        PairingRepo::insert(&conn, &p1).unwrap();
        PairingRepo::insert(&conn, &p2).unwrap();

        let at = Utc.with_ymd_and_hms(2026, 3, 2, 10, 0, 0).unwrap();
        let later = Session::new(p1.id.clone(), at + Duration::days(1), 60, SessionKind::Free, at);
        let mut first = Session::new(p1.id.clone(), at, 60, SessionKind::Free, at);
        let other = Session::new(p2.id.clone(), at, 60, SessionKind::Free, at);
        SessionRepo::insert(&conn, &later).unwrap();
        SessionRepo::insert(&conn, &first).unwrap();
        SessionRepo::insert(&conn, &other).unwrap();

        let sessions = SessionRepo::list_for_teacher(&conn, &TeacherId::new("t1")).unwrap();
        let ids: Vec<_> = sessions.iter().map(|s| s.id.clone()).collect();
        assert_eq!(ids, vec![first.id.clone(), later.id.clone()]);

        let t1 = TeacherId::new("t1");
        assert!(SessionRepo::find_ongoing_for_teacher(&conn, &t1, &later.id).unwrap().is_none());

        first.status = SessionStatus::Ongoing;
        SessionRepo::update(&conn, &first).unwrap();
        assert_eq!(
            SessionRepo::find_ongoing_for_teacher(&conn, &t1, &later.id).unwrap(),
            Some(first.id.clone())
        );
        assert!(SessionRepo::find_ongoing_for_teacher(&conn, &t1, &first.id).unwrap().is_none());
        assert_eq!(SessionRepo::list_for_pairing(&conn, &p2.id).unwrap().len(), 1);
    }
}
