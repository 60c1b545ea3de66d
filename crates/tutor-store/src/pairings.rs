//! Pairing repository

use rusqlite::{Connection, OptionalExtension, Row, params};
use tracing::debug;
use tutor_api::Pairing;
use tutor_util::PairingId;

use crate::StoreResult;
use crate::sqlite::{instant_col, instant_text, text_col};

pub struct PairingRepo;

impl PairingRepo {
    pub fn insert(conn: &Connection, pairing: &Pairing) -> StoreResult<()> {
        conn.execute(
            "INSERT INTO pairings (id, user_id, teacher_id, will_continue, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                pairing.id.to_string(),
                pairing.user_id.as_str(),
                pairing.teacher_id.as_str(),
                pairing.will_continue,
                instant_text(&pairing.created_at),
            ],
        )?;
        debug!(pairing_id = %pairing.id, "Pairing inserted");
        Ok(())
    }

    pub fn get(conn: &Connection, id: &PairingId) -> StoreResult<Option<Pairing>> {
        let pairing = conn
            .query_row(
                "SELECT id, user_id, teacher_id, will_continue, created_at
                 FROM pairings WHERE id = ?1",
                [id.to_string()],
                Self::map_row,
            )
            .optional()?;
        Ok(pairing)
    }

    pub fn set_will_continue(
        conn: &Connection,
        id: &PairingId,
        will_continue: bool,
    ) -> StoreResult<()> {
        conn.execute(
            "UPDATE pairings SET will_continue = ?1 WHERE id = ?2",
            params![will_continue, id.to_string()],
        )?;
        Ok(())
    }

    /// Map columns `offset..offset+5` of a row
    pub(crate) fn map_at(row: &Row<'_>, offset: usize) -> rusqlite::Result<Pairing> {
        let user_id: String = row.get(offset + 1)?;
        let teacher_id: String = row.get(offset + 2)?;
        Ok(Pairing {
            id: text_col(row, offset)?,
            user_id: user_id.into(),
            teacher_id: teacher_id.into(),
            will_continue: row.get(offset + 3)?,
            created_at: instant_col(row, offset + 4)?,
        })
    }

    fn map_row(row: &Row<'_>) -> rusqlite::Result<Pairing> {
        Self::map_at(row, 0)
    }
}
