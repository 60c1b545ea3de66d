//! Prepaid session balances

use rusqlite::{Connection, OptionalExtension, params};
use tracing::debug;
use tutor_util::UserId;

use crate::StoreResult;

pub struct BalanceRepo;

impl BalanceRepo {
    /// Remaining paid sessions; `None` if billing never set a balance.
    pub fn get(conn: &Connection, user_id: &UserId) -> StoreResult<Option<u32>> {
        let remaining = conn
            .query_row(
                "SELECT remaining_sessions FROM balances WHERE user_id = ?1",
                [user_id.as_str()],
                |row| row.get(0),
            )
            .optional()?;
        Ok(remaining)
    }

    pub fn set(conn: &Connection, user_id: &UserId, remaining: u32) -> StoreResult<()> {
        conn.execute(
            r#"
            INSERT INTO balances (user_id, remaining_sessions)
            VALUES (?1, ?2)
            ON CONFLICT(user_id)
            DO UPDATE SET remaining_sessions = excluded.remaining_sessions
            "#,
            params![user_id.as_str(), remaining],
        )?;
        debug!(user_id = %user_id, remaining, "Balance set");
        Ok(())
    }

    /// Consume one session. Returns false, changing nothing, when the balance
    /// is empty or missing.
    pub fn decrement(conn: &Connection, user_id: &UserId) -> StoreResult<bool> {
        let changed = conn.execute(
            "UPDATE balances SET remaining_sessions = remaining_sessions - 1
             WHERE user_id = ?1 AND remaining_sessions > 0",
            [user_id.as_str()],
        )?;
        Ok(changed > 0)
    }
}
