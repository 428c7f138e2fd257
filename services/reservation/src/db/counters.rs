//! Counter store: the singleton row of next-slot cursors.
//!
//! The `FOR UPDATE` lock on this row is the serialization point for every
//! booking and cancellation transaction. Cursors only ever advance; a freed
//! confirmed seat is refilled by promotion, never by cursor reuse.

use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};

/// The three next-slot cursors.
#[derive(Debug, Clone, Copy)]
pub struct Counters {
    pub confirmed_next_seat: i32,
    pub rac_next_position: i32,
    pub wait_next_position: i32,
}

impl<'r> sqlx::FromRow<'r, PgRow> for Counters {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            confirmed_next_seat: row.try_get("confirmed_next_seat")?,
            rac_next_position: row.try_get("rac_next_position")?,
            wait_next_position: row.try_get("wait_next_position")?,
        })
    }
}

/// Lock the counters row for the rest of the transaction.
///
/// Every writer takes this lock before reading tier occupancy, which
/// serializes tier assignment and the promotion cascades.
pub async fn lock(conn: &mut PgConnection) -> Result<Counters, sqlx::Error> {
    sqlx::query_as::<_, Counters>(
        "SELECT confirmed_next_seat, rac_next_position, wait_next_position
         FROM counters WHERE id = 1
         FOR UPDATE",
    )
    .fetch_one(conn)
    .await
}

pub async fn advance_confirmed(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE counters SET confirmed_next_seat = confirmed_next_seat + 1 WHERE id = 1")
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn advance_rac(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE counters SET rac_next_position = rac_next_position + 1 WHERE id = 1")
        .execute(conn)
        .await?;
    Ok(())
}

pub async fn advance_waiting(conn: &mut PgConnection) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE counters SET wait_next_position = wait_next_position + 1 WHERE id = 1")
        .execute(conn)
        .await?;
    Ok(())
}

/// Whether the singleton row has been seeded.
pub async fn is_seeded(pool: &PgPool) -> Result<bool, sqlx::Error> {
    sqlx::query_scalar("SELECT EXISTS(SELECT 1 FROM counters WHERE id = 1)")
        .fetch_one(pool)
        .await
}
