//! Ticket ledger model and queries.
//!
//! Tickets live in the `tickets` table as a text tier plus three nullable
//! slot columns. The core surfaces them as a [`Placement`] tagged variant so
//! a tier with a missing or mismatched slot is unrepresentable; decoding a
//! row enforces that exactly one slot column matches the stored tier.

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgConnection, PgPool, Row};
use thiserror::Error;

/// Ticket tier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Confirmed,
    Rac,
    Waiting,
    Child,
}

impl Tier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Rac => "rac",
            Self::Waiting => "waiting",
            Self::Child => "child",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "confirmed" => Some(Self::Confirmed),
            "rac" => Some(Self::Rac),
            "waiting" => Some(Self::Waiting),
            "child" => Some(Self::Child),
            _ => None,
        }
    }
}

/// A storage row whose tier and slot columns disagree.
#[derive(Debug, Error)]
#[error("tier '{tier}' does not match its slot columns")]
pub struct PlacementError {
    tier: String,
}

/// A tier together with its slot, as one tagged value.
///
/// Confirmed tickets hold a seat number; RAC and Waiting tickets hold a queue
/// position; children hold no slot at all.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Confirmed { seat: i32 },
    Rac { position: i32 },
    Waiting { position: i32 },
    Child,
}

impl Placement {
    pub fn tier(&self) -> Tier {
        match self {
            Self::Confirmed { .. } => Tier::Confirmed,
            Self::Rac { .. } => Tier::Rac,
            Self::Waiting { .. } => Tier::Waiting,
            Self::Child => Tier::Child,
        }
    }

    pub fn seat_no(&self) -> Option<i32> {
        match self {
            Self::Confirmed { seat } => Some(*seat),
            _ => None,
        }
    }

    pub fn rac_position(&self) -> Option<i32> {
        match self {
            Self::Rac { position } => Some(*position),
            _ => None,
        }
    }

    pub fn wait_position(&self) -> Option<i32> {
        match self {
            Self::Waiting { position } => Some(*position),
            _ => None,
        }
    }

    /// Rebuild the tagged value from the storage columns.
    ///
    /// Exactly one slot column must be set and it must be the one the tier
    /// owns; anything else is a corrupt row.
    pub fn from_columns(
        tier: &str,
        seat_no: Option<i32>,
        rac_position: Option<i32>,
        wait_position: Option<i32>,
    ) -> Result<Self, PlacementError> {
        match (Tier::parse(tier), seat_no, rac_position, wait_position) {
            (Some(Tier::Confirmed), Some(seat), None, None) => Ok(Self::Confirmed { seat }),
            (Some(Tier::Rac), None, Some(position), None) => Ok(Self::Rac { position }),
            (Some(Tier::Waiting), None, None, Some(position)) => Ok(Self::Waiting { position }),
            (Some(Tier::Child), None, None, None) => Ok(Self::Child),
            _ => Err(PlacementError {
                tier: tier.to_string(),
            }),
        }
    }
}

/// A ticket from the ledger.
#[derive(Debug, Clone)]
pub struct Ticket {
    pub ticket_id: i64,
    pub passenger_id: i64,
    pub placement: Placement,
    pub booked_at: DateTime<Utc>,
    pub canceled_at: Option<DateTime<Utc>>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for Ticket {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        let tier: String = row.try_get("tier")?;
        let placement = Placement::from_columns(
            &tier,
            row.try_get("seat_no")?,
            row.try_get("rac_position")?,
            row.try_get("wait_position")?,
        )
        .map_err(|e| sqlx::Error::ColumnDecode {
            index: "tier".to_string(),
            source: Box::new(e),
        })?;

        Ok(Self {
            ticket_id: row.try_get("ticket_id")?,
            passenger_id: row.try_get("passenger_id")?,
            placement,
            booked_at: row.try_get("booked_at")?,
            canceled_at: row.try_get("canceled_at")?,
        })
    }
}

/// Ticket id and queue position of a RAC or Waiting queue head.
#[derive(Debug, Clone, Copy)]
pub struct QueueHead {
    pub ticket_id: i64,
    pub position: i32,
}

impl<'r> sqlx::FromRow<'r, PgRow> for QueueHead {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(Self {
            ticket_id: row.try_get("ticket_id")?,
            position: row.try_get("position")?,
        })
    }
}

const TICKET_COLUMNS: &str =
    "ticket_id, passenger_id, tier, seat_no, rac_position, wait_position, booked_at, canceled_at";

/// Count active tickets in a tier.
pub async fn count_active(conn: &mut PgConnection, tier: Tier) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "SELECT COUNT(*)::BIGINT FROM tickets WHERE tier = $1 AND canceled_at IS NULL",
    )
    .bind(tier.as_str())
    .fetch_one(conn)
    .await
}

/// Insert a new ticket with the given placement.
pub async fn insert(
    conn: &mut PgConnection,
    passenger_id: i64,
    placement: Placement,
) -> Result<Ticket, sqlx::Error> {
    sqlx::query_as::<_, Ticket>(&format!(
        "INSERT INTO tickets (passenger_id, tier, seat_no, rac_position, wait_position)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING {TICKET_COLUMNS}"
    ))
    .bind(passenger_id)
    .bind(placement.tier().as_str())
    .bind(placement.seat_no())
    .bind(placement.rac_position())
    .bind(placement.wait_position())
    .fetch_one(conn)
    .await
}

/// Fetch a ticket by id, canceled or not.
pub async fn find(conn: &mut PgConnection, ticket_id: i64) -> Result<Option<Ticket>, sqlx::Error> {
    sqlx::query_as::<_, Ticket>(&format!(
        "SELECT {TICKET_COLUMNS} FROM tickets WHERE ticket_id = $1"
    ))
    .bind(ticket_id)
    .fetch_optional(conn)
    .await
}

/// All active tickets, in booking order.
pub async fn list_active(pool: &PgPool) -> Result<Vec<Ticket>, sqlx::Error> {
    sqlx::query_as::<_, Ticket>(&format!(
        "SELECT {TICKET_COLUMNS} FROM tickets WHERE canceled_at IS NULL ORDER BY ticket_id"
    ))
    .fetch_all(pool)
    .await
}

/// Head of the RAC queue: the active RAC ticket with the smallest position.
pub async fn rac_head(conn: &mut PgConnection) -> Result<Option<QueueHead>, sqlx::Error> {
    sqlx::query_as::<_, QueueHead>(
        "SELECT ticket_id, rac_position AS position FROM tickets
         WHERE tier = 'rac' AND canceled_at IS NULL
         ORDER BY rac_position
         LIMIT 1",
    )
    .fetch_optional(conn)
    .await
}

/// Head of the Waiting queue: the active Waiting ticket with the smallest position.
pub async fn waiting_head(conn: &mut PgConnection) -> Result<Option<QueueHead>, sqlx::Error> {
    sqlx::query_as::<_, QueueHead>(
        "SELECT ticket_id, wait_position AS position FROM tickets
         WHERE tier = 'waiting' AND canceled_at IS NULL
         ORDER BY wait_position
         LIMIT 1",
    )
    .fetch_optional(conn)
    .await
}

/// Mark a ticket canceled. The tier and slot columns are left as booked;
/// they become historical once `canceled_at` is set.
pub async fn mark_canceled(conn: &mut PgConnection, ticket_id: i64) -> Result<(), sqlx::Error> {
    sqlx::query("UPDATE tickets SET canceled_at = now() WHERE ticket_id = $1")
        .bind(ticket_id)
        .execute(conn)
        .await?;
    Ok(())
}

/// Move a RAC ticket into a vacated confirmed seat.
pub async fn promote_rac_to_confirmed(
    conn: &mut PgConnection,
    ticket_id: i64,
    seat: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE tickets SET tier = 'confirmed', seat_no = $2, rac_position = NULL
         WHERE ticket_id = $1",
    )
    .bind(ticket_id)
    .bind(seat)
    .execute(conn)
    .await?;
    Ok(())
}

/// Move a Waiting ticket into a RAC position.
pub async fn promote_waiting_to_rac(
    conn: &mut PgConnection,
    ticket_id: i64,
    position: i32,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE tickets SET tier = 'rac', rac_position = $2, wait_position = NULL
         WHERE ticket_id = $1",
    )
    .bind(ticket_id)
    .bind(position)
    .execute(conn)
    .await?;
    Ok(())
}

/// Close a gap in the RAC queue: shift every active position above `position`
/// down by one.
pub async fn shift_rac_down_above(
    conn: &mut PgConnection,
    position: i32,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE tickets SET rac_position = rac_position - 1
         WHERE tier = 'rac' AND canceled_at IS NULL AND rac_position > $1",
    )
    .bind(position)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

/// Close a gap in the Waiting queue: shift every active position above
/// `position` down by one.
pub async fn shift_waiting_down_above(
    conn: &mut PgConnection,
    position: i32,
) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE tickets SET wait_position = wait_position - 1
         WHERE tier = 'waiting' AND canceled_at IS NULL AND wait_position > $1",
    )
    .bind(position)
    .execute(conn)
    .await?;
    Ok(result.rows_affected())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case("confirmed", Tier::Confirmed)]
    #[case("rac", Tier::Rac)]
    #[case("waiting", Tier::Waiting)]
    #[case("child", Tier::Child)]
    fn tier_round_trips(#[case] s: &str, #[case] tier: Tier) {
        assert_eq!(Tier::parse(s), Some(tier));
        assert_eq!(tier.as_str(), s);
    }

    #[test]
    fn unknown_tier_is_rejected() {
        assert_eq!(Tier::parse("tatkal"), None);
        assert_eq!(Tier::parse(""), None);
    }

    #[rstest]
    #[case("confirmed", Some(12), None, None, Placement::Confirmed { seat: 12 })]
    #[case("rac", None, Some(3), None, Placement::Rac { position: 3 })]
    #[case("waiting", None, None, Some(7), Placement::Waiting { position: 7 })]
    #[case("child", None, None, None, Placement::Child)]
    fn placement_decodes_matching_columns(
        #[case] tier: &str,
        #[case] seat_no: Option<i32>,
        #[case] rac_position: Option<i32>,
        #[case] wait_position: Option<i32>,
        #[case] expected: Placement,
    ) {
        let placement =
            Placement::from_columns(tier, seat_no, rac_position, wait_position).unwrap();
        assert_eq!(placement, expected);
        assert_eq!(placement.tier().as_str(), tier);
    }

    #[rstest]
    #[case("confirmed", None, None, None)]
    #[case("confirmed", Some(1), Some(2), None)]
    #[case("rac", None, None, Some(2))]
    #[case("waiting", None, Some(4), Some(2))]
    #[case("child", Some(9), None, None)]
    #[case("tatkal", Some(1), None, None)]
    fn placement_rejects_mismatched_columns(
        #[case] tier: &str,
        #[case] seat_no: Option<i32>,
        #[case] rac_position: Option<i32>,
        #[case] wait_position: Option<i32>,
    ) {
        assert!(Placement::from_columns(tier, seat_no, rac_position, wait_position).is_err());
    }

    #[test]
    fn placement_exposes_only_its_own_slot() {
        let rac = Placement::Rac { position: 4 };
        assert_eq!(rac.rac_position(), Some(4));
        assert_eq!(rac.seat_no(), None);
        assert_eq!(rac.wait_position(), None);
    }
}
