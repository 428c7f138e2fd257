//! Booking allocation and cancellation promotion.
//!
//! A booking fills Confirmed first, then RAC, then Waiting, each with a fixed
//! capacity. A cancellation vacating a Confirmed seat promotes the RAC head
//! into it and the Waiting head into RAC; a cancellation vacating a RAC
//! position pulls the Waiting head straight into it. After every commit the
//! active RAC and Waiting positions form a dense 1..N sequence.
//!
//! Both operations run inside a single Postgres transaction that locks the
//! counters row before reading any occupancy count. That lock is the only
//! serialization point; availability and listing reads never take it.

use std::time::Duration;

use sqlx::{PgConnection, PgPool};
use thiserror::Error;
use tracing::info;

use super::counters;
use super::tickets::{self, Placement, Ticket, Tier};

/// Confirmed berth capacity of the coach.
pub const MAX_CONFIRMED: i64 = 63;
/// RAC capacity.
pub const MAX_RAC: i64 = 18;
/// Waiting-list capacity.
pub const MAX_WAIT: i64 = 10;

/// Age below which a passenger travels as a child, without a berth.
pub const CHILD_AGE_LIMIT: i32 = 5;

fn is_child(age: i32) -> bool {
    age < CHILD_AGE_LIMIT
}

/// Errors surfaced by booking and cancellation.
#[derive(Debug, Error)]
pub enum BookingError {
    /// All three tiers are full; nothing was booked.
    #[error("no berths available in any tier")]
    CapacityExceeded,

    /// The ticket does not exist or is already canceled.
    #[error("ticket {0} not found or already canceled")]
    NotFound(i64),

    /// The serializing lock or the transaction could not complete. The
    /// operation rolled back cleanly and the caller may retry.
    #[error("storage contention: {0}")]
    Transient(#[source] sqlx::Error),

    /// Any other storage failure.
    #[error("storage failure: {0}")]
    Storage(#[source] sqlx::Error),
}

impl BookingError {
    pub fn retryable(&self) -> bool {
        matches!(self, Self::Transient(_))
    }

    fn from_sqlx(err: sqlx::Error) -> Self {
        // lock_not_available (55P03) is raised when SET LOCAL lock_timeout
        // expires; serialization_failure (40001) and deadlock_detected
        // (40P01) are the other retryable outcomes.
        if let sqlx::Error::Database(db) = &err {
            if matches!(db.code().as_deref(), Some("55P03" | "40001" | "40P01")) {
                return Self::Transient(err);
            }
        }
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) => Self::Transient(err),
            err => Self::Storage(err),
        }
    }
}

/// A new passenger to book.
#[derive(Debug, Clone)]
pub struct NewPassenger {
    pub name: String,
    pub age: i32,
    pub gender: String,
}

/// What a cancellation did, for the caller's acknowledgement.
#[derive(Debug, Clone, Copy)]
pub struct CancelOutcome {
    pub ticket_id: i64,
    /// RAC ticket that moved into the vacated confirmed seat.
    pub promoted_to_confirmed: Option<i64>,
    /// Waiting ticket that moved into a RAC position.
    pub promoted_to_rac: Option<i64>,
}

/// Per-tier used/free counts.
#[derive(Debug, Clone, Copy)]
pub struct TierAvailability {
    pub used: i64,
    pub free: i64,
}

#[derive(Debug, Clone, Copy)]
pub struct Availability {
    pub confirmed: TierAvailability,
    pub rac: TierAvailability,
    pub waiting: TierAvailability,
}

/// Reservation operations over the ticket ledger and counter store.
#[derive(Clone)]
pub struct Reservations {
    pool: PgPool,
    lock_timeout: Duration,
}

impl Reservations {
    pub fn new(pool: PgPool, lock_timeout: Duration) -> Self {
        Self { pool, lock_timeout }
    }

    /// Book a ticket for `passenger`.
    ///
    /// Adults take the first tier with room, in order: Confirmed (seat from
    /// the cursor), RAC (queue tail), Waiting (queue tail). Exactly one
    /// ticket row is inserted and exactly one cursor advanced; when every
    /// tier is full nothing is written at all.
    pub async fn book(&self, passenger: NewPassenger) -> Result<Ticket, BookingError> {
        let mut tx = self.pool.begin().await.map_err(BookingError::from_sqlx)?;

        let passenger_id = insert_passenger(&mut tx, &passenger)
            .await
            .map_err(BookingError::from_sqlx)?;

        // Children under five share an adult's berth: record the ticket
        // without touching the counters or any tier count.
        if is_child(passenger.age) {
            let ticket = tickets::insert(&mut tx, passenger_id, Placement::Child)
                .await
                .map_err(BookingError::from_sqlx)?;
            tx.commit().await.map_err(BookingError::from_sqlx)?;
            info!(ticket_id = ticket.ticket_id, "booked child ticket");
            return Ok(ticket);
        }

        set_lock_timeout(&mut tx, self.lock_timeout)
            .await
            .map_err(BookingError::from_sqlx)?;
        let counters = counters::lock(&mut tx)
            .await
            .map_err(BookingError::from_sqlx)?;

        let confirmed_ct = tickets::count_active(&mut tx, Tier::Confirmed)
            .await
            .map_err(BookingError::from_sqlx)?;

        let placement = if confirmed_ct < MAX_CONFIRMED {
            counters::advance_confirmed(&mut tx)
                .await
                .map_err(BookingError::from_sqlx)?;
            Placement::Confirmed {
                seat: counters.confirmed_next_seat,
            }
        } else {
            let rac_ct = tickets::count_active(&mut tx, Tier::Rac)
                .await
                .map_err(BookingError::from_sqlx)?;
            if rac_ct < MAX_RAC {
                counters::advance_rac(&mut tx)
                    .await
                    .map_err(BookingError::from_sqlx)?;
                // Dense numbering keeps the tail at active count + 1.
                Placement::Rac {
                    position: rac_ct as i32 + 1,
                }
            } else {
                let wait_ct = tickets::count_active(&mut tx, Tier::Waiting)
                    .await
                    .map_err(BookingError::from_sqlx)?;
                if wait_ct < MAX_WAIT {
                    counters::advance_waiting(&mut tx)
                        .await
                        .map_err(BookingError::from_sqlx)?;
                    Placement::Waiting {
                        position: wait_ct as i32 + 1,
                    }
                } else {
                    // Dropping the transaction rolls back the passenger row.
                    return Err(BookingError::CapacityExceeded);
                }
            }
        };

        let ticket = tickets::insert(&mut tx, passenger_id, placement)
            .await
            .map_err(BookingError::from_sqlx)?;
        tx.commit().await.map_err(BookingError::from_sqlx)?;

        info!(
            ticket_id = ticket.ticket_id,
            tier = placement.tier().as_str(),
            "booked ticket"
        );
        Ok(ticket)
    }

    /// Cancel a ticket and run the promotion cascades.
    ///
    /// Vacating a Confirmed seat promotes the RAC head into it and then the
    /// Waiting head to the RAC tail; vacating a RAC position pulls the
    /// Waiting head straight into that position. Queues are renumbered so
    /// active positions stay dense. Everything commits atomically; a failed
    /// step leaves the ticket active.
    pub async fn cancel(&self, ticket_id: i64) -> Result<CancelOutcome, BookingError> {
        let mut tx = self.pool.begin().await.map_err(BookingError::from_sqlx)?;

        set_lock_timeout(&mut tx, self.lock_timeout)
            .await
            .map_err(BookingError::from_sqlx)?;
        // Serialize with bookings and other cancellations; the cursor values
        // themselves are not needed here.
        counters::lock(&mut tx)
            .await
            .map_err(BookingError::from_sqlx)?;

        let ticket = tickets::find(&mut tx, ticket_id)
            .await
            .map_err(BookingError::from_sqlx)?
            .filter(|t| t.canceled_at.is_none())
            .ok_or(BookingError::NotFound(ticket_id))?;

        tickets::mark_canceled(&mut tx, ticket_id)
            .await
            .map_err(BookingError::from_sqlx)?;

        let mut outcome = CancelOutcome {
            ticket_id,
            promoted_to_confirmed: None,
            promoted_to_rac: None,
        };

        match ticket.placement {
            Placement::Confirmed { seat } => {
                // A Confirmed vacancy is only backfilled through the RAC
                // queue; with no RAC ticket, Waiting stays where it is.
                if let Some(rac) = tickets::rac_head(&mut tx)
                    .await
                    .map_err(BookingError::from_sqlx)?
                {
                    tickets::promote_rac_to_confirmed(&mut tx, rac.ticket_id, seat)
                        .await
                        .map_err(BookingError::from_sqlx)?;
                    tickets::shift_rac_down_above(&mut tx, rac.position)
                        .await
                        .map_err(BookingError::from_sqlx)?;
                    outcome.promoted_to_confirmed = Some(rac.ticket_id);

                    if let Some(wait) = tickets::waiting_head(&mut tx)
                        .await
                        .map_err(BookingError::from_sqlx)?
                    {
                        // Waiting is only non-empty while RAC is full, so
                        // the slot the shift just freed is the tail.
                        tickets::promote_waiting_to_rac(&mut tx, wait.ticket_id, MAX_RAC as i32)
                            .await
                            .map_err(BookingError::from_sqlx)?;
                        tickets::shift_waiting_down_above(&mut tx, wait.position)
                            .await
                            .map_err(BookingError::from_sqlx)?;
                        outcome.promoted_to_rac = Some(wait.ticket_id);
                    }
                }
            }
            Placement::Rac { position } => {
                if let Some(wait) = tickets::waiting_head(&mut tx)
                    .await
                    .map_err(BookingError::from_sqlx)?
                {
                    // The vacated position is refilled in place, so the RAC
                    // queue stays dense without shifting.
                    tickets::promote_waiting_to_rac(&mut tx, wait.ticket_id, position)
                        .await
                        .map_err(BookingError::from_sqlx)?;
                    tickets::shift_waiting_down_above(&mut tx, wait.position)
                        .await
                        .map_err(BookingError::from_sqlx)?;
                    outcome.promoted_to_rac = Some(wait.ticket_id);
                } else {
                    tickets::shift_rac_down_above(&mut tx, position)
                        .await
                        .map_err(BookingError::from_sqlx)?;
                }
            }
            Placement::Waiting { position } => {
                tickets::shift_waiting_down_above(&mut tx, position)
                    .await
                    .map_err(BookingError::from_sqlx)?;
            }
            Placement::Child => {}
        }

        tx.commit().await.map_err(BookingError::from_sqlx)?;

        info!(
            ticket_id,
            promoted_to_confirmed = ?outcome.promoted_to_confirmed,
            promoted_to_rac = ?outcome.promoted_to_rac,
            "canceled ticket"
        );
        Ok(outcome)
    }

    /// All active tickets, in booking order.
    pub async fn list_booked(&self) -> Result<Vec<Ticket>, BookingError> {
        tickets::list_active(&self.pool)
            .await
            .map_err(BookingError::from_sqlx)
    }

    /// Per-tier used/free counts.
    ///
    /// Lock-free point-in-time read; may be slightly stale under concurrent
    /// writers.
    pub async fn availability(&self) -> Result<Availability, BookingError> {
        let rows: Vec<(String, i64)> = sqlx::query_as(
            "SELECT tier, COUNT(*)::BIGINT FROM tickets
             WHERE canceled_at IS NULL AND tier IN ('confirmed', 'rac', 'waiting')
             GROUP BY tier",
        )
        .fetch_all(&self.pool)
        .await
        .map_err(BookingError::from_sqlx)?;

        let used = |name: &str| {
            rows.iter()
                .find(|(tier, _)| tier == name)
                .map_or(0, |(_, count)| *count)
        };

        let confirmed = used("confirmed");
        let rac = used("rac");
        let waiting = used("waiting");

        Ok(Availability {
            confirmed: TierAvailability {
                used: confirmed,
                free: MAX_CONFIRMED - confirmed,
            },
            rac: TierAvailability {
                used: rac,
                free: MAX_RAC - rac,
            },
            waiting: TierAvailability {
                used: waiting,
                free: MAX_WAIT - waiting,
            },
        })
    }
}

async fn insert_passenger(
    conn: &mut PgConnection,
    passenger: &NewPassenger,
) -> Result<i64, sqlx::Error> {
    sqlx::query_scalar(
        "INSERT INTO passengers (name, age, gender) VALUES ($1, $2, $3) RETURNING passenger_id",
    )
    .bind(&passenger.name)
    .bind(passenger.age)
    .bind(&passenger.gender)
    .fetch_one(conn)
    .await
}

/// Bound the wait for the counters lock so a contended caller gets a
/// retryable failure instead of queueing indefinitely.
async fn set_lock_timeout(conn: &mut PgConnection, timeout: Duration) -> Result<(), sqlx::Error> {
    // SET LOCAL does not accept bind parameters.
    let millis = timeout.as_millis().max(1);
    sqlx::query(&format!("SET LOCAL lock_timeout = '{millis}ms'"))
        .execute(conn)
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case(0, true)]
    #[case(4, true)]
    #[case(5, false)]
    #[case(90, false)]
    fn child_age_boundary(#[case] age: i32, #[case] expected: bool) {
        assert_eq!(is_child(age), expected);
    }

    #[test]
    fn capacities_match_the_coach() {
        assert_eq!(MAX_CONFIRMED + MAX_RAC + MAX_WAIT, 91);
    }

    #[test]
    fn pool_timeout_is_transient() {
        let err = BookingError::from_sqlx(sqlx::Error::PoolTimedOut);
        assert!(err.retryable());
        assert!(matches!(err, BookingError::Transient(_)));
    }

    #[test]
    fn row_not_found_is_not_retryable() {
        let err = BookingError::from_sqlx(sqlx::Error::RowNotFound);
        assert!(!err.retryable());
        assert!(matches!(err, BookingError::Storage(_)));
    }
}
