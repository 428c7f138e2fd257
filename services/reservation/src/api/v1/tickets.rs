//! Ticket API endpoints.
//!
//! Booking, cancellation, listing, and availability. The handlers validate
//! the request shape and map core errors to problem responses; all
//! allocation decisions live in `db::reservations`.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::api::error::ApiError;
use crate::api::request_context::RequestContext;
use crate::db::reservations::{BookingError, NewPassenger};
use crate::db::tickets::Ticket;
use crate::state::AppState;

/// Create ticket routes.
pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/book", post(book_ticket))
        .route("/cancel/{ticket_id}", post(cancel_ticket))
        .route("/booked", get(list_booked))
        .route("/available", get(availability))
}

// =============================================================================
// Request/Response Types
// =============================================================================

/// Request to book a ticket for one passenger.
#[derive(Debug, Deserialize)]
pub struct BookTicketRequest {
    /// Passenger name.
    pub name: String,

    /// Passenger age; under five travels as a child without a berth.
    pub age: i32,

    /// Passenger gender, stored as given.
    pub gender: String,
}

/// A ticket as returned by the API.
#[derive(Debug, Serialize)]
pub struct TicketResponse {
    pub ticket_id: i64,
    pub passenger_id: i64,

    /// Tier: "confirmed", "rac", "waiting", or "child".
    pub tier: String,

    /// Seat number (confirmed tickets only).
    pub seat_no: Option<i32>,

    /// Queue position (RAC tickets only).
    pub rac_position: Option<i32>,

    /// Queue position (waiting tickets only).
    pub wait_position: Option<i32>,

    pub booked_at: DateTime<Utc>,
    pub canceled_at: Option<DateTime<Utc>>,
}

impl From<Ticket> for TicketResponse {
    fn from(ticket: Ticket) -> Self {
        Self {
            ticket_id: ticket.ticket_id,
            passenger_id: ticket.passenger_id,
            tier: ticket.placement.tier().as_str().to_string(),
            seat_no: ticket.placement.seat_no(),
            rac_position: ticket.placement.rac_position(),
            wait_position: ticket.placement.wait_position(),
            booked_at: ticket.booked_at,
            canceled_at: ticket.canceled_at,
        }
    }
}

/// Acknowledgement of a cancellation.
#[derive(Debug, Serialize)]
pub struct CancelResponse {
    pub ticket_id: i64,
    pub message: String,

    /// RAC ticket promoted into the vacated confirmed seat, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promoted_to_confirmed: Option<i64>,

    /// Waiting ticket promoted into a RAC position, if any.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub promoted_to_rac: Option<i64>,
}

/// Response for listing active tickets.
#[derive(Debug, Serialize)]
pub struct ListBookedResponse {
    /// Active tickets in booking order.
    pub items: Vec<TicketResponse>,

    /// Total count.
    pub total: i64,
}

/// Used/free counts for one tier.
#[derive(Debug, Serialize)]
pub struct TierAvailabilityResponse {
    pub used: i64,
    pub free: i64,
}

/// Per-tier availability.
#[derive(Debug, Serialize)]
pub struct AvailabilityResponse {
    pub confirmed: TierAvailabilityResponse,
    pub rac: TierAvailabilityResponse,
    pub waiting: TierAvailabilityResponse,
}

// =============================================================================
// Handlers
// =============================================================================

/// Book a ticket.
///
/// POST /v1/tickets/book
async fn book_ticket(
    State(state): State<AppState>,
    ctx: RequestContext,
    Json(req): Json<BookTicketRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if req.age < 0 {
        return Err(
            ApiError::bad_request("invalid_age", "Passenger age cannot be negative")
                .with_request_id(ctx.request_id),
        );
    }

    let passenger = NewPassenger {
        name: req.name,
        age: req.age,
        gender: req.gender,
    };

    let ticket = state
        .db()
        .reservations()
        .book(passenger)
        .await
        .map_err(|e| booking_error(e, &ctx.request_id))?;

    Ok((StatusCode::CREATED, Json(TicketResponse::from(ticket))))
}

/// Cancel a ticket and run the promotion cascades.
///
/// POST /v1/tickets/cancel/{ticket_id}
async fn cancel_ticket(
    State(state): State<AppState>,
    ctx: RequestContext,
    Path(ticket_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let ticket_id: i64 = ticket_id.parse().map_err(|_| {
        ApiError::bad_request("invalid_ticket_id", "Ticket ID must be an integer")
            .with_request_id(ctx.request_id.clone())
    })?;

    let outcome = state
        .db()
        .reservations()
        .cancel(ticket_id)
        .await
        .map_err(|e| booking_error(e, &ctx.request_id))?;

    Ok(Json(CancelResponse {
        ticket_id: outcome.ticket_id,
        message: "Canceled".to_string(),
        promoted_to_confirmed: outcome.promoted_to_confirmed,
        promoted_to_rac: outcome.promoted_to_rac,
    }))
}

/// List active tickets.
///
/// GET /v1/tickets/booked
async fn list_booked(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let tickets = state
        .db()
        .reservations()
        .list_booked()
        .await
        .map_err(|e| booking_error(e, &ctx.request_id))?;

    let total = tickets.len() as i64;
    let items = tickets.into_iter().map(TicketResponse::from).collect();

    Ok(Json(ListBookedResponse { items, total }))
}

/// Per-tier availability.
///
/// GET /v1/tickets/available
async fn availability(
    State(state): State<AppState>,
    ctx: RequestContext,
) -> Result<impl IntoResponse, ApiError> {
    let availability = state
        .db()
        .reservations()
        .availability()
        .await
        .map_err(|e| booking_error(e, &ctx.request_id))?;

    Ok(Json(AvailabilityResponse {
        confirmed: TierAvailabilityResponse {
            used: availability.confirmed.used,
            free: availability.confirmed.free,
        },
        rac: TierAvailabilityResponse {
            used: availability.rac.used,
            free: availability.rac.free,
        },
        waiting: TierAvailabilityResponse {
            used: availability.waiting.used,
            free: availability.waiting.free,
        },
    }))
}

fn booking_error(err: BookingError, request_id: &str) -> ApiError {
    let api = match &err {
        BookingError::CapacityExceeded => {
            ApiError::conflict("capacity_exceeded", "No berths available in any tier")
        }
        BookingError::NotFound(id) => ApiError::not_found(
            "ticket_not_found",
            format!("Ticket {id} not found or already canceled"),
        ),
        BookingError::Transient(_) => {
            tracing::warn!(error = %err, "reservation storage contention");
            ApiError::service_unavailable(
                "storage_contention",
                "The reservation store is contended; retry shortly",
            )
            .with_retry_after_seconds(1)
        }
        BookingError::Storage(_) => {
            tracing::error!(error = %err, "reservation storage failure");
            ApiError::internal("internal_error", "Reservation storage failure")
        }
    };
    api.with_request_id(request_id.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::tickets::Placement;
    use rstest::rstest;

    fn ticket(placement: Placement) -> Ticket {
        Ticket {
            ticket_id: 7,
            passenger_id: 3,
            placement,
            booked_at: Utc::now(),
            canceled_at: None,
        }
    }

    #[rstest]
    #[case(Placement::Confirmed { seat: 12 }, "confirmed", Some(12), None, None)]
    #[case(Placement::Rac { position: 4 }, "rac", None, Some(4), None)]
    #[case(Placement::Waiting { position: 2 }, "waiting", None, None, Some(2))]
    #[case(Placement::Child, "child", None, None, None)]
    fn ticket_response_carries_slot_for_tier(
        #[case] placement: Placement,
        #[case] tier: &str,
        #[case] seat_no: Option<i32>,
        #[case] rac_position: Option<i32>,
        #[case] wait_position: Option<i32>,
    ) {
        let resp = TicketResponse::from(ticket(placement));
        assert_eq!(resp.tier, tier);
        assert_eq!(resp.seat_no, seat_no);
        assert_eq!(resp.rac_position, rac_position);
        assert_eq!(resp.wait_position, wait_position);
    }

    #[test]
    fn capacity_exceeded_maps_to_conflict() {
        let api = booking_error(BookingError::CapacityExceeded, "req-1");
        assert_eq!(api.status, StatusCode::CONFLICT);
        assert_eq!(api.problem.code, "capacity_exceeded");
        assert_eq!(api.problem.request_id, "req-1");
    }

    #[test]
    fn transient_maps_to_retryable_503() {
        let api = booking_error(
            BookingError::Transient(sqlx::Error::PoolTimedOut),
            "req-2",
        );
        assert_eq!(api.status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(api.problem.retryable);
        assert!(api.problem.retry_after_seconds > 0);
    }
}
