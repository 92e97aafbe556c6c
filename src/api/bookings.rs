//! Booking API endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use uuid::Uuid;

use crate::api::middleware::{ApiError, AppState};
use crate::models::{Actor, ActorInput, CreateBookingInput, Reservation, ReservationStatus};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/bookings", post(create_booking))
        .route("/bookings/{id}", get(get_booking))
        .route("/bookings/{id}/confirm", post(confirm_booking))
        .route("/bookings/{id}/cancel", post(cancel_booking))
        .route("/users/{user_id}/reservations", get(list_user_reservations))
}

/// Admin-only booking operations, mounted under `/admin`
pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/bookings/{id}/complete", post(complete_booking))
        .route("/bookings/{id}/cancel", post(admin_cancel_booking))
}

#[derive(Serialize)]
struct CreatedResponse {
    reservation_id: Uuid,
    expires_at: DateTime<Utc>,
}

#[derive(Serialize)]
struct StatusResponse {
    reservation_id: Uuid,
    status: ReservationStatus,
}

impl From<Reservation> for StatusResponse {
    fn from(r: Reservation) -> Self {
        Self {
            reservation_id: r.id,
            status: r.status,
        }
    }
}

#[derive(Serialize)]
struct ReservationResponse {
    reservation: Reservation,
}

#[derive(Serialize)]
pub(crate) struct ReservationsResponse {
    pub(crate) reservations: Vec<Reservation>,
}

pub(crate) fn parse_reservation_id(raw: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(raw)
        .map_err(|_| ApiError::validation_error(format!("Invalid reservation id: {}", raw)))
}

pub(crate) fn require_user_id(user_id: &str) -> Result<&str, ApiError> {
    let user_id = user_id.trim();
    if user_id.is_empty() {
        return Err(ApiError::validation_error("user_id is required"));
    }
    Ok(user_id)
}

async fn create_booking(
    State(state): State<AppState>,
    Json(input): Json<CreateBookingInput>,
) -> Result<impl IntoResponse, ApiError> {
    let user_id = require_user_id(&input.user_id)?;
    let computer_id = input.computer_id.trim();
    if computer_id.is_empty() {
        return Err(ApiError::validation_error("computer_id is required"));
    }

    let reservation = state.ledger.create(computer_id, user_id).await?;
    Ok((
        StatusCode::CREATED,
        Json(CreatedResponse {
            reservation_id: reservation.id,
            expires_at: reservation.expires_at,
        }),
    ))
}

async fn get_booking(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let reservation = state.ledger.get(parse_reservation_id(&id)?).await?;
    Ok(Json(ReservationResponse { reservation }))
}

async fn confirm_booking(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ActorInput>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_reservation_id(&id)?;
    let user_id = require_user_id(&input.user_id)?;
    let reservation = state.ledger.confirm(id, user_id).await?;
    Ok(Json(StatusResponse::from(reservation)))
}

async fn cancel_booking(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(input): Json<ActorInput>,
) -> Result<impl IntoResponse, ApiError> {
    let id = parse_reservation_id(&id)?;
    let actor = Actor::User(require_user_id(&input.user_id)?.to_string());
    let reservation = state.ledger.cancel(id, &actor).await?;
    Ok(Json(StatusResponse::from(reservation)))
}

async fn list_user_reservations(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let reservations = state
        .ledger
        .history_for_user(require_user_id(&user_id)?)
        .await?;
    Ok(Json(ReservationsResponse { reservations }))
}

async fn complete_booking(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let reservation = state.ledger.complete(parse_reservation_id(&id)?).await?;
    Ok(Json(StatusResponse::from(reservation)))
}

async fn admin_cancel_booking(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let reservation = state
        .ledger
        .cancel(parse_reservation_id(&id)?, &Actor::Admin)
        .await?;
    Ok(Json(StatusResponse::from(reservation)))
}
