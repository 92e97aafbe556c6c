//! Settings API endpoints

use axum::{
    extract::State,
    response::IntoResponse,
    routing::{get, put},
    Json, Router,
};
use serde::{Deserialize, Serialize};

use crate::api::middleware::{ApiError, AppState};

pub fn router() -> Router<AppState> {
    Router::new().route("/settings/booking-timeout", get(get_booking_timeout))
}

/// Mounted under `/admin`
pub fn admin_router() -> Router<AppState> {
    Router::new().route(
        "/settings/booking_timeout_minutes",
        put(update_booking_timeout),
    )
}

#[derive(Serialize)]
struct BookingTimeoutResponse {
    booking_timeout_minutes: i64,
}

#[derive(Deserialize)]
struct UpdateSettingInput {
    value: i64,
}

async fn get_booking_timeout(State(state): State<AppState>) -> Result<impl IntoResponse, ApiError> {
    let minutes = state.settings.booking_timeout_minutes().await?;
    Ok(Json(BookingTimeoutResponse {
        booking_timeout_minutes: minutes,
    }))
}

async fn update_booking_timeout(
    State(state): State<AppState>,
    Json(input): Json<UpdateSettingInput>,
) -> Result<impl IntoResponse, ApiError> {
    let minutes = state.settings.set_booking_timeout_minutes(input.value).await?;
    Ok(Json(BookingTimeoutResponse {
        booking_timeout_minutes: minutes,
    }))
}
