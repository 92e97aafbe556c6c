//! Workstation API endpoints

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::Serialize;

use crate::api::bookings::ReservationsResponse;
use crate::api::live;
use crate::api::middleware::{ApiError, AppState};
use crate::models::{Computer, ComputerSummary, RegisterComputerInput};

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/computers", get(list_computers))
        .route("/computers/live", get(live::live_map))
        .route("/computers/{id}", get(get_computer))
        .route("/computers/{id}/reservations", get(list_computer_reservations))
        .route("/computers/{id}/heartbeat", post(heartbeat))
}

/// Fleet management, mounted under `/admin`
pub fn admin_router() -> Router<AppState> {
    Router::new()
        .route("/computers", post(register_computer))
        .route("/computers/{id}/offline", post(mark_offline))
        .route("/computers/{id}/maintenance", post(mark_maintenance))
        .route("/computers/{id}/online", post(mark_online))
}

#[derive(Serialize)]
struct ComputerResponse {
    computer: Computer,
}

async fn list_computers(State(state): State<AppState>) -> impl IntoResponse {
    let computers: Vec<ComputerSummary> = state
        .fleet
        .list()
        .iter()
        .map(ComputerSummary::from)
        .collect();
    Json(computers)
}

async fn get_computer(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let computer = state.fleet.get(&id)?;
    Ok(Json(ComputerResponse { computer }))
}

async fn list_computer_reservations(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let reservations = state.ledger.history_for_computer(&id).await?;
    Ok(Json(ReservationsResponse { reservations }))
}

async fn heartbeat(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let computer = state.fleet.heartbeat(&id).await?;
    Ok(Json(ComputerResponse { computer }))
}

async fn register_computer(
    State(state): State<AppState>,
    Json(input): Json<RegisterComputerInput>,
) -> Result<impl IntoResponse, ApiError> {
    let computer = state.fleet.register(input).await?;
    Ok((StatusCode::CREATED, Json(ComputerResponse { computer })))
}

async fn mark_offline(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let computer = state.fleet.mark_offline(&id).await?;
    Ok(Json(ComputerResponse { computer }))
}

async fn mark_maintenance(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let computer = state.fleet.mark_maintenance(&id).await?;
    Ok(Json(ComputerResponse { computer }))
}

async fn mark_online(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let computer = state.fleet.mark_online(&id).await?;
    Ok(Json(ComputerResponse { computer }))
}
