//! API middleware
//!
//! Contains:
//! - Shared application state
//! - Request statistics
//! - The JSON error envelope and its mapping from service errors
//! - Bearer token check for admin routes

use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use crate::services::settings::{MAX_BOOKING_TIMEOUT_MINUTES, MIN_BOOKING_TIMEOUT_MINUTES};
use crate::services::{
    Broadcaster, Engine, FleetError, FleetService, Ledger, LedgerError, SettingsService,
    SettingsServiceError,
};

// ============================================================================
// Request Statistics
// ============================================================================

/// Lightweight request statistics using atomic operations (no locks)
pub struct RequestStats {
    total_requests: AtomicU64,
    /// Total response time in microseconds, for the average
    total_response_time_us: AtomicU64,
    start_time: Instant,
}

impl RequestStats {
    pub fn new() -> Self {
        Self {
            total_requests: AtomicU64::new(0),
            total_response_time_us: AtomicU64::new(0),
            start_time: Instant::now(),
        }
    }

    /// Record a request with its response time
    pub fn record(&self, duration_us: u64) {
        self.total_requests.fetch_add(1, Ordering::Relaxed);
        self.total_response_time_us
            .fetch_add(duration_us, Ordering::Relaxed);
    }

    pub fn total_requests(&self) -> u64 {
        self.total_requests.load(Ordering::Relaxed)
    }

    /// Average response time in microseconds
    pub fn avg_response_time_us(&self) -> f64 {
        let total = self.total_requests.load(Ordering::Relaxed);
        if total == 0 {
            return 0.0;
        }
        let total_time = self.total_response_time_us.load(Ordering::Relaxed);
        total_time as f64 / total as f64
    }

    pub fn uptime_seconds(&self) -> u64 {
        self.start_time.elapsed().as_secs()
    }
}

impl Default for RequestStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Application state containing shared services
#[derive(Clone)]
pub struct AppState {
    pub ledger: Arc<Ledger>,
    pub fleet: Arc<FleetService>,
    pub settings: Arc<SettingsService>,
    pub broadcaster: Arc<Broadcaster>,
    pub request_stats: Arc<RequestStats>,
    /// Expected bearer token for `/admin`; `None` leaves admin routes open
    pub admin_token: Option<Arc<str>>,
}

impl AppState {
    pub fn new(engine: &Engine, admin_token: Option<String>) -> Self {
        Self {
            ledger: engine.ledger.clone(),
            fleet: engine.fleet.clone(),
            settings: engine.settings.clone(),
            broadcaster: engine.broadcaster.clone(),
            request_stats: Arc::new(RequestStats::new()),
            admin_token: admin_token
                .filter(|t| !t.trim().is_empty())
                .map(Arc::from),
        }
    }
}

/// Error response for API errors
#[derive(Debug, Serialize, Deserialize)]
pub struct ApiError {
    pub error: ApiErrorDetail,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiErrorDetail {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    pub fn with_details(
        code: impl Into<String>,
        message: impl Into<String>,
        details: serde_json::Value,
    ) -> Self {
        Self {
            error: ApiErrorDetail {
                code: code.into(),
                message: message.into(),
                details: Some(details),
            },
        }
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new("UNAUTHORIZED", message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new("NOT_FOUND", message)
    }

    pub fn validation_error(message: impl Into<String>) -> Self {
        Self::new("VALIDATION_ERROR", message)
    }

    pub fn transient(message: impl Into<String>) -> Self {
        Self::new("TRANSIENT", message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match self.error.code.as_str() {
            "UNAUTHORIZED" => StatusCode::UNAUTHORIZED,
            "NOT_OWNER" => StatusCode::FORBIDDEN,
            "NOT_FOUND" => StatusCode::NOT_FOUND,
            "VALIDATION_ERROR" => StatusCode::BAD_REQUEST,
            "RESOURCE_UNAVAILABLE" | "INVALID_STATE" | "DUPLICATE" => StatusCode::CONFLICT,
            "OUT_OF_RANGE" => StatusCode::UNPROCESSABLE_ENTITY,
            "TRANSIENT" => StatusCode::SERVICE_UNAVAILABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };

        (status, Json(self)).into_response()
    }
}

impl From<LedgerError> for ApiError {
    fn from(e: LedgerError) -> Self {
        let message = e.to_string();
        match e {
            LedgerError::ResourceUnavailable(id) => Self::with_details(
                "RESOURCE_UNAVAILABLE",
                message,
                serde_json::json!({ "computer_id": id }),
            ),
            LedgerError::InvalidState { id, status, .. } => Self::with_details(
                "INVALID_STATE",
                message,
                serde_json::json!({ "reservation_id": id, "status": status }),
            ),
            LedgerError::NotOwner(_) => Self::new("NOT_OWNER", message),
            LedgerError::NotFound(_) => Self::not_found(message),
            LedgerError::Transient(_) => Self::transient(message),
            LedgerError::Integrity(violations) => Self::with_details(
                "INTEGRITY",
                "Integrity check failed",
                serde_json::json!({ "violations": violations }),
            ),
        }
    }
}

impl From<FleetError> for ApiError {
    fn from(e: FleetError) -> Self {
        let message = e.to_string();
        match e {
            FleetError::NotFound(_) => Self::not_found(message),
            FleetError::Busy(_) => Self::new("RESOURCE_UNAVAILABLE", message),
            FleetError::Duplicate(_) => Self::new("DUPLICATE", message),
            FleetError::Invalid(_) => Self::validation_error(message),
            FleetError::Transient(_) => Self::transient(message),
        }
    }
}

impl From<SettingsServiceError> for ApiError {
    fn from(e: SettingsServiceError) -> Self {
        let message = e.to_string();
        match e {
            SettingsServiceError::OutOfRange(value) => Self::with_details(
                "OUT_OF_RANGE",
                message,
                serde_json::json!({
                    "value": value,
                    "min": MIN_BOOKING_TIMEOUT_MINUTES,
                    "max": MAX_BOOKING_TIMEOUT_MINUTES,
                }),
            ),
            SettingsServiceError::LoadError(_) | SettingsServiceError::SaveError(_) => {
                Self::transient(message)
            }
        }
    }
}

/// Extract a bearer token from the Authorization header
fn extract_bearer_token(request: &Request) -> Option<&str> {
    request
        .headers()
        .get(header::AUTHORIZATION)?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
        .map(str::trim)
}

/// Admin authorization middleware
pub async fn require_admin(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if let Some(expected) = state.admin_token.as_deref() {
        match extract_bearer_token(&request) {
            Some(token) if token == expected => {}
            Some(_) => {
                tracing::warn!("Rejected admin request with wrong token: {}", request.uri());
                return Err(ApiError::unauthorized("Invalid admin token"));
            }
            None => return Err(ApiError::unauthorized("Admin token required")),
        }
    }

    Ok(next.run(request).await)
}

/// Request statistics middleware
///
/// Records request count and response time for the admin stats endpoint.
pub async fn request_stats_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let start = Instant::now();
    let response = next.run(request).await;

    let duration_us = start.elapsed().as_micros() as u64;
    state.request_stats.record(duration_us);

    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::ReservationStatus;
    use uuid::Uuid;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            ("RESOURCE_UNAVAILABLE", StatusCode::CONFLICT),
            ("INVALID_STATE", StatusCode::CONFLICT),
            ("NOT_OWNER", StatusCode::FORBIDDEN),
            ("OUT_OF_RANGE", StatusCode::UNPROCESSABLE_ENTITY),
            ("NOT_FOUND", StatusCode::NOT_FOUND),
            ("TRANSIENT", StatusCode::SERVICE_UNAVAILABLE),
            ("INTEGRITY", StatusCode::INTERNAL_SERVER_ERROR),
            ("UNAUTHORIZED", StatusCode::UNAUTHORIZED),
        ];
        for (code, status) in cases {
            assert_eq!(ApiError::new(code, "x").into_response().status(), status, "{}", code);
        }
    }

    #[test]
    fn test_ledger_error_codes() {
        let id = Uuid::new_v4();
        let err: ApiError = LedgerError::InvalidState {
            id,
            status: ReservationStatus::Expired,
            action: "confirm",
        }
        .into();
        assert_eq!(err.error.code, "INVALID_STATE");
        assert_eq!(
            err.error.details.unwrap()["status"],
            serde_json::json!("expired")
        );

        let err: ApiError = LedgerError::NotOwner(id).into();
        assert_eq!(err.error.code, "NOT_OWNER");
        let err: ApiError = LedgerError::Transient("db".into()).into();
        assert_eq!(err.error.code, "TRANSIENT");
    }

    #[test]
    fn test_settings_out_of_range_code() {
        let err: ApiError = SettingsServiceError::OutOfRange(200).into();
        assert_eq!(err.error.code, "OUT_OF_RANGE");
        assert!(err.error.message.contains("200"));
    }

    #[test]
    fn test_request_stats_average() {
        let stats = RequestStats::new();
        assert_eq!(stats.avg_response_time_us(), 0.0);
        stats.record(100);
        stats.record(300);
        assert_eq!(stats.total_requests(), 2);
        assert_eq!(stats.avg_response_time_us(), 200.0);
    }
}
