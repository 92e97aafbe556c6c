//! Admin API endpoints
//!
//! Engine statistics plus the admin halves of the booking, fleet and
//! settings routers. Everything here sits behind `require_admin`.

use axum::{extract::State, routing::get, Json, Router};
use serde::Serialize;

use crate::api::middleware::AppState;
use crate::api::{bookings, computers, settings};

/// App version constant
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Engine statistics response
#[derive(Debug, Serialize)]
pub struct EngineStatsResponse {
    pub version: String,
    /// Process uptime in seconds
    pub uptime_seconds: u64,
    /// Uptime formatted (e.g., "2h 15m")
    pub uptime_formatted: String,
    pub total_requests: u64,
    pub avg_response_time_ms: f64,
    /// Pending holds waiting on a deadline
    pub armed_timers: usize,
    /// Open live map connections
    pub live_subscribers: usize,
    pub computers: usize,
}

/// Build the admin router
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/stats", get(get_engine_stats))
        .merge(bookings::admin_router())
        .merge(computers::admin_router())
        .merge(settings::admin_router())
}

/// GET /api/v1/admin/stats
async fn get_engine_stats(State(state): State<AppState>) -> Json<EngineStatsResponse> {
    let uptime_seconds = state.request_stats.uptime_seconds();

    Json(EngineStatsResponse {
        version: APP_VERSION.to_string(),
        uptime_seconds,
        uptime_formatted: format_uptime(uptime_seconds),
        total_requests: state.request_stats.total_requests(),
        avg_response_time_ms: state.request_stats.avg_response_time_us() / 1000.0,
        armed_timers: state.ledger.armed_timers(),
        live_subscribers: state.broadcaster.subscriber_count(),
        computers: state.fleet.list().len(),
    })
}

/// Format uptime to human readable string
fn format_uptime(seconds: u64) -> String {
    let days = seconds / 86400;
    let hours = (seconds % 86400) / 3600;
    let minutes = (seconds % 3600) / 60;

    if days > 0 {
        format!("{}d {}h {}m", days, hours, minutes)
    } else if hours > 0 {
        format!("{}h {}m", hours, minutes)
    } else if minutes > 0 {
        format!("{}m", minutes)
    } else {
        format!("{}s", seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_uptime() {
        assert_eq!(format_uptime(42), "42s");
        assert_eq!(format_uptime(125), "2m");
        assert_eq!(format_uptime(3 * 3600 + 60), "3h 1m");
        assert_eq!(format_uptime(2 * 86400 + 3600), "2d 1h 0m");
    }
}
