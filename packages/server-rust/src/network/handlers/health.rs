//! Health, liveness, and readiness endpoint handlers.
//!
//! These handlers expose service state for supervisors and operational
//! monitoring.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde_json::json;

use super::AppState;
use crate::network::LifecycleState;

/// Returns detailed health information as JSON.
///
/// Always returns 200 -- the `state` field in the response body indicates
/// whether the service is actually accepting work.
pub async fn health_handler(State(state): State<AppState>) -> Json<serde_json::Value> {
    let lifecycle = state.shutdown.state();
    let uptime_secs = state.start_time.elapsed().as_secs();

    Json(json!({
        "state": lifecycle.as_str(),
        "in_flight": state.shutdown.in_flight_count(),
        "active_operations": state.tracker.count(),
        "resources": state.registry.len(),
        "busy_resources": state.registry.busy_count(),
        "uptime_secs": uptime_secs,
    }))
}

/// Liveness check: always returns 200 OK.
pub async fn liveness_handler() -> StatusCode {
    StatusCode::OK
}

/// Readiness check: returns 200 while running, 503 otherwise.
///
/// Returns 503 during startup, while draining, and after stop.
pub async fn readiness_handler(State(state): State<AppState>) -> StatusCode {
    if state.shutdown.state() == LifecycleState::Running {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    }
}
