//! Health check handler for load balancers and orchestrators.

use axum::{
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use pulse_pipeline::HealthStatus;
use serde::Serialize;
use tracing::{debug, instrument};

use crate::AppState;

/// Health check response structure.
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    /// Overall status and, when unhealthy, the first failing check
    #[serde(flatten)]
    pub status: HealthStatus,
    /// Timestamp when health check was performed
    pub timestamp: DateTime<Utc>,
    /// Service version information
    pub version: &'static str,
}

/// Health check endpoint handler.
///
/// Returns 200 when healthy and 503 with a reason otherwise. Checks the
/// breaker first, then queue depth, then store reachability.
#[instrument(name = "health_check", skip(state))]
pub async fn health_check(State(state): State<AppState>) -> Response {
    let status = state.engine.health().await;
    let code = if status.is_healthy() { StatusCode::OK } else { StatusCode::SERVICE_UNAVAILABLE };

    debug!(?status, "health check completed");

    let body = HealthResponse {
        status,
        timestamp: state.clock.now_utc(),
        version: env!("CARGO_PKG_VERSION"),
    };
    (code, Json(body)).into_response()
}
