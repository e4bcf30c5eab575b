//! Pipeline counters endpoint.

use axum::{extract::State, Json};
use pulse_pipeline::MetricsSnapshot;
use tracing::instrument;

use crate::AppState;

/// Returns throughput counters, queue depth and process memory.
#[instrument(name = "metrics", skip(state))]
pub async fn metrics(State(state): State<AppState>) -> Json<MetricsSnapshot> {
    Json(state.engine.metrics().await)
}
