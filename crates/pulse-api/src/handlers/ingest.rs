//! Event ingestion handlers.
//!
//! Bodies are decoded through the shared [`LargePayloadParser`], validated
//! here, and handed to the admission controller. A 202 means the events are
//! queued, not yet stored.
//!
//! Admission runs on its own task. When the request times out the client
//! gets a 408, but an enqueue that already started still runs to completion
//! or failure.
//!
//! [`LargePayloadParser`]: pulse_pipeline::LargePayloadParser

use std::{future::Future, sync::Arc};

use axum::{extract::State, http::StatusCode, Json};
use bytes::Bytes;
use pulse_core::{
    validation::{parse_event, partition_batch},
    PulseError,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, Instrument};

use super::ApiError;
use crate::AppState;

/// Response for an accepted single event.
#[derive(Debug, Serialize)]
pub struct EventAccepted {
    /// Always `accepted`
    pub status: &'static str,
    /// Identifier of the queued event
    pub event_id: String,
}

/// Response for an accepted batch.
#[derive(Debug, Serialize)]
pub struct BatchAccepted {
    /// Events queued
    pub accepted: usize,
    /// Elements that failed validation
    pub rejected: usize,
    /// Zero-based positions of the rejected elements
    pub invalid_indexes: Vec<usize>,
}

/// Queues one event.
///
/// # Errors
///
/// - 400: malformed JSON or invalid event
/// - 503: queue at the backpressure threshold
#[instrument(name = "ingest_event", skip_all, fields(body_bytes = body.len(), event_id = tracing::field::Empty))]
pub async fn ingest_event(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<EventAccepted>), ApiError> {
    let value: Value = state.parser.parse(body).await?;
    let event = parse_event(value)?;
    let event_id = event.event_id.clone();
    tracing::Span::current().record("event_id", event_id.as_str());

    let engine = Arc::clone(&state.engine);
    detached(async move { engine.admission().admit_one(event).await }).await?;

    debug!("event queued");
    Ok((StatusCode::ACCEPTED, Json(EventAccepted { status: "accepted", event_id })))
}

/// Queues the valid elements of a batch.
///
/// # Errors
///
/// - 400: malformed JSON, not an array, or no valid element
/// - 413: more elements than the batch limit
/// - 503: queue at the backpressure threshold
#[instrument(name = "ingest_batch", skip_all, fields(body_bytes = body.len()))]
pub async fn ingest_batch(
    State(state): State<AppState>,
    body: Bytes,
) -> Result<(StatusCode, Json<BatchAccepted>), ApiError> {
    let items: Vec<Value> = state.parser.parse(body).await?;
    let admission = state.engine.admission();
    admission.check_batch_size(items.len())?;

    let batch = partition_batch(items);
    if batch.valid.is_empty() {
        return Err(PulseError::validation(format!(
            "batch contains no valid events ({} rejected)",
            batch.rejected()
        ))
        .into());
    }

    let accepted = batch.accepted();
    let rejected = batch.rejected();
    let engine = Arc::clone(&state.engine);
    let valid = batch.valid;
    let jobs = detached(async move { engine.admission().admit_batch(valid).await }).await?;

    info!(accepted, rejected, jobs, "batch queued");
    Ok((
        StatusCode::ACCEPTED,
        Json(BatchAccepted { accepted, rejected, invalid_indexes: batch.invalid_indexes }),
    ))
}

/// Runs `admission` on a separate task and waits for it. Dropping the
/// returned future leaves the task running.
async fn detached<T, F>(admission: F) -> Result<T, PulseError>
where
    F: Future<Output = pulse_core::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    tokio::spawn(admission.in_current_span())
        .await
        .map_err(|e| PulseError::Other(anyhow::anyhow!("admission task failed: {e}")))?
}
