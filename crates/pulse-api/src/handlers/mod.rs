//! HTTP request handlers for the Pulse API.
//!
//! Every handler reports failures through [`ApiError`], which maps the
//! error taxonomy onto status codes and renders `{error: {code, message}}`.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use pulse_core::PulseError;
use serde::Serialize;
use tracing::{error, warn};

pub mod health;
pub mod ingest;
pub mod metrics;
pub mod ws;

pub use health::health_check;
pub use ingest::{ingest_batch, ingest_event};
pub use metrics::metrics;
pub use ws::subscribe;

/// Error response with code and message.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// Error details including code and message
    pub error: ErrorDetail,
}

/// Detailed error information.
#[derive(Debug, Serialize)]
pub struct ErrorDetail {
    /// Error code from the taxonomy (E1001-E3004, E9999)
    pub code: String,
    /// Human-readable error description
    pub message: String,
}

/// Handler error carrying a [`PulseError`].
#[derive(Debug)]
pub struct ApiError(pub PulseError);

impl From<PulseError> for ApiError {
    fn from(error: PulseError) -> Self {
        Self(error)
    }
}

/// HTTP status for an error.
pub fn status_for(error: &PulseError) -> StatusCode {
    match error {
        PulseError::Validation { .. } => StatusCode::BAD_REQUEST,
        PulseError::BatchTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
        PulseError::QueueOverloaded { .. } | PulseError::StoreUnavailable { .. } => {
            StatusCode::SERVICE_UNAVAILABLE
        },
        PulseError::ProcessingFailure { .. }
        | PulseError::ShutdownFailure { .. }
        | PulseError::Queue(_)
        | PulseError::Database(_)
        | PulseError::Serialization(_)
        | PulseError::Other(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = status_for(&self.0);
        if status.is_server_error() {
            error!(code = self.0.code(), error = %self.0, "request failed");
        } else {
            warn!(code = self.0.code(), error = %self.0, "request rejected");
        }

        let body = ErrorResponse {
            error: ErrorDetail { code: self.0.code().to_string(), message: self.0.to_string() },
        };
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn errors_map_to_documented_statuses() {
        assert_eq!(status_for(&PulseError::validation("bad")), StatusCode::BAD_REQUEST);
        assert_eq!(
            status_for(&PulseError::BatchTooLarge { size: 11, limit: 10 }),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(
            status_for(&PulseError::QueueOverloaded { depth: 5, threshold: 5 }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            status_for(&PulseError::StoreUnavailable { retry_in: Duration::from_secs(1) }),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(status_for(&PulseError::queue("closed")), StatusCode::INTERNAL_SERVER_ERROR);
    }
}
