//! Error types and result handling for the ingestion pipeline.
//!
//! Defines the structured error taxonomy with stable codes so callers can
//! tell admission rejections, storage outages, processing failures and
//! shutdown failures apart. HTTP status mapping lives in the API crate.

use std::time::Duration;

use thiserror::Error;

/// Result type alias using `PulseError`.
pub type Result<T> = std::result::Result<T, PulseError>;

/// Pulse error types with stable codes.
#[derive(Debug, Error)]
pub enum PulseError {
    // Ingress errors (E1001-E1002)
    /// Event failed shape or value validation (E1001).
    #[error("[E1001] Validation failed: {message}")]
    Validation {
        /// What was wrong with the event
        message: String,
    },

    /// Batch exceeds the configured maximum size (E1002).
    #[error("[E1002] Batch too large: {size} events exceeds limit of {limit}")]
    BatchTooLarge {
        /// Number of events submitted
        size: usize,
        /// Configured maximum batch size
        limit: usize,
    },

    // Pipeline errors (E3001-E3004)
    /// Queue depth crossed the backpressure threshold (E3001).
    #[error("[E3001] Queue overloaded: depth {depth} reached threshold {threshold}")]
    QueueOverloaded {
        /// Observed queue depth at admission time
        depth: u64,
        /// Configured backpressure threshold
        threshold: u64,
    },

    /// Circuit breaker is open, persistence store is not being called (E3002).
    #[error("[E3002] Store unavailable: circuit open for another {}ms", retry_in.as_millis())]
    StoreUnavailable {
        /// Time left until the breaker allows a probe
        retry_in: Duration,
    },

    /// Job processing failed for a reason other than an open circuit (E3003).
    #[error("[E3003] Processing failed for job {job_id}: {message}")]
    ProcessingFailure {
        /// Identifier of the failed job
        job_id: String,
        /// Failure description
        message: String,
    },

    /// A teardown step failed (E3004).
    #[error("[E3004] Shutdown failed during {step}: {message}")]
    ShutdownFailure {
        /// Name of the shutdown step that failed
        step: &'static str,
        /// Failure description
        message: String,
    },

    /// Queue store operation failed.
    #[error("Queue error: {0}")]
    Queue(String),

    /// Generic database error.
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON encoding or decoding failed.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Generic error for wrapping other errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl PulseError {
    /// Creates a validation error.
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation { message: message.into() }
    }

    /// Creates a processing failure for a job.
    pub fn processing(job_id: impl Into<String>, message: impl Into<String>) -> Self {
        Self::ProcessingFailure { job_id: job_id.into(), message: message.into() }
    }

    /// Creates a queue error.
    pub fn queue(message: impl Into<String>) -> Self {
        Self::Queue(message.into())
    }

    /// Creates a shutdown failure for the named step.
    pub fn shutdown(step: &'static str, message: impl Into<String>) -> Self {
        Self::ShutdownFailure { step, message: message.into() }
    }

    /// Returns the error code.
    pub const fn code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "E1001",
            Self::BatchTooLarge { .. } => "E1002",
            Self::QueueOverloaded { .. } => "E3001",
            Self::StoreUnavailable { .. } => "E3002",
            Self::ProcessingFailure { .. } => "E3003",
            Self::ShutdownFailure { .. } => "E3004",
            Self::Queue(_) | Self::Database(_) | Self::Serialization(_) | Self::Other(_) => "E9999",
        }
    }

    /// Returns whether the queue should redeliver a job that failed with this
    /// error.
    ///
    /// Malformed events will never normalize, so redelivering them only burns
    /// attempts. Everything else is treated as transient.
    pub const fn is_retryable(&self) -> bool {
        !matches!(self, Self::Validation { .. } | Self::BatchTooLarge { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_codes_are_stable() {
        assert_eq!(PulseError::validation("bad").code(), "E1001");
        assert_eq!(PulseError::BatchTooLarge { size: 2, limit: 1 }.code(), "E1002");
        assert_eq!(PulseError::QueueOverloaded { depth: 10, threshold: 10 }.code(), "E3001");
        assert_eq!(
            PulseError::StoreUnavailable { retry_in: Duration::from_secs(1) }.code(),
            "E3002"
        );
        assert_eq!(PulseError::processing("job-1", "boom").code(), "E3003");
        assert_eq!(PulseError::shutdown("close_queue", "boom").code(), "E3004");
        assert_eq!(PulseError::queue("closed").code(), "E9999");
    }

    #[test]
    fn retryable_errors_identified() {
        assert!(!PulseError::validation("bad timestamp").is_retryable());
        assert!(!PulseError::BatchTooLarge { size: 2, limit: 1 }.is_retryable());
        assert!(PulseError::StoreUnavailable { retry_in: Duration::ZERO }.is_retryable());
        assert!(PulseError::processing("job-1", "connection reset").is_retryable());
    }

    #[test]
    fn store_unavailable_message_includes_cooldown() {
        let error = PulseError::StoreUnavailable { retry_in: Duration::from_millis(1500) };
        assert_eq!(error.to_string(), "[E3002] Store unavailable: circuit open for another 1500ms");
    }
}
