//! Core domain models and event types.
//!
//! Provides the telemetry event model, queue job envelope, error taxonomy,
//! clock abstraction and notification registry shared by every other Pulse
//! crate.

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod error;
pub mod events;
pub mod models;
pub mod time;
pub mod validation;

pub use error::{PulseError, Result};
pub use events::{NotificationBus, NotificationHandler, ProcessedNotification, SubscriptionId};
pub use models::{Job, JobId, JobPayload, ProcessedEvent, QueueDepth, RawEvent};
pub use time::{saturating_millis, Clock, RealClock, TestClock};
pub use validation::{partition_batch, PartitionedBatch};
