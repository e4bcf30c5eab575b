//! Telemetry ingestion pipeline with backpressure and store protection.
//!
//! Events enter through the [`AdmissionController`], which rejects work once
//! the job queue is deep enough. A pool of workers drains the queue,
//! normalizes events and writes them in chunks through a circuit breaker,
//! then announces each stored event on the notification bus.
//!
//! 1. **Admit** - Compare queue depth against the backpressure threshold
//! 2. **Enqueue** - Wrap events in jobs with deterministic ids
//! 3. **Process** - Normalize timestamps and persist with `ON CONFLICT DO NOTHING`
//! 4. **Announce** - Publish one notification per stored event
//!
//! Shutdown is driven by [`ShutdownCoordinator`], which runs the teardown
//! steps exposed by [`IngestEngine`] in dependency order.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use pulse_core::RealClock;
//! use pulse_pipeline::{
//!     queue::MemoryJobQueue, retry::RetryPolicy, storage::mock::MemoryEventStore, EngineConfig,
//!     IngestEngine,
//! };
//!
//! # async fn example() {
//! let engine = IngestEngine::new(
//!     EngineConfig::default(),
//!     Arc::new(MemoryJobQueue::new(RetryPolicy::default())),
//!     Arc::new(MemoryEventStore::new()),
//!     Arc::new(RealClock::new()),
//! );
//! engine.start().await;
//! # }
//! ```

pub mod admission;
pub mod circuit;
pub mod engine;
pub mod metrics;
pub mod parse;
pub mod persistence;
pub mod queue;
pub mod retry;
pub mod schema;
pub mod shutdown;
pub mod storage;
mod worker;
pub mod worker_pool;

pub use admission::{AdmissionConfig, AdmissionController};
pub use circuit::{CircuitBreaker, CircuitConfig, CircuitState};
pub use engine::{EngineConfig, HealthStatus, IngestEngine, RetentionConfig, UnhealthyReason};
pub use metrics::MetricsSnapshot;
pub use parse::LargePayloadParser;
pub use shutdown::{ShutdownCoordinator, ShutdownOutcome, ShutdownPlan};
pub use worker::JobProcessor;
