//! In-memory pipeline harness.
//!
//! [`TestEnv`] wires an [`IngestEngine`] to the in-memory queue and event
//! store with a shared [`TestClock`]. Workers are not started; tests drive
//! processing with [`TestEnv::process_pending`] and move time with
//! [`TestEnv::advance_time`], so runs are deterministic.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use pulse_core::{Clock, RawEvent, TestClock};
use pulse_pipeline::{
    queue::MemoryJobQueue, retry::RetryPolicy, storage::mock::MemoryEventStore, EngineConfig,
    IngestEngine,
};

/// Builder for [`TestEnv`].
#[derive(Debug, Clone)]
pub struct TestEnvBuilder {
    config: EngineConfig,
    policy: RetryPolicy,
}

impl TestEnvBuilder {
    /// Default engine configuration with a three-attempt, one-second policy.
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
            policy: RetryPolicy { jitter_factor: 0.0, ..RetryPolicy::default() },
        }
    }

    /// Replaces the engine configuration.
    #[must_use]
    pub fn config(mut self, config: EngineConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the backpressure threshold.
    #[must_use]
    pub fn backpressure_threshold(mut self, threshold: u64) -> Self {
        self.config.admission.backpressure_threshold = threshold;
        self
    }

    /// Sets the admission chunk size and the persistence chunk size.
    #[must_use]
    pub fn chunk_size(mut self, size: usize) -> Self {
        self.config.admission.chunk_size = size;
        self.config.persist_chunk_size = size;
        self
    }

    /// Sets the batch size limit.
    #[must_use]
    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.config.admission.max_batch_size = size;
        self
    }

    /// Sets the breaker's failure threshold and cooldown.
    #[must_use]
    pub fn circuit(mut self, failure_threshold: u32, cooldown: Duration) -> Self {
        self.config.circuit.failure_threshold = failure_threshold;
        self.config.circuit.cooldown = cooldown;
        self
    }

    /// Sets how long finished jobs keep their ids reserved.
    #[must_use]
    pub fn dedup_window(mut self, window: Duration) -> Self {
        self.config.retention.dedup_window = window;
        self
    }

    /// Sets the queue's redelivery policy.
    #[must_use]
    pub fn retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Builds the environment.
    pub fn build(self) -> TestEnv {
        let clock = TestClock::new();
        let shared: Arc<dyn Clock> = Arc::new(clock.clone());
        let queue = Arc::new(MemoryJobQueue::with_clock(self.policy, shared.clone()));
        let store = Arc::new(MemoryEventStore::new());
        let engine =
            Arc::new(IngestEngine::new(self.config, queue.clone(), store.clone(), shared));
        TestEnv { clock, queue, store, engine }
    }
}

impl Default for TestEnvBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Engine over in-memory backends with a manual clock.
pub struct TestEnv {
    /// Clock shared by the engine and queue.
    pub clock: TestClock,
    /// Job queue handle.
    pub queue: Arc<MemoryJobQueue>,
    /// Event store handle.
    pub store: Arc<MemoryEventStore>,
    /// Engine under test.
    pub engine: Arc<IngestEngine>,
}

impl TestEnv {
    /// Environment with default settings.
    pub fn new() -> Self {
        TestEnvBuilder::new().build()
    }

    /// Starts a builder.
    pub fn builder() -> TestEnvBuilder {
        TestEnvBuilder::new()
    }

    /// Admits one event.
    ///
    /// # Errors
    ///
    /// Returns the admission error.
    pub async fn admit(&self, event: RawEvent) -> Result<()> {
        self.engine.admission().admit_one(event).await.context("admission failed")
    }

    /// Admits a validated batch. Returns the number of new jobs.
    ///
    /// # Errors
    ///
    /// Returns the admission error.
    pub async fn admit_batch(&self, events: Vec<RawEvent>) -> Result<usize> {
        self.engine.admission().admit_batch(events).await.context("batch admission failed")
    }

    /// Handles every ready job. Returns the number of jobs handled.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue fails.
    pub async fn process_pending(&self) -> Result<usize> {
        self.engine.process_pending().await.context("processing cycle failed")
    }

    /// Advances the shared clock, then handles jobs that became ready.
    ///
    /// # Errors
    ///
    /// Returns an error if the queue fails.
    pub async fn advance_and_process(&self, duration: Duration) -> Result<usize> {
        self.advance_time(duration);
        self.process_pending().await
    }

    /// Moves the shared clock forward.
    pub fn advance_time(&self, duration: Duration) {
        self.clock.advance(duration);
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for TestEnv {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestEnv")
            .field("elapsed", &self.clock.elapsed())
            .field("rows", &self.store.row_count())
            .finish_non_exhaustive()
    }
}
