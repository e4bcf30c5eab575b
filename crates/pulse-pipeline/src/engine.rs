//! Ingestion engine wiring admission, queue, workers and persistence.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Admission      │──▶│ Job Queue    │──▶│ Worker Pool  │
//! │ (depth check)  │   │ (durable)    │   │ (N consumers)│
//! └────────────────┘   └──────────────┘   └──────────────┘
//!                                                │
//!                         ┌──────────────────────┼─────────────────┐
//!                         ▼                      ▼                 ▼
//!                 ┌──────────────┐      ┌──────────────┐   ┌──────────────┐
//!                 │ Circuit      │─────▶│ Event Store  │   │ Notification │
//!                 │ Breaker      │      │ (sensor_     │   │ Bus          │
//!                 └──────────────┘      │  events)     │   └──────────────┘
//!                                       └──────────────┘
//! ```
//!
//! A retention sweeper runs next to the workers and purges finished jobs
//! once they leave the dedup window.
//!
//! Teardown is exposed as separate steps so the binary can order them
//! against the HTTP server and broadcast hub.

use std::{sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use pulse_core::{Clock, NotificationBus, PulseError, Result};
use serde::{Deserialize, Serialize};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{
    admission::{AdmissionConfig, AdmissionController},
    circuit::{CircuitBreaker, CircuitConfig, CircuitState},
    metrics::{MetricsSnapshot, PipelineMetrics},
    persistence::{BatchPersistence, DEFAULT_CHUNK_SIZE},
    queue::JobQueue,
    storage::EventStore,
    worker::JobProcessor,
    worker_pool::{WorkerPool, WorkerPoolConfig},
};

/// Engine configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineConfig {
    /// Admission limits.
    pub admission: AdmissionConfig,
    /// Worker pool sizing.
    pub workers: WorkerPoolConfig,
    /// Circuit breaker tuning.
    pub circuit: CircuitConfig,
    /// Rows per insert statement.
    pub persist_chunk_size: usize,
    /// Maximum notification handlers.
    pub max_subscribers: usize,
    /// How long finished jobs keep their ids reserved.
    pub retention: RetentionConfig,
}

/// Finished-job retention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionConfig {
    /// Completed and failed jobs younger than this still dedup resubmissions.
    pub dedup_window: Duration,
    /// Pause between purges.
    pub sweep_interval: Duration,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { dedup_window: Duration::from_secs(24 * 60 * 60), sweep_interval: Duration::from_secs(300) }
    }
}

/// Oldest finish time that is still inside `window`.
fn retention_cutoff(now: DateTime<Utc>, window: Duration) -> DateTime<Utc> {
    chrono::Duration::from_std(window)
        .ok()
        .and_then(|window| now.checked_sub_signed(window))
        .unwrap_or(DateTime::<Utc>::MIN_UTC)
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            admission: AdmissionConfig::default(),
            workers: WorkerPoolConfig::default(),
            circuit: CircuitConfig::default(),
            persist_chunk_size: DEFAULT_CHUNK_SIZE,
            max_subscribers: 1000,
            retention: RetentionConfig::default(),
        }
    }
}

/// Why the service reports itself unhealthy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnhealthyReason {
    /// The store circuit breaker is open.
    CircuitOpen,
    /// Queue depth is at or above the backpressure threshold.
    QueueOverloaded,
    /// The store did not answer a probe.
    StoreUnreachable,
}

/// Health check result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum HealthStatus {
    /// Accepting and processing work.
    Healthy,
    /// Not fit to take traffic.
    Unhealthy {
        /// First failing check
        reason: UnhealthyReason,
    },
}

impl HealthStatus {
    /// Whether the status is healthy.
    pub const fn is_healthy(&self) -> bool {
        matches!(self, Self::Healthy)
    }
}

/// Running ingestion pipeline.
pub struct IngestEngine {
    admission: AdmissionController,
    persistence: Arc<BatchPersistence>,
    queue: Arc<dyn JobQueue>,
    bus: Arc<NotificationBus>,
    metrics: Arc<PipelineMetrics>,
    processor: Arc<JobProcessor>,
    workers: WorkerPool,
    clock: Arc<dyn Clock>,
    retention: RetentionConfig,
    sweeper_token: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl IngestEngine {
    /// Wires the pipeline. Workers are not started.
    pub fn new(
        config: EngineConfig,
        queue: Arc<dyn JobQueue>,
        store: Arc<dyn EventStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let metrics = Arc::new(PipelineMetrics::new());
        let bus = Arc::new(NotificationBus::new(config.max_subscribers));
        let breaker = CircuitBreaker::with_clock(config.circuit, clock.clone());
        let persistence = Arc::new(BatchPersistence::new(store, breaker, config.persist_chunk_size));

        let admission =
            AdmissionController::new(queue.clone(), metrics.clone(), clock.clone(), config.admission);
        let processor = Arc::new(JobProcessor::new(
            queue.clone(),
            persistence.clone(),
            bus.clone(),
            metrics.clone(),
            clock.clone(),
        ));
        let workers = WorkerPool::new(queue.clone(), processor.clone(), config.workers);

        Self {
            admission,
            persistence,
            queue,
            bus,
            metrics,
            processor,
            workers,
            clock,
            retention: config.retention,
            sweeper_token: CancellationToken::new(),
            sweeper: Mutex::new(None),
        }
    }

    /// Starts the worker pool and the retention sweeper.
    pub async fn start(&self) {
        self.workers.spawn_workers().await;

        let mut sweeper = self.sweeper.lock().await;
        if sweeper.is_none() {
            let queue = self.queue.clone();
            let clock = self.clock.clone();
            let retention = self.retention;
            let token = self.sweeper_token.clone();
            *sweeper = Some(tokio::spawn(sweep_finished_jobs(queue, clock, retention, token)));
        }

        info!("ingest engine started");
    }

    /// Purges finished jobs older than the dedup window. Returns jobs removed.
    ///
    /// # Errors
    ///
    /// Returns the queue's error.
    pub async fn purge_finished_jobs(&self) -> Result<u64> {
        let cutoff = retention_cutoff(self.clock.now_utc(), self.retention.dedup_window);
        self.queue.purge_finished(cutoff).await
    }

    /// Handles every ready job on the calling task, bypassing the worker pool.
    ///
    /// Returns the number of jobs handled, failed ones included. Jobs
    /// rescheduled for a later attempt are left in the queue.
    ///
    /// # Errors
    ///
    /// Returns the queue's error if a dequeue fails.
    pub async fn process_pending(&self) -> Result<usize> {
        let mut handled = 0;
        while let Some(job) = self.queue.dequeue().await? {
            if let Err(e) = self.processor.handle(&job).await {
                debug!(job_id = %job.id, error = %e, "job failed during manual drain");
            }
            handled += 1;
        }
        Ok(handled)
    }

    /// Admission controller for ingress.
    pub fn admission(&self) -> &AdmissionController {
        &self.admission
    }

    /// Registry for processed-event handlers.
    pub fn notifications(&self) -> &Arc<NotificationBus> {
        &self.bus
    }

    /// Persistence layer.
    pub fn persistence(&self) -> &BatchPersistence {
        &self.persistence
    }

    /// Breaker state of the persistence layer.
    pub fn circuit_state(&self) -> CircuitState {
        self.persistence.circuit_state()
    }

    /// Runs health checks in priority order: breaker, queue depth, store.
    pub async fn health(&self) -> HealthStatus {
        if self.persistence.breaker().is_open() {
            return HealthStatus::Unhealthy { reason: UnhealthyReason::CircuitOpen };
        }

        match self.admission.can_accept().await {
            Ok(true) => {},
            Ok(false) => return HealthStatus::Unhealthy { reason: UnhealthyReason::QueueOverloaded },
            Err(e) => {
                warn!(error = %e, "queue depth unavailable during health check");
                return HealthStatus::Unhealthy { reason: UnhealthyReason::StoreUnreachable };
            },
        }

        if !self.persistence.is_healthy().await {
            return HealthStatus::Unhealthy { reason: UnhealthyReason::StoreUnreachable };
        }

        HealthStatus::Healthy
    }

    /// Current counters and queue depth.
    pub async fn metrics(&self) -> MetricsSnapshot {
        let depth = match self.queue.depth().await {
            Ok(depth) => depth,
            Err(e) => {
                warn!(error = %e, "queue depth unavailable for metrics");
                pulse_core::QueueDepth::default()
            },
        };
        self.metrics.snapshot(depth)
    }

    /// Stops workers after in-flight jobs complete.
    ///
    /// # Errors
    ///
    /// Returns `PulseError::ShutdownFailure` if a worker panicked.
    pub async fn close_workers(&self) -> Result<()> {
        self.sweeper_token.cancel();
        if let Some(handle) = self.sweeper.lock().await.take() {
            if let Err(join_error) = handle.await {
                error!(error = %join_error, "retention sweeper panicked");
            }
        }
        self.workers.close().await
    }

    /// Releases the queue handle.
    ///
    /// # Errors
    ///
    /// Returns `PulseError::ShutdownFailure` wrapping the queue error.
    pub async fn close_queue(&self) -> Result<()> {
        self.queue.close().await.map_err(|e| PulseError::shutdown("close_queue", e.to_string()))
    }

    /// Closes the event store's connection pool.
    ///
    /// # Errors
    ///
    /// Returns `PulseError::ShutdownFailure` wrapping the store error.
    pub async fn close_store(&self) -> Result<()> {
        self.persistence.close().await.map_err(|e| PulseError::shutdown("close_store", e.to_string()))
    }
}

async fn sweep_finished_jobs(
    queue: Arc<dyn JobQueue>,
    clock: Arc<dyn Clock>,
    retention: RetentionConfig,
    token: CancellationToken,
) {
    debug!(window_secs = retention.dedup_window.as_secs(), "retention sweeper started");
    loop {
        tokio::select! {
            () = token.cancelled() => break,
            () = tokio::time::sleep(retention.sweep_interval) => {},
        }

        let cutoff = retention_cutoff(clock.now_utc(), retention.dedup_window);
        match queue.purge_finished(cutoff).await {
            Ok(0) => {},
            Ok(purged) => info!(purged, %cutoff, "finished jobs purged"),
            Err(e) => warn!(error = %e, "finished job purge failed"),
        }
    }
    debug!("retention sweeper stopped");
}

impl std::fmt::Debug for IngestEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IngestEngine")
            .field("admission", &self.admission)
            .field("persistence", &self.persistence)
            .field("workers", &self.workers)
            .field("retention", &self.retention)
            .finish_non_exhaustive()
    }
}
