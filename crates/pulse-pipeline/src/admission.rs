//! Depth-based admission of events into the job queue.
//!
//! Admission is a soft bound: the depth check and the enqueue are separate
//! queue calls, so concurrent admissions may overshoot the threshold by at
//! most one call's worth of jobs.

use std::sync::Arc;

use pulse_core::{Clock, Job, PulseError, RawEvent, Result};
use tracing::{debug, instrument, warn};

use crate::{metrics::PipelineMetrics, queue::JobQueue};

/// Admission limits.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AdmissionConfig {
    /// Queue depth at which new work is rejected.
    pub backpressure_threshold: u64,
    /// Batches longer than this are split into sub-batch jobs of this size.
    pub chunk_size: usize,
    /// Largest batch accepted in one submission.
    pub max_batch_size: usize,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self { backpressure_threshold: 10_000, chunk_size: 1000, max_batch_size: 10_000 }
    }
}

/// Decides whether work may enter the queue and enqueues it.
pub struct AdmissionController {
    queue: Arc<dyn JobQueue>,
    metrics: Arc<PipelineMetrics>,
    clock: Arc<dyn Clock>,
    config: AdmissionConfig,
}

impl AdmissionController {
    /// Creates a controller over `queue`.
    pub fn new(
        queue: Arc<dyn JobQueue>,
        metrics: Arc<PipelineMetrics>,
        clock: Arc<dyn Clock>,
        config: AdmissionConfig,
    ) -> Self {
        Self { queue, metrics, clock, config: AdmissionConfig { chunk_size: config.chunk_size.max(1), ..config } }
    }

    /// Admission limits in effect.
    pub fn config(&self) -> &AdmissionConfig {
        &self.config
    }

    /// Returns whether the current queue depth is below the threshold.
    ///
    /// # Errors
    ///
    /// Returns the queue's error if depth cannot be read.
    pub async fn can_accept(&self) -> Result<bool> {
        Ok(self.check_depth().await.is_ok())
    }

    /// Rejects submissions over the configured batch size.
    ///
    /// # Errors
    ///
    /// Returns `PulseError::BatchTooLarge` when `size` exceeds the limit.
    pub fn check_batch_size(&self, size: usize) -> Result<()> {
        if size > self.config.max_batch_size {
            return Err(PulseError::BatchTooLarge { size, limit: self.config.max_batch_size });
        }
        Ok(())
    }

    /// Enqueues one event as a job keyed by its `event_id`.
    ///
    /// # Errors
    ///
    /// Returns `PulseError::QueueOverloaded` when the queue is at or above the
    /// backpressure threshold, or the queue's own error.
    #[instrument(skip_all, fields(event_id = %event.event_id))]
    pub async fn admit_one(&self, event: RawEvent) -> Result<()> {
        self.check_depth().await?;

        let job = Job::single(event, self.clock.now_utc());
        let job_id = job.id.clone();
        if !self.queue.enqueue(job).await? {
            debug!(job_id = %job_id, "duplicate job ignored by queue");
        }

        self.metrics.record_received(1);
        Ok(())
    }

    /// Enqueues already-validated events with a single depth check.
    ///
    /// Batches up to `chunk_size` become one job per event. Longer batches
    /// become ordered sub-batch jobs of `chunk_size` events with ids derived
    /// from offset, first event and length. Returns the number of new jobs.
    ///
    /// # Errors
    ///
    /// Returns `PulseError::BatchTooLarge`, `PulseError::QueueOverloaded`, or
    /// the queue's own error.
    #[instrument(skip_all, fields(events = events.len()))]
    pub async fn admit_batch(&self, events: Vec<RawEvent>) -> Result<usize> {
        self.check_batch_size(events.len())?;
        if events.is_empty() {
            return Ok(0);
        }
        self.check_depth().await?;

        let event_count = events.len() as u64;
        let jobs = self.build_jobs(events)?;
        let job_count = jobs.len();
        let enqueued = self.queue.enqueue_all(jobs).await?;

        if enqueued < job_count {
            debug!(duplicates = job_count - enqueued, "duplicate jobs ignored by queue");
        }
        self.metrics.record_received(event_count);
        Ok(enqueued)
    }

    fn build_jobs(&self, events: Vec<RawEvent>) -> Result<Vec<Job>> {
        let now = self.clock.now_utc();
        let chunk_size = self.config.chunk_size;

        if events.len() <= chunk_size {
            return Ok(events.into_iter().map(|event| Job::single(event, now)).collect());
        }

        let mut jobs = Vec::with_capacity(events.len().div_ceil(chunk_size));
        let mut remaining = events.into_iter();
        let mut offset = 0;
        loop {
            let chunk: Vec<RawEvent> = remaining.by_ref().take(chunk_size).collect();
            if chunk.is_empty() {
                break;
            }
            let len = chunk.len();
            jobs.push(Job::batch(offset, chunk, now)?);
            offset += len;
        }
        Ok(jobs)
    }

    async fn check_depth(&self) -> Result<()> {
        let depth = self.queue.depth().await?.total();
        if depth >= self.config.backpressure_threshold {
            warn!(depth, threshold = self.config.backpressure_threshold, "rejecting work, queue overloaded");
            return Err(PulseError::QueueOverloaded {
                depth,
                threshold: self.config.backpressure_threshold,
            });
        }
        Ok(())
    }
}

impl std::fmt::Debug for AdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdmissionController").field("config", &self.config).finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use pulse_core::{JobId, RealClock};

    use super::*;
    use crate::{queue::MemoryJobQueue, retry::RetryPolicy};

    fn raw(id: usize) -> RawEvent {
        RawEvent {
            event_id: format!("evt-{id}"),
            device_id: "device-1".to_string(),
            sensor_type: "temperature".to_string(),
            value: 1.0,
            unit: "celsius".to_string(),
            timestamp: "2024-01-01T00:00:00Z".to_string(),
            metadata: None,
        }
    }

    fn controller(threshold: u64) -> (AdmissionController, Arc<MemoryJobQueue>, Arc<PipelineMetrics>) {
        let queue = Arc::new(MemoryJobQueue::new(RetryPolicy::default()));
        let metrics = Arc::new(PipelineMetrics::new());
        let controller = AdmissionController::new(
            queue.clone(),
            metrics.clone(),
            Arc::new(RealClock::new()),
            AdmissionConfig { backpressure_threshold: threshold, chunk_size: 1000, max_batch_size: 5000 },
        );
        (controller, queue, metrics)
    }

    #[tokio::test]
    async fn single_event_job_uses_event_id() {
        let (controller, queue, metrics) = controller(10);

        controller.admit_one(raw(1)).await.unwrap();

        assert!(queue.job(&JobId::from("evt-1")).is_some());
        assert_eq!(metrics.total_received(), 1);
    }

    #[tokio::test]
    async fn rejects_at_threshold() {
        let (controller, _queue, metrics) = controller(2);
        controller.admit_one(raw(1)).await.unwrap();
        assert!(controller.can_accept().await.unwrap());
        controller.admit_one(raw(2)).await.unwrap();

        assert!(!controller.can_accept().await.unwrap());
        let err = controller.admit_one(raw(3)).await.unwrap_err();
        assert!(matches!(err, PulseError::QueueOverloaded { depth: 2, threshold: 2 }));

        let err = controller.admit_batch(vec![raw(4)]).await.unwrap_err();
        assert_eq!(err.code(), "E3001");
        assert_eq!(metrics.total_received(), 2);
    }

    #[tokio::test]
    async fn batch_check_is_once_per_call() {
        let (controller, queue, _) = controller(2);

        let enqueued = controller.admit_batch((0..5).map(raw).collect()).await.unwrap();

        assert_eq!(enqueued, 5);
        assert_eq!(queue.job_ids().len(), 5);
    }

    #[tokio::test]
    async fn large_batches_split_into_deterministic_jobs() {
        let (controller, queue, metrics) = controller(100);

        let enqueued = controller.admit_batch((0..2500).map(raw).collect()).await.unwrap();

        assert_eq!(enqueued, 3);
        let ids: Vec<_> = queue.job_ids().into_iter().map(|id| id.0).collect();
        assert_eq!(ids, ["batch-0-evt-0-1000", "batch-1000-evt-1000-1000", "batch-2000-evt-2000-500"]);
        assert_eq!(metrics.total_received(), 2500);

        let again = controller.admit_batch((0..2500).map(raw).collect()).await.unwrap();
        assert_eq!(again, 0);
    }

    #[tokio::test]
    async fn oversized_batch_is_rejected() {
        let (controller, queue, _) = controller(100);

        let err = controller.admit_batch((0..5001).map(raw).collect()).await.unwrap_err();

        assert!(matches!(err, PulseError::BatchTooLarge { size: 5001, limit: 5000 }));
        assert!(queue.job_ids().is_empty());
    }
}
