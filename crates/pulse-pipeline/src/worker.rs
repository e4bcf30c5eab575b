//! Queue consumer that normalizes, persists and announces events.

use std::{sync::Arc, time::Duration};

use pulse_core::{
    Clock, Job, NotificationBus, ProcessedEvent, ProcessedNotification, PulseError, Result,
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::{metrics::PipelineMetrics, persistence::BatchPersistence, queue::JobQueue};

/// Per-job processing shared by every worker.
pub struct JobProcessor {
    queue: Arc<dyn JobQueue>,
    persistence: Arc<BatchPersistence>,
    bus: Arc<NotificationBus>,
    metrics: Arc<PipelineMetrics>,
    clock: Arc<dyn Clock>,
}

impl JobProcessor {
    /// Creates a processor.
    pub fn new(
        queue: Arc<dyn JobQueue>,
        persistence: Arc<BatchPersistence>,
        bus: Arc<NotificationBus>,
        metrics: Arc<PipelineMetrics>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self { queue, persistence, bus, metrics, clock }
    }

    /// Processes a claimed job and acknowledges it to the queue.
    ///
    /// Success completes the job; failure hands it back to the queue, which
    /// applies its own redelivery policy. Returns the processing result.
    ///
    /// If the queue rejects the completion after the events were persisted,
    /// the job stays active until the next startup requeues it
    /// (`PostgresJobQueue::requeue_active`). The redelivery is harmless since
    /// the store skips duplicate event ids.
    ///
    /// # Errors
    ///
    /// Returns the processing error after it has been reported to the queue.
    pub async fn handle(&self, job: &Job) -> Result<usize> {
        let count = job.event_count() as u64;

        match self.process(job).await {
            Ok(processed) => {
                self.metrics.record_processed(count);
                if let Err(e) = self.queue.complete(&job.id).await {
                    self.metrics.record_unacknowledged();
                    warn!(
                        job_id = %job.id,
                        error = %e,
                        unacknowledged = self.metrics.unacknowledged_jobs(),
                        "persisted job not acknowledged, it stays active until requeued at startup"
                    );
                }
                Ok(processed)
            },
            Err(err) => {
                self.metrics.record_failed(count);
                let first = job.events().first();
                error!(
                    job_id = %job.id,
                    attempt = job.attempts,
                    event_id = first.map_or("", |e| e.event_id.as_str()),
                    device_id = first.map_or("", |e| e.device_id.as_str()),
                    error = %err,
                    "job processing failed"
                );
                if let Err(e) = self.queue.fail(&job.id, &err).await {
                    error!(job_id = %job.id, error = %e, "failed to report job failure to queue");
                }
                Err(err)
            },
        }
    }

    /// Normalizes and persists a job's events, then publishes one
    /// notification per event.
    async fn process(&self, job: &Job) -> Result<usize> {
        let processed_at = self.clock.now_utc();
        let events = job
            .events()
            .iter()
            .map(|raw| ProcessedEvent::from_raw(raw, processed_at, job.enqueued_at))
            .collect::<Result<Vec<_>>>()?;

        self.persistence.insert_batch(&events).await.map_err(|e| match e {
            PulseError::StoreUnavailable { .. } | PulseError::Validation { .. } => e,
            other => PulseError::processing(job.id.as_str(), other.to_string()),
        })?;

        let count = events.len();
        for event in events {
            self.bus.publish(&ProcessedNotification::EventProcessed(event)).await;
        }

        debug!(job_id = %job.id, events = count, "job processed");
        Ok(count)
    }
}

impl std::fmt::Debug for JobProcessor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobProcessor").field("bus", &self.bus).finish_non_exhaustive()
    }
}

/// Single queue consumer.
pub(crate) struct Worker {
    id: usize,
    queue: Arc<dyn JobQueue>,
    processor: Arc<JobProcessor>,
    poll_interval: Duration,
    error_backoff: Duration,
    cancellation_token: CancellationToken,
}

impl Worker {
    pub(crate) fn new(
        id: usize,
        queue: Arc<dyn JobQueue>,
        processor: Arc<JobProcessor>,
        poll_interval: Duration,
        error_backoff: Duration,
        cancellation_token: CancellationToken,
    ) -> Self {
        Self { id, queue, processor, poll_interval, error_backoff, cancellation_token }
    }

    /// Drains the queue until cancelled.
    ///
    /// Cancellation is only observed between jobs, so a job that has been
    /// dequeued always runs to completion.
    pub(crate) async fn run(&self) {
        loop {
            if self.cancellation_token.is_cancelled() {
                info!(worker_id = self.id, "worker received shutdown signal");
                break;
            }

            match self.queue.dequeue().await {
                Ok(Some(job)) => {
                    // Outcome is already logged and reported to the queue.
                    let _ = self.processor.handle(&job).await;
                },
                Ok(None) => {
                    tokio::select! {
                        () = tokio::time::sleep(self.poll_interval) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
                Err(error) => {
                    warn!(worker_id = self.id, error = %error, "dequeue failed");
                    tokio::select! {
                        () = tokio::time::sleep(self.error_backoff) => {}
                        () = self.cancellation_token.cancelled() => break,
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::Utc;
    use pulse_core::{JobId, NotificationHandler, RawEvent, RealClock};

    use super::*;
    use crate::{
        circuit::{CircuitBreaker, CircuitConfig},
        queue::{JobStatus, MemoryJobQueue},
        retry::RetryPolicy,
        storage::mock::MemoryEventStore,
    };

    #[derive(Debug, Default)]
    struct Counter(AtomicUsize);

    #[async_trait::async_trait]
    impl NotificationHandler for Counter {
        async fn handle(&self, _notification: &ProcessedNotification) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    struct Fixture {
        processor: JobProcessor,
        queue: Arc<MemoryJobQueue>,
        store: Arc<MemoryEventStore>,
        metrics: Arc<PipelineMetrics>,
        notified: Arc<Counter>,
    }

    fn fixture() -> Fixture {
        let queue = Arc::new(MemoryJobQueue::new(RetryPolicy::default()));
        let store = Arc::new(MemoryEventStore::new());
        let persistence = Arc::new(BatchPersistence::new(
            store.clone(),
            CircuitBreaker::new(CircuitConfig::default()),
            1000,
        ));
        let bus = Arc::new(NotificationBus::new(8));
        let notified = Arc::new(Counter::default());
        bus.subscribe(notified.clone()).unwrap();
        let metrics = Arc::new(PipelineMetrics::new());
        let processor = JobProcessor::new(
            queue.clone(),
            persistence,
            bus,
            metrics.clone(),
            Arc::new(RealClock::new()),
        );
        Fixture { processor, queue, store, metrics, notified }
    }

    fn raw(id: &str, timestamp: &str) -> RawEvent {
        RawEvent {
            event_id: id.to_string(),
            device_id: "device-9".to_string(),
            sensor_type: "temperature".to_string(),
            value: 3.5,
            unit: "celsius".to_string(),
            timestamp: timestamp.to_string(),
            metadata: None,
        }
    }

    async fn claim(queue: &MemoryJobQueue, job: Job) -> Job {
        queue.enqueue(job).await.unwrap();
        queue.dequeue().await.unwrap().unwrap()
    }

    #[tokio::test]
    async fn successful_job_is_stored_notified_and_completed() {
        let f = fixture();
        let enqueued_at = Utc::now();
        let job = Job::batch(
            0,
            vec![raw("a", "2024-01-01T00:00:00+01:00"), raw("b", "2024-01-01T00:00:00Z")],
            enqueued_at,
        )
        .unwrap();
        let job = claim(&f.queue, job).await;

        assert_eq!(f.processor.handle(&job).await.unwrap(), 2);

        let stored = f.store.get("a").unwrap();
        assert_eq!(stored.canonical_timestamp(), "2023-12-31T23:00:00.000Z");
        assert_eq!(stored.received_at, enqueued_at);
        assert!(stored.processed_at >= enqueued_at);
        assert_eq!(f.notified.0.load(Ordering::SeqCst), 2);
        assert_eq!(f.metrics.total_processed(), 2);
        assert_eq!(f.queue.status(&job.id), Some(JobStatus::Completed));
    }

    #[tokio::test]
    async fn store_failure_is_counted_and_returned_to_queue() {
        let f = fixture();
        f.store.fail_next(1);
        let job = claim(&f.queue, Job::single(raw("a", "2024-01-01T00:00:00Z"), Utc::now())).await;

        let err = f.processor.handle(&job).await.unwrap_err();

        assert!(matches!(err, PulseError::ProcessingFailure { .. }));
        assert_eq!(f.metrics.total_failed(), 1);
        assert_eq!(f.notified.0.load(Ordering::SeqCst), 0);
        assert_eq!(f.queue.status(&JobId::from("a")), Some(JobStatus::Waiting));
    }

    #[tokio::test]
    async fn rejected_acknowledgement_is_counted_and_job_stays_active() {
        let f = fixture();
        let job = claim(&f.queue, Job::single(raw("a", "2024-01-01T00:00:00Z"), Utc::now())).await;
        f.queue.close().await.unwrap();

        assert_eq!(f.processor.handle(&job).await.unwrap(), 1);

        assert!(f.store.get("a").is_some());
        assert_eq!(f.metrics.total_processed(), 1);
        assert_eq!(f.metrics.unacknowledged_jobs(), 1);
        assert_eq!(f.queue.status(&job.id), Some(JobStatus::Active));
    }

    #[tokio::test]
    async fn unparseable_timestamp_fails_permanently() {
        let f = fixture();
        let job = claim(&f.queue, Job::single(raw("a", "soon"), Utc::now())).await;

        let err = f.processor.handle(&job).await.unwrap_err();

        assert!(matches!(err, PulseError::Validation { .. }));
        assert!(matches!(f.queue.status(&job.id), Some(JobStatus::Failed(_))));
        assert_eq!(f.store.insert_calls(), 0);
    }
}
