//! Integration tests for the ingestion engine.
//!
//! Runs the full admit, queue, process and persist path against the
//! in-memory queue and event store.

use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

use pulse_core::{
    Clock, NotificationHandler, ProcessedNotification, PulseError, RawEvent, RealClock, TestClock,
};
use pulse_pipeline::{
    queue::{JobQueue, JobStatus, MemoryJobQueue},
    retry::RetryPolicy,
    storage::mock::MemoryEventStore,
    worker_pool::WorkerPoolConfig,
    AdmissionConfig, CircuitConfig, CircuitState, EngineConfig, HealthStatus, IngestEngine,
    ShutdownCoordinator, ShutdownOutcome, ShutdownPlan, UnhealthyReason,
};

#[derive(Debug, Default)]
struct Recorder {
    seen: AtomicUsize,
}

#[async_trait::async_trait]
impl NotificationHandler for Recorder {
    async fn handle(&self, _notification: &ProcessedNotification) {
        self.seen.fetch_add(1, Ordering::SeqCst);
    }
}

struct Harness {
    engine: Arc<IngestEngine>,
    queue: Arc<MemoryJobQueue>,
    store: Arc<MemoryEventStore>,
}

fn harness(config: EngineConfig, clock: Arc<dyn Clock>) -> Harness {
    let queue = Arc::new(MemoryJobQueue::with_clock(
        RetryPolicy::exponential(3, Duration::from_millis(10)),
        clock.clone(),
    ));
    let store = Arc::new(MemoryEventStore::new());
    let engine = Arc::new(IngestEngine::new(config, queue.clone(), store.clone(), clock));
    Harness { engine, queue, store }
}

fn fast_config() -> EngineConfig {
    EngineConfig {
        workers: WorkerPoolConfig {
            concurrency: 4,
            poll_interval: Duration::from_millis(5),
            error_backoff: Duration::from_millis(5),
        },
        ..EngineConfig::default()
    }
}

fn event(id: usize) -> RawEvent {
    RawEvent {
        event_id: format!("evt-{id}"),
        device_id: format!("device-{}", id % 7),
        sensor_type: "humidity".to_string(),
        value: id as f64 / 10.0,
        unit: "percent".to_string(),
        timestamp: "2024-03-01T12:00:00Z".to_string(),
        metadata: None,
    }
}

async fn wait_for(mut condition: impl FnMut() -> bool) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met within 5s");
}

#[tokio::test]
async fn admitted_batch_is_persisted_and_announced() {
    let h = harness(fast_config(), Arc::new(RealClock::new()));
    let recorder = Arc::new(Recorder::default());
    h.engine.notifications().subscribe(recorder.clone()).unwrap();
    h.engine.start().await;

    let events: Vec<_> = (0..2500).map(event).collect();
    let jobs = h.engine.admission().admit_batch(events).await.unwrap();
    assert_eq!(jobs, 3);

    wait_for(|| h.store.row_count() == 2500).await;
    wait_for(|| recorder.seen.load(Ordering::SeqCst) == 2500).await;

    let metrics = h.engine.metrics().await;
    assert_eq!(metrics.total_received, 2500);
    assert_eq!(metrics.total_processed, 2500);
    assert_eq!(metrics.total_failed, 0);
    assert_eq!(metrics.queue_depth, 0);

    h.engine.close_workers().await.unwrap();
}

#[tokio::test]
async fn duplicate_events_are_stored_once() {
    let h = harness(fast_config(), Arc::new(RealClock::new()));
    h.engine.start().await;

    h.engine.admission().admit_one(event(1)).await.unwrap();
    wait_for(|| h.store.row_count() == 1).await;

    h.engine.admission().admit_one(event(1)).await.unwrap();
    h.engine.admission().admit_batch(vec![event(1), event(2)]).await.unwrap();
    wait_for(|| h.store.row_count() == 2).await;

    h.engine.close_workers().await.unwrap();
    assert_eq!(h.store.row_count(), 2);
}

#[tokio::test]
async fn admission_rejects_once_queue_reaches_threshold() {
    let config = EngineConfig {
        admission: AdmissionConfig { backpressure_threshold: 3, ..AdmissionConfig::default() },
        ..fast_config()
    };
    let h = harness(config, Arc::new(RealClock::new()));

    for id in 0..3 {
        h.engine.admission().admit_one(event(id)).await.unwrap();
    }

    let err = h.engine.admission().admit_one(event(99)).await.unwrap_err();
    assert!(matches!(err, PulseError::QueueOverloaded { depth: 3, threshold: 3 }));
    assert_eq!(
        h.engine.health().await,
        HealthStatus::Unhealthy { reason: UnhealthyReason::QueueOverloaded }
    );
}

#[tokio::test]
async fn transient_store_failure_is_retried_to_completion() {
    let h = harness(fast_config(), Arc::new(RealClock::new()));
    h.store.fail_next(1);
    h.engine.start().await;

    h.engine.admission().admit_one(event(5)).await.unwrap();

    wait_for(|| h.store.row_count() == 1).await;
    wait_for(|| h.queue.status(&"evt-5".into()) == Some(JobStatus::Completed)).await;
    let metrics = h.engine.metrics().await;
    assert_eq!(metrics.total_failed, 1);
    assert_eq!(metrics.total_processed, 1);

    h.engine.close_workers().await.unwrap();
}

#[tokio::test]
async fn health_reports_open_circuit_before_other_checks() {
    let clock = Arc::new(TestClock::new());
    let config = EngineConfig {
        circuit: CircuitConfig { failure_threshold: 2, cooldown: Duration::from_secs(30) },
        ..fast_config()
    };
    let h = harness(config, clock.clone());
    assert_eq!(h.engine.health().await, HealthStatus::Healthy);

    h.store.set_unavailable(true);
    assert_eq!(
        h.engine.health().await,
        HealthStatus::Unhealthy { reason: UnhealthyReason::StoreUnreachable }
    );
    // second failed probe trips the breaker
    let _ = h.engine.health().await;
    assert_eq!(h.engine.circuit_state(), CircuitState::Open);
    assert_eq!(
        h.engine.health().await,
        HealthStatus::Unhealthy { reason: UnhealthyReason::CircuitOpen }
    );

    h.store.set_unavailable(false);
    clock.advance(Duration::from_secs(30));
    assert_eq!(h.engine.health().await, HealthStatus::Healthy);
    assert_eq!(h.engine.circuit_state(), CircuitState::Closed);
}

#[tokio::test]
async fn shutdown_plan_drains_in_flight_work_before_closing_store() {
    let h = harness(fast_config(), Arc::new(RealClock::new()));
    h.store.set_delay(Some(Duration::from_millis(200)));
    h.engine.start().await;

    h.engine.admission().admit_one(event(7)).await.unwrap();
    wait_for(|| h.store.insert_calls() == 1).await;

    let workers = Arc::clone(&h.engine);
    let queue = Arc::clone(&h.engine);
    let store = Arc::clone(&h.engine);
    let plan = ShutdownPlan::new()
        .step("close_workers", async move { workers.close_workers().await })
        .step("close_queue", async move { queue.close_queue().await })
        .step("close_store", async move { store.close_store().await });

    let outcome = ShutdownCoordinator::new(Duration::from_secs(5)).run(plan).await;

    assert_eq!(outcome, Some(ShutdownOutcome::Completed));
    assert_eq!(h.store.row_count(), 1);
    assert!(h.store.is_closed());
    assert!(h.queue.depth().await.is_err(), "queue should reject calls after close");
}

#[tokio::test]
async fn closing_queue_twice_fails_the_step() {
    let h = harness(fast_config(), Arc::new(RealClock::new()));
    h.engine.close_queue().await.unwrap();

    let err = h.engine.close_queue().await.unwrap_err();
    assert_eq!(err.code(), "E3004");
}
