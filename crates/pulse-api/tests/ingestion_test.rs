//! Integration tests for the event ingestion endpoints.
//!
//! Drives `/api/events` and `/api/events/batch` through the full router on
//! top of the in-memory pipeline harness.

use std::{sync::Arc, time::Duration};

use axum::{
    body::{to_bytes, Body},
    http::{Request, StatusCode},
    Router,
};
use chrono::{DateTime, Utc};
use pulse_api::{create_router, AppState, Broadcaster, HttpLimits};
use pulse_core::{Job, JobId, PulseError, QueueDepth, RealClock};
use pulse_pipeline::{
    queue::{JobQueue, MemoryJobQueue},
    retry::RetryPolicy,
    storage::{mock::MemoryEventStore, StoreFuture},
    EngineConfig, IngestEngine, LargePayloadParser,
};
use pulse_testing::{fixtures, EventBuilder, TestEnv};
use serde_json::{json, Value};
use tower::ServiceExt;

fn app(env: &TestEnv, parse_threshold: usize) -> Router {
    let state = AppState {
        engine: Arc::clone(&env.engine),
        broadcaster: Arc::new(Broadcaster::new(16, 4)),
        parser: LargePayloadParser::new(2, parse_threshold),
        clock: Arc::new(env.clock.clone()),
    };
    create_router(state, HttpLimits::default())
}

fn post(uri: &str, body: &Value) -> Request<Body> {
    Request::builder()
        .method("POST")
        .uri(uri)
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(body).unwrap()))
        .unwrap()
}

async fn send(app: Router, request: Request<Body>) -> (StatusCode, Value) {
    let response = app.oneshot(request).await.expect("request failed");
    let status = response.status();
    assert!(response.headers().contains_key("x-request-id"), "missing X-Request-Id");
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    let body = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, body)
}

#[tokio::test]
async fn single_event_is_accepted_and_queued() {
    let env = TestEnv::new();
    let event = EventBuilder::new().id("evt-100").build_json();

    let (status, body) = send(app(&env, 1 << 20), post("/api/events", &event)).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, json!({ "status": "accepted", "event_id": "evt-100" }));
    assert_eq!(env.queue.job_ids().len(), 1);

    env.process_pending().await.unwrap();
    assert!(env.store.get("evt-100").is_some());
}

#[tokio::test]
async fn invalid_event_is_rejected_with_validation_code() {
    let env = TestEnv::new();
    let event = json!({ "event_id": "x", "device_id": "d", "sensor_type": "t", "value": 1,
                        "unit": "u", "timestamp": "not-a-time" });

    let (status, body) = send(app(&env, 1 << 20), post("/api/events", &event)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "E1001");
    assert!(env.queue.job_ids().is_empty());
}

#[tokio::test]
async fn malformed_json_is_a_bad_request() {
    let env = TestEnv::new();
    let request = Request::builder()
        .method("POST")
        .uri("/api/events")
        .body(Body::from("{\"event_id\": "))
        .unwrap();

    let (status, body) = send(app(&env, 1 << 20), request).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "E1001");
}

#[tokio::test]
async fn overloaded_queue_returns_503() {
    let env = TestEnv::builder().backpressure_threshold(1).build();
    env.admit(EventBuilder::new().build()).await.unwrap();

    let (status, body) =
        send(app(&env, 1 << 20), post("/api/events", &EventBuilder::new().build_json())).await;

    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(body["error"]["code"], "E3001");
}

#[tokio::test]
async fn partial_batch_reports_invalid_indexes() {
    let env = TestEnv::new();
    let batch = fixtures::batch_json("b", 8, &[0, 3, 7]);

    let (status, body) = send(app(&env, 1 << 20), post("/api/events/batch", &batch)).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body, json!({ "accepted": 5, "rejected": 3, "invalid_indexes": [0, 3, 7] }));

    env.process_pending().await.unwrap();
    assert_eq!(env.store.row_count(), 5);
}

#[tokio::test]
async fn batch_with_no_valid_elements_is_rejected() {
    let env = TestEnv::new();
    let batch = fixtures::batch_json("b", 3, &[0, 1, 2]);

    let (status, body) = send(app(&env, 1 << 20), post("/api/events/batch", &batch)).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["error"]["code"], "E1001");
}

#[tokio::test]
async fn oversize_batch_returns_413() {
    let env = TestEnv::builder().max_batch_size(5).build();
    let batch = fixtures::batch_json("b", 6, &[]);

    let (status, body) = send(app(&env, 1 << 20), post("/api/events/batch", &batch)).await;

    assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
    assert_eq!(body["error"]["code"], "E1002");
}

#[tokio::test]
async fn large_batches_parse_through_offload_path() {
    let env = TestEnv::new();
    let batch = fixtures::batch_json("large", 2500, &[]);

    let (status, body) = send(app(&env, 1024), post("/api/events/batch", &batch)).await;

    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["accepted"], 2500);
    assert_eq!(env.queue.job_ids().len(), 3);
}

#[tokio::test]
async fn non_array_batch_body_is_a_bad_request() {
    let env = TestEnv::new();

    let (status, _) =
        send(app(&env, 1 << 20), post("/api/events/batch", &json!({ "events": [] }))).await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
}

/// Memory queue whose enqueues take a while to land.
#[derive(Debug)]
struct SlowQueue {
    inner: MemoryJobQueue,
    delay: Duration,
}

impl JobQueue for SlowQueue {
    fn enqueue(&self, job: Job) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            self.inner.enqueue(job).await
        })
    }

    fn enqueue_all(&self, jobs: Vec<Job>) -> StoreFuture<'_, usize> {
        Box::pin(async move {
            tokio::time::sleep(self.delay).await;
            self.inner.enqueue_all(jobs).await
        })
    }

    fn depth(&self) -> StoreFuture<'_, QueueDepth> {
        self.inner.depth()
    }

    fn dequeue(&self) -> StoreFuture<'_, Option<Job>> {
        self.inner.dequeue()
    }

    fn complete<'a>(&'a self, id: &'a JobId) -> StoreFuture<'a, ()> {
        self.inner.complete(id)
    }

    fn fail<'a>(&'a self, id: &'a JobId, error: &'a PulseError) -> StoreFuture<'a, ()> {
        self.inner.fail(id, error)
    }

    fn purge_finished(&self, before: DateTime<Utc>) -> StoreFuture<'_, u64> {
        self.inner.purge_finished(before)
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        self.inner.close()
    }
}

fn slow_app(queue: Arc<SlowQueue>) -> Router {
    let clock = Arc::new(RealClock::new());
    let engine = IngestEngine::new(
        EngineConfig::default(),
        queue,
        Arc::new(MemoryEventStore::new()),
        clock.clone(),
    );
    let state = AppState {
        engine: Arc::new(engine),
        broadcaster: Arc::new(Broadcaster::new(16, 4)),
        parser: LargePayloadParser::new(1, 1 << 20),
        clock,
    };
    let limits = HttpLimits { request_timeout: Duration::from_millis(50), ..HttpLimits::default() };
    create_router(state, limits)
}

fn slow_queue() -> Arc<SlowQueue> {
    Arc::new(SlowQueue {
        inner: MemoryJobQueue::new(RetryPolicy::default()),
        delay: Duration::from_millis(200),
    })
}

#[tokio::test]
async fn timed_out_request_still_completes_started_enqueue() {
    let queue = slow_queue();
    let event = EventBuilder::new().id("late-1").build_json();

    let (status, _) = send(slow_app(queue.clone()), post("/api/events", &event)).await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);
    assert!(queue.inner.job(&JobId::from("late-1")).is_none(), "enqueue should still be sleeping");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(queue.inner.job(&JobId::from("late-1")).is_some());
}

#[tokio::test]
async fn timed_out_batch_still_completes_started_enqueue() {
    let queue = slow_queue();
    let batch = fixtures::batch_json("late", 3, &[]);

    let (status, _) = send(slow_app(queue.clone()), post("/api/events/batch", &batch)).await;
    assert_eq!(status, StatusCode::REQUEST_TIMEOUT);

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(queue.inner.job_ids().len(), 3);
}
