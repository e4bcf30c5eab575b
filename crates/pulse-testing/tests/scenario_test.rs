//! Deterministic pipeline scenarios on the in-memory harness.

use std::time::Duration;

use anyhow::Result;
use pulse_core::{validation::partition_batch, JobId, PulseError};
use pulse_pipeline::{queue::JobStatus, CircuitState};
use pulse_testing::{fixtures, property, EventBuilder, TestEnv};
use proptest::prelude::*;

#[tokio::test]
async fn batch_of_2500_becomes_three_stable_jobs() -> Result<()> {
    let env = TestEnv::new();
    let events = fixtures::events("evt", 2500);

    assert_eq!(env.admit_batch(events.clone()).await?, 3);
    assert_eq!(
        env.queue.job_ids(),
        vec![
            JobId::from("batch-0-evt-0-1000"),
            JobId::from("batch-1000-evt-1000-1000"),
            JobId::from("batch-2000-evt-2000-500"),
        ]
    );

    // resubmitting the same batch creates nothing new
    assert_eq!(env.admit_batch(events).await?, 0);

    assert_eq!(env.process_pending().await?, 3);
    assert_eq!(env.store.row_count(), 2500);
    Ok(())
}

#[tokio::test]
async fn repeated_processing_stores_each_event_once() -> Result<()> {
    let env = TestEnv::new();
    let event = EventBuilder::new().id("dup-1").build();

    env.admit(event.clone()).await?;
    env.process_pending().await?;
    env.admit(event.clone()).await?;
    env.admit_batch(vec![event, EventBuilder::new().id("dup-2").build()]).await?;
    env.process_pending().await?;

    assert_eq!(env.store.row_count(), 2);
    let metrics = env.engine.metrics().await;
    assert_eq!(metrics.total_received, 4);
    Ok(())
}

#[tokio::test]
async fn backpressure_boundary_applies_to_single_and_batch() -> Result<()> {
    let env = TestEnv::builder().backpressure_threshold(2).build();

    env.admit(EventBuilder::new().build()).await?;
    env.admit(EventBuilder::new().build()).await?;

    let single = env.engine.admission().admit_one(EventBuilder::new().build()).await.unwrap_err();
    assert!(matches!(single, PulseError::QueueOverloaded { depth: 2, .. }));

    let batch =
        env.engine.admission().admit_batch(fixtures::events("over", 3)).await.unwrap_err();
    assert!(matches!(batch, PulseError::QueueOverloaded { .. }));

    env.process_pending().await?;
    env.admit_batch(fixtures::events("after", 5)).await?;
    Ok(())
}

#[tokio::test]
async fn oversize_batch_is_rejected_before_depth_check() {
    let env = TestEnv::builder().max_batch_size(10).backpressure_threshold(1).build();
    env.admit(EventBuilder::new().build()).await.unwrap();

    let err = env.engine.admission().admit_batch(fixtures::events("big", 11)).await.unwrap_err();

    assert!(matches!(err, PulseError::BatchTooLarge { size: 11, limit: 10 }));
}

#[tokio::test]
async fn failed_job_is_redelivered_after_backoff() -> Result<()> {
    let env = TestEnv::new();
    let id = JobId::from("retry-1");
    env.store.fail_next(1);

    env.admit(EventBuilder::new().id("retry-1").build()).await?;
    assert_eq!(env.process_pending().await?, 1);
    assert_eq!(env.queue.status(&id), Some(JobStatus::Waiting));
    assert_eq!(env.store.row_count(), 0);

    // not ready before the one second backoff
    assert_eq!(env.advance_and_process(Duration::from_millis(500)).await?, 0);
    assert_eq!(env.advance_and_process(Duration::from_millis(500)).await?, 1);

    assert_eq!(env.queue.status(&id), Some(JobStatus::Completed));
    assert_eq!(env.store.row_count(), 1);
    let metrics = env.engine.metrics().await;
    assert_eq!((metrics.total_processed, metrics.total_failed), (1, 1));
    Ok(())
}

#[tokio::test]
async fn job_fails_permanently_after_max_attempts() -> Result<()> {
    let env = TestEnv::new();
    let id = JobId::from("doomed");
    env.store.set_unavailable(true);

    env.admit(EventBuilder::new().id("doomed").build()).await?;
    env.process_pending().await?;
    env.advance_and_process(Duration::from_secs(1)).await?;
    env.advance_and_process(Duration::from_secs(2)).await?;

    assert!(matches!(env.queue.status(&id), Some(JobStatus::Failed(_))));
    assert_eq!(env.engine.metrics().await.total_failed, 3);
    Ok(())
}

#[tokio::test]
async fn open_circuit_fails_jobs_without_touching_store() -> Result<()> {
    let env = TestEnv::builder().circuit(2, Duration::from_secs(30)).build();
    env.store.set_unavailable(true);

    env.admit(EventBuilder::new().id("a").build()).await?;
    env.admit(EventBuilder::new().id("b").build()).await?;
    env.process_pending().await?;
    assert_eq!(env.engine.circuit_state(), CircuitState::Open);
    let calls = env.store.insert_calls();

    env.admit(EventBuilder::new().id("c").build()).await?;
    env.process_pending().await?;

    assert_eq!(env.store.insert_calls(), calls, "open breaker must not call the store");
    assert_eq!(env.queue.status(&JobId::from("c")), Some(JobStatus::Waiting));

    // store recovers; cooldown passes; the probe closes the breaker
    env.store.set_unavailable(false);
    env.advance_and_process(Duration::from_secs(30)).await?;
    assert_eq!(env.engine.circuit_state(), CircuitState::Closed);
    assert_eq!(env.store.row_count(), 3);
    Ok(())
}

#[tokio::test]
async fn finished_jobs_are_purged_after_dedup_window() -> Result<()> {
    let env = TestEnv::builder().dedup_window(Duration::from_secs(3600)).build();
    let event = EventBuilder::new().id("kept-1").build();

    env.admit(event.clone()).await?;
    env.process_pending().await?;

    env.advance_time(Duration::from_secs(1800));
    assert_eq!(env.engine.purge_finished_jobs().await?, 0);
    env.admit(event.clone()).await?;
    assert_eq!(env.process_pending().await?, 0, "id still reserved inside the window");

    env.advance_time(Duration::from_secs(1801));
    assert_eq!(env.engine.purge_finished_jobs().await?, 1);
    assert!(env.queue.is_empty());

    // past the window the id is accepted again; the store still dedups the row
    env.admit(event).await?;
    assert_eq!(env.process_pending().await?, 1);
    assert_eq!(env.store.row_count(), 1);
    assert_eq!(env.engine.metrics().await.queue_depth, 0);
    Ok(())
}

proptest! {
    #[test]
    fn partition_accounts_for_every_element((items, invalid) in property::mixed_batch(40)) {
        let n = items.len();
        let batch = partition_batch(items);
        prop_assert_eq!(batch.accepted(), n - invalid.len());
        prop_assert_eq!(batch.rejected(), invalid.len());
        prop_assert_eq!(batch.invalid_indexes, invalid);
    }

    #[test]
    fn generated_events_are_valid(event in property::raw_event()) {
        prop_assert!(event.validate().is_ok());
    }
}
