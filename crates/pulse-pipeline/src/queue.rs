//! Durable job queue used between admission and the worker pool.
//!
//! The pipeline only needs enqueue, depth, dequeue-for-drain and close. Job
//! ids are the dedup key: re-enqueueing a known id is a no-op, including ids
//! of jobs that already completed. Finished jobs are kept for a dedup window
//! and then removed with [`JobQueue::purge_finished`].
//!
//! # Job lifecycle
//!
//! ```text
//!   enqueue ──▶ waiting ──dequeue──▶ active ──complete──▶ completed
//!                  ▲                   │
//!                  │   retryable fail  │ non-retryable or out of attempts
//!                  └───────────────────┤
//!                                      ▼
//!                                    failed
//! ```

use std::{
    collections::{HashMap, VecDeque},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use chrono::{DateTime, Utc};
use pulse_core::{Clock, Job, JobId, JobPayload, PulseError, QueueDepth, RealClock, Result};
use sqlx::{types::Json, PgPool, Postgres, QueryBuilder};
use tracing::{debug, info, warn};

use crate::{
    retry::{RetryDecision, RetryPolicy},
    storage::StoreFuture,
};

/// Queue operations used by admission and workers.
pub trait JobQueue: Send + Sync + 'static {
    /// Adds a job. Returns `false` if a job with the same id already exists.
    fn enqueue(&self, job: Job) -> StoreFuture<'_, bool>;

    /// Adds jobs in order. Returns how many were new.
    fn enqueue_all(&self, jobs: Vec<Job>) -> StoreFuture<'_, usize>;

    /// Current waiting and active counts.
    fn depth(&self) -> StoreFuture<'_, QueueDepth>;

    /// Claims the oldest ready job, if any.
    fn dequeue(&self) -> StoreFuture<'_, Option<Job>>;

    /// Marks a claimed job as done.
    fn complete<'a>(&'a self, id: &'a JobId) -> StoreFuture<'a, ()>;

    /// Reports a claimed job as failed; the queue decides on redelivery.
    fn fail<'a>(&'a self, id: &'a JobId, error: &'a PulseError) -> StoreFuture<'a, ()>;

    /// Deletes completed and failed jobs that finished before `before`.
    /// Their ids become available for enqueue again. Returns rows removed.
    fn purge_finished(&self, before: DateTime<Utc>) -> StoreFuture<'_, u64>;

    /// Releases the queue handle. Later calls fail with `PulseError::Queue`.
    fn close(&self) -> StoreFuture<'_, ()>;
}

fn closed_error() -> PulseError {
    PulseError::queue("queue is closed")
}

/// Queue backed by the `ingest_jobs` table.
///
/// Workers claim with `FOR UPDATE SKIP LOCKED`, so any number of consumers
/// (and processes) can drain the same queue without contention.
pub struct PostgresJobQueue {
    pool: PgPool,
    queue_name: String,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
    closed: AtomicBool,
}

impl PostgresJobQueue {
    /// Creates a queue handle for `queue_name`.
    pub fn new(pool: PgPool, queue_name: impl Into<String>, policy: RetryPolicy) -> Self {
        Self {
            pool,
            queue_name: queue_name.into(),
            policy,
            clock: Arc::new(RealClock::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Returns jobs left active by a previous process to the waiting state.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    pub async fn requeue_active(&self) -> Result<u64> {
        let result = sqlx::query(
            r#"
            UPDATE ingest_jobs
            SET status = 'waiting', updated_at = NOW()
            WHERE queue_name = $1 AND status = 'active'
            "#,
        )
        .bind(&self.queue_name)
        .execute(&self.pool)
        .await?;

        let requeued = result.rows_affected();
        if requeued > 0 {
            info!(queue = %self.queue_name, requeued, "requeued jobs left active by previous run");
        }
        Ok(requeued)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(closed_error());
        }
        Ok(())
    }

    async fn insert_jobs(&self, jobs: &[Job]) -> Result<u64> {
        if jobs.is_empty() {
            return Ok(0);
        }

        let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(
            "INSERT INTO ingest_jobs (queue_name, job_id, payload, enqueued_at, available_at) ",
        );
        builder.push_values(jobs, |mut row, job| {
            row.push_bind(&self.queue_name)
                .push_bind(job.id.as_str())
                .push_bind(Json(&job.payload))
                .push_bind(job.enqueued_at)
                .push_bind(job.enqueued_at);
        });
        builder.push(" ON CONFLICT (queue_name, job_id) DO NOTHING");

        let result = builder.build().execute(&self.pool).await?;
        Ok(result.rows_affected())
    }
}

impl JobQueue for PostgresJobQueue {
    fn enqueue(&self, job: Job) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            self.ensure_open()?;
            let inserted = self.insert_jobs(std::slice::from_ref(&job)).await?;
            Ok(inserted == 1)
        })
    }

    fn enqueue_all(&self, jobs: Vec<Job>) -> StoreFuture<'_, usize> {
        Box::pin(async move {
            self.ensure_open()?;
            let inserted = self.insert_jobs(&jobs).await?;
            Ok(usize::try_from(inserted).unwrap_or(usize::MAX))
        })
    }

    fn depth(&self) -> StoreFuture<'_, QueueDepth> {
        Box::pin(async move {
            self.ensure_open()?;
            let (waiting, active): (i64, i64) = sqlx::query_as(
                r#"
                SELECT COUNT(*) FILTER (WHERE status = 'waiting'),
                       COUNT(*) FILTER (WHERE status = 'active')
                FROM ingest_jobs
                WHERE queue_name = $1 AND status IN ('waiting', 'active')
                "#,
            )
            .bind(&self.queue_name)
            .fetch_one(&self.pool)
            .await?;

            Ok(QueueDepth {
                waiting: u64::try_from(waiting).unwrap_or(0),
                active: u64::try_from(active).unwrap_or(0),
            })
        })
    }

    fn dequeue(&self) -> StoreFuture<'_, Option<Job>> {
        Box::pin(async move {
            self.ensure_open()?;
            let now = self.clock.now_utc();
            let mut tx = self.pool.begin().await?;

            let job_id: Option<String> = sqlx::query_scalar(
                r#"
                SELECT job_id FROM ingest_jobs
                WHERE queue_name = $1
                  AND status = 'waiting'
                  AND available_at <= $2
                ORDER BY available_at ASC, seq ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
                "#,
            )
            .bind(&self.queue_name)
            .bind(now)
            .fetch_optional(&mut *tx)
            .await?;

            let Some(job_id) = job_id else {
                tx.rollback().await?;
                return Ok(None);
            };

            let (id, payload, enqueued_at, attempts): (String, Json<JobPayload>, DateTime<Utc>, i32) =
                sqlx::query_as(
                    r#"
                    UPDATE ingest_jobs
                    SET status = 'active', attempts = attempts + 1, updated_at = NOW()
                    WHERE queue_name = $1 AND job_id = $2
                    RETURNING job_id, payload, enqueued_at, attempts
                    "#,
                )
                .bind(&self.queue_name)
                .bind(&job_id)
                .fetch_one(&mut *tx)
                .await?;

            tx.commit().await?;

            Ok(Some(Job {
                id: JobId(id),
                payload: payload.0,
                enqueued_at,
                attempts: u32::try_from(attempts).unwrap_or(0),
            }))
        })
    }

    fn complete<'a>(&'a self, id: &'a JobId) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            sqlx::query(
                r#"
                UPDATE ingest_jobs
                SET status = 'completed', last_error = NULL, updated_at = NOW()
                WHERE queue_name = $1 AND job_id = $2
                "#,
            )
            .bind(&self.queue_name)
            .bind(id.as_str())
            .execute(&self.pool)
            .await?;
            Ok(())
        })
    }

    fn fail<'a>(&'a self, id: &'a JobId, error: &'a PulseError) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            self.ensure_open()?;
            let mut tx = self.pool.begin().await?;

            let attempts: Option<i32> = sqlx::query_scalar(
                r#"
                SELECT attempts FROM ingest_jobs
                WHERE queue_name = $1 AND job_id = $2 AND status = 'active'
                FOR UPDATE
                "#,
            )
            .bind(&self.queue_name)
            .bind(id.as_str())
            .fetch_optional(&mut *tx)
            .await?;

            let Some(attempts) = attempts else {
                tx.rollback().await?;
                warn!(job_id = %id, "failure reported for job that is not active");
                return Ok(());
            };

            let attempt = u32::try_from(attempts).unwrap_or(0);
            match self.policy.decide(attempt, error, self.clock.now_utc()) {
                RetryDecision::Retry { next_attempt_at } => {
                    sqlx::query(
                        r#"
                        UPDATE ingest_jobs
                        SET status = 'waiting', available_at = $3, last_error = $4, updated_at = NOW()
                        WHERE queue_name = $1 AND job_id = $2
                        "#,
                    )
                    .bind(&self.queue_name)
                    .bind(id.as_str())
                    .bind(next_attempt_at)
                    .bind(error.to_string())
                    .execute(&mut *tx)
                    .await?;
                    debug!(job_id = %id, attempt, %next_attempt_at, "job scheduled for redelivery");
                },
                RetryDecision::GiveUp { reason } => {
                    sqlx::query(
                        r#"
                        UPDATE ingest_jobs
                        SET status = 'failed', last_error = $3, updated_at = NOW()
                        WHERE queue_name = $1 AND job_id = $2
                        "#,
                    )
                    .bind(&self.queue_name)
                    .bind(id.as_str())
                    .bind(error.to_string())
                    .execute(&mut *tx)
                    .await?;
                    warn!(job_id = %id, attempt, reason = %reason, "job permanently failed");
                },
            }

            tx.commit().await?;
            Ok(())
        })
    }

    fn purge_finished(&self, before: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            self.ensure_open()?;
            let result = sqlx::query(
                r#"
                DELETE FROM ingest_jobs
                WHERE queue_name = $1
                  AND status IN ('completed', 'failed')
                  AND updated_at < $2
                "#,
            )
            .bind(&self.queue_name)
            .bind(before)
            .execute(&self.pool)
            .await?;

            let purged = result.rows_affected();
            if purged > 0 {
                debug!(queue = %self.queue_name, purged, %before, "finished jobs purged");
            }
            Ok(purged)
        })
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            if self.closed.swap(true, Ordering::AcqRel) {
                return Err(closed_error());
            }
            info!(queue = %self.queue_name, "job queue closed");
            Ok(())
        })
    }
}

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobStatus {
    /// Ready or scheduled for redelivery.
    Waiting,
    /// Claimed by a worker.
    Active,
    /// Processed successfully.
    Completed,
    /// Gave up on; holds the last error.
    Failed(String),
}

#[derive(Debug)]
struct JobRecord {
    job: Job,
    status: JobStatus,
    available_at: DateTime<Utc>,
    seq: u64,
    finished_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct MemoryQueueState {
    records: HashMap<JobId, JobRecord>,
    order: VecDeque<JobId>,
    depth: QueueDepth,
    next_seq: u64,
    closed: bool,
}

/// Moves one job between depth buckets. Finished statuses have no bucket.
fn shift(depth: &mut QueueDepth, from: &JobStatus, to: &JobStatus) {
    match from {
        JobStatus::Waiting => depth.waiting = depth.waiting.saturating_sub(1),
        JobStatus::Active => depth.active = depth.active.saturating_sub(1),
        JobStatus::Completed | JobStatus::Failed(_) => {},
    }
    match to {
        JobStatus::Waiting => depth.waiting += 1,
        JobStatus::Active => depth.active += 1,
        JobStatus::Completed | JobStatus::Failed(_) => {},
    }
}

/// In-process queue for development and tests.
///
/// Same contract as [`PostgresJobQueue`] without durability across restarts.
#[derive(Debug)]
pub struct MemoryJobQueue {
    state: Mutex<MemoryQueueState>,
    policy: RetryPolicy,
    clock: Arc<dyn Clock>,
}

impl MemoryJobQueue {
    /// Creates an empty queue.
    pub fn new(policy: RetryPolicy) -> Self {
        Self::with_clock(policy, Arc::new(RealClock::new()))
    }

    /// Creates an empty queue reading time from `clock`.
    pub fn with_clock(policy: RetryPolicy, clock: Arc<dyn Clock>) -> Self {
        Self { state: Mutex::new(MemoryQueueState::default()), policy, clock }
    }

    /// Status of a known job.
    pub fn status(&self, id: &JobId) -> Option<JobStatus> {
        self.lock().records.get(id).map(|record| record.status.clone())
    }

    /// Number of jobs held, finished ones included.
    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    /// Whether the queue holds no jobs at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Ids of jobs in submission order, regardless of status.
    pub fn job_ids(&self) -> Vec<JobId> {
        let state = self.lock();
        let mut ids: Vec<_> = state.records.values().map(|r| (r.seq, r.job.id.clone())).collect();
        ids.sort();
        ids.into_iter().map(|(_, id)| id).collect()
    }

    /// A known job by id.
    pub fn job(&self, id: &JobId) -> Option<Job> {
        self.lock().records.get(id).map(|record| record.job.clone())
    }

    fn lock(&self) -> MutexGuard<'_, MemoryQueueState> {
        self.state.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn push(state: &mut MemoryQueueState, job: Job) -> bool {
        if state.records.contains_key(&job.id) {
            return false;
        }
        let id = job.id.clone();
        let available_at = job.enqueued_at;
        let seq = state.next_seq;
        state.next_seq += 1;
        state.records.insert(
            id.clone(),
            JobRecord { job, status: JobStatus::Waiting, available_at, seq, finished_at: None },
        );
        state.order.push_back(id);
        state.depth.waiting += 1;
        true
    }

    fn locked_open(&self) -> Result<MutexGuard<'_, MemoryQueueState>> {
        let state = self.lock();
        if state.closed {
            return Err(closed_error());
        }
        Ok(state)
    }
}

impl JobQueue for MemoryJobQueue {
    fn enqueue(&self, job: Job) -> StoreFuture<'_, bool> {
        Box::pin(async move {
            let mut state = self.locked_open()?;
            Ok(Self::push(&mut state, job))
        })
    }

    fn enqueue_all(&self, jobs: Vec<Job>) -> StoreFuture<'_, usize> {
        Box::pin(async move {
            let mut state = self.locked_open()?;
            Ok(jobs.into_iter().map(|job| Self::push(&mut state, job)).filter(|new| *new).count())
        })
    }

    fn depth(&self) -> StoreFuture<'_, QueueDepth> {
        Box::pin(async move {
            Ok(self.locked_open()?.depth)
        })
    }

    fn dequeue(&self) -> StoreFuture<'_, Option<Job>> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            let mut state = self.locked_open()?;
            let state = &mut *state;

            let position = state.order.iter().position(|id| {
                state.records.get(id).is_some_and(|r| r.status == JobStatus::Waiting && r.available_at <= now)
            });
            let Some(id) = position.and_then(|p| state.order.remove(p)) else {
                return Ok(None);
            };

            let Some(record) = state.records.get_mut(&id) else {
                return Ok(None);
            };
            shift(&mut state.depth, &record.status, &JobStatus::Active);
            record.status = JobStatus::Active;
            record.job.attempts += 1;
            Ok(Some(record.job.clone()))
        })
    }

    fn complete<'a>(&'a self, id: &'a JobId) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            let mut state = self.locked_open()?;
            let state = &mut *state;
            if let Some(record) = state.records.get_mut(id) {
                if record.finished_at.is_none() {
                    shift(&mut state.depth, &record.status, &JobStatus::Completed);
                    record.finished_at = Some(now);
                }
                record.status = JobStatus::Completed;
            }
            Ok(())
        })
    }

    fn fail<'a>(&'a self, id: &'a JobId, error: &'a PulseError) -> StoreFuture<'a, ()> {
        Box::pin(async move {
            let now = self.clock.now_utc();
            let mut state = self.locked_open()?;
            let state = &mut *state;

            let Some(record) = state.records.get_mut(id).filter(|r| r.status == JobStatus::Active) else {
                warn!(job_id = %id, "failure reported for job that is not active");
                return Ok(());
            };

            let attempt = record.job.attempts;
            match self.policy.decide(attempt, error, now) {
                RetryDecision::Retry { next_attempt_at } => {
                    let previous = std::mem::replace(&mut record.status, JobStatus::Waiting);
                    shift(&mut state.depth, &previous, &record.status);
                    record.available_at = next_attempt_at;
                    state.order.push_back(id.clone());
                    debug!(job_id = %id, attempt, %next_attempt_at, "job scheduled for redelivery");
                },
                RetryDecision::GiveUp { reason } => {
                    let previous =
                        std::mem::replace(&mut record.status, JobStatus::Failed(error.to_string()));
                    shift(&mut state.depth, &previous, &record.status);
                    record.finished_at = Some(now);
                    warn!(job_id = %id, attempt, reason = %reason, "job permanently failed");
                },
            }
            Ok(())
        })
    }

    fn purge_finished(&self, before: DateTime<Utc>) -> StoreFuture<'_, u64> {
        Box::pin(async move {
            let mut state = self.locked_open()?;
            let held = state.records.len();
            state.records.retain(|_, record| record.finished_at.map_or(true, |at| at >= before));
            let purged = (held - state.records.len()) as u64;
            if purged > 0 {
                debug!(purged, %before, "finished jobs purged");
            }
            Ok(purged)
        })
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            let mut state = self.locked_open()?;
            state.closed = true;
            info!("in-memory job queue closed");
            Ok(())
        })
    }
}
