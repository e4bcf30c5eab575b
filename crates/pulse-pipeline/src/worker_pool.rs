//! Worker pool lifecycle with structured concurrency.
//!
//! Spawns a fixed number of queue consumers and stops them cooperatively:
//! `close` signals cancellation and then waits for every worker to finish
//! the job it is holding.

use std::{sync::Arc, time::Duration};

use pulse_core::{PulseError, Result};
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::{
    queue::JobQueue,
    worker::{JobProcessor, Worker},
};

/// Worker pool sizing and pacing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkerPoolConfig {
    /// Number of concurrent consumers.
    pub concurrency: usize,
    /// Sleep between polls of an empty queue.
    pub poll_interval: Duration,
    /// Sleep after a failed dequeue.
    pub error_backoff: Duration,
}

impl Default for WorkerPoolConfig {
    fn default() -> Self {
        Self {
            concurrency: 20,
            poll_interval: Duration::from_millis(100),
            error_backoff: Duration::from_secs(1),
        }
    }
}

/// Supervised set of queue consumers.
pub struct WorkerPool {
    queue: Arc<dyn JobQueue>,
    processor: Arc<JobProcessor>,
    config: WorkerPoolConfig,
    cancellation_token: CancellationToken,
    worker_handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Creates an idle pool.
    pub fn new(queue: Arc<dyn JobQueue>, processor: Arc<JobProcessor>, config: WorkerPoolConfig) -> Self {
        Self {
            queue,
            processor,
            config,
            cancellation_token: CancellationToken::new(),
            worker_handles: Mutex::new(Vec::new()),
        }
    }

    /// Spawns `concurrency` workers. Calling it on a running pool is a no-op.
    pub async fn spawn_workers(&self) {
        let mut handles = self.worker_handles.lock().await;
        if !handles.is_empty() {
            warn!("worker pool already running");
            return;
        }

        info!(worker_count = self.config.concurrency, "spawning workers");

        for worker_id in 0..self.config.concurrency {
            let worker = Worker::new(
                worker_id,
                self.queue.clone(),
                self.processor.clone(),
                self.config.poll_interval,
                self.config.error_backoff,
                self.cancellation_token.clone(),
            );

            handles.push(tokio::spawn(async move {
                worker.run().await;
                info!(worker_id, "worker stopped");
            }));
        }
    }

    /// Number of workers that have not exited.
    pub async fn active_workers(&self) -> usize {
        self.worker_handles.lock().await.iter().filter(|h| !h.is_finished()).count()
    }

    /// Stops all workers after their in-flight jobs finish.
    ///
    /// # Errors
    ///
    /// Returns `PulseError::ShutdownFailure` if any worker task panicked.
    pub async fn close(&self) -> Result<()> {
        self.cancellation_token.cancel();

        let handles = std::mem::take(&mut *self.worker_handles.lock().await);
        info!(worker_count = handles.len(), "waiting for workers to finish in-flight jobs");

        let mut panicked = 0;
        for (worker_id, result) in futures::future::join_all(handles).await.into_iter().enumerate() {
            if let Err(join_error) = result {
                error!(worker_id, error = %join_error, "worker task panicked during shutdown");
                panicked += 1;
            }
        }

        if panicked > 0 {
            return Err(PulseError::shutdown("close_workers", format!("{panicked} worker(s) panicked")));
        }

        info!("worker pool stopped");
        Ok(())
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        let active = self.worker_handles.get_mut().iter().filter(|h| !h.is_finished()).count();

        if active > 0 && !self.cancellation_token.is_cancelled() {
            error!(active_workers = active, "worker pool dropped while running, cancelling workers");
            self.cancellation_token.cancel();
        }
    }
}

impl std::fmt::Debug for WorkerPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerPool")
            .field("config", &self.config)
            .field("cancelled", &self.cancellation_token.is_cancelled())
            .finish_non_exhaustive()
    }
}
