//! Pipeline counters and the metrics snapshot.
//!
//! Counters are lock-free atomics bumped by admission and workers. Memory is
//! sampled from the OS on each snapshot.

use std::{
    sync::{
        atomic::{AtomicU64, Ordering},
        Mutex,
    },
    time::Instant,
};

use pulse_core::QueueDepth;
use serde::{Deserialize, Serialize};
use sysinfo::{Pid, ProcessRefreshKind, ProcessesToUpdate, System};

/// Point-in-time view of pipeline throughput.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    /// Events accepted by admission.
    pub total_received: u64,
    /// Events persisted by workers.
    pub total_processed: u64,
    /// Events in jobs that failed processing, counted per attempt.
    pub total_failed: u64,
    /// Waiting plus active jobs.
    pub queue_depth: u64,
    /// Processed events per second of uptime.
    pub events_per_second: f64,
    /// Resident memory of this process in MiB.
    pub memory_usage_mb: f64,
}

/// Shared counters.
#[derive(Debug)]
pub struct PipelineMetrics {
    total_received: AtomicU64,
    total_processed: AtomicU64,
    total_failed: AtomicU64,
    unacknowledged_jobs: AtomicU64,
    started_at: Instant,
    system: Mutex<System>,
    pid: Option<Pid>,
}

impl Default for PipelineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl PipelineMetrics {
    /// Creates zeroed counters; uptime starts now.
    pub fn new() -> Self {
        Self {
            total_received: AtomicU64::new(0),
            total_processed: AtomicU64::new(0),
            total_failed: AtomicU64::new(0),
            unacknowledged_jobs: AtomicU64::new(0),
            started_at: Instant::now(),
            system: Mutex::new(System::new()),
            pid: sysinfo::get_current_pid().ok(),
        }
    }

    /// Adds accepted events.
    pub fn record_received(&self, count: u64) {
        self.total_received.fetch_add(count, Ordering::Relaxed);
    }

    /// Adds persisted events.
    pub fn record_processed(&self, count: u64) {
        self.total_processed.fetch_add(count, Ordering::Relaxed);
    }

    /// Adds events from a failed job.
    pub fn record_failed(&self, count: u64) {
        self.total_failed.fetch_add(count, Ordering::Relaxed);
    }

    /// Counts a job whose events were persisted but whose completion the
    /// queue did not record.
    pub fn record_unacknowledged(&self) {
        self.unacknowledged_jobs.fetch_add(1, Ordering::Relaxed);
    }

    /// Events accepted so far.
    pub fn total_received(&self) -> u64 {
        self.total_received.load(Ordering::Relaxed)
    }

    /// Events persisted so far.
    pub fn total_processed(&self) -> u64 {
        self.total_processed.load(Ordering::Relaxed)
    }

    /// Failed events so far.
    pub fn total_failed(&self) -> u64 {
        self.total_failed.load(Ordering::Relaxed)
    }

    /// Persisted jobs left active in the queue after a failed acknowledgement.
    pub fn unacknowledged_jobs(&self) -> u64 {
        self.unacknowledged_jobs.load(Ordering::Relaxed)
    }

    /// Builds a snapshot using the given queue depth.
    pub fn snapshot(&self, depth: QueueDepth) -> MetricsSnapshot {
        let total_processed = self.total_processed();
        let uptime = self.started_at.elapsed().as_secs_f64();
        let events_per_second = if uptime > 0.0 { total_processed as f64 / uptime } else { 0.0 };

        MetricsSnapshot {
            total_received: self.total_received(),
            total_processed,
            total_failed: self.total_failed(),
            queue_depth: depth.total(),
            events_per_second: round2(events_per_second),
            memory_usage_mb: round2(self.memory_usage_mb()),
        }
    }

    fn memory_usage_mb(&self) -> f64 {
        let Some(pid) = self.pid else {
            return 0.0;
        };

        let mut system = self.system.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
        system.refresh_processes_specifics(
            ProcessesToUpdate::Some(&[pid]),
            true,
            ProcessRefreshKind::nothing().with_memory(),
        );

        system.process(pid).map_or(0.0, |process| process.memory() as f64 / (1024.0 * 1024.0))
    }
}

fn round2(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}
