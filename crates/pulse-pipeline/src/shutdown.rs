//! One-shot ordered shutdown with a watchdog.
//!
//! A [`ShutdownPlan`] is a list of named teardown steps run strictly in
//! order. The first failing step aborts the sequence; the whole sequence is
//! bounded by a timeout. The [`ShutdownCoordinator`] guarantees the plan runs
//! at most once no matter how many signals arrive.

use std::{
    sync::atomic::{AtomicBool, Ordering},
    time::Duration,
};

use futures::future::BoxFuture;
use pulse_core::{saturating_millis, Result};
use tracing::{error, info, warn};

/// Default watchdog for the whole shutdown sequence.
pub const DEFAULT_SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(60);

struct ShutdownStep {
    name: &'static str,
    action: BoxFuture<'static, Result<()>>,
}

/// Ordered teardown steps.
#[derive(Default)]
pub struct ShutdownPlan {
    steps: Vec<ShutdownStep>,
}

impl ShutdownPlan {
    /// Creates an empty plan.
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a step. The future does not run until the plan executes.
    #[must_use]
    pub fn step<F>(mut self, name: &'static str, action: F) -> Self
    where
        F: std::future::Future<Output = Result<()>> + Send + 'static,
    {
        self.steps.push(ShutdownStep { name, action: Box::pin(action) });
        self
    }

    /// Step names in execution order.
    pub fn step_names(&self) -> Vec<&'static str> {
        self.steps.iter().map(|s| s.name).collect()
    }
}

impl std::fmt::Debug for ShutdownPlan {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ShutdownPlan").field("steps", &self.step_names()).finish()
    }
}

/// How a shutdown ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShutdownOutcome {
    /// Every step succeeded.
    Completed,
    /// A step failed; later steps were skipped.
    Failed {
        /// Name of the failed step
        step: &'static str,
        /// Rendered error
        error: String,
    },
    /// The watchdog fired before the sequence finished.
    TimedOut,
}

impl ShutdownOutcome {
    /// Process exit code for this outcome.
    pub const fn exit_code(&self) -> i32 {
        match self {
            Self::Completed => 0,
            Self::Failed { .. } | Self::TimedOut => 1,
        }
    }
}

/// Runs a shutdown plan at most once.
#[derive(Debug)]
pub struct ShutdownCoordinator {
    started: AtomicBool,
    timeout: Duration,
}

impl ShutdownCoordinator {
    /// Creates a coordinator with the given watchdog timeout.
    pub fn new(timeout: Duration) -> Self {
        Self { started: AtomicBool::new(false), timeout }
    }

    /// Whether shutdown has begun.
    pub fn is_shutting_down(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Executes `plan`. Returns `None` if shutdown already started.
    pub async fn run(&self, plan: ShutdownPlan) -> Option<ShutdownOutcome> {
        if self.started.swap(true, Ordering::AcqRel) {
            warn!("shutdown already in progress, ignoring");
            return None;
        }

        info!(steps = ?plan.step_names(), timeout_ms = saturating_millis(self.timeout), "shutdown started");

        let sequence = async move {
            for ShutdownStep { name, action } in plan.steps {
                info!(step = name, "shutdown step starting");
                if let Err(e) = action.await {
                    error!(step = name, error = %e, "shutdown step failed");
                    return ShutdownOutcome::Failed { step: name, error: e.to_string() };
                }
                info!(step = name, "shutdown step completed");
            }
            ShutdownOutcome::Completed
        };

        let outcome = match tokio::time::timeout(self.timeout, sequence).await {
            Ok(outcome) => outcome,
            Err(_) => {
                error!(timeout_ms = saturating_millis(self.timeout), "shutdown timed out");
                ShutdownOutcome::TimedOut
            },
        };

        info!(?outcome, exit_code = outcome.exit_code(), "shutdown finished");
        Some(outcome)
    }
}
