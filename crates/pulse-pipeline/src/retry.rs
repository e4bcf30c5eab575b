//! Redelivery policy for failed queue jobs.
//!
//! Workers never retry locally: a failed job goes back to the queue, which
//! consults a [`RetryPolicy`] to decide whether and when to hand it out
//! again.

use std::time::Duration;

use chrono::{DateTime, Utc};
use pulse_core::PulseError;
use rand::Rng;
use serde::{Deserialize, Serialize};

/// How the queue redelivers failed jobs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum delivery attempts, including the first.
    pub max_attempts: u32,

    /// Delay before the first redelivery.
    pub base_delay: Duration,

    /// Upper bound on any single delay.
    pub max_delay: Duration,

    /// Jitter fraction (0.0 to 1.0) applied to each delay.
    pub jitter_factor: f64,

    /// How delays grow between attempts.
    pub backoff_strategy: BackoffStrategy,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            jitter_factor: 0.25,
            backoff_strategy: BackoffStrategy::Exponential,
        }
    }
}

impl RetryPolicy {
    /// Exponential policy with the given attempt budget and base delay.
    pub fn exponential(max_attempts: u32, base_delay: Duration) -> Self {
        Self { max_attempts, base_delay, ..Self::default() }
    }

    /// Decides what happens to a job whose `attempt`-th delivery failed.
    pub fn decide(&self, attempt: u32, error: &PulseError, failed_at: DateTime<Utc>) -> RetryDecision {
        if !error.is_retryable() {
            return RetryDecision::GiveUp { reason: format!("non-retryable error: {error}") };
        }

        if attempt >= self.max_attempts {
            return RetryDecision::GiveUp {
                reason: format!("maximum attempts ({}) exceeded", self.max_attempts),
            };
        }

        let Ok(delay) = chrono::Duration::from_std(self.delay_for(attempt)) else {
            return RetryDecision::GiveUp { reason: "retry delay out of range".to_string() };
        };

        RetryDecision::Retry { next_attempt_at: failed_at + delay }
    }

    /// Delay before redelivering after the `attempt`-th failure (1-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let base = match self.backoff_strategy {
            BackoffStrategy::Fixed => self.base_delay,
            BackoffStrategy::Linear => self.base_delay * attempt.max(1),
            BackoffStrategy::Exponential => {
                let exponent = attempt.saturating_sub(1).min(20);
                self.base_delay * 2_u32.saturating_pow(exponent)
            },
        };

        let capped = base.min(self.max_delay);
        apply_jitter(capped, self.jitter_factor).min(self.max_delay)
    }
}

/// Strategy for growing retry delays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    /// Same delay every time.
    Fixed,
    /// Delay doubles each attempt.
    Exponential,
    /// Delay grows by `base_delay` each attempt.
    Linear,
}

/// Outcome of a redelivery decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Make the job visible again at `next_attempt_at`.
    Retry {
        /// Earliest time the job may be dequeued again
        next_attempt_at: DateTime<Utc>,
    },
    /// Mark the job permanently failed.
    GiveUp {
        /// Why the job will not be redelivered
        reason: String,
    },
}

/// Randomizes `duration` by up to ±`jitter_factor`.
fn apply_jitter(duration: Duration, jitter_factor: f64) -> Duration {
    if jitter_factor <= 0.0 {
        return duration;
    }

    let clamped = jitter_factor.clamp(0.0, 1.0);
    let range = duration.as_secs_f64() * clamped;
    let offset = rand::rng().random_range(-range..=range);

    Duration::from_secs_f64((duration.as_secs_f64() + offset).max(0.0))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_jitter(strategy: BackoffStrategy) -> RetryPolicy {
        RetryPolicy { jitter_factor: 0.0, backoff_strategy: strategy, max_attempts: 10, ..Default::default() }
    }

    #[test]
    fn exponential_backoff_doubles() {
        let policy = no_jitter(BackoffStrategy::Exponential);
        let delays: Vec<_> = (1..=4).map(|a| policy.delay_for(a)).collect();

        assert_eq!(delays, [1, 2, 4, 8].map(Duration::from_secs));
    }

    #[test]
    fn linear_and_fixed_backoff() {
        let linear = no_jitter(BackoffStrategy::Linear);
        assert_eq!(linear.delay_for(3), Duration::from_secs(3));

        let fixed = no_jitter(BackoffStrategy::Fixed);
        assert_eq!(fixed.delay_for(7), Duration::from_secs(1));
    }

    #[test]
    fn max_delay_is_enforced() {
        let policy = RetryPolicy { max_delay: Duration::from_secs(5), ..no_jitter(BackoffStrategy::Exponential) };
        assert_eq!(policy.delay_for(10), Duration::from_secs(5));
    }

    #[test]
    fn gives_up_at_max_attempts() {
        let policy = RetryPolicy::exponential(3, Duration::from_millis(100));
        let error = PulseError::processing("job-1", "connection reset");

        assert!(matches!(policy.decide(2, &error, Utc::now()), RetryDecision::Retry { .. }));
        match policy.decide(3, &error, Utc::now()) {
            RetryDecision::GiveUp { reason } => assert!(reason.contains("maximum attempts")),
            RetryDecision::Retry { .. } => unreachable!("third failure must be final"),
        }
    }

    #[test]
    fn validation_errors_are_never_retried() {
        let policy = RetryPolicy::default();
        let decision = policy.decide(1, &PulseError::validation("bad timestamp"), Utc::now());

        assert!(matches!(decision, RetryDecision::GiveUp { reason } if reason.contains("non-retryable")));
    }

    #[test]
    fn retry_is_scheduled_after_failure_time() {
        let policy = RetryPolicy { jitter_factor: 0.0, ..RetryPolicy::default() };
        let failed_at = Utc::now();

        let RetryDecision::Retry { next_attempt_at } =
            policy.decide(1, &PulseError::StoreUnavailable { retry_in: Duration::ZERO }, failed_at)
        else {
            unreachable!("store outages are retryable");
        };
        assert_eq!(next_attempt_at - failed_at, chrono::Duration::seconds(1));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let base = Duration::from_secs(10);
        let mut seen = std::collections::HashSet::new();

        for _ in 0..20 {
            let jittered = apply_jitter(base, 0.5);
            assert!(jittered >= Duration::from_secs(5) && jittered <= Duration::from_secs(15));
            seen.insert(jittered.as_millis());
        }
        assert!(seen.len() > 1, "jitter should vary the delay");
    }
}
