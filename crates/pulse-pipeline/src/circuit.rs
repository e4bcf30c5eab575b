//! Circuit breaker guarding calls to the persistence store.
//!
//! Tracks consecutive store failures and, once the threshold is reached,
//! fails fast for a cooldown window instead of hammering an unhealthy
//! database.
//!
//! # Circuit Breaker State Machine
//!
//! ```text
//!                          ┌─────────────────────────┐
//!                          │        CLOSED           │
//!                          │   (Normal Operation)    │
//!                          │                         │
//!                          │ ● All calls allowed     │
//!                          │ ● Counting failures     │
//!                          └─────────────────────────┘
//!                           │                        ▲
//!                           │                        │
//!         failure_threshold │                        │ probe succeeds
//!      consecutive failures │                        │
//!                           ▼                        │
//!    ┌─────────────────────────┐                  ┌───────────────────────┐
//!    │         OPEN            │                  │       HALF-OPEN       │
//!    │      (Fail Fast)        │                  │   (Single Probe)      │
//!    │                         │ cooldown elapsed │                       │
//!    │ ● Store never called    │ ───────────────▶ │ ● One call allowed    │
//!    │ ● StoreUnavailable      │                  │ ● Others fail fast    │
//!    └─────────────────────────┘                  └───────────────────────┘
//!                ▲                                            │
//!                │                              probe fails   │
//!                └────────────────────────────────────────────┘
//! ```
//!
//! The decision to call or fail is synchronous: the state lock is a
//! `std::sync::Mutex` and is never held across an await.

use std::{
    fmt,
    future::Future,
    sync::{Arc, Mutex, MutexGuard},
    time::{Duration, Instant},
};

use pulse_core::{saturating_millis, Clock, PulseError, RealClock, Result};
use serde::{Deserialize, Serialize};

/// Circuit breaker tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CircuitConfig {
    /// Consecutive failures that trip the breaker.
    pub failure_threshold: u32,
    /// How long the breaker stays open before allowing a probe.
    pub cooldown: Duration,
}

impl Default for CircuitConfig {
    fn default() -> Self {
        Self { failure_threshold: 5, cooldown: Duration::from_secs(30) }
    }
}

/// Current state of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation.
    Closed,
    /// Failing fast until the cooldown elapses.
    Open,
    /// Cooldown elapsed; the next call is a probe.
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Closed => write!(f, "closed"),
            Self::Open => write!(f, "open"),
            Self::HalfOpen => write!(f, "half_open"),
        }
    }
}

#[derive(Debug)]
struct CircuitInner {
    state: CircuitState,
    failure_count: u32,
    open_until: Option<Instant>,
    probe_in_flight: bool,
}

impl CircuitInner {
    const fn new() -> Self {
        Self { state: CircuitState::Closed, failure_count: 0, open_until: None, probe_in_flight: false }
    }

    /// Applies the time-triggered `open -> half-open` transition.
    fn refresh(&mut self, now: Instant) {
        if self.state == CircuitState::Open && self.open_until.map_or(true, |until| now >= until) {
            tracing::info!("circuit breaker transitioning to half-open");
            self.state = CircuitState::HalfOpen;
            self.probe_in_flight = false;
        }
    }

    fn retry_in(&self, now: Instant) -> Duration {
        self.open_until.map_or(Duration::ZERO, |until| until.saturating_duration_since(now))
    }
}

/// Breaker instance owned by a single persistence layer.
pub struct CircuitBreaker {
    config: CircuitConfig,
    inner: Mutex<CircuitInner>,
    clock: Arc<dyn Clock>,
}

impl CircuitBreaker {
    /// Creates a breaker driven by the real clock.
    pub fn new(config: CircuitConfig) -> Self {
        Self::with_clock(config, Arc::new(RealClock::new()))
    }

    /// Creates a breaker driven by the given clock.
    pub fn with_clock(config: CircuitConfig, clock: Arc<dyn Clock>) -> Self {
        Self { config, inner: Mutex::new(CircuitInner::new()), clock }
    }

    /// Runs `operation` unless the breaker is open.
    ///
    /// # Errors
    ///
    /// Returns `PulseError::StoreUnavailable` without invoking the operation
    /// while the breaker is open or another caller holds the half-open probe.
    /// Otherwise returns the operation's own error unchanged.
    pub async fn execute<T, F, Fut>(&self, operation: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut guard = self.admit()?;
        let result = operation().await;

        let was_probe = guard.disarm();
        match &result {
            Ok(_) => self.record_success(was_probe),
            Err(e) => self.record_failure(was_probe, e),
        }

        result
    }

    /// Returns whether calls are currently being rejected outright.
    pub fn is_open(&self) -> bool {
        self.state() == CircuitState::Open
    }

    /// Current state after applying any pending cooldown transition.
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.refresh(now);
        inner.state
    }

    /// Consecutive failures observed since the last success.
    pub fn failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Breaker configuration.
    pub fn config(&self) -> &CircuitConfig {
        &self.config
    }

    /// Forces the breaker closed with no recorded failures.
    pub fn reset(&self) {
        *self.lock() = CircuitInner::new();
    }

    fn admit(&self) -> Result<ProbeGuard<'_>> {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.refresh(now);

        match inner.state {
            CircuitState::Closed => Ok(ProbeGuard { breaker: self, armed: false }),
            CircuitState::Open => Err(PulseError::StoreUnavailable { retry_in: inner.retry_in(now) }),
            CircuitState::HalfOpen if inner.probe_in_flight => {
                Err(PulseError::StoreUnavailable { retry_in: Duration::ZERO })
            },
            CircuitState::HalfOpen => {
                inner.probe_in_flight = true;
                Ok(ProbeGuard { breaker: self, armed: true })
            },
        }
    }

    fn record_success(&self, was_probe: bool) {
        let mut inner = self.lock();
        inner.failure_count = 0;
        if was_probe {
            inner.probe_in_flight = false;
        }

        if inner.state == CircuitState::HalfOpen {
            tracing::info!("circuit breaker closing, store recovered");
            inner.state = CircuitState::Closed;
            inner.open_until = None;
        }
    }

    fn record_failure(&self, was_probe: bool, error: &PulseError) {
        let now = self.clock.now();
        let mut inner = self.lock();
        inner.failure_count = inner.failure_count.saturating_add(1);
        if was_probe {
            inner.probe_in_flight = false;
        }

        let trip = inner.state == CircuitState::HalfOpen
            || (inner.state == CircuitState::Closed
                && inner.failure_count >= self.config.failure_threshold);

        if trip {
            tracing::warn!(
                failures = inner.failure_count,
                cooldown_ms = saturating_millis(self.config.cooldown),
                error = %error,
                "circuit breaker opening"
            );
            inner.state = CircuitState::Open;
            inner.open_until = Some(now + self.config.cooldown);
        }
    }

    fn lock(&self) -> MutexGuard<'_, CircuitInner> {
        self.inner.lock().unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.lock();
        f.debug_struct("CircuitBreaker")
            .field("config", &self.config)
            .field("state", &inner.state)
            .field("failure_count", &inner.failure_count)
            .finish()
    }
}

/// Releases the half-open probe slot if the probing call is cancelled
/// before it reports an outcome.
struct ProbeGuard<'a> {
    breaker: &'a CircuitBreaker,
    armed: bool,
}

impl ProbeGuard<'_> {
    /// Returns whether this call held the probe slot.
    fn disarm(&mut self) -> bool {
        std::mem::replace(&mut self.armed, false)
    }
}

impl Drop for ProbeGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.breaker.lock().probe_in_flight = false;
        }
    }
}
