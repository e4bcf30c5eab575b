//! Chunked, idempotent batch persistence behind the circuit breaker.
//!
//! Every store call, including health probes, goes through the same
//! [`CircuitBreaker`] so an outage is observed consistently by workers and
//! health checks.

use std::sync::Arc;

use pulse_core::{ProcessedEvent, Result};
use tracing::{debug, instrument};

use crate::{
    circuit::{CircuitBreaker, CircuitState},
    storage::EventStore,
};

/// Default number of rows per insert statement.
pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Converts processed events into stored rows.
pub struct BatchPersistence {
    store: Arc<dyn EventStore>,
    breaker: CircuitBreaker,
    chunk_size: usize,
}

impl BatchPersistence {
    /// Creates a persistence layer owning `breaker`.
    pub fn new(store: Arc<dyn EventStore>, breaker: CircuitBreaker, chunk_size: usize) -> Self {
        Self { store, breaker, chunk_size: chunk_size.max(1) }
    }

    /// Stores `events`, skipping any whose `event_id` is already present.
    ///
    /// Events are written in chunks of `chunk_size`, one statement per chunk.
    /// Returns the number of newly inserted rows.
    ///
    /// # Errors
    ///
    /// Returns `PulseError::StoreUnavailable` if the breaker is open, or the
    /// store's error for the first failing chunk. Earlier chunks stay
    /// committed, which is safe because reinserting them is a no-op.
    #[instrument(skip_all, fields(events = events.len()))]
    pub async fn insert_batch(&self, events: &[ProcessedEvent]) -> Result<u64> {
        let mut inserted = 0;

        for chunk in events.chunks(self.chunk_size) {
            let store = &self.store;
            inserted += self.breaker.execute(|| store.insert_chunk(chunk)).await?;
        }

        debug!(inserted, skipped = events.len() as u64 - inserted, "batch persisted");
        Ok(inserted)
    }

    /// Stores a single event.
    ///
    /// # Errors
    ///
    /// Same as [`Self::insert_batch`].
    pub async fn insert_one(&self, event: &ProcessedEvent) -> Result<u64> {
        self.insert_batch(std::slice::from_ref(event)).await
    }

    /// Pings the store through the breaker.
    pub async fn is_healthy(&self) -> bool {
        let store = &self.store;
        self.breaker.execute(|| store.ping()).await.is_ok()
    }

    /// Current breaker state.
    pub fn circuit_state(&self) -> CircuitState {
        self.breaker.state()
    }

    /// The breaker guarding this layer.
    pub fn breaker(&self) -> &CircuitBreaker {
        &self.breaker
    }

    /// Closes the store's connection pool.
    ///
    /// # Errors
    ///
    /// Returns the store's close error.
    pub async fn close(&self) -> Result<()> {
        self.store.close().await
    }
}

impl std::fmt::Debug for BatchPersistence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BatchPersistence")
            .field("breaker", &self.breaker)
            .field("chunk_size", &self.chunk_size)
            .finish_non_exhaustive()
    }
}
