//! Storage abstraction for processed events.
//!
//! The persistence layer talks to the database only through [`EventStore`],
//! so breaker and batching behavior can be tested against the in-memory
//! [`mock::MemoryEventStore`] without PostgreSQL.

use std::{future::Future, pin::Pin};

use pulse_core::{ProcessedEvent, Result};
use sqlx::{types::Json, PgPool, Postgres, QueryBuilder};

/// Boxed future returned by store and queue operations.
pub type StoreFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T>> + Send + 'a>>;

/// Operations the persistence layer needs from the event store.
pub trait EventStore: Send + Sync + 'static {
    /// Inserts one chunk of events in a single statement.
    ///
    /// Rows whose `event_id` already exists are skipped. Returns the number
    /// of rows actually inserted.
    fn insert_chunk<'a>(&'a self, events: &'a [ProcessedEvent]) -> StoreFuture<'a, u64>;

    /// Cheap liveness probe.
    fn ping(&self) -> StoreFuture<'_, ()>;

    /// Closes the underlying connections.
    fn close(&self) -> StoreFuture<'_, ()>;
}

/// `sensor_events` table in PostgreSQL.
#[derive(Debug, Clone)]
pub struct PostgresEventStore {
    pool: PgPool,
}

impl PostgresEventStore {
    /// Creates a store over an existing pool.
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

impl EventStore for PostgresEventStore {
    fn insert_chunk<'a>(&'a self, events: &'a [ProcessedEvent]) -> StoreFuture<'a, u64> {
        Box::pin(async move {
            if events.is_empty() {
                return Ok(0);
            }

            let mut builder: QueryBuilder<'_, Postgres> = QueryBuilder::new(
                r#"INSERT INTO sensor_events
                   (event_id, device_id, sensor_type, value, unit, "timestamp",
                    metadata, processed_at, received_at) "#,
            );
            builder.push_values(events, |mut row, event| {
                row.push_bind(&event.event_id)
                    .push_bind(&event.device_id)
                    .push_bind(&event.sensor_type)
                    .push_bind(event.value)
                    .push_bind(&event.unit)
                    .push_bind(event.timestamp)
                    .push_bind(event.metadata.as_ref().map(Json))
                    .push_bind(event.processed_at)
                    .push_bind(event.received_at);
            });
            builder.push(" ON CONFLICT (event_id) DO NOTHING");

            let result = builder.build().execute(&self.pool).await?;
            Ok(result.rows_affected())
        })
    }

    fn ping(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            sqlx::query("SELECT 1").execute(&self.pool).await?;
            Ok(())
        })
    }

    fn close(&self) -> StoreFuture<'_, ()> {
        Box::pin(async move {
            self.pool.close().await;
            Ok(())
        })
    }
}

pub mod mock {
    //! In-memory event store for tests.
    //!
    //! Keyed by `event_id` with the same skip-on-conflict semantics as the
    //! PostgreSQL store. Supports injecting failures and latency.

    use std::{
        collections::HashMap,
        sync::{
            atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
            Mutex,
        },
        time::Duration,
    };

    use pulse_core::{ProcessedEvent, PulseError};

    use super::{EventStore, StoreFuture};

    /// Mock event store with failure injection.
    #[derive(Debug, Default)]
    pub struct MemoryEventStore {
        rows: Mutex<HashMap<String, ProcessedEvent>>,
        insert_calls: AtomicUsize,
        ping_calls: AtomicUsize,
        failures_remaining: AtomicU32,
        unavailable: AtomicBool,
        closed: AtomicBool,
        delay: Mutex<Option<Duration>>,
    }

    impl MemoryEventStore {
        /// Creates an empty store.
        pub fn new() -> Self {
            Self::default()
        }

        /// Fails the next `count` calls.
        pub fn fail_next(&self, count: u32) {
            self.failures_remaining.store(count, Ordering::SeqCst);
        }

        /// Fails every call until cleared.
        pub fn set_unavailable(&self, unavailable: bool) {
            self.unavailable.store(unavailable, Ordering::SeqCst);
        }

        /// Delays every insert by `delay`.
        pub fn set_delay(&self, delay: Option<Duration>) {
            *self.delay.lock().unwrap_or_else(std::sync::PoisonError::into_inner) = delay;
        }

        /// Number of stored rows.
        pub fn row_count(&self) -> usize {
            self.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner).len()
        }

        /// Looks up a stored row.
        pub fn get(&self, event_id: &str) -> Option<ProcessedEvent> {
            self.rows
                .lock()
                .unwrap_or_else(std::sync::PoisonError::into_inner)
                .get(event_id)
                .cloned()
        }

        /// Number of `insert_chunk` calls that reached the store.
        pub fn insert_calls(&self) -> usize {
            self.insert_calls.load(Ordering::SeqCst)
        }

        /// Number of `ping` calls that reached the store.
        pub fn ping_calls(&self) -> usize {
            self.ping_calls.load(Ordering::SeqCst)
        }

        /// Whether `close` has been called.
        pub fn is_closed(&self) -> bool {
            self.closed.load(Ordering::SeqCst)
        }

        fn check_available(&self) -> pulse_core::Result<()> {
            if self.closed.load(Ordering::SeqCst) {
                return Err(PulseError::Database(sqlx::Error::PoolClosed));
            }
            if self.unavailable.load(Ordering::SeqCst) {
                return Err(PulseError::Database(sqlx::Error::PoolTimedOut));
            }
            let injected = self
                .failures_remaining
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok();
            if injected {
                return Err(PulseError::Database(sqlx::Error::PoolTimedOut));
            }
            Ok(())
        }
    }

    impl EventStore for MemoryEventStore {
        fn insert_chunk<'a>(&'a self, events: &'a [ProcessedEvent]) -> StoreFuture<'a, u64> {
            Box::pin(async move {
                self.insert_calls.fetch_add(1, Ordering::SeqCst);

                let delay = *self.delay.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                self.check_available()?;

                let mut rows = self.rows.lock().unwrap_or_else(std::sync::PoisonError::into_inner);
                let mut inserted = 0;
                for event in events {
                    if !rows.contains_key(&event.event_id) {
                        rows.insert(event.event_id.clone(), event.clone());
                        inserted += 1;
                    }
                }
                Ok(inserted)
            })
        }

        fn ping(&self) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                self.ping_calls.fetch_add(1, Ordering::SeqCst);
                self.check_available()
            })
        }

        fn close(&self) -> StoreFuture<'_, ()> {
            Box::pin(async move {
                self.closed.store(true, Ordering::SeqCst);
                Ok(())
            })
        }
    }
}
