//! PostgreSQL access for database-backed tests.
//!
//! Tests using this module are `#[ignore]`d by default and run against the
//! database named by `DATABASE_URL`. Each handle opens its own small pool
//! on the current runtime. Isolation comes from unique queue names and
//! event id prefixes rather than per-test databases.

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use sqlx::{
    postgres::{PgConnectOptions, PgPoolOptions},
    PgPool,
};
use tracing::{debug, warn};
use uuid::Uuid;

/// Test database handle.
#[derive(Debug, Clone)]
pub struct TestDatabase {
    pool: PgPool,
    namespace: String,
}

impl TestDatabase {
    /// Connects, ensures the schema exists, and picks a fresh namespace.
    ///
    /// # Errors
    ///
    /// Returns an error if `DATABASE_URL` is unset or unreachable.
    pub async fn new() -> Result<Self> {
        let pool = create_pool().await?;
        pulse_pipeline::schema::run_migrations(&pool).await.context("failed to apply schema")?;
        let namespace = format!("t{}", Uuid::new_v4().simple());
        Ok(Self { pool, namespace })
    }

    /// Access to the underlying database pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Queue name unique to this handle.
    pub fn queue_name(&self) -> String {
        format!("{}-queue", self.namespace)
    }

    /// Event id unique to this handle.
    pub fn event_id(&self, suffix: impl std::fmt::Display) -> String {
        format!("{}-{suffix}", self.namespace)
    }

    /// Rows in `sensor_events` written by this handle.
    ///
    /// # Errors
    ///
    /// Returns the query error.
    pub async fn event_rows(&self) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sensor_events WHERE event_id LIKE $1")
            .bind(format!("{}-%", self.namespace))
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    /// Deletes rows written by this handle.
    ///
    /// # Errors
    ///
    /// Returns the query error.
    pub async fn cleanup(&self) -> Result<()> {
        sqlx::query("DELETE FROM sensor_events WHERE event_id LIKE $1")
            .bind(format!("{}-%", self.namespace))
            .execute(&self.pool)
            .await?;
        sqlx::query("DELETE FROM ingest_jobs WHERE queue_name = $1")
            .bind(self.queue_name())
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}

async fn create_pool() -> Result<PgPool> {
    let start_time = Instant::now();
    let database_url =
        std::env::var("DATABASE_URL").context("DATABASE_URL environment variable is required")?;

    let opts = database_url.parse::<PgConnectOptions>().context("failed to parse DATABASE_URL")?;

    let pool = PgPoolOptions::new()
        .max_connections(4)
        .min_connections(0)
        .idle_timeout(Duration::from_secs(30))
        .acquire_timeout(Duration::from_secs(30))
        .connect_with(opts)
        .await
        .context("failed to create test connection pool")?;

    let duration = start_time.elapsed();
    if duration > Duration::from_millis(200) {
        warn!("Test pool creation took {}ms", duration.as_millis());
    } else {
        debug!("created test pool in {}ms", duration.as_millis());
    }

    Ok(pool)
}
