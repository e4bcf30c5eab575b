//! Database schema for events and queued jobs.

use pulse_core::Result;
use sqlx::PgPool;
use tracing::info;

/// Serializes concurrent migration runs across instances.
const MIGRATION_LOCK_ID: i64 = 0x7075_6c73_65;

const STATEMENTS: &[(&str, &str)] = &[
    (
        "sensor_events table",
        r#"
        CREATE TABLE IF NOT EXISTS sensor_events (
            id BIGSERIAL PRIMARY KEY,
            event_id TEXT NOT NULL UNIQUE,
            device_id TEXT NOT NULL,
            sensor_type TEXT NOT NULL,
            value DOUBLE PRECISION NOT NULL,
            unit TEXT NOT NULL,
            "timestamp" TIMESTAMPTZ NOT NULL,
            metadata JSONB,
            processed_at TIMESTAMPTZ NOT NULL,
            received_at TIMESTAMPTZ NOT NULL,
            created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
        )
        "#,
    ),
    (
        "sensor_events device index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_sensor_events_device_time
        ON sensor_events(device_id, "timestamp" DESC)
        "#,
    ),
    (
        "ingest_jobs table",
        r#"
        CREATE TABLE IF NOT EXISTS ingest_jobs (
            queue_name TEXT NOT NULL,
            job_id TEXT NOT NULL,
            seq BIGSERIAL,
            payload JSONB NOT NULL,
            status TEXT NOT NULL DEFAULT 'waiting',
            attempts INTEGER NOT NULL DEFAULT 0,
            enqueued_at TIMESTAMPTZ NOT NULL,
            available_at TIMESTAMPTZ NOT NULL,
            last_error TEXT,
            updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
            PRIMARY KEY (queue_name, job_id)
        )
        "#,
    ),
    (
        "ingest_jobs ready index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_ingest_jobs_ready
        ON ingest_jobs(queue_name, available_at, seq)
        WHERE status = 'waiting'
        "#,
    ),
    (
        "ingest_jobs status index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_ingest_jobs_status
        ON ingest_jobs(queue_name, status)
        WHERE status IN ('waiting', 'active')
        "#,
    ),
    (
        "ingest_jobs finished index",
        r#"
        CREATE INDEX IF NOT EXISTS idx_ingest_jobs_finished
        ON ingest_jobs(queue_name, updated_at)
        WHERE status IN ('completed', 'failed')
        "#,
    ),
];

/// Creates tables and indexes that do not exist yet.
///
/// Runs in one transaction holding an advisory lock, so instances starting
/// together apply the schema one at a time.
///
/// # Errors
///
/// Returns the first failing statement's error.
pub async fn run_migrations(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await?;
    sqlx::query("SELECT pg_advisory_xact_lock($1)").bind(MIGRATION_LOCK_ID).execute(&mut *tx).await?;

    for (name, sql) in STATEMENTS {
        sqlx::query(sql).execute(&mut *tx).await?;
        info!(object = name, "schema object ensured");
    }

    tx.commit().await?;
    Ok(())
}
