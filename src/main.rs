//! Pulse telemetry ingestion service.
//!
//! Main entry point. Loads configuration, wires the ingestion pipeline to
//! PostgreSQL and serves the HTTP API until a shutdown signal arrives.

use std::{sync::Arc, time::Duration};

use anyhow::{Context, Result};
use pulse_api::{AppState, Broadcaster, Config, HttpLimits, QueueBackend, RunningService};
use pulse_core::{Clock, RealClock};
use pulse_pipeline::{
    queue::{JobQueue, MemoryJobQueue, PostgresJobQueue},
    schema,
    storage::PostgresEventStore,
    IngestEngine, LargePayloadParser, ShutdownCoordinator,
};
use sqlx::postgres::PgPoolOptions;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let config = Config::load()?;
    init_tracing(&config.rust_log);

    info!("Starting Pulse ingestion service");
    info!(
        database_url = %config.database_url_masked(),
        host = %config.host,
        port = config.port,
        queue_backend = ?config.queue_backend,
        max_connections = config.database_max_connections,
        "Configuration loaded"
    );

    let db_pool = create_database_pool(&config).await?;
    info!("Database connection pool established");

    schema::run_migrations(&db_pool).await.context("Failed to run migrations")?;
    info!("Database migrations completed");

    let clock: Arc<dyn Clock> = Arc::new(RealClock::new());
    let queue = create_queue(&config, &db_pool, clock.clone()).await?;
    let store = Arc::new(PostgresEventStore::new(db_pool));
    let engine = Arc::new(IngestEngine::new(config.to_engine_config(), queue, store, clock.clone()));

    let state = AppState {
        engine,
        broadcaster: Arc::new(Broadcaster::new(config.broadcast_capacity, config.max_subscribers)),
        parser: LargePayloadParser::new(config.parser_workers, config.large_payload_threshold_bytes),
        clock,
    };
    let limits =
        HttpLimits { request_timeout: config.request_timeout(), max_body_bytes: config.max_body_bytes };

    let addr = config.parse_server_addr()?;
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    let service = RunningService::launch(state, limits, listener).await?;

    info!(addr = %service.local_addr(), "Pulse is ready to receive events");

    tokio::select! {
        () = pulse_api::shutdown_signal() => {},
        () = service.server_stopped() => {
            warn!("HTTP server exited unexpectedly, shutting down");
        },
    }

    let coordinator = ShutdownCoordinator::new(config.shutdown_timeout());
    let exit_code = match coordinator.run(service.shutdown_plan()).await {
        Some(outcome) => outcome.exit_code(),
        None => 1,
    };

    info!(exit_code, "Pulse shutdown complete");
    std::process::exit(exit_code);
}

/// Initializes tracing, preferring `RUST_LOG` from the environment.
fn init_tracing(default_directive: &str) {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(default_directive))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let fmt_layer = fmt::layer()
        .with_target(true)
        .with_thread_ids(true)
        .with_thread_names(true)
        .with_file(true)
        .with_line_number(true);

    tracing_subscriber::registry().with(filter).with(fmt_layer).init();
}

/// Creates the database connection pool with retry logic.
async fn create_database_pool(config: &Config) -> Result<sqlx::PgPool> {
    let mut retries = 0;
    const MAX_RETRIES: u32 = 5;
    const RETRY_DELAY: Duration = Duration::from_secs(2);

    loop {
        match PgPoolOptions::new()
            .max_connections(config.database_max_connections)
            .min_connections(config.database_min_connections)
            .acquire_timeout(Duration::from_secs(config.database_connection_timeout))
            .idle_timeout(Duration::from_secs(600))
            .max_lifetime(Duration::from_secs(1800))
            .connect(&config.database_url)
            .await
        {
            Ok(pool) => {
                sqlx::query("SELECT 1")
                    .execute(&pool)
                    .await
                    .context("Failed to verify database connection")?;

                return Ok(pool);
            },
            Err(e) if retries < MAX_RETRIES => {
                retries += 1;
                warn!(
                    attempt = retries,
                    max_retries = MAX_RETRIES,
                    error = %e,
                    "Database connection failed, retrying..."
                );
                tokio::time::sleep(RETRY_DELAY).await;
            },
            Err(e) => {
                return Err(e).context("Failed to create database connection pool after retries");
            },
        }
    }
}

/// Builds the configured job queue. Jobs a crashed process left active are
/// made ready again.
async fn create_queue(
    config: &Config,
    pool: &sqlx::PgPool,
    clock: Arc<dyn Clock>,
) -> Result<Arc<dyn JobQueue>> {
    let policy = config.to_retry_policy();
    match config.queue_backend {
        QueueBackend::Postgres => {
            let queue = PostgresJobQueue::new(pool.clone(), config.queue_name.clone(), policy);
            let recovered = queue.requeue_active().await.context("Failed to recover active jobs")?;
            if recovered > 0 {
                info!(recovered, queue = %config.queue_name, "requeued jobs left active by a previous run");
            }
            Ok(Arc::new(queue))
        },
        QueueBackend::Memory => {
            warn!("using in-memory queue; queued jobs will not survive a restart");
            Ok(Arc::new(MemoryJobQueue::with_clock(policy, clock)))
        },
    }
}
