//! Configuration management for the Pulse ingestion service.

use std::{net::SocketAddr, str::FromStr, time::Duration};

use anyhow::{Context, Result};
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use pulse_pipeline::{
    retry::{BackoffStrategy, RetryPolicy},
    worker_pool::WorkerPoolConfig,
    AdmissionConfig, CircuitConfig, EngineConfig, RetentionConfig,
};
use serde::{Deserialize, Serialize};

const CONFIG_FILE: &str = "pulse.toml";

/// Where queued jobs live.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    /// `ingest_jobs` table in the service database.
    Postgres,
    /// In-process queue. Jobs do not survive a restart.
    Memory,
}

/// Complete service configuration with defaults, file, and environment
/// overrides.
///
/// Configuration is loaded in priority order:
/// 1. Environment variables (highest priority)
/// 2. Configuration file (`pulse.toml`)
/// 3. Built-in defaults (lowest priority)
///
/// # Example
///
/// ```no_run
/// use pulse_api::Config;
///
/// let config = Config::load().expect("Failed to load configuration");
///
/// println!("Server will bind to {}:{}", config.host, config.port);
/// ```
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // Database
    /// PostgreSQL connection URL.
    ///
    /// Environment variable: `DATABASE_URL`
    #[serde(default = "default_database_url", alias = "DATABASE_URL")]
    pub database_url: String,
    /// Maximum number of database connections in the pool.
    ///
    /// Environment variable: `DATABASE_MAX_CONNECTIONS`
    #[serde(default = "default_max_connections", alias = "DATABASE_MAX_CONNECTIONS")]
    pub database_max_connections: u32,
    /// Minimum number of connections to maintain in the pool.
    ///
    /// Environment variable: `DATABASE_MIN_CONNECTIONS`
    #[serde(default = "default_min_connections", alias = "DATABASE_MIN_CONNECTIONS")]
    pub database_min_connections: u32,
    /// Database connection acquire timeout in seconds.
    ///
    /// Environment variable: `DATABASE_CONNECTION_TIMEOUT`
    #[serde(default = "default_acquire_timeout", alias = "DATABASE_CONNECTION_TIMEOUT")]
    pub database_connection_timeout: u64,

    // Server
    /// Server bind address.
    ///
    /// Environment variable: `HOST`
    #[serde(default = "default_host", alias = "HOST")]
    pub host: String,
    /// Server bind port.
    ///
    /// Environment variable: `PORT`
    #[serde(default = "default_port", alias = "PORT")]
    pub port: u16,
    /// Per-request timeout in milliseconds.
    ///
    /// Environment variable: `REQUEST_TIMEOUT_MS`
    #[serde(default = "default_request_timeout_ms", alias = "REQUEST_TIMEOUT_MS")]
    pub request_timeout_ms: u64,
    /// Largest accepted request body.
    ///
    /// Environment variable: `MAX_BODY_BYTES`
    #[serde(default = "default_max_body_bytes", alias = "MAX_BODY_BYTES")]
    pub max_body_bytes: usize,
    /// Bodies at least this large are parsed on the blocking pool.
    ///
    /// Environment variable: `LARGE_PAYLOAD_THRESHOLD_BYTES`
    #[serde(default = "default_large_payload_threshold", alias = "LARGE_PAYLOAD_THRESHOLD_BYTES")]
    pub large_payload_threshold_bytes: usize,
    /// Concurrent blocking parses.
    ///
    /// Environment variable: `PARSER_WORKERS`
    #[serde(default = "default_parser_workers", alias = "PARSER_WORKERS")]
    pub parser_workers: usize,

    // Queue
    /// Logical queue name, shared by every instance draining the same jobs.
    ///
    /// Environment variable: `QUEUE_NAME`
    #[serde(default = "default_queue_name", alias = "QUEUE_NAME")]
    pub queue_name: String,
    /// Job storage backend.
    ///
    /// Environment variable: `QUEUE_BACKEND`
    #[serde(default = "default_queue_backend", alias = "QUEUE_BACKEND")]
    pub queue_backend: QueueBackend,
    /// Number of concurrent queue consumers.
    ///
    /// Environment variable: `QUEUE_CONCURRENCY`
    #[serde(default = "default_queue_concurrency", alias = "QUEUE_CONCURRENCY")]
    pub queue_concurrency: usize,
    /// Queue depth at which admission starts rejecting.
    ///
    /// Environment variable: `BACKPRESSURE_THRESHOLD`
    #[serde(default = "default_backpressure_threshold", alias = "BACKPRESSURE_THRESHOLD")]
    pub backpressure_threshold: u64,
    /// Delivery attempts per job, including the first.
    ///
    /// Environment variable: `QUEUE_MAX_ATTEMPTS`
    #[serde(default = "default_queue_max_attempts", alias = "QUEUE_MAX_ATTEMPTS")]
    pub queue_max_attempts: u32,
    /// Base redelivery delay in milliseconds.
    ///
    /// Environment variable: `QUEUE_BACKOFF_MS`
    #[serde(default = "default_queue_backoff_ms", alias = "QUEUE_BACKOFF_MS")]
    pub queue_backoff_ms: u64,
    /// Seconds a finished job keeps its id reserved against resubmission.
    ///
    /// Environment variable: `QUEUE_DEDUP_RETENTION_SECS`
    #[serde(default = "default_dedup_retention_secs", alias = "QUEUE_DEDUP_RETENTION_SECS")]
    pub queue_dedup_retention_secs: u64,

    // Batching
    /// Largest batch accepted by the batch endpoint.
    ///
    /// Environment variable: `MAX_EVENTS_PER_BATCH`
    #[serde(default = "default_max_events_per_batch", alias = "MAX_EVENTS_PER_BATCH")]
    pub max_events_per_batch: usize,
    /// Events per sub-batch job and per insert statement.
    ///
    /// Environment variable: `BATCH_CHUNK_SIZE`
    #[serde(default = "default_batch_chunk_size", alias = "BATCH_CHUNK_SIZE")]
    pub batch_chunk_size: usize,

    // Circuit breaker
    /// Consecutive store failures that open the breaker.
    ///
    /// Environment variable: `CIRCUIT_FAILURE_THRESHOLD`
    #[serde(default = "default_circuit_failure_threshold", alias = "CIRCUIT_FAILURE_THRESHOLD")]
    pub circuit_failure_threshold: u32,
    /// How long the breaker stays open in milliseconds.
    ///
    /// Environment variable: `CIRCUIT_COOLDOWN_MS`
    #[serde(default = "default_circuit_cooldown_ms", alias = "CIRCUIT_COOLDOWN_MS")]
    pub circuit_cooldown_ms: u64,

    // Shutdown and broadcast
    /// Watchdog for the whole shutdown sequence in milliseconds.
    ///
    /// Environment variable: `SHUTDOWN_TIMEOUT_MS`
    #[serde(default = "default_shutdown_timeout_ms", alias = "SHUTDOWN_TIMEOUT_MS")]
    pub shutdown_timeout_ms: u64,
    /// Messages buffered per broadcast subscriber before it starts skipping.
    ///
    /// Environment variable: `BROADCAST_CAPACITY`
    #[serde(default = "default_broadcast_capacity", alias = "BROADCAST_CAPACITY")]
    pub broadcast_capacity: usize,
    /// Maximum live WebSocket sessions.
    ///
    /// Environment variable: `MAX_SUBSCRIBERS`
    #[serde(default = "default_max_subscribers", alias = "MAX_SUBSCRIBERS")]
    pub max_subscribers: usize,

    // Logging
    /// Log level configuration.
    ///
    /// Environment variable: `RUST_LOG`
    #[serde(default = "default_log_level", alias = "RUST_LOG")]
    pub rust_log: String,
}

impl Config {
    /// Load configuration from defaults, config file, and environment variable
    /// overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if a source cannot be parsed or validation fails.
    pub fn load() -> Result<Self> {
        let figment = Figment::new()
            .merge(Serialized::defaults(Self::default()))
            .merge(Toml::file(CONFIG_FILE))
            .merge(Env::prefixed(""));

        let config: Self = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    /// Convert to the pipeline's engine configuration.
    pub fn to_engine_config(&self) -> EngineConfig {
        EngineConfig {
            admission: AdmissionConfig {
                backpressure_threshold: self.backpressure_threshold,
                chunk_size: self.batch_chunk_size,
                max_batch_size: self.max_events_per_batch,
            },
            workers: WorkerPoolConfig { concurrency: self.queue_concurrency, ..WorkerPoolConfig::default() },
            circuit: self.to_circuit_config(),
            persist_chunk_size: self.batch_chunk_size,
            max_subscribers: self.max_subscribers,
            retention: RetentionConfig {
                dedup_window: Duration::from_secs(self.queue_dedup_retention_secs),
                ..RetentionConfig::default()
            },
        }
    }

    /// Convert to the queue's redelivery policy.
    pub fn to_retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.queue_max_attempts,
            base_delay: Duration::from_millis(self.queue_backoff_ms),
            backoff_strategy: BackoffStrategy::Exponential,
            ..RetryPolicy::default()
        }
    }

    /// Convert to circuit breaker configuration.
    pub fn to_circuit_config(&self) -> CircuitConfig {
        CircuitConfig {
            failure_threshold: self.circuit_failure_threshold,
            cooldown: Duration::from_millis(self.circuit_cooldown_ms),
        }
    }

    /// Per-request timeout.
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Shutdown watchdog.
    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_millis(self.shutdown_timeout_ms)
    }

    /// Parse server socket address from host and port configuration.
    ///
    /// # Errors
    ///
    /// Returns an error if host and port do not form a socket address.
    pub fn parse_server_addr(&self) -> Result<SocketAddr> {
        let addr_str = format!("{}:{}", self.host, self.port);
        SocketAddr::from_str(&addr_str).context("Invalid server address")
    }

    /// Get database URL with password masked for logging.
    pub fn database_url_masked(&self) -> String {
        if let Some(at_pos) = self.database_url.find('@') {
            if let Some(colon_pos) = self.database_url[..at_pos].rfind(':') {
                let mut masked = self.database_url.clone();
                masked.replace_range(colon_pos + 1..at_pos, "***");
                return masked;
            }
        }
        self.database_url.clone()
    }

    /// Validate configuration values.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        if self.port == 0 {
            anyhow::bail!("port must be greater than 0");
        }

        if self.database_max_connections == 0 {
            anyhow::bail!("database max_connections must be greater than 0");
        }

        if self.database_min_connections > self.database_max_connections {
            anyhow::bail!("database min_connections cannot exceed max_connections");
        }

        let sizes = [
            ("queue_concurrency", self.queue_concurrency),
            ("max_events_per_batch", self.max_events_per_batch),
            ("batch_chunk_size", self.batch_chunk_size),
            ("parser_workers", self.parser_workers),
            ("max_body_bytes", self.max_body_bytes),
            ("broadcast_capacity", self.broadcast_capacity),
            ("max_subscribers", self.max_subscribers),
        ];
        if let Some((name, _)) = sizes.iter().find(|(_, value)| *value == 0) {
            anyhow::bail!("{name} must be greater than 0");
        }

        if self.backpressure_threshold == 0 {
            anyhow::bail!("backpressure_threshold must be greater than 0");
        }

        if self.queue_dedup_retention_secs == 0 {
            anyhow::bail!("queue_dedup_retention_secs must be greater than 0");
        }

        if self.queue_max_attempts == 0 {
            anyhow::bail!("queue_max_attempts must be greater than 0");
        }

        if self.circuit_failure_threshold == 0 {
            anyhow::bail!("circuit_failure_threshold must be greater than 0");
        }

        if self.request_timeout_ms == 0 || self.shutdown_timeout_ms == 0 {
            anyhow::bail!("request and shutdown timeouts must be greater than 0");
        }

        if self.queue_name.trim().is_empty() {
            anyhow::bail!("queue_name must not be empty");
        }

        Ok(())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database_url: default_database_url(),
            database_max_connections: default_max_connections(),
            database_min_connections: default_min_connections(),
            database_connection_timeout: default_acquire_timeout(),
            host: default_host(),
            port: default_port(),
            request_timeout_ms: default_request_timeout_ms(),
            max_body_bytes: default_max_body_bytes(),
            large_payload_threshold_bytes: default_large_payload_threshold(),
            parser_workers: default_parser_workers(),
            queue_name: default_queue_name(),
            queue_backend: default_queue_backend(),
            queue_concurrency: default_queue_concurrency(),
            backpressure_threshold: default_backpressure_threshold(),
            queue_max_attempts: default_queue_max_attempts(),
            queue_backoff_ms: default_queue_backoff_ms(),
            queue_dedup_retention_secs: default_dedup_retention_secs(),
            max_events_per_batch: default_max_events_per_batch(),
            batch_chunk_size: default_batch_chunk_size(),
            circuit_failure_threshold: default_circuit_failure_threshold(),
            circuit_cooldown_ms: default_circuit_cooldown_ms(),
            shutdown_timeout_ms: default_shutdown_timeout_ms(),
            broadcast_capacity: default_broadcast_capacity(),
            max_subscribers: default_max_subscribers(),
            rust_log: default_log_level(),
        }
    }
}

fn default_database_url() -> String {
    "postgresql://localhost/pulse".to_string()
}

fn default_max_connections() -> u32 {
    20
}

fn default_min_connections() -> u32 {
    2
}

fn default_acquire_timeout() -> u64 {
    10
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_request_timeout_ms() -> u64 {
    30_000
}

fn default_max_body_bytes() -> usize {
    50 * 1024 * 1024
}

fn default_large_payload_threshold() -> usize {
    1024 * 1024
}

fn default_parser_workers() -> usize {
    4
}

fn default_queue_name() -> String {
    "sensor-events".to_string()
}

fn default_queue_backend() -> QueueBackend {
    QueueBackend::Postgres
}

fn default_queue_concurrency() -> usize {
    20
}

fn default_backpressure_threshold() -> u64 {
    10_000
}

fn default_queue_max_attempts() -> u32 {
    3
}

fn default_queue_backoff_ms() -> u64 {
    1000
}

fn default_dedup_retention_secs() -> u64 {
    24 * 60 * 60
}

fn default_max_events_per_batch() -> usize {
    10_000
}

fn default_batch_chunk_size() -> usize {
    1000
}

fn default_circuit_failure_threshold() -> u32 {
    5
}

fn default_circuit_cooldown_ms() -> u64 {
    30_000
}

fn default_shutdown_timeout_ms() -> u64 {
    60_000
}

fn default_broadcast_capacity() -> usize {
    1024
}

fn default_max_subscribers() -> usize {
    1000
}

fn default_log_level() -> String {
    "info".to_string()
}
