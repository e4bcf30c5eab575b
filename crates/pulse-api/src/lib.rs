//! Pulse HTTP API.
//!
//! Exposes event ingestion, health, metrics and a WebSocket feed of
//! processed events on top of an [`IngestEngine`].

#![forbid(unsafe_code)]
#![warn(missing_docs)]

use std::sync::Arc;

use pulse_core::Clock;
use pulse_pipeline::{IngestEngine, LargePayloadParser};

pub mod broadcast;
pub mod config;
pub mod handlers;
pub mod lifecycle;
pub mod server;

pub use broadcast::{BroadcastSession, Broadcaster};
pub use config::{Config, QueueBackend};
pub use lifecycle::RunningService;
pub use server::{create_router, serve, shutdown_signal, start_server, HttpLimits};

/// Shared state handed to every handler.
#[derive(Clone)]
pub struct AppState {
    /// Ingestion pipeline.
    pub engine: Arc<IngestEngine>,
    /// Live subscriber hub.
    pub broadcaster: Arc<Broadcaster>,
    /// Request body decoder.
    pub parser: LargePayloadParser,
    /// Time source for response timestamps.
    pub clock: Arc<dyn Clock>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("engine", &self.engine)
            .field("broadcaster", &self.broadcaster)
            .field("parser", &self.parser)
            .finish_non_exhaustive()
    }
}
