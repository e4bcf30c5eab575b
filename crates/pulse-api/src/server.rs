//! HTTP server configuration and request routing.
//!
//! Requests flow through middleware in order:
//! 1. Request ID generation
//! 2. Request/response logging
//! 3. Timeout enforcement
//! 4. Body size limit
//! 5. Handler execution
//!
//! # Graceful Shutdown
//!
//! [`start_server`] stops accepting connections once its cancellation token
//! fires and returns after in-flight requests finish. The binary cancels the
//! token as the first shutdown step.

use std::{net::SocketAddr, time::Duration};

use axum::{
    extract::{DefaultBodyLimit, Request},
    middleware::{self, Next},
    response::Response,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::{timeout::TimeoutLayer, trace::TraceLayer};
use tracing::info;
use uuid::Uuid;

use crate::{handlers, AppState};

/// Per-request limits applied by the router.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HttpLimits {
    /// Time budget for one request.
    pub request_timeout: Duration,
    /// Largest accepted body.
    pub max_body_bytes: usize,
}

impl Default for HttpLimits {
    fn default() -> Self {
        Self { request_timeout: Duration::from_secs(30), max_body_bytes: 50 * 1024 * 1024 }
    }
}

/// Creates the Axum router with all routes and middleware.
///
/// # Example
///
/// ```no_run
/// use pulse_api::{create_router, AppState, HttpLimits};
///
/// fn build(state: AppState) {
///     let app = create_router(state, HttpLimits::default());
///     // Serve the app...
/// }
/// ```
pub fn create_router(state: AppState, limits: HttpLimits) -> Router {
    let api_routes = Router::new()
        .route("/api/events", post(handlers::ingest_event))
        .route("/api/events/batch", post(handlers::ingest_batch));

    let ops_routes = Router::new()
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .route("/ws", get(handlers::subscribe));

    Router::new()
        .merge(api_routes)
        .merge(ops_routes)
        .layer(DefaultBodyLimit::max(limits.max_body_bytes))
        .layer(TimeoutLayer::new(limits.request_timeout))
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(inject_request_id))
        .with_state(state)
}

/// Middleware to inject request ID into all responses.
///
/// Adds X-Request-Id header for tracing requests across services.
async fn inject_request_id(req: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();

    let mut req = req;
    req.extensions_mut().insert(request_id.clone());

    let mut response = next.run(req).await;

    if let Ok(header_value) = request_id.parse() {
        response.headers_mut().insert("X-Request-Id", header_value);
    }

    response
}

/// Binds `addr` and serves the API until `shutdown` is cancelled.
///
/// # Errors
///
/// Returns `std::io::Error` if the address cannot be bound or the accept
/// loop fails.
pub async fn start_server(
    state: AppState,
    limits: HttpLimits,
    addr: SocketAddr,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let listener = TcpListener::bind(addr).await?;
    serve(listener, state, limits, shutdown).await
}

/// Serves the API on an already bound listener until `shutdown` is
/// cancelled, then waits for in-flight requests.
///
/// # Errors
///
/// Returns `std::io::Error` if the accept loop fails.
pub async fn serve(
    listener: TcpListener,
    state: AppState,
    limits: HttpLimits,
    shutdown: CancellationToken,
) -> Result<(), std::io::Error> {
    let app = create_router(state, limits);
    let actual_addr = listener.local_addr()?;

    info!(addr = %actual_addr, "HTTP server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await?;

    info!("HTTP server stopped gracefully");
    Ok(())
}

/// Waits for shutdown signal (CTRL+C or SIGTERM).
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            },
            Err(e) => {
                tracing::error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received CTRL+C, starting graceful shutdown");
        },
        () = terminate => {
            info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}
