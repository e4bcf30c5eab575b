//! Service startup and ordered teardown.
//!
//! [`RunningService::launch`] wires the broadcast hub into the engine's
//! notifications, starts the worker pool and serves HTTP.
//! [`RunningService::shutdown_plan`] unwinds the same pieces in dependency
//! order:
//!
//! ```text
//! stop_accepting -> unsubscribe_broadcaster -> close_workers
//!     -> close_queue -> close_broadcaster -> close_store
//! ```
//!
//! Workers finish their in-flight jobs before the queue closes, and the
//! store closes last so those jobs can still persist.

use std::{net::SocketAddr, sync::Arc};

use pulse_core::{NotificationHandler, PulseError, Result, SubscriptionId};
use pulse_pipeline::{IngestEngine, ShutdownPlan};
use tokio::{net::TcpListener, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::{server, AppState, Broadcaster, HttpLimits};

/// Handles to every long-lived piece of a started service.
pub struct RunningService {
    engine: Arc<IngestEngine>,
    broadcaster: Arc<Broadcaster>,
    subscription: SubscriptionId,
    local_addr: SocketAddr,
    stop_accepting: CancellationToken,
    server_done: CancellationToken,
    server: JoinHandle<std::io::Result<()>>,
}

impl RunningService {
    /// Subscribes the hub, starts workers and begins serving on `listener`.
    ///
    /// # Errors
    ///
    /// Returns an error if the listener has no local address or the
    /// notification bus refuses the hub.
    pub async fn launch(state: AppState, limits: HttpLimits, listener: TcpListener) -> Result<Self> {
        let local_addr =
            listener.local_addr().map_err(|e| PulseError::Other(anyhow::anyhow!(e)))?;

        let handler: Arc<dyn NotificationHandler> = state.broadcaster.clone();
        let subscription = state.engine.notifications().subscribe(handler)?;

        state.engine.start().await;

        let engine = state.engine.clone();
        let broadcaster = state.broadcaster.clone();
        let stop_accepting = CancellationToken::new();
        let server_done = CancellationToken::new();

        let server = tokio::spawn({
            let stop_accepting = stop_accepting.clone();
            let server_done = server_done.clone();
            async move {
                let result = server::serve(listener, state, limits, stop_accepting).await;
                server_done.cancel();
                result
            }
        });

        info!(addr = %local_addr, %subscription, "service launched");

        Ok(Self {
            engine,
            broadcaster,
            subscription,
            local_addr,
            stop_accepting,
            server_done,
            server,
        })
    }

    /// Address the HTTP server is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The running engine.
    pub fn engine(&self) -> &Arc<IngestEngine> {
        &self.engine
    }

    /// Resolves once the HTTP server task has exited for any reason.
    pub async fn server_stopped(&self) {
        self.server_done.cancelled().await;
    }

    /// Builds the teardown sequence. Nothing runs until the plan executes.
    pub fn shutdown_plan(self) -> ShutdownPlan {
        let Self { engine, broadcaster, subscription, stop_accepting, server, .. } = self;

        ShutdownPlan::new()
            .step("stop_accepting", async move {
                stop_accepting.cancel();
                Ok(())
            })
            .step("unsubscribe_broadcaster", {
                let engine = engine.clone();
                async move {
                    engine.notifications().unsubscribe(subscription);
                    Ok(())
                }
            })
            .step("close_workers", {
                let engine = engine.clone();
                async move { engine.close_workers().await }
            })
            .step("close_queue", {
                let engine = engine.clone();
                async move { engine.close_queue().await }
            })
            .step("close_broadcaster", async move {
                broadcaster.close();
                match server.await {
                    Ok(Ok(())) => Ok(()),
                    Ok(Err(e)) => Err(PulseError::shutdown("close_broadcaster", e.to_string())),
                    Err(e) => Err(PulseError::shutdown(
                        "close_broadcaster",
                        format!("server task failed: {e}"),
                    )),
                }
            })
            .step("close_store", async move { engine.close_store().await })
    }
}

impl std::fmt::Debug for RunningService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RunningService")
            .field("local_addr", &self.local_addr)
            .field("subscription", &self.subscription)
            .field("server_running", &!self.server_done.is_cancelled())
            .finish_non_exhaustive()
    }
}
