//! Fan-out of processed events to live WebSocket sessions.
//!
//! Each notification is serialized once and pushed into a bounded
//! `tokio::sync::broadcast` channel. Sessions read from their own receiver;
//! a session that falls more than the channel capacity behind skips the
//! missed frames and keeps going.

use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::ws::Utf8Bytes;
use pulse_core::{NotificationHandler, ProcessedNotification};
use tokio::sync::{broadcast, OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Live subscriber hub.
pub struct Broadcaster {
    sender: broadcast::Sender<Utf8Bytes>,
    sessions: Arc<Semaphore>,
    max_sessions: usize,
    closed: CancellationToken,
}

impl Broadcaster {
    /// Creates a hub buffering `capacity` frames for at most `max_sessions`
    /// concurrent sessions.
    pub fn new(capacity: usize, max_sessions: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self {
            sender,
            sessions: Arc::new(Semaphore::new(max_sessions)),
            max_sessions,
            closed: CancellationToken::new(),
        }
    }

    /// Opens a session, or returns `None` when the hub is full or closed.
    pub fn open_session(&self) -> Option<BroadcastSession> {
        if self.closed.is_cancelled() {
            return None;
        }

        let permit = match Arc::clone(&self.sessions).try_acquire_owned() {
            Ok(permit) => permit,
            Err(TryAcquireError::NoPermits) => {
                warn!(max_sessions = self.max_sessions, "subscriber limit reached");
                return None;
            },
            Err(TryAcquireError::Closed) => return None,
        };

        Some(BroadcastSession {
            receiver: self.sender.subscribe(),
            evicted: self.closed.child_token(),
            _permit: permit,
        })
    }

    /// Number of open sessions.
    pub fn session_count(&self) -> usize {
        self.max_sessions.saturating_sub(self.sessions.available_permits())
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Rejects new sessions and evicts existing ones.
    pub fn close(&self) {
        let evicted = self.session_count();
        self.closed.cancel();
        self.sessions.close();
        info!(evicted, "broadcast hub closed");
    }

    fn send(&self, frame: Utf8Bytes) {
        // Err only means nobody is listening right now.
        if let Ok(receivers) = self.sender.send(frame) {
            debug!(receivers, "frame broadcast");
        }
    }
}

#[async_trait]
impl NotificationHandler for Broadcaster {
    async fn handle(&self, notification: &ProcessedNotification) {
        if self.closed.is_cancelled() {
            return;
        }
        match serde_json::to_string(notification) {
            Ok(text) => self.send(text.into()),
            Err(e) => {
                warn!(event_id = %notification.event().event_id, error = %e, "failed to encode notification");
            },
        }
    }
}

impl std::fmt::Debug for Broadcaster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broadcaster")
            .field("sessions", &self.session_count())
            .field("max_sessions", &self.max_sessions)
            .field("closed", &self.is_closed())
            .finish()
    }
}

/// One subscriber's view of the hub. Dropping it frees the slot.
#[derive(Debug)]
pub struct BroadcastSession {
    receiver: broadcast::Receiver<Utf8Bytes>,
    evicted: CancellationToken,
    _permit: OwnedSemaphorePermit,
}

impl BroadcastSession {
    /// Next frame, or `None` once the hub evicts this session.
    pub async fn next_frame(&mut self) -> Option<Utf8Bytes> {
        loop {
            tokio::select! {
                biased;
                () = self.evicted.cancelled() => return None,
                received = self.receiver.recv() => match received {
                    Ok(frame) => return Some(frame),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "subscriber lagging, frames dropped");
                    },
                    Err(broadcast::error::RecvError::Closed) => return None,
                },
            }
        }
    }
}
