//! Processed-event notifications and the bounded subscriber registry.
//!
//! Workers publish one [`ProcessedNotification`] per persisted event. The
//! [`NotificationBus`] fans each notification out to every registered
//! [`NotificationHandler`] concurrently.
//!
//! ```text
//! ┌─────────────────┐  EventProcessed   ┌──────────────────┐
//! │ Worker Pool     │ ─────────────────▶│ NotificationBus  │
//! │ (Producer)      │                   │ (bounded)        │
//! └─────────────────┘                   └──────────────────┘
//!                                                │
//!                                                │ join_all
//!                                                ▼
//!                                       ┌──────────────────┐
//!                                       │ Broadcaster      │
//!                                       │ (WebSocket hub)  │
//!                                       └──────────────────┘
//! ```
//!
//! Subscriptions are explicit so shutdown can detach the broadcast hub
//! before the worker pool drains.

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, RwLock,
    },
};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::{
    error::{PulseError, Result},
    models::ProcessedEvent,
};

/// Notification emitted after an event has been persisted.
///
/// Serializes to `{"type":"event_processed","data":{...}}`, which is the
/// frame format live subscribers receive.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ProcessedNotification {
    /// An event was stored.
    EventProcessed(ProcessedEvent),
}

impl ProcessedNotification {
    /// The event this notification is about.
    pub fn event(&self) -> &ProcessedEvent {
        match self {
            Self::EventProcessed(event) => event,
        }
    }
}

/// Receiver of processed-event notifications.
///
/// Implementations must not block worker progress and must swallow their
/// own failures.
#[async_trait::async_trait]
pub trait NotificationHandler: Send + Sync + fmt::Debug {
    /// Handles one notification.
    async fn handle(&self, notification: &ProcessedNotification);
}

/// Handle returned by [`NotificationBus::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

type Subscriber = (SubscriptionId, Arc<dyn NotificationHandler>);

/// Bounded registry of notification handlers.
pub struct NotificationBus {
    subscribers: RwLock<Vec<Subscriber>>,
    max_subscribers: usize,
    next_id: AtomicU64,
}

impl NotificationBus {
    /// Creates a bus that accepts at most `max_subscribers` handlers.
    pub fn new(max_subscribers: usize) -> Self {
        Self { subscribers: RwLock::new(Vec::new()), max_subscribers, next_id: AtomicU64::new(1) }
    }

    /// Registers a handler.
    ///
    /// # Errors
    ///
    /// Returns `PulseError::Other` when the registry is full.
    pub fn subscribe(&self, handler: Arc<dyn NotificationHandler>) -> Result<SubscriptionId> {
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        if subscribers.len() >= self.max_subscribers {
            return Err(PulseError::Other(anyhow::anyhow!(
                "notification bus is full ({} subscribers)",
                self.max_subscribers
            )));
        }

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        subscribers.push((id, handler));
        debug!(subscription = %id, count = subscribers.len(), "notification handler subscribed");
        Ok(id)
    }

    /// Removes a handler. Returns whether anything was removed.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscribers = self.subscribers.write().unwrap_or_else(|e| e.into_inner());
        let before = subscribers.len();
        subscribers.retain(|(existing, _)| *existing != id);
        let removed = subscribers.len() != before;

        if removed {
            debug!(subscription = %id, "notification handler unsubscribed");
        } else {
            warn!(subscription = %id, "unsubscribe for unknown subscription");
        }
        removed
    }

    /// Number of registered handlers.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// Delivers a notification to every handler concurrently.
    pub async fn publish(&self, notification: &ProcessedNotification) {
        // Snapshot so the lock is released before any handler runs.
        let handlers: Vec<Arc<dyn NotificationHandler>> = self
            .subscribers
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, handler)| Arc::clone(handler))
            .collect();

        let futures = handlers.iter().map(|handler| handler.handle(notification));
        futures::future::join_all(futures).await;
    }
}

impl fmt::Debug for NotificationBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotificationBus")
            .field("subscribers", &self.subscriber_count())
            .field("max_subscribers", &self.max_subscribers)
            .finish()
    }
}
