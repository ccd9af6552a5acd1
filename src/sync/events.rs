//! Queue-state events and the hub that fans them out.

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::SyncItem;

/// Events published while items move through the queue.
///
/// Serialized as `{"event": "<name>", "data": {...}}`.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(
    tag = "event",
    content = "data",
    rename_all = "kebab-case",
    rename_all_fields = "camelCase"
)]
pub enum SyncEvent {
    Queued {
        item: SyncItem,
        queue_size: usize,
    },
    Started {
        queue_size: usize,
    },
    ItemSynced {
        item: SyncItem,
    },
    ItemFailed {
        item: SyncItem,
        error: String,
    },
    Completed {
        successful: usize,
        failed: usize,
        total: usize,
        timestamp: DateTime<Utc>,
    },
}

impl SyncEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SyncEvent::Queued { .. } => "queued",
            SyncEvent::Started { .. } => "started",
            SyncEvent::ItemSynced { .. } => "item-synced",
            SyncEvent::ItemFailed { .. } => "item-failed",
            SyncEvent::Completed { .. } => "completed",
        }
    }
}

/// Broadcasts [`SyncEvent`]s to every subscriber.
///
/// Slow subscribers lose the oldest events rather than blocking the engine.
#[derive(Debug, Clone)]
pub struct Notifier {
    sender: broadcast::Sender<SyncEvent>,
}

impl Notifier {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.sender.subscribe()
    }

    pub fn notify(&self, event: SyncEvent) {
        tracing::debug!(event = event.name(), "sync event");
        // Ignore send errors (no subscribers)
        let _ = self.sender.send(event);
    }
}

impl Default for Notifier {
    fn default() -> Self {
        Self::new(256)
    }
}
