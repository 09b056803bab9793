//! Engine event bus
//!
//! Publish/subscribe channel scoped to one engine. Publishing never blocks
//! and never fails; a subscriber that falls behind loses the oldest events.

use serde::Serialize;
use serde_json::Value;
use tokio::sync::broadcast;

use super::message::SyncUpdate;
use super::state::ConnectionStatus;
use crate::models::{AbandonedItem, ConflictRecord, DrainReport, QueueItem, Resolution};

/// Notifications for the presentation layer
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum SyncEvent {
    /// Queue counters changed
    QueueUpdated { pending: usize, abandoned: usize },
    /// A remote-origin change arrived
    SyncUpdate(SyncUpdate),
    /// A conflict was raised
    SyncConflict(ConflictRecord),
    /// A server-initiated bulk sync finished
    SyncCompleted { synced_count: usize, errors: Vec<String> },
    /// Local snapshots were replaced by a reconciliation
    LocalDataUpdated,
    /// A drain cycle finished
    DrainFinished(DrainReport),
    ConnectionChanged(ConnectionStatus),
    /// Credentials were refused; automatic reconnection is suspended
    AuthenticationFailed(String),
    ItemAbandoned(AbandonedItem),
    /// The server refused a mutation; it was removed from the queue
    ItemRejected { item: QueueItem, reason: String },
    ConflictResolved {
        conflict_id: String,
        resolution: Resolution,
    },
    StatusUpdate(Value),
}

impl SyncEvent {
    pub fn kind(&self) -> &'static str {
        match self {
            SyncEvent::QueueUpdated { .. } => "queue_updated",
            SyncEvent::SyncUpdate(_) => "sync_update",
            SyncEvent::SyncConflict(_) => "sync_conflict",
            SyncEvent::SyncCompleted { .. } => "sync_completed",
            SyncEvent::LocalDataUpdated => "local_data_updated",
            SyncEvent::DrainFinished(_) => "drain_finished",
            SyncEvent::ConnectionChanged(_) => "connection_changed",
            SyncEvent::AuthenticationFailed(_) => "authentication_failed",
            SyncEvent::ItemAbandoned(_) => "item_abandoned",
            SyncEvent::ItemRejected { .. } => "item_rejected",
            SyncEvent::ConflictResolved { .. } => "conflict_resolved",
            SyncEvent::StatusUpdate(_) => "status_update",
        }
    }
}

/// Broadcast bus for `SyncEvent`s
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<SyncEvent>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (tx, _rx) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.tx.subscribe()
    }

    pub fn publish(&self, event: SyncEvent) {
        // No subscribers is fine
        let _ = self.tx.send(event);
    }

    pub fn subscriber_count(&self) -> usize {
        self.tx.receiver_count()
    }
}
