//! Shared sync state
//!
//! One `SyncState` value per engine, readable by anyone through a watch
//! channel. Writes are partitioned by field group: the connection manager
//! owns connectivity, the queue owns the counters, the reconciler owns the
//! full-sync markers.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;

/// Push channel state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// Not connected, not trying
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Channel open and dispatching frames
    Open,
    /// Waiting for the reconnect timer
    Reconnecting,
}

impl ConnectionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Open => "open",
            ConnectionStatus::Reconnecting => "reconnecting",
        }
    }
}

impl std::fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of the engine's observable state
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncState {
    pub is_online: bool,
    pub channel_open: bool,
    pub connection: ConnectionStatus,
    pub queue_length: usize,
    pub abandoned_count: usize,
    pub last_full_sync_at: Option<DateTime<Utc>>,
    pub last_full_sync_count: Option<usize>,
}

impl SyncState {
    pub fn new(is_online: bool) -> Self {
        Self {
            is_online,
            channel_open: false,
            connection: ConnectionStatus::Disconnected,
            queue_length: 0,
            abandoned_count: 0,
            last_full_sync_at: None,
            last_full_sync_count: None,
        }
    }
}

/// Shared handle to the engine's `SyncState`
#[derive(Debug, Clone)]
pub struct SyncStateHandle {
    tx: Arc<watch::Sender<SyncState>>,
}

impl SyncStateHandle {
    pub fn new(is_online: bool) -> Self {
        let (tx, _rx) = watch::channel(SyncState::new(is_online));
        Self { tx: Arc::new(tx) }
    }

    /// Current state
    pub fn snapshot(&self) -> SyncState {
        self.tx.borrow().clone()
    }

    /// Receiver notified on every change
    pub fn subscribe(&self) -> watch::Receiver<SyncState> {
        self.tx.subscribe()
    }

    pub fn is_online(&self) -> bool {
        self.tx.borrow().is_online
    }

    // Connection manager

    pub(crate) fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|state| {
            let changed = state.is_online != online;
            state.is_online = online;
            changed
        });
    }

    pub(crate) fn set_connection(&self, status: ConnectionStatus) {
        self.tx.send_if_modified(|state| {
            let open = status == ConnectionStatus::Open;
            let changed = state.connection != status || state.channel_open != open;
            state.connection = status;
            state.channel_open = open;
            changed
        });
    }

    // Sync queue

    pub(crate) fn set_queue_counts(&self, pending: usize, abandoned: usize) {
        self.tx.send_if_modified(|state| {
            let changed = state.queue_length != pending || state.abandoned_count != abandoned;
            state.queue_length = pending;
            state.abandoned_count = abandoned;
            changed
        });
    }

    // Reconciler

    pub(crate) fn record_full_sync(&self, at: DateTime<Utc>, count: usize) {
        self.tx.send_modify(|state| {
            state.last_full_sync_at = Some(at);
            state.last_full_sync_count = Some(count);
        });
    }
}
