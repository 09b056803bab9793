//! Sync machinery
//!
//! Keeps the local store consistent with the remote service across
//! intermittent connectivity.
//!
//! ## Components
//!
//! - `queue`: durable, ordered, at-least-once delivery of local mutations
//! - `connection`: the push channel, with fixed-delay reconnection
//! - `reconcile`: full snapshot sync and incremental remote changes
//! - `conflict`: conflict ledger and resolution policies
//! - `events` / `state`: what the presentation layer may observe
//!
//! ## Wire contract
//!
//! Push frames are JSON objects discriminated by `type`
//! (`sync_update`, `conflict_detected`, `sync_completed`, `status_update`).
//! Request/response calls go to `GET /initial/{account}`,
//! `GET /force/{account}`, `POST /sync/{entityType}` and
//! `POST /resolve/{conflictId}`.

pub mod conflict;
pub mod connection;
pub mod error;
pub mod events;
pub mod message;
pub mod queue;
pub mod reconcile;
pub mod remote;
pub mod scheduler;
pub mod state;

pub use conflict::{ConflictLedger, ConflictResolver};
pub use connection::{ConnectionManager, Connector, MessageHandler, PushChannel, WsConnector};
pub use error::{SyncError, SyncResult};
pub use events::{EventBus, SyncEvent};
pub use message::{
    ClientFrame, ConflictDetected, ConflictInfo, PushFrame, ResolveRequest, ResolveResponse,
    SnapshotData, SnapshotResponse, SubmitOutcome, SubmitRequest, SyncCompleted, SyncUpdate,
};
pub use queue::SyncQueue;
pub use reconcile::Reconciler;
pub use remote::{HttpRemote, RemoteService};
pub use scheduler::ScheduledTask;
pub use state::{ConnectionStatus, SyncState, SyncStateHandle};
