//! Millennium Trace core library
//!
//! Offline-first sync engine for a user's artifacts, scenes, collectibles
//! and activity history. Local writes land in SQLite immediately and are
//! delivered to the remote service through a durable queue whenever the
//! device is online.
//!
//! # Architecture
//!
//! - **Local store**: source of truth for reads, one collection per entity type
//! - **Sync queue**: ordered, at-least-once delivery of local mutations
//! - **Push channel**: WebSocket carrying remote changes and conflict notices
//! - **Reconciler / resolver**: snapshot sync and conflict settlement
//!
//! # Quick Start
//!
//! ```text
//! let engine = SyncEngine::open(Config::load()?)?;
//! engine.start("user-42").await?;
//!
//! engine.sync_artifact(json!({"id": "a1", "name": "Bronze mirror"}), Action::Create).await;
//! let artifact = engine.get(EntityType::Artifact, "a1")?;
//! ```
//!
//! # Modules
//!
//! - `engine`: the facade wiring every component (main entry point)
//! - `models`: queue items, conflicts and reports
//! - `storage`: SQLite persistence
//! - `sync`: queue, connection, reconciliation and conflicts
//! - `services`: recognition, scene generation and minting clients
//! - `config`: application configuration

pub mod config;
pub mod engine;
pub mod identity;
pub mod models;
pub mod services;
pub mod storage;
pub mod sync;

pub use config::{Config, ServiceEndpoints, SyncSettings};
pub use engine::{EngineStatus, SyncEngine};
pub use identity::Identity;
pub use models::{
    AbandonedItem, Action, ConflictRecord, DrainReport, EntityType, QueueItem, Resolution,
    SyncMode, SyncReport,
};
pub use services::{MintClient, RecognitionClient, SceneClient};
pub use storage::{LocalStore, StorageError, StorageStats};
pub use sync::{ConnectionStatus, SyncError, SyncEvent, SyncResult, SyncState};
