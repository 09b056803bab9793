//! Storage layer
//!
//! Durable local state of the engine, kept in a single SQLite database:
//!
//! - **Entity snapshots**: one row per entity, grouped by collection
//! - **Pending queue / abandoned list**: ordered queue items
//! - **Conflicts**: open and resolved conflict records
//! - **Metadata**: device id and current account

pub mod error;
pub mod local;
pub mod schema;

pub use error::{StorageError, StorageResult};
pub use local::{LocalStore, StorageStats};
pub use schema::{init_schema, needs_init, SCHEMA_VERSION};
