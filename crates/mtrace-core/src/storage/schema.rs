//! SQLite schema for the local store
//!
//! Entity snapshots are stored per collection; the pending queue and the
//! abandoned list keep their insertion order through an explicit position.

use rusqlite::{params, Connection, OptionalExtension, Result};

/// Current schema version for migrations
pub const SCHEMA_VERSION: i32 = 1;

/// Initialize the database schema
pub fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Schema version tracking
        CREATE TABLE IF NOT EXISTS schema_info (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        -- Entity snapshots, one row per entity
        CREATE TABLE IF NOT EXISTS entities (
            collection TEXT NOT NULL,
            id TEXT NOT NULL,
            payload TEXT NOT NULL,
            updated_at INTEGER NOT NULL,
            PRIMARY KEY (collection, id)
        );

        -- Pending mutations in delivery order
        CREATE TABLE IF NOT EXISTS pending_queue (
            position INTEGER PRIMARY KEY,
            id TEXT UNIQUE NOT NULL,
            item TEXT NOT NULL
        );

        -- Items that exhausted their retries
        CREATE TABLE IF NOT EXISTS abandoned_items (
            position INTEGER PRIMARY KEY,
            id TEXT UNIQUE NOT NULL,
            item TEXT NOT NULL
        );

        -- Conflict records, open and resolved
        CREATE TABLE IF NOT EXISTS conflicts (
            conflict_id TEXT PRIMARY KEY,
            record TEXT NOT NULL,
            resolved INTEGER NOT NULL DEFAULT 0,
            detected_at INTEGER NOT NULL
        );

        -- Installation metadata (device id, current account)
        CREATE TABLE IF NOT EXISTS meta (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_entities_collection ON entities(collection);
        CREATE INDEX IF NOT EXISTS idx_conflicts_resolved ON conflicts(resolved);
        "#,
    )?;

    conn.execute(
        "INSERT OR REPLACE INTO schema_info (key, value) VALUES ('version', ?1)",
        params![SCHEMA_VERSION.to_string()],
    )?;

    Ok(())
}

/// Check if the schema needs to be initialized or migrated
pub fn needs_init(conn: &Connection) -> Result<bool> {
    let table_exists: bool = conn.query_row(
        "SELECT EXISTS(SELECT 1 FROM sqlite_master WHERE type='table' AND name='schema_info')",
        [],
        |row| row.get(0),
    )?;

    if !table_exists {
        return Ok(true);
    }

    let version: Option<String> = conn
        .query_row(
            "SELECT value FROM schema_info WHERE key = 'version'",
            [],
            |row| row.get(0),
        )
        .optional()?;

    match version {
        Some(v) => Ok(v.parse::<i32>().unwrap_or(0) < SCHEMA_VERSION),
        None => Ok(true),
    }
}
