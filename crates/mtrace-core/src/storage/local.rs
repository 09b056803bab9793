//! Local store adapter
//!
//! Durable key/value persistence for entity snapshots, the pending
//! mutation queue, the abandoned list, conflict records and installation
//! metadata. No sync logic lives here.
//!
//! Every operation is synchronous from the caller's point of view and is
//! backed by a single SQLite connection, so a reopened store sees exactly
//! what the previous process wrote.

use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::Utc;
use rusqlite::{params, Connection, OptionalExtension, Transaction};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use super::error::{StorageError, StorageResult};
use super::schema::{init_schema, needs_init};
use crate::models::{AbandonedItem, ConflictRecord, Entity, EntityType, QueueItem};

/// Row counts and file size of the local store
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageStats {
    pub entity_count: usize,
    pub pending_count: usize,
    pub abandoned_count: usize,
    pub open_conflicts: usize,
    /// Size of the database file in bytes (0 for in-memory stores)
    pub database_size: u64,
}

/// Handle to the local SQLite store
///
/// Cloning is cheap; clones share the same connection.
#[derive(Clone)]
pub struct LocalStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl LocalStore {
    /// Open or create the database at `path`
    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| StorageError::from_io(e, parent.to_path_buf()))?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = FULL;")?;

        if needs_init(&conn)? {
            init_schema(&conn)?;
        }

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: Some(path.to_path_buf()),
        })
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path: None,
        })
    }

    fn conn(&self) -> StorageResult<MutexGuard<'_, Connection>> {
        self.conn.lock().map_err(|_| StorageError::LockPoisoned)
    }

    // ==================== Entity snapshots ====================

    /// Get an entity snapshot
    pub fn get(&self, entity_type: EntityType, id: &str) -> StorageResult<Option<Value>> {
        let conn = self.conn()?;
        let payload: Option<String> = conn
            .query_row(
                "SELECT payload FROM entities WHERE collection = ?1 AND id = ?2",
                params![entity_type.collection(), id],
                |row| row.get(0),
            )
            .optional()?;

        payload
            .map(|text| decode("entities", id, &text))
            .transpose()
    }

    /// Insert or replace an entity snapshot
    pub fn put(&self, entity_type: EntityType, id: &str, entity: &Value) -> StorageResult<()> {
        let conn = self.conn()?;
        upsert_entity(&conn, entity_type, id, entity)
    }

    /// Remove an entity snapshot; missing entities are ignored
    pub fn delete(&self, entity_type: EntityType, id: &str) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "DELETE FROM entities WHERE collection = ?1 AND id = ?2",
            params![entity_type.collection(), id],
        )?;
        Ok(())
    }

    /// All snapshots of a collection, ordered by id
    pub fn list(&self, entity_type: EntityType) -> StorageResult<Vec<Value>> {
        let conn = self.conn()?;
        let mut stmt =
            conn.prepare("SELECT id, payload FROM entities WHERE collection = ?1 ORDER BY id")?;
        let rows = stmt.query_map(params![entity_type.collection()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut entities = Vec::new();
        for row in rows {
            let (id, text) = row?;
            entities.push(decode("entities", &id, &text)?);
        }
        Ok(entities)
    }

    /// Overwrite whole collections in one transaction
    ///
    /// Entities without an id are skipped and reported back.
    pub fn replace_collections(
        &self,
        collections: &[(EntityType, Vec<Value>)],
    ) -> StorageResult<Vec<EntityType>> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        let mut skipped = Vec::new();

        for (entity_type, entities) in collections {
            tx.execute(
                "DELETE FROM entities WHERE collection = ?1",
                params![entity_type.collection()],
            )?;
            for entity in entities {
                match Entity(entity).id() {
                    Some(id) => upsert_entity(&tx, *entity_type, &id, entity)?,
                    None => skipped.push(*entity_type),
                }
            }
        }

        tx.commit()?;
        Ok(skipped)
    }

    // ==================== Queue ====================

    /// Pending queue items in delivery order
    pub fn list_pending(&self) -> StorageResult<Vec<QueueItem>> {
        let conn = self.conn()?;
        load_ordered(&conn, "pending_queue")
    }

    /// Replace the durable queue with `items`
    pub fn persist_queue(&self, items: &[QueueItem]) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        store_ordered(&tx, "pending_queue", items, |item| item.id.to_string())?;
        tx.commit()?;
        Ok(())
    }

    /// Abandoned items in the order they were abandoned
    pub fn list_abandoned(&self) -> StorageResult<Vec<AbandonedItem>> {
        let conn = self.conn()?;
        load_ordered(&conn, "abandoned_items")
    }

    /// Replace the durable abandoned list with `items`
    pub fn persist_abandoned(&self, items: &[AbandonedItem]) -> StorageResult<()> {
        let mut conn = self.conn()?;
        let tx = conn.transaction()?;
        store_ordered(&tx, "abandoned_items", items, |entry| {
            entry.item.id.to_string()
        })?;
        tx.commit()?;
        Ok(())
    }

    // ==================== Conflicts ====================

    /// All conflict records, oldest first
    pub fn load_conflicts(&self) -> StorageResult<Vec<ConflictRecord>> {
        let conn = self.conn()?;
        let mut stmt = conn.prepare(
            "SELECT conflict_id, record FROM conflicts ORDER BY detected_at, conflict_id",
        )?;
        let rows = stmt.query_map([], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
        })?;

        let mut records = Vec::new();
        for row in rows {
            let (id, text) = row?;
            records.push(decode("conflicts", &id, &text)?);
        }
        Ok(records)
    }

    /// Insert or update a conflict record
    pub fn save_conflict(&self, record: &ConflictRecord) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO conflicts (conflict_id, record, resolved, detected_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![
                record.conflict_id,
                serde_json::to_string(record)?,
                record.is_resolved(),
                record.detected_at.timestamp_millis()
            ],
        )?;
        Ok(())
    }

    // ==================== Metadata ====================

    pub fn get_meta(&self, key: &str) -> StorageResult<Option<String>> {
        let conn = self.conn()?;
        Ok(conn
            .query_row(
                "SELECT value FROM meta WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()?)
    }

    pub fn set_meta(&self, key: &str, value: &str) -> StorageResult<()> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR REPLACE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, value],
        )?;
        Ok(())
    }

    /// Get the value for `key`, storing `make()` first if it is absent
    pub fn get_or_insert_meta(
        &self,
        key: &str,
        make: impl FnOnce() -> String,
    ) -> StorageResult<String> {
        let conn = self.conn()?;
        conn.execute(
            "INSERT OR IGNORE INTO meta (key, value) VALUES (?1, ?2)",
            params![key, make()],
        )?;
        Ok(conn.query_row(
            "SELECT value FROM meta WHERE key = ?1",
            params![key],
            |row| row.get(0),
        )?)
    }

    // ==================== Stats ====================

    pub fn stats(&self) -> StorageResult<StorageStats> {
        let conn = self.conn()?;
        let count = |sql: &str| -> StorageResult<usize> {
            let n: i64 = conn.query_row(sql, [], |row| row.get(0))?;
            Ok(n as usize)
        };

        let database_size = self
            .path
            .as_ref()
            .and_then(|p| std::fs::metadata(p).ok())
            .map(|m| m.len())
            .unwrap_or(0);

        Ok(StorageStats {
            entity_count: count("SELECT COUNT(*) FROM entities")?,
            pending_count: count("SELECT COUNT(*) FROM pending_queue")?,
            abandoned_count: count("SELECT COUNT(*) FROM abandoned_items")?,
            open_conflicts: count("SELECT COUNT(*) FROM conflicts WHERE resolved = 0")?,
            database_size,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }
}

fn upsert_entity(
    conn: &Connection,
    entity_type: EntityType,
    id: &str,
    entity: &Value,
) -> StorageResult<()> {
    conn.execute(
        "INSERT OR REPLACE INTO entities (collection, id, payload, updated_at)
         VALUES (?1, ?2, ?3, ?4)",
        params![
            entity_type.collection(),
            id,
            serde_json::to_string(entity)?,
            Utc::now().timestamp_millis()
        ],
    )?;
    Ok(())
}

fn load_ordered<T: DeserializeOwned>(conn: &Connection, table: &'static str) -> StorageResult<Vec<T>> {
    let sql = format!("SELECT id, item FROM {} ORDER BY position", table);
    let mut stmt = conn.prepare(&sql)?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
    })?;

    let mut items = Vec::new();
    for row in rows {
        let (id, text) = row?;
        items.push(decode(table, &id, &text)?);
    }
    Ok(items)
}

fn store_ordered<T: Serialize>(
    tx: &Transaction<'_>,
    table: &'static str,
    items: &[T],
    key: impl Fn(&T) -> String,
) -> StorageResult<()> {
    tx.execute(&format!("DELETE FROM {}", table), [])?;
    let sql = format!("INSERT INTO {} (position, id, item) VALUES (?1, ?2, ?3)", table);
    let mut stmt = tx.prepare(&sql)?;
    for (position, item) in items.iter().enumerate() {
        stmt.execute(params![position as i64, key(item), serde_json::to_string(item)?])?;
    }
    Ok(())
}

fn decode<T: DeserializeOwned>(table: &'static str, key: &str, text: &str) -> StorageResult<T> {
    serde_json::from_str(text).map_err(|e| StorageError::CorruptRecord {
        table,
        key: key.to_string(),
        details: e.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Action, Resolution};
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_put_get_delete() {
        let store = LocalStore::open_in_memory().unwrap();
        let artifact = json!({"id": "a1", "name": "Bronze Ding", "v": 1});

        assert!(store.get(EntityType::Artifact, "a1").unwrap().is_none());

        store.put(EntityType::Artifact, "a1", &artifact).unwrap();
        assert_eq!(store.get(EntityType::Artifact, "a1").unwrap(), Some(artifact));

        // Same id in another collection is a different entity
        assert!(store.get(EntityType::Scene, "a1").unwrap().is_none());

        store.delete(EntityType::Artifact, "a1").unwrap();
        assert!(store.get(EntityType::Artifact, "a1").unwrap().is_none());

        // Deleting again is a no-op
        store.delete(EntityType::Artifact, "a1").unwrap();
    }

    #[test]
    fn test_replace_collections_overwrites() {
        let store = LocalStore::open_in_memory().unwrap();
        store.put(EntityType::Scene, "old", &json!({"id": "old"})).unwrap();
        store.put(EntityType::Artifact, "keep", &json!({"id": "keep"})).unwrap();

        let skipped = store
            .replace_collections(&[(
                EntityType::Scene,
                vec![json!({"id": "s1"}), json!({"id": "s2"}), json!({"title": "no id"})],
            )])
            .unwrap();

        assert_eq!(skipped, vec![EntityType::Scene]);
        let scenes = store.list(EntityType::Scene).unwrap();
        assert_eq!(scenes, vec![json!({"id": "s1"}), json!({"id": "s2"})]);
        // Untouched collection survives
        assert!(store.get(EntityType::Artifact, "keep").unwrap().is_some());
    }

    #[test]
    fn test_queue_persistence_keeps_order() {
        let store = LocalStore::open_in_memory().unwrap();
        let items: Vec<_> = (0..5)
            .map(|i| {
                QueueItem::new(EntityType::Scene, Action::Create, json!({"id": format!("s{}", i)}), "d")
            })
            .collect();

        store.persist_queue(&items).unwrap();
        assert_eq!(store.list_pending().unwrap(), items);

        store.persist_queue(&items[2..]).unwrap();
        assert_eq!(store.list_pending().unwrap(), items[2..].to_vec());
    }

    #[test]
    fn test_abandoned_persistence() {
        let store = LocalStore::open_in_memory().unwrap();
        let entry = AbandonedItem {
            item: QueueItem::new(EntityType::Activity, Action::Create, json!({"id": "x"}), "d"),
            abandoned_at: Utc::now(),
            reason: "timeout".to_string(),
        };

        store.persist_abandoned(std::slice::from_ref(&entry)).unwrap();
        assert_eq!(store.list_abandoned().unwrap(), vec![entry]);
    }

    #[test]
    fn test_conflict_roundtrip_and_stats() {
        let store = LocalStore::open_in_memory().unwrap();
        let mut record =
            ConflictRecord::new("c1", EntityType::Artifact, json!({"id": "a1"}), json!({"id": "a1", "v": 2}));
        store.save_conflict(&record).unwrap();
        assert_eq!(store.stats().unwrap().open_conflicts, 1);

        record.resolved_at = Some(Utc::now());
        record.resolution = Some(Resolution::Remote);
        store.save_conflict(&record).unwrap();

        let loaded = store.load_conflicts().unwrap();
        assert_eq!(loaded, vec![record]);
        assert_eq!(store.stats().unwrap().open_conflicts, 0);
    }

    #[test]
    fn test_meta_get_or_insert() {
        let store = LocalStore::open_in_memory().unwrap();
        let first = store.get_or_insert_meta("device_id", || "dev-1".to_string()).unwrap();
        let second = store.get_or_insert_meta("device_id", || "dev-2".to_string()).unwrap();
        assert_eq!(first, "dev-1");
        assert_eq!(second, "dev-1");
    }

    #[test]
    fn test_state_survives_reopen() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("mtrace.db");
        let item = QueueItem::new(EntityType::Scene, Action::Create, json!({"id": "s1"}), "d");

        {
            let store = LocalStore::open(&path).unwrap();
            store.put(EntityType::User, "u1", &json!({"id": "u1", "username": "li"})).unwrap();
            store.persist_queue(std::slice::from_ref(&item)).unwrap();
            store.set_meta("account_id", "u1").unwrap();
        }

        let store = LocalStore::open(&path).unwrap();
        assert_eq!(
            store.get(EntityType::User, "u1").unwrap(),
            Some(json!({"id": "u1", "username": "li"}))
        );
        assert_eq!(store.list_pending().unwrap(), vec![item]);
        assert_eq!(store.get_meta("account_id").unwrap(), Some("u1".to_string()));
        assert!(store.stats().unwrap().database_size > 0);
    }

    #[test]
    fn test_corrupt_row_is_reported() {
        let store = LocalStore::open_in_memory().unwrap();
        {
            let conn = store.conn().unwrap();
            conn.execute(
                "INSERT INTO pending_queue (position, id, item) VALUES (0, 'bad', 'not json')",
                [],
            )
            .unwrap();
        }

        let err = store.list_pending().unwrap_err();
        assert!(matches!(err, StorageError::CorruptRecord { table: "pending_queue", .. }));
    }
}
