//! Data models for the sync engine
//!
//! Entities are opaque JSON payloads: the engine only reads their id,
//! version and owner. Everything else belongs to the presentation layer.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Kind of user-owned entity kept in sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum EntityType {
    /// The account profile
    User,
    /// A captured artifact
    Artifact,
    /// A generated scene
    Scene,
    /// A minted collectible
    Collectible,
    /// An activity log entry
    Activity,
}

impl EntityType {
    pub const ALL: [EntityType; 5] = [
        EntityType::User,
        EntityType::Artifact,
        EntityType::Scene,
        EntityType::Collectible,
        EntityType::Activity,
    ];

    /// Name used on the wire (`POST /sync/{entityType}`)
    pub fn as_str(&self) -> &'static str {
        match self {
            EntityType::User => "user",
            EntityType::Artifact => "artifact",
            EntityType::Scene => "scene",
            EntityType::Collectible => "nft",
            EntityType::Activity => "activity",
        }
    }

    /// Name of the persisted collection and of the snapshot field
    pub fn collection(&self) -> &'static str {
        match self {
            EntityType::User => "user",
            EntityType::Artifact => "artifacts",
            EntityType::Scene => "scenes",
            EntityType::Collectible => "nfts",
            EntityType::Activity => "activities",
        }
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Error returned when an entity type name is not recognized
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("unknown entity type: {0}")]
pub struct UnknownEntityType(pub String);

impl FromStr for EntityType {
    type Err = UnknownEntityType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "user" | "users" => Ok(EntityType::User),
            "artifact" | "artifacts" => Ok(EntityType::Artifact),
            "scene" | "scenes" => Ok(EntityType::Scene),
            "nft" | "nfts" | "collectible" | "collectibles" => Ok(EntityType::Collectible),
            "activity" | "activities" => Ok(EntityType::Activity),
            _ => Err(UnknownEntityType(s.to_string())),
        }
    }
}

impl TryFrom<String> for EntityType {
    type Error = UnknownEntityType;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<EntityType> for String {
    fn from(value: EntityType) -> Self {
        value.as_str().to_string()
    }
}

/// Kind of local mutation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Create,
    Update,
    Delete,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Create => "create",
            Action::Update => "update",
            Action::Delete => "delete",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "create" => Ok(Action::Create),
            "update" => Ok(Action::Update),
            "delete" => Ok(Action::Delete),
            other => Err(format!("unknown action: {}", other)),
        }
    }
}

/// Read-only view over an entity payload
///
/// Only identifier, version and owner are interpreted.
pub struct Entity<'a>(pub &'a Value);

impl<'a> Entity<'a> {
    /// Globally unique identifier (string or numeric `id`)
    pub fn id(&self) -> Option<String> {
        match self.0.get("id")? {
            Value::String(s) if !s.is_empty() => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        }
    }

    /// Version marker: `version`, `v` or `updatedAt`, whichever is present
    pub fn version(&self) -> Option<&'a Value> {
        ["version", "v", "updatedAt"]
            .iter()
            .find_map(|key| self.0.get(*key))
    }

    /// Owning account identifier
    pub fn owner(&self) -> Option<&'a str> {
        ["userId", "ownerId"]
            .iter()
            .find_map(|key| self.0.get(*key).and_then(Value::as_str))
    }
}

/// Identifier of a single entity across collections
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EntityKey {
    pub entity_type: EntityType,
    pub id: Option<String>,
}

/// A pending local mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QueueItem {
    /// Unique queue item identifier
    pub id: Uuid,
    pub entity_type: EntityType,
    pub action: Action,
    pub payload: Value,
    pub enqueued_at: DateTime<Utc>,
    pub retry_count: u32,
    pub origin_device_id: String,
    /// Error message of the last failed delivery
    #[serde(default)]
    pub last_error: Option<String>,
    /// Conflict id parking this item until the conflict is resolved
    #[serde(default)]
    pub held_by: Option<String>,
}

impl QueueItem {
    pub fn new(
        entity_type: EntityType,
        action: Action,
        payload: Value,
        origin_device_id: impl Into<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            entity_type,
            action,
            payload,
            enqueued_at: Utc::now(),
            retry_count: 0,
            origin_device_id: origin_device_id.into(),
            last_error: None,
            held_by: None,
        }
    }

    /// Identifier of the entity this mutation targets
    pub fn entity_id(&self) -> Option<String> {
        Entity(&self.payload).id()
    }

    pub fn entity_key(&self) -> EntityKey {
        EntityKey {
            entity_type: self.entity_type,
            id: self.entity_id(),
        }
    }

    /// Whether this item mutates the given entity
    pub fn targets(&self, entity_type: EntityType, id: &str) -> bool {
        self.entity_type == entity_type && self.entity_id().as_deref() == Some(id)
    }
}

/// A queue item that exhausted its retries, held for inspection
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AbandonedItem {
    pub item: QueueItem,
    pub abandoned_at: DateTime<Utc>,
    pub reason: String,
}

/// How a conflict is settled
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// Re-submit the local payload, superseding the remote one
    Local,
    /// Discard the local mutation, keep the remote payload
    Remote,
    /// Submit a caller-supplied merged payload
    Merge,
}

impl Resolution {
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Local => "local",
            Resolution::Remote => "remote",
            Resolution::Merge => "merge",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "local" => Ok(Resolution::Local),
            "remote" => Ok(Resolution::Remote),
            "merge" => Ok(Resolution::Merge),
            other => Err(format!("unknown resolution policy: {}", other)),
        }
    }
}

/// Divergence between a pending local mutation and the remote version
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub conflict_id: String,
    pub entity_type: EntityType,
    pub local_payload: Value,
    pub remote_payload: Value,
    pub detected_at: DateTime<Utc>,
    #[serde(default)]
    pub resolved_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub resolution: Option<Resolution>,
}

impl ConflictRecord {
    pub fn new(
        conflict_id: impl Into<String>,
        entity_type: EntityType,
        local_payload: Value,
        remote_payload: Value,
    ) -> Self {
        Self {
            conflict_id: conflict_id.into(),
            entity_type,
            local_payload,
            remote_payload,
            detected_at: Utc::now(),
            resolved_at: None,
            resolution: None,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    /// Entity id, taken from the remote payload first
    pub fn entity_id(&self) -> Option<String> {
        Entity(&self.remote_payload)
            .id()
            .or_else(|| Entity(&self.local_payload).id())
    }
}

/// Outcome counts of one drain cycle
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DrainReport {
    pub succeeded: usize,
    pub conflicted: usize,
    pub retried: usize,
    pub abandoned: usize,
    pub rejected: usize,
    /// The cycle did not run (offline, already draining, or disabled)
    pub skipped: bool,
    /// The server refused our credentials and the cycle stopped early
    #[serde(default)]
    pub auth_failed: bool,
}

impl DrainReport {
    pub fn skipped() -> Self {
        Self {
            skipped: true,
            ..Self::default()
        }
    }

    /// Number of items the cycle attempted to deliver
    pub fn attempted(&self) -> usize {
        self.succeeded + self.conflicted + self.retried + self.abandoned + self.rejected
    }
}

/// Which reconciliation endpoint was used
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Initial,
    Forced,
}

impl SyncMode {
    /// Endpoint path segment
    pub fn path(&self) -> &'static str {
        match self {
            SyncMode::Initial => "initial",
            SyncMode::Forced => "force",
        }
    }
}

/// Result of a full reconciliation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub mode: SyncMode,
    /// Entities written per collection
    pub counts: BTreeMap<EntityType, usize>,
    /// Count reported by the server
    pub synced_count: usize,
    /// Pending mutations re-applied over the snapshot
    pub overlaid_pending: usize,
    pub errors: Vec<String>,
    pub completed_at: DateTime<Utc>,
}

impl SyncReport {
    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}
