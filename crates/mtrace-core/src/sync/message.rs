//! Wire message types
//!
//! Push-channel frames are JSON objects discriminated by `type`, with the
//! body either under `data` or inline next to the discriminator. REST
//! bodies mirror the sync endpoints.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::error::{SyncError, SyncResult};
use crate::models::{Action, EntityType, Resolution};

/// Incremental remote-origin change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncUpdate {
    pub entity_type: EntityType,
    pub action: Action,
    pub payload: Value,
}

/// Server-detected divergence for a pending mutation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictDetected {
    pub conflict_id: String,
    pub entity_type: EntityType,
    pub local_data: Value,
    pub remote_data: Value,
}

/// Completion of a server-initiated bulk sync
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncCompleted {
    #[serde(default)]
    pub synced_count: usize,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Frames the server pushes to the client
#[derive(Debug, Clone, PartialEq)]
pub enum PushFrame {
    SyncUpdate(SyncUpdate),
    ConflictDetected(ConflictDetected),
    SyncCompleted(SyncCompleted),
    /// Informational, never mutates state
    StatusUpdate(Value),
}

#[derive(Deserialize)]
struct RawFrame {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: Option<Value>,
    #[serde(flatten)]
    rest: Map<String, Value>,
}

impl PushFrame {
    /// Parse a text frame
    ///
    /// Returns `Ok(None)` for frame types this client does not know.
    pub fn parse(text: &str) -> SyncResult<Option<Self>> {
        let raw: RawFrame = serde_json::from_str(text)
            .map_err(|e| SyncError::Protocol(format!("malformed push frame: {}", e)))?;

        let body = match raw.data {
            Some(data) if !data.is_null() => data,
            _ => Value::Object(raw.rest),
        };

        let frame = match raw.kind.as_str() {
            "sync_update" => PushFrame::SyncUpdate(decode_body(&raw.kind, body)?),
            "conflict_detected" => PushFrame::ConflictDetected(decode_body(&raw.kind, body)?),
            "sync_completed" => PushFrame::SyncCompleted(decode_body(&raw.kind, body)?),
            "status_update" => PushFrame::StatusUpdate(body),
            _ => return Ok(None),
        };
        Ok(Some(frame))
    }

    pub fn kind(&self) -> &'static str {
        match self {
            PushFrame::SyncUpdate(_) => "sync_update",
            PushFrame::ConflictDetected(_) => "conflict_detected",
            PushFrame::SyncCompleted(_) => "sync_completed",
            PushFrame::StatusUpdate(_) => "status_update",
        }
    }

    /// Encode as `{"type": ..., "data": ...}`
    pub fn to_json(&self) -> Value {
        let data = match self {
            PushFrame::SyncUpdate(body) => serde_json::to_value(body),
            PushFrame::ConflictDetected(body) => serde_json::to_value(body),
            PushFrame::SyncCompleted(body) => serde_json::to_value(body),
            PushFrame::StatusUpdate(body) => Ok(body.clone()),
        }
        .unwrap_or(Value::Null);
        serde_json::json!({ "type": self.kind(), "data": data })
    }
}

fn decode_body<T: serde::de::DeserializeOwned>(kind: &str, body: Value) -> SyncResult<T> {
    serde_json::from_value(body)
        .map_err(|e| SyncError::Protocol(format!("invalid {} frame: {}", kind, e)))
}

/// Frames the client sends on the push channel
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Keep-alive probe
    Ping { timestamp: i64 },
    /// Ask the server for a `status_update`
    StatusRequest {
        #[serde(rename = "deviceId")]
        device_id: String,
    },
}

/// Collections of an authoritative snapshot
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotData {
    #[serde(default)]
    pub user: Option<Value>,
    #[serde(default)]
    pub artifacts: Option<Vec<Value>>,
    #[serde(default)]
    pub scenes: Option<Vec<Value>>,
    #[serde(default)]
    pub nfts: Option<Vec<Value>>,
    #[serde(default)]
    pub activities: Option<Vec<Value>>,
}

/// Response of `GET /initial/{accountId}` and `GET /force/{accountId}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SnapshotResponse {
    #[serde(default)]
    pub data: SnapshotData,
    #[serde(default)]
    pub synced_count: usize,
    #[serde(default)]
    pub errors: Vec<String>,
}

/// Body of `POST /sync/{entityType}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub action: Action,
    pub data: Value,
    /// Enqueue time in milliseconds since the epoch
    pub timestamp: i64,
    pub device_id: String,
}

/// Response of `POST /sync/{entityType}`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub success: bool,
    #[serde(default)]
    pub error: Option<String>,
    /// Present when the server reports a version conflict
    #[serde(default)]
    pub conflict: Option<ConflictInfo>,
}

/// Conflict details returned by a rejected submission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictInfo {
    pub conflict_id: String,
    #[serde(default)]
    pub remote_data: Value,
}

/// Outcome of a delivered submission
#[derive(Debug, Clone, PartialEq)]
pub enum SubmitOutcome {
    Accepted,
    Conflict(ConflictInfo),
}

/// Body of `POST /resolve/{conflictId}`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub resolution: Resolution,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub merged_data: Option<Value>,
    pub device_id: String,
}

/// Response of `POST /resolve/{conflictId}`
///
/// A 2xx response without `success` counts as acknowledged.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResolveResponse {
    #[serde(default = "acknowledged")]
    pub success: bool,
    #[serde(default)]
    pub message: String,
}

fn acknowledged() -> bool {
    true
}
