//! Conflict tracking and resolution
//!
//! The ledger records every conflict the server reports, once per id. The
//! resolver settles an open conflict with one of three policies and marks
//! it resolved; a resolved conflict is never reopened.

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::{SyncError, SyncResult};
use super::events::{EventBus, SyncEvent};
use super::message::{ConflictDetected, ResolveRequest};
use super::queue::SyncQueue;
use super::remote::RemoteService;
use crate::models::{Action, ConflictRecord, Resolution};
use crate::storage::{LocalStore, StorageResult};

/// Persisted set of conflict records, in detection order
#[derive(Clone)]
pub struct ConflictLedger {
    store: LocalStore,
    events: EventBus,
    records: Arc<StdMutex<Vec<ConflictRecord>>>,
}

impl ConflictLedger {
    pub fn load(store: LocalStore, events: EventBus) -> StorageResult<Self> {
        let records = store.load_conflicts()?;
        Ok(Self {
            store,
            events,
            records: Arc::new(StdMutex::new(records)),
        })
    }

    fn records(&self) -> MutexGuard<'_, Vec<ConflictRecord>> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a new conflict and announce it
    ///
    /// Returns false, without side effects, if the id is already known.
    pub fn register(&self, record: ConflictRecord) -> StorageResult<bool> {
        let mut records = self.records();
        if records.iter().any(|r| r.conflict_id == record.conflict_id) {
            debug!(conflict_id = %record.conflict_id, "Duplicate conflict ignored");
            return Ok(false);
        }

        self.store.save_conflict(&record)?;
        records.push(record.clone());
        drop(records);

        warn!(
            conflict_id = %record.conflict_id,
            entity_type = %record.entity_type,
            entity_id = record.entity_id().as_deref().unwrap_or("-"),
            "Conflict detected"
        );
        self.events.publish(SyncEvent::SyncConflict(record));
        Ok(true)
    }

    pub fn get(&self, conflict_id: &str) -> Option<ConflictRecord> {
        self.records()
            .iter()
            .find(|r| r.conflict_id == conflict_id)
            .cloned()
    }

    pub fn list(&self, unresolved_only: bool) -> Vec<ConflictRecord> {
        self.records()
            .iter()
            .filter(|r| !unresolved_only || !r.is_resolved())
            .cloned()
            .collect()
    }

    fn mark_resolved(&self, conflict_id: &str, resolution: Resolution) -> SyncResult<ConflictRecord> {
        let mut records = self.records();
        let record = records
            .iter_mut()
            .find(|r| r.conflict_id == conflict_id)
            .ok_or_else(|| SyncError::UnknownConflict(conflict_id.to_string()))?;
        if record.is_resolved() {
            return Err(SyncError::AlreadyResolved(conflict_id.to_string()));
        }

        let mut updated = record.clone();
        updated.resolved_at = Some(Utc::now());
        updated.resolution = Some(resolution);
        self.store.save_conflict(&updated)?;
        *record = updated.clone();
        Ok(updated)
    }
}

/// Applies resolution policies to open conflicts
pub struct ConflictResolver {
    ledger: ConflictLedger,
    queue: SyncQueue,
    store: LocalStore,
    remote: Arc<dyn RemoteService>,
    events: EventBus,
    device_id: String,
    request_timeout: Duration,
    // One resolution at a time
    resolving: Mutex<()>,
}

impl ConflictResolver {
    pub fn new(
        ledger: ConflictLedger,
        queue: SyncQueue,
        store: LocalStore,
        remote: Arc<dyn RemoteService>,
        events: EventBus,
        device_id: impl Into<String>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            ledger,
            queue,
            store,
            remote,
            events,
            device_id: device_id.into(),
            request_timeout,
            resolving: Mutex::new(()),
        }
    }

    pub fn ledger(&self) -> &ConflictLedger {
        &self.ledger
    }

    /// Raise a conflict reported on the push channel
    ///
    /// Pending mutations of the entity are parked until it is resolved.
    /// Returns `None` for an id that is already known.
    pub async fn detect(&self, frame: ConflictDetected) -> SyncResult<Option<ConflictRecord>> {
        let record = ConflictRecord::new(
            frame.conflict_id,
            frame.entity_type,
            frame.local_data,
            frame.remote_data,
        );
        if !self.ledger.register(record.clone())? {
            return Ok(None);
        }

        if let Some(entity_id) = record.entity_id() {
            let held = self
                .queue
                .hold_entity(record.entity_type, &entity_id, &record.conflict_id)
                .await;
            debug!(conflict_id = %record.conflict_id, held, "Parked pending mutations");
        }
        Ok(Some(record))
    }

    /// Settle a conflict
    ///
    /// The server is told first; local effects apply only once it has
    /// acknowledged, so a failed call leaves the conflict open.
    pub async fn resolve(
        &self,
        conflict_id: &str,
        policy: Resolution,
        merged: Option<Value>,
    ) -> SyncResult<ConflictRecord> {
        let _resolving = self.resolving.lock().await;

        let record = self
            .ledger
            .get(conflict_id)
            .ok_or_else(|| SyncError::UnknownConflict(conflict_id.to_string()))?;
        if record.is_resolved() {
            return Err(SyncError::AlreadyResolved(conflict_id.to_string()));
        }
        if policy == Resolution::Merge && merged.is_none() {
            return Err(SyncError::InvalidMerge);
        }

        let request = ResolveRequest {
            resolution: policy,
            merged_data: merged.clone(),
            device_id: self.device_id.clone(),
        };
        let response = tokio::time::timeout(
            self.request_timeout,
            self.remote.resolve(conflict_id, &request),
        )
        .await
        .unwrap_or(Err(SyncError::Timeout))?;
        debug!(%conflict_id, message = %response.message, "Server acknowledged resolution");

        let entity_type = record.entity_type;
        let entity_id = record.entity_id();

        match (policy, merged) {
            (Resolution::Local, _) => {
                if let Some(id) = &entity_id {
                    self.store.put(entity_type, id, &record.local_payload)?;
                }
                let released = self.queue.release_held(conflict_id).await;
                if released == 0 {
                    // Nothing parked locally; submit the local version anew
                    self.queue
                        .enqueue(entity_type, Action::Update, record.local_payload.clone())
                        .await;
                }
            }
            (Resolution::Remote, _) => {
                if let Some(id) = &entity_id {
                    let discarded = self.queue.discard_entity(entity_type, id).await;
                    self.store.put(entity_type, id, &record.remote_payload)?;
                    debug!(%conflict_id, discarded, "Local mutations discarded");
                }
            }
            (Resolution::Merge, Some(payload)) => {
                if let Some(id) = &entity_id {
                    self.queue.discard_entity(entity_type, id).await;
                    self.store.put(entity_type, id, &payload)?;
                }
                self.queue
                    .enqueue(entity_type, Action::Update, payload)
                    .await;
            }
            (Resolution::Merge, None) => return Err(SyncError::InvalidMerge),
        }

        let resolved = self.ledger.mark_resolved(conflict_id, policy)?;
        info!(%conflict_id, resolution = %policy, "Conflict resolved");
        self.events.publish(SyncEvent::ConflictResolved {
            conflict_id: conflict_id.to_string(),
            resolution: policy,
        });
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SyncSettings;
    use crate::models::{EntityType, SyncMode};
    use crate::sync::message::{ResolveResponse, SnapshotResponse, SubmitOutcome, SubmitRequest};
    use crate::sync::state::SyncStateHandle;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

    #[derive(Default)]
    struct ResolveRemote {
        calls: AtomicUsize,
        refuse: AtomicBool,
        hang: AtomicBool,
    }

    #[async_trait]
    impl RemoteService for ResolveRemote {
        async fn fetch_snapshot(&self, _: &str, _: SyncMode) -> SyncResult<SnapshotResponse> {
            Ok(SnapshotResponse::default())
        }

        async fn submit(&self, _: EntityType, _: &SubmitRequest) -> SyncResult<SubmitOutcome> {
            Ok(SubmitOutcome::Accepted)
        }

        async fn resolve(&self, _: &str, _: &ResolveRequest) -> SyncResult<ResolveResponse> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.hang.load(Ordering::SeqCst) {
                std::future::pending::<()>().await;
            }
            if self.refuse.load(Ordering::SeqCst) {
                return Err(SyncError::transport("unreachable"));
            }
            Ok(ResolveResponse {
                success: true,
                message: "ok".into(),
            })
        }
    }

    struct Fixture {
        resolver: ConflictResolver,
        queue: SyncQueue,
        store: LocalStore,
        remote: Arc<ResolveRemote>,
    }

    fn fixture() -> Fixture {
        let store = LocalStore::open_in_memory().unwrap();
        let events = EventBus::new(64);
        let remote = Arc::new(ResolveRemote::default());
        let ledger = ConflictLedger::load(store.clone(), events.clone()).unwrap();
        let queue = SyncQueue::load(
            store.clone(),
            remote.clone(),
            SyncStateHandle::new(false),
            events.clone(),
            ledger.clone(),
            "device-a",
            &SyncSettings::default(),
        )
        .unwrap();
        let resolver = ConflictResolver::new(
            ledger,
            queue.clone(),
            store.clone(),
            remote.clone(),
            events,
            "device-a",
            SyncSettings::default().request_timeout(),
        );
        Fixture {
            resolver,
            queue,
            store,
            remote,
        }
    }

    fn artifact_conflict(id: &str) -> ConflictDetected {
        ConflictDetected {
            conflict_id: id.to_string(),
            entity_type: EntityType::Artifact,
            local_data: json!({"id": "a1", "v": 1}),
            remote_data: json!({"id": "a1", "v": 2}),
        }
    }

    #[tokio::test]
    async fn test_duplicate_detection_creates_one_record() {
        let f = fixture();
        assert!(f.resolver.detect(artifact_conflict("c1")).await.unwrap().is_some());
        assert!(f.resolver.detect(artifact_conflict("c1")).await.unwrap().is_none());
        assert_eq!(f.resolver.ledger().list(false).len(), 1);
        assert_eq!(f.store.load_conflicts().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_remote_wins_discards_local_mutations() {
        let f = fixture();
        f.queue
            .enqueue(EntityType::Artifact, Action::Update, json!({"id": "a1", "v": 1}))
            .await;
        f.resolver.detect(artifact_conflict("c1")).await.unwrap();
        assert_eq!(f.queue.pending().await[0].held_by.as_deref(), Some("c1"));

        let record = f
            .resolver
            .resolve("c1", Resolution::Remote, None)
            .await
            .unwrap();

        assert_eq!(record.resolution, Some(Resolution::Remote));
        assert_eq!(
            f.store.get(EntityType::Artifact, "a1").unwrap(),
            Some(json!({"id": "a1", "v": 2}))
        );
        assert!(!f.queue.has_pending(EntityType::Artifact, "a1").await);
    }

    #[tokio::test]
    async fn test_second_resolution_fails() {
        let f = fixture();
        f.resolver.detect(artifact_conflict("c1")).await.unwrap();
        f.resolver.resolve("c1", Resolution::Remote, None).await.unwrap();

        let err = f
            .resolver
            .resolve("c1", Resolution::Local, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::AlreadyResolved(id) if id == "c1"));
        assert_eq!(f.remote.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_merge_requires_payload() {
        let f = fixture();
        f.resolver.detect(artifact_conflict("c1")).await.unwrap();

        let err = f
            .resolver
            .resolve("c1", Resolution::Merge, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::InvalidMerge));
        assert!(!f.resolver.ledger().get("c1").unwrap().is_resolved());
        assert_eq!(f.remote.calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_merge_enqueues_merged_payload() {
        let f = fixture();
        f.queue
            .enqueue(EntityType::Artifact, Action::Update, json!({"id": "a1", "v": 1}))
            .await;
        f.resolver.detect(artifact_conflict("c1")).await.unwrap();

        let merged = json!({"id": "a1", "v": 3, "title": "merged"});
        f.resolver
            .resolve("c1", Resolution::Merge, Some(merged.clone()))
            .await
            .unwrap();

        let pending = f.queue.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload, merged);
        assert_eq!(pending[0].action, Action::Update);
        assert!(pending[0].held_by.is_none());
        assert_eq!(f.store.get(EntityType::Artifact, "a1").unwrap(), Some(merged));
    }

    #[tokio::test]
    async fn test_local_wins_releases_held_items() {
        let f = fixture();
        f.queue
            .enqueue(EntityType::Artifact, Action::Update, json!({"id": "a1", "v": 1}))
            .await;
        f.resolver.detect(artifact_conflict("c1")).await.unwrap();

        f.resolver.resolve("c1", Resolution::Local, None).await.unwrap();

        let pending = f.queue.pending().await;
        assert_eq!(pending.len(), 1);
        assert!(pending[0].held_by.is_none());
        assert_eq!(
            f.store.get(EntityType::Artifact, "a1").unwrap(),
            Some(json!({"id": "a1", "v": 1}))
        );
    }

    #[tokio::test]
    async fn test_local_wins_without_pending_enqueues_local_payload() {
        let f = fixture();
        f.resolver.detect(artifact_conflict("c1")).await.unwrap();
        f.resolver.resolve("c1", Resolution::Local, None).await.unwrap();

        let pending = f.queue.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload, json!({"id": "a1", "v": 1}));
    }

    #[tokio::test]
    async fn test_failed_server_call_leaves_conflict_open() {
        let f = fixture();
        f.resolver.detect(artifact_conflict("c1")).await.unwrap();
        f.remote.refuse.store(true, Ordering::SeqCst);

        assert!(f.resolver.resolve("c1", Resolution::Remote, None).await.is_err());
        assert!(!f.resolver.ledger().get("c1").unwrap().is_resolved());

        f.remote.refuse.store(false, Ordering::SeqCst);
        f.resolver.resolve("c1", Resolution::Remote, None).await.unwrap();
        assert!(f.resolver.ledger().list(true).is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_server_call_times_out() {
        let f = fixture();
        f.resolver.detect(artifact_conflict("c1")).await.unwrap();
        f.remote.hang.store(true, Ordering::SeqCst);

        let err = f
            .resolver
            .resolve("c1", Resolution::Local, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Timeout));
        assert!(!f.resolver.ledger().get("c1").unwrap().is_resolved());

        // The resolver is free again for the next attempt
        f.remote.hang.store(false, Ordering::SeqCst);
        f.resolver.resolve("c1", Resolution::Local, None).await.unwrap();
        assert_eq!(f.remote.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_unknown_conflict() {
        let f = fixture();
        let err = f
            .resolver
            .resolve("nope", Resolution::Remote, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::UnknownConflict(_)));
    }

    #[tokio::test]
    async fn test_ledger_reloads_resolution() {
        let f = fixture();
        f.resolver.detect(artifact_conflict("c1")).await.unwrap();
        f.resolver.resolve("c1", Resolution::Remote, None).await.unwrap();

        let reloaded = ConflictLedger::load(f.store.clone(), EventBus::new(4)).unwrap();
        let record = reloaded.get("c1").unwrap();
        assert!(record.is_resolved());
        assert_eq!(record.resolution, Some(Resolution::Remote));
    }
}
