//! Durable mutation queue
//!
//! Local mutations are appended here and delivered to the remote service
//! oldest-first, one at a time. An item leaves the durable queue only when
//! the server acknowledges it, refuses it outright, or it runs out of
//! retries and moves to the abandoned list.
//!
//! Mutations of the same entity are delivered in enqueue order. A failed
//! item takes every later item of its entity to the tail with it, and an
//! item parked by an open conflict blocks the rest of its entity.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, Weak};
use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::conflict::ConflictLedger;
use super::error::{SyncError, SyncResult};
use super::events::{EventBus, SyncEvent};
use super::message::{SubmitOutcome, SubmitRequest};
use super::remote::RemoteService;
use super::scheduler::ScheduledTask;
use super::state::SyncStateHandle;
use crate::config::SyncSettings;
use crate::models::{
    AbandonedItem, Action, ConflictRecord, DrainReport, EntityKey, EntityType, QueueItem,
};
use crate::storage::LocalStore;

#[derive(Default)]
struct QueueItems {
    pending: VecDeque<QueueItem>,
    abandoned: Vec<AbandonedItem>,
}

impl QueueItems {
    fn position(&self, id: Uuid) -> Option<usize> {
        self.pending.iter().position(|item| item.id == id)
    }

    /// Move the item at `index` and every later item of its entity to the tail
    fn requeue_entity_chain(&mut self, index: usize) {
        let key = self.pending[index].entity_key();
        let mut kept = VecDeque::with_capacity(self.pending.len());
        let mut chain = Vec::new();

        for (i, item) in self.pending.drain(..).enumerate() {
            if i >= index && item.entity_key() == key {
                chain.push(item);
            } else {
                kept.push_back(item);
            }
        }
        kept.extend(chain);
        self.pending = kept;
    }

    /// Whether a drain would find anything to deliver
    fn has_deliverable(&self) -> bool {
        let mut blocked = HashSet::new();
        for item in &self.pending {
            let key = item.entity_key();
            if item.held_by.is_some() {
                blocked.insert(key);
            } else if !blocked.contains(&key) {
                return true;
            }
        }
        false
    }
}

/// Where a batched item stands in the live queue
enum LiveStatus {
    Ready,
    Held,
    Gone,
}

/// Resets the drain flag when a cycle ends, however it ends
struct DrainGuard<'a>(&'a AtomicBool);

impl Drop for DrainGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

struct QueueInner {
    store: LocalStore,
    remote: Arc<dyn RemoteService>,
    state: SyncStateHandle,
    events: EventBus,
    ledger: ConflictLedger,
    device_id: String,
    batch_size: usize,
    max_retries: u32,
    follow_up_delay: Duration,
    request_timeout: Duration,
    items: Mutex<QueueItems>,
    draining: AtomicBool,
    // Held for a whole drain cycle and for a full sync's fetch-and-replace
    delivery: Mutex<()>,
    follow_up: StdMutex<Option<ScheduledTask>>,
}

/// The pending-mutation queue
///
/// Cloning is cheap; clones share the same queue.
#[derive(Clone)]
pub struct SyncQueue {
    inner: Arc<QueueInner>,
}

impl SyncQueue {
    /// Load the durable queue and abandoned list
    #[allow(clippy::too_many_arguments)]
    pub fn load(
        store: LocalStore,
        remote: Arc<dyn RemoteService>,
        state: SyncStateHandle,
        events: EventBus,
        ledger: ConflictLedger,
        device_id: impl Into<String>,
        settings: &SyncSettings,
    ) -> SyncResult<Self> {
        let pending: VecDeque<_> = store.list_pending()?.into();
        let abandoned = store.list_abandoned()?;
        state.set_queue_counts(pending.len(), abandoned.len());

        if !pending.is_empty() {
            info!(pending = pending.len(), "Restored pending queue");
        }

        Ok(Self {
            inner: Arc::new(QueueInner {
                store,
                remote,
                state,
                events,
                ledger,
                device_id: device_id.into(),
                batch_size: settings.batch_size.max(1),
                max_retries: settings.max_retries.max(1),
                follow_up_delay: settings.follow_up_delay(),
                request_timeout: settings.request_timeout(),
                items: Mutex::new(QueueItems { pending, abandoned }),
                draining: AtomicBool::new(false),
                delivery: Mutex::new(()),
                follow_up: StdMutex::new(None),
            }),
        })
    }

    /// Append a mutation and persist it
    ///
    /// Never fails. A persistence error is logged and the item is written
    /// again at the next persistence point.
    pub async fn enqueue(
        &self,
        entity_type: EntityType,
        action: Action,
        payload: Value,
    ) -> QueueItem {
        let item = QueueItem::new(entity_type, action, payload, self.inner.device_id.clone());
        debug!(
            entity_type = %entity_type,
            entity_id = item.entity_id().as_deref().unwrap_or("-"),
            action = %action,
            "Enqueued mutation"
        );

        let mut items = self.inner.items.lock().await;
        items.pending.push_back(item.clone());
        self.commit(&items);
        item
    }

    /// Deliver up to one batch of pending items
    ///
    /// A no-op while offline or while another drain is running.
    pub async fn drain(&self) -> DrainReport {
        if !self.inner.state.is_online() {
            debug!("Offline, drain skipped");
            return DrainReport::skipped();
        }
        if self.inner.draining.swap(true, Ordering::SeqCst) {
            debug!("Drain already running");
            return DrainReport::skipped();
        }

        let report = {
            let _guard = DrainGuard(&self.inner.draining);
            self.run_cycle().await
        };

        self.inner.events.publish(SyncEvent::DrainFinished(report.clone()));
        report
    }

    async fn run_cycle(&self) -> DrainReport {
        let _delivery = self.inner.delivery.lock().await;
        let mut report = DrainReport::default();
        let batch = self.next_batch().await;
        if batch.is_empty() {
            return report;
        }
        debug!(batch = batch.len(), "Draining queue");

        // Entities that must not see further deliveries this cycle
        let mut blocked: HashSet<EntityKey> = HashSet::new();
        let mut auth_failed = false;

        for item in batch {
            let key = item.entity_key();
            if blocked.contains(&key) {
                continue;
            }
            if !self.inner.state.is_online() {
                debug!("Went offline mid-drain");
                break;
            }

            // The batch is a copy; the live queue may have moved on since
            match self.live_status(item.id).await {
                LiveStatus::Gone => {
                    debug!(item_id = %item.id, "Item left the queue mid-drain, skipped");
                    continue;
                }
                LiveStatus::Held => {
                    blocked.insert(key);
                    continue;
                }
                LiveStatus::Ready => {}
            }

            match self.submit(&item).await {
                Ok(SubmitOutcome::Accepted) => {
                    if self.remove(item.id).await {
                        report.succeeded += 1;
                    }
                }
                Ok(SubmitOutcome::Conflict(info)) => {
                    blocked.insert(key);
                    let record = ConflictRecord::new(
                        info.conflict_id,
                        item.entity_type,
                        item.payload.clone(),
                        info.remote_data,
                    );
                    self.park(&item, record).await;
                    report.conflicted += 1;
                }
                Err(e) if e.is_rejection() => {
                    warn!(
                        entity_type = %item.entity_type,
                        entity_id = item.entity_id().as_deref().unwrap_or("-"),
                        retry_count = item.retry_count,
                        error = %e,
                        "Mutation rejected by server"
                    );
                    if self.remove(item.id).await {
                        self.inner.events.publish(SyncEvent::ItemRejected {
                            item,
                            reason: e.to_string(),
                        });
                    }
                    report.rejected += 1;
                }
                Err(e) if e.is_auth_failure() => {
                    // Not the item's fault; keep its retry budget
                    warn!(error = %e, "Submission refused credentials, drain stopped");
                    self.inner
                        .events
                        .publish(SyncEvent::AuthenticationFailed(e.to_string()));
                    report.auth_failed = true;
                    auth_failed = true;
                    break;
                }
                Err(e) => {
                    blocked.insert(key);
                    if self.record_failure(item.id, &e).await {
                        report.abandoned += 1;
                    } else {
                        report.retried += 1;
                    }
                }
            }
        }

        let deliverable = {
            let items = self.inner.items.lock().await;
            self.commit(&items);
            items.has_deliverable()
        };

        if deliverable && !auth_failed && self.inner.state.is_online() {
            self.schedule_follow_up();
        }
        report
    }

    async fn live_status(&self, id: Uuid) -> LiveStatus {
        let items = self.inner.items.lock().await;
        match items.position(id) {
            None => LiveStatus::Gone,
            Some(index) if items.pending[index].held_by.is_some() => LiveStatus::Held,
            Some(_) => LiveStatus::Ready,
        }
    }

    /// Block drains until the returned guard is dropped
    ///
    /// Waits for a running cycle to finish first.
    pub(crate) async fn hold_delivery(&self) -> MutexGuard<'_, ()> {
        self.inner.delivery.lock().await
    }

    async fn next_batch(&self) -> Vec<QueueItem> {
        let items = self.inner.items.lock().await;
        let mut blocked = HashSet::new();
        let mut batch = Vec::new();

        for item in &items.pending {
            if batch.len() >= self.inner.batch_size {
                break;
            }
            let key = item.entity_key();
            if item.held_by.is_some() {
                blocked.insert(key);
                continue;
            }
            if !blocked.contains(&key) {
                batch.push(item.clone());
            }
        }
        batch
    }

    async fn submit(&self, item: &QueueItem) -> SyncResult<SubmitOutcome> {
        let request = SubmitRequest {
            action: item.action,
            data: item.payload.clone(),
            timestamp: item.enqueued_at.timestamp_millis(),
            device_id: item.origin_device_id.clone(),
        };

        tokio::time::timeout(
            self.inner.request_timeout,
            self.inner.remote.submit(item.entity_type, &request),
        )
        .await
        .unwrap_or(Err(SyncError::Timeout))
    }

    async fn remove(&self, id: Uuid) -> bool {
        let mut items = self.inner.items.lock().await;
        match items.position(id) {
            Some(index) => {
                items.pending.remove(index);
                true
            }
            None => false,
        }
    }

    /// Hold `item` (and its entity) behind a newly raised conflict
    async fn park(&self, item: &QueueItem, record: ConflictRecord) {
        let conflict_id = record.conflict_id.clone();
        warn!(
            entity_type = %item.entity_type,
            entity_id = item.entity_id().as_deref().unwrap_or("-"),
            %conflict_id,
            "Submission conflicted with remote version"
        );

        if let Err(e) = self.inner.ledger.register(record) {
            error!(error = %e, %conflict_id, "Failed to record conflict");
        }

        let mut items = self.inner.items.lock().await;
        if let Some(index) = items.position(item.id) {
            items.pending[index].held_by = Some(conflict_id);
        }
    }

    /// Count a failed attempt; returns true if the item was abandoned
    async fn record_failure(&self, id: Uuid, err: &SyncError) -> bool {
        let mut items = self.inner.items.lock().await;
        let Some(index) = items.position(id) else {
            return false;
        };

        let item = &mut items.pending[index];
        item.retry_count += 1;
        item.last_error = Some(err.to_string());
        warn!(
            entity_type = %item.entity_type,
            entity_id = item.entity_id().as_deref().unwrap_or("-"),
            retry_count = item.retry_count,
            error = %err,
            "Delivery failed"
        );

        if item.retry_count >= self.inner.max_retries {
            let Some(item) = items.pending.remove(index) else {
                return false;
            };
            let abandoned = AbandonedItem {
                item,
                abandoned_at: Utc::now(),
                reason: err.to_string(),
            };
            error!(
                entity_type = %abandoned.item.entity_type,
                entity_id = abandoned.item.entity_id().as_deref().unwrap_or("-"),
                retry_count = abandoned.item.retry_count,
                "Mutation abandoned after exhausting retries"
            );
            items.abandoned.push(abandoned.clone());
            self.inner.events.publish(SyncEvent::ItemAbandoned(abandoned));
            true
        } else {
            items.requeue_entity_chain(index);
            false
        }
    }

    fn schedule_follow_up(&self) {
        let weak: Weak<QueueInner> = Arc::downgrade(&self.inner);
        let task = ScheduledTask::after(self.inner.follow_up_delay, async move {
            let Some(inner) = weak.upgrade() else {
                return;
            };
            // Running now; the next cycle may replace the slot
            if let Some(task) = inner.follow_up_slot().take() {
                task.detach();
            }
            SyncQueue { inner }.drain().await;
        });
        *self.inner.follow_up_slot() = Some(task);
    }

    /// Cancel a scheduled follow-up drain
    pub fn cancel_follow_up(&self) {
        if let Some(mut task) = self.inner.follow_up_slot().take() {
            task.cancel();
        }
    }

    /// Persist both lists and publish the new counts
    fn commit(&self, items: &QueueItems) {
        let pending: Vec<QueueItem> = items.pending.iter().cloned().collect();
        if let Err(e) = self.inner.store.persist_queue(&pending) {
            error!(
                error = %e,
                pending = pending.len(),
                recoverable = e.is_recoverable(),
                "Failed to persist queue"
            );
        }
        if let Err(e) = self.inner.store.persist_abandoned(&items.abandoned) {
            error!(error = %e, "Failed to persist abandoned items");
        }

        let (pending, abandoned) = (items.pending.len(), items.abandoned.len());
        self.inner.state.set_queue_counts(pending, abandoned);
        self.inner
            .events
            .publish(SyncEvent::QueueUpdated { pending, abandoned });
    }

    // ==================== Inspection and operator actions ====================

    pub async fn pending(&self) -> Vec<QueueItem> {
        self.inner.items.lock().await.pending.iter().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.inner.items.lock().await.pending.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub async fn abandoned(&self) -> Vec<AbandonedItem> {
        self.inner.items.lock().await.abandoned.clone()
    }

    /// Put an abandoned item back at the tail with a fresh retry budget
    pub async fn retry_abandoned(&self, id: Uuid) -> Option<QueueItem> {
        let mut items = self.inner.items.lock().await;
        let index = items.abandoned.iter().position(|a| a.item.id == id)?;
        let mut item = items.abandoned.remove(index).item;
        item.retry_count = 0;
        item.last_error = None;
        items.pending.push_back(item.clone());
        self.commit(&items);
        info!(item_id = %id, "Abandoned item re-queued");
        Some(item)
    }

    /// Drop an abandoned item for good
    pub async fn discard_abandoned(&self, id: Uuid) -> Option<AbandonedItem> {
        let mut items = self.inner.items.lock().await;
        let index = items.abandoned.iter().position(|a| a.item.id == id)?;
        let entry = items.abandoned.remove(index);
        self.commit(&items);
        info!(item_id = %id, "Abandoned item discarded");
        Some(entry)
    }

    /// Drop every pending item; returns how many were removed
    pub async fn clear(&self) -> usize {
        let mut items = self.inner.items.lock().await;
        let removed = items.pending.len();
        items.pending.clear();
        self.commit(&items);
        warn!(removed, "Pending queue cleared");
        removed
    }

    // ==================== Conflict and reconciliation helpers ====================

    /// Pending items for one entity, in delivery order
    pub async fn pending_for(&self, entity_type: EntityType, id: &str) -> Vec<QueueItem> {
        let items = self.inner.items.lock().await;
        items
            .pending
            .iter()
            .filter(|item| item.targets(entity_type, id))
            .cloned()
            .collect()
    }

    pub async fn has_pending(&self, entity_type: EntityType, id: &str) -> bool {
        let items = self.inner.items.lock().await;
        items.pending.iter().any(|item| item.targets(entity_type, id))
    }

    /// Park every unheld item of an entity behind `conflict_id`
    pub(crate) async fn hold_entity(
        &self,
        entity_type: EntityType,
        id: &str,
        conflict_id: &str,
    ) -> usize {
        let mut items = self.inner.items.lock().await;
        let mut held = 0;
        for item in items.pending.iter_mut() {
            if item.targets(entity_type, id) && item.held_by.is_none() {
                item.held_by = Some(conflict_id.to_string());
                held += 1;
            }
        }
        if held > 0 {
            self.commit(&items);
        }
        held
    }

    /// Make items parked by `conflict_id` deliverable again
    pub(crate) async fn release_held(&self, conflict_id: &str) -> usize {
        let mut items = self.inner.items.lock().await;
        let mut released = 0;
        for item in items.pending.iter_mut() {
            if item.held_by.as_deref() == Some(conflict_id) {
                item.held_by = None;
                item.retry_count = 0;
                released += 1;
            }
        }
        if released > 0 {
            self.commit(&items);
        }
        released
    }

    /// Remove every pending item of an entity
    pub(crate) async fn discard_entity(&self, entity_type: EntityType, id: &str) -> usize {
        let mut items = self.inner.items.lock().await;
        let before = items.pending.len();
        items.pending.retain(|item| !item.targets(entity_type, id));
        let removed = before - items.pending.len();
        if removed > 0 {
            self.commit(&items);
        }
        removed
    }
}

impl QueueInner {
    fn follow_up_slot(&self) -> std::sync::MutexGuard<'_, Option<ScheduledTask>> {
        self.follow_up.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sync::message::{ConflictInfo, ResolveRequest, ResolveResponse, SnapshotResponse};
    use async_trait::async_trait;
    use serde_json::json;

    /// Remote whose submit outcome is chosen per entity id
    #[derive(Default)]
    struct ScriptedRemote {
        submitted: StdMutex<Vec<(EntityType, Action, Value)>>,
        failing: StdMutex<HashSet<String>>,
        rejecting: StdMutex<HashSet<String>>,
        conflicting: StdMutex<HashSet<String>>,
        unauthorized: StdMutex<HashSet<String>>,
    }

    impl ScriptedRemote {
        fn ids(&self) -> Vec<String> {
            self.submitted
                .lock()
                .unwrap()
                .iter()
                .map(|(_, _, payload)| payload["id"].as_str().unwrap_or("").to_string())
                .collect()
        }
    }

    #[async_trait]
    impl RemoteService for ScriptedRemote {
        async fn fetch_snapshot(
            &self,
            _account_id: &str,
            _mode: crate::models::SyncMode,
        ) -> SyncResult<SnapshotResponse> {
            Ok(SnapshotResponse::default())
        }

        async fn submit(
            &self,
            entity_type: EntityType,
            request: &SubmitRequest,
        ) -> SyncResult<SubmitOutcome> {
            tokio::time::sleep(Duration::from_millis(10)).await;

            let id = request.data["id"].as_str().unwrap_or("").to_string();
            self.submitted
                .lock()
                .unwrap()
                .push((entity_type, request.action, request.data.clone()));

            if self.failing.lock().unwrap().contains(&id) {
                return Err(SyncError::transport("connection reset"));
            }
            if self.unauthorized.lock().unwrap().contains(&id) {
                return Err(SyncError::AuthenticationFailed("401 Unauthorized".into()));
            }
            if self.rejecting.lock().unwrap().contains(&id) {
                return Err(SyncError::ServerRejected("invalid payload".into()));
            }
            if self.conflicting.lock().unwrap().contains(&id) {
                return Ok(SubmitOutcome::Conflict(ConflictInfo {
                    conflict_id: format!("c-{}", id),
                    remote_data: json!({"id": id, "v": 9}),
                }));
            }
            Ok(SubmitOutcome::Accepted)
        }

        async fn resolve(
            &self,
            _conflict_id: &str,
            _request: &ResolveRequest,
        ) -> SyncResult<ResolveResponse> {
            Ok(ResolveResponse::default())
        }
    }

    struct Fixture {
        queue: SyncQueue,
        remote: Arc<ScriptedRemote>,
        store: LocalStore,
        state: SyncStateHandle,
        events: EventBus,
        ledger: ConflictLedger,
    }

    fn fixture(online: bool) -> Fixture {
        let store = LocalStore::open_in_memory().unwrap();
        let remote = Arc::new(ScriptedRemote::default());
        let state = SyncStateHandle::new(online);
        let events = EventBus::new(64);
        let ledger = ConflictLedger::load(store.clone(), events.clone()).unwrap();
        let queue = SyncQueue::load(
            store.clone(),
            remote.clone(),
            state.clone(),
            events.clone(),
            ledger.clone(),
            "device-test",
            &SyncSettings::default(),
        )
        .unwrap();
        Fixture {
            queue,
            remote,
            store,
            state,
            events,
            ledger,
        }
    }

    #[tokio::test]
    async fn test_enqueue_persists_before_returning() {
        let f = fixture(false);
        let item = f
            .queue
            .enqueue(EntityType::Scene, Action::Create, json!({"id": "s1", "title": "T"}))
            .await;

        assert_eq!(item.origin_device_id, "device-test");
        assert_eq!(f.store.list_pending().unwrap(), vec![item]);
        assert_eq!(f.state.snapshot().queue_length, 1);
    }

    #[tokio::test]
    async fn test_drain_offline_is_noop() {
        let f = fixture(false);
        f.queue
            .enqueue(EntityType::Scene, Action::Create, json!({"id": "s1"}))
            .await;

        let report = f.queue.drain().await;
        assert!(report.skipped);
        assert!(f.remote.ids().is_empty());
        assert_eq!(f.queue.len().await, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drain_delivers_in_order_and_empties_queue() {
        let f = fixture(true);
        for id in ["a1", "a2", "a1"] {
            f.queue
                .enqueue(EntityType::Artifact, Action::Update, json!({"id": id}))
                .await;
        }

        let report = f.queue.drain().await;
        assert_eq!(report.succeeded, 3);
        assert_eq!(f.remote.ids(), vec!["a1", "a2", "a1"]);
        assert!(f.queue.is_empty().await);
        assert!(f.store.list_pending().unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_is_bounded_and_follow_up_drains_rest() {
        let f = fixture(true);
        for i in 0..15 {
            f.queue
                .enqueue(EntityType::Activity, Action::Create, json!({"id": format!("x{}", i)}))
                .await;
        }

        let report = f.queue.drain().await;
        assert_eq!(report.succeeded, 10);
        assert_eq!(f.queue.len().await, 5);

        tokio::time::sleep(Duration::from_millis(1_200)).await;
        assert_eq!(f.queue.len().await, 0);
        assert_eq!(f.remote.ids().len(), 15);
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_drain_is_skipped() {
        let f = fixture(true);
        f.queue
            .enqueue(EntityType::Scene, Action::Create, json!({"id": "s1"}))
            .await;

        let (first, second) = tokio::join!(f.queue.drain(), f.queue.drain());
        assert_eq!(first.succeeded, 1);
        assert!(second.skipped);
        assert_eq!(f.remote.ids(), vec!["s1"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_entity_held_mid_drain_is_not_delivered() {
        let f = fixture(true);
        f.queue
            .enqueue(EntityType::Artifact, Action::Update, json!({"id": "a1", "v": 1}))
            .await;
        f.queue
            .enqueue(EntityType::Artifact, Action::Update, json!({"id": "a1", "v": 2}))
            .await;

        let (report, held) = tokio::join!(f.queue.drain(), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            f.queue.hold_entity(EntityType::Artifact, "a1", "c1").await
        });

        assert_eq!(held, 2);
        // v1 was already in flight; v2 stays parked
        assert_eq!(f.remote.ids(), vec!["a1"]);
        assert_eq!(report.succeeded, 1);
        let pending = f.queue.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].payload["v"], json!(2));
        assert_eq!(pending[0].held_by.as_deref(), Some("c1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_clear_mid_drain_stops_delivery() {
        let f = fixture(true);
        for id in ["s1", "s2", "s3"] {
            f.queue
                .enqueue(EntityType::Scene, Action::Create, json!({"id": id}))
                .await;
        }

        let (report, cleared) = tokio::join!(f.queue.drain(), async {
            tokio::time::sleep(Duration::from_millis(5)).await;
            f.queue.clear().await
        });

        assert_eq!(cleared, 3);
        assert_eq!(f.remote.ids(), vec!["s1"]);
        // The in-flight item was no longer queued when acknowledged
        assert_eq!(report.succeeded, 0);
        assert!(f.queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_auth_failure_stops_drain_without_spending_retries() {
        let f = fixture(true);
        for id in ["s1", "s2", "s3"] {
            f.remote.unauthorized.lock().unwrap().insert(id.into());
            f.queue
                .enqueue(EntityType::Scene, Action::Create, json!({"id": id}))
                .await;
        }
        let mut events = f.events.subscribe();

        let report = f.queue.drain().await;
        assert!(report.auth_failed);
        assert_eq!(report.attempted(), 0);

        // No follow-up drain is scheduled
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(f.remote.ids(), vec!["s1"]);

        let pending = f.queue.pending().await;
        assert_eq!(pending.len(), 3);
        assert!(pending.iter().all(|item| item.retry_count == 0));
        assert!(f.queue.abandoned().await.is_empty());

        let mut saw_auth_event = false;
        while let Ok(event) = events.try_recv() {
            if matches!(event, SyncEvent::AuthenticationFailed(_)) {
                saw_auth_event = true;
            }
        }
        assert!(saw_auth_event);
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_moves_entity_chain_to_tail() {
        let f = fixture(true);
        f.remote.failing.lock().unwrap().insert("a1".into());
        f.queue
            .enqueue(EntityType::Artifact, Action::Create, json!({"id": "a1", "n": 1}))
            .await;
        f.queue
            .enqueue(EntityType::Artifact, Action::Create, json!({"id": "b1"}))
            .await;
        f.queue
            .enqueue(EntityType::Artifact, Action::Update, json!({"id": "a1", "n": 2}))
            .await;
        f.queue
            .enqueue(EntityType::Artifact, Action::Create, json!({"id": "c1"}))
            .await;

        let report = f.queue.drain().await;
        f.queue.cancel_follow_up();

        assert_eq!(report.retried, 1);
        assert_eq!(report.succeeded, 2);
        // The second a1 mutation was not attempted ahead of the first
        assert_eq!(f.remote.ids(), vec!["a1", "b1", "c1"]);

        let pending = f.queue.pending().await;
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].payload["n"], json!(1));
        assert_eq!(pending[0].retry_count, 1);
        assert_eq!(pending[1].payload["n"], json!(2));
        assert_eq!(pending[1].retry_count, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_after_three_attempts() {
        let f = fixture(true);
        f.remote.failing.lock().unwrap().insert("s1".into());
        let item = f
            .queue
            .enqueue(EntityType::Scene, Action::Create, json!({"id": "s1"}))
            .await;
        let mut events = f.events.subscribe();

        // First drain plus the follow-ups it schedules
        f.queue.drain().await;
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(f.remote.ids().len(), 3);
        assert!(f.queue.is_empty().await);
        let abandoned = f.queue.abandoned().await;
        assert_eq!(abandoned.len(), 1);
        assert_eq!(abandoned[0].item.id, item.id);
        assert_eq!(abandoned[0].item.retry_count, 3);
        assert_eq!(f.store.list_abandoned().unwrap().len(), 1);

        let mut saw_abandoned = false;
        while let Ok(event) = events.try_recv() {
            saw_abandoned |= matches!(event, SyncEvent::ItemAbandoned(_));
        }
        assert!(saw_abandoned);

        // Never retried again
        f.queue.drain().await;
        assert_eq!(f.remote.ids().len(), 3);
        assert_eq!(f.state.snapshot().abandoned_count, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_rejected_item_is_removed() {
        let f = fixture(true);
        f.remote.rejecting.lock().unwrap().insert("s1".into());
        f.queue
            .enqueue(EntityType::Scene, Action::Create, json!({"id": "s1"}))
            .await;

        let report = f.queue.drain().await;
        assert_eq!(report.rejected, 1);
        assert!(f.queue.is_empty().await);
        assert!(f.queue.abandoned().await.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_conflict_parks_entity() {
        let f = fixture(true);
        f.remote.conflicting.lock().unwrap().insert("a1".into());
        f.queue
            .enqueue(EntityType::Artifact, Action::Update, json!({"id": "a1", "v": 1}))
            .await;
        f.queue
            .enqueue(EntityType::Artifact, Action::Update, json!({"id": "a1", "v": 2}))
            .await;

        let report = f.queue.drain().await;
        assert_eq!(report.conflicted, 1);
        assert_eq!(f.remote.ids(), vec!["a1"]);

        let record = f.ledger.get("c-a1").unwrap();
        assert_eq!(record.local_payload, json!({"id": "a1", "v": 1}));

        // Held item blocks the later one; nothing is deliverable
        f.remote.conflicting.lock().unwrap().clear();
        let report = f.queue.drain().await;
        assert_eq!(report.attempted(), 0);
        assert_eq!(f.queue.len().await, 2);

        assert_eq!(f.queue.release_held("c-a1").await, 1);
        let report = f.queue.drain().await;
        assert_eq!(report.succeeded, 2);
    }

    #[tokio::test]
    async fn test_operator_actions_on_abandoned() {
        let f = fixture(false);
        let item = QueueItem::new(EntityType::Scene, Action::Create, json!({"id": "s1"}), "d");
        {
            let mut items = f.queue.inner.items.lock().await;
            items.abandoned.push(AbandonedItem {
                item: item.clone(),
                abandoned_at: Utc::now(),
                reason: "timeout".into(),
            });
        }

        assert!(f.queue.discard_abandoned(Uuid::new_v4()).await.is_none());
        let retried = f.queue.retry_abandoned(item.id).await.unwrap();
        assert_eq!(retried.retry_count, 0);
        assert!(f.queue.abandoned().await.is_empty());
        assert_eq!(f.queue.len().await, 1);

        assert_eq!(f.queue.clear().await, 1);
        assert!(f.store.list_pending().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_queue_reloads_from_store() {
        let f = fixture(false);
        f.queue
            .enqueue(EntityType::User, Action::Update, json!({"id": "u1"}))
            .await;

        let reloaded = SyncQueue::load(
            f.store.clone(),
            f.remote.clone(),
            SyncStateHandle::new(false),
            f.events.clone(),
            f.ledger.clone(),
            "device-test",
            &SyncSettings::default(),
        )
        .unwrap();
        assert_eq!(reloaded.pending().await, f.queue.pending().await);
    }

    #[tokio::test]
    async fn test_entity_helpers() {
        let f = fixture(false);
        f.queue
            .enqueue(EntityType::Artifact, Action::Update, json!({"id": "a1"}))
            .await;
        f.queue
            .enqueue(EntityType::Scene, Action::Update, json!({"id": "a1"}))
            .await;

        assert!(f.queue.has_pending(EntityType::Artifact, "a1").await);
        assert_eq!(f.queue.pending_for(EntityType::Scene, "a1").await.len(), 1);
        assert_eq!(f.queue.hold_entity(EntityType::Artifact, "a1", "c1").await, 1);
        assert_eq!(f.queue.discard_entity(EntityType::Artifact, "a1").await, 1);
        assert!(!f.queue.has_pending(EntityType::Artifact, "a1").await);
        assert_eq!(f.queue.len().await, 1);
    }
}
