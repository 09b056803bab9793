//! Full reconciliation and incremental remote changes
//!
//! A full sync overwrites each local collection with the server's
//! snapshot, then re-applies pending local mutations on top so they keep
//! precedence until they are delivered. Drains wait while a full sync is
//! between its fetch and its overwrite.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use serde_json::Value;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::error::SyncResult;
use super::events::{EventBus, SyncEvent};
use super::message::{SnapshotData, SyncUpdate};
use super::queue::SyncQueue;
use super::remote::RemoteService;
use super::state::SyncStateHandle;
use crate::models::{Action, Entity, EntityType, QueueItem, SyncMode, SyncReport};
use crate::storage::LocalStore;

pub struct Reconciler {
    store: LocalStore,
    remote: Arc<dyn RemoteService>,
    queue: SyncQueue,
    state: SyncStateHandle,
    events: EventBus,
    // Full syncs never overlap
    running: Mutex<()>,
}

impl Reconciler {
    pub fn new(
        store: LocalStore,
        remote: Arc<dyn RemoteService>,
        queue: SyncQueue,
        state: SyncStateHandle,
        events: EventBus,
    ) -> Self {
        Self {
            store,
            remote,
            queue,
            state,
            events,
            running: Mutex::new(()),
        }
    }

    /// First full sync after sign-in
    pub async fn initial_sync(&self, account_id: &str) -> SyncResult<SyncReport> {
        self.full_sync(account_id, SyncMode::Initial).await
    }

    /// Full resync, used to recover from missed push frames
    pub async fn forced_sync(&self, account_id: &str) -> SyncResult<SyncReport> {
        self.full_sync(account_id, SyncMode::Forced).await
    }

    async fn full_sync(&self, account_id: &str, mode: SyncMode) -> SyncResult<SyncReport> {
        let _running = self.running.lock().await;
        // No acknowledgement may land between the fetch and the overwrite,
        // or the older snapshot would clobber it
        let _delivery = self.queue.hold_delivery().await;
        info!(%account_id, mode = mode.path(), "Starting full sync");

        let response = self.remote.fetch_snapshot(account_id, mode).await?;
        let collections = snapshot_collections(response.data);

        let mut counts: BTreeMap<EntityType, usize> = collections
            .iter()
            .map(|(entity_type, entities)| (*entity_type, entities.len()))
            .collect();

        let mut errors = response.errors;
        for entity_type in self.store.replace_collections(&collections)? {
            warn!(entity_type = %entity_type, "Snapshot entity without id skipped");
            errors.push(format!("{} entity without id skipped", entity_type));
            if let Some(count) = counts.get_mut(&entity_type) {
                *count = count.saturating_sub(1);
            }
        }

        let overlaid_pending = self.overlay_pending().await?;

        let report = SyncReport {
            mode,
            counts,
            synced_count: response.synced_count,
            overlaid_pending,
            errors,
            completed_at: Utc::now(),
        };
        self.state.record_full_sync(report.completed_at, report.total());
        self.events.publish(SyncEvent::LocalDataUpdated);

        info!(
            %account_id,
            total = report.total(),
            synced_count = report.synced_count,
            overlaid_pending,
            "Full sync completed"
        );
        Ok(report)
    }

    /// Re-apply pending mutations over freshly written snapshots
    async fn overlay_pending(&self) -> SyncResult<usize> {
        let mut applied = 0;
        for item in self.queue.pending().await {
            if apply_item(&self.store, &item)? {
                applied += 1;
            }
        }
        Ok(applied)
    }

    /// Merge a pushed remote change into the local store
    ///
    /// Skipped if a local mutation of the same entity is still pending. The
    /// change is republished either way. Returns whether it was written.
    pub async fn apply_remote_change(&self, update: SyncUpdate) -> SyncResult<bool> {
        let entity_type = update.entity_type;
        let written = match Entity(&update.payload).id() {
            None => {
                warn!(entity_type = %entity_type, "Remote change without entity id");
                false
            }
            Some(id) if self.queue.has_pending(entity_type, &id).await => {
                debug!(
                    entity_type = %entity_type,
                    entity_id = %id,
                    "Local mutation pending, remote change not applied"
                );
                false
            }
            Some(id) => {
                write_entity(&self.store, entity_type, update.action, &id, &update.payload)?;
                true
            }
        };

        self.events.publish(SyncEvent::SyncUpdate(update));
        Ok(written)
    }
}

/// Collections to overwrite; an absent user leaves the stored one alone
fn snapshot_collections(data: SnapshotData) -> Vec<(EntityType, Vec<Value>)> {
    let mut collections = Vec::with_capacity(EntityType::ALL.len());
    if let Some(user) = data.user.filter(|user| !user.is_null()) {
        collections.push((EntityType::User, vec![user]));
    }
    collections.push((EntityType::Artifact, data.artifacts.unwrap_or_default()));
    collections.push((EntityType::Scene, data.scenes.unwrap_or_default()));
    collections.push((EntityType::Collectible, data.nfts.unwrap_or_default()));
    collections.push((EntityType::Activity, data.activities.unwrap_or_default()));
    collections
}

pub(crate) fn apply_item(store: &LocalStore, item: &QueueItem) -> SyncResult<bool> {
    match item.entity_id() {
        Some(id) => {
            write_entity(store, item.entity_type, item.action, &id, &item.payload)?;
            Ok(true)
        }
        None => Ok(false),
    }
}

fn write_entity(
    store: &LocalStore,
    entity_type: EntityType,
    action: Action,
    id: &str,
    payload: &Value,
) -> SyncResult<()> {
    match action {
        Action::Create | Action::Update => store.put(entity_type, id, payload)?,
        Action::Delete => store.delete(entity_type, id)?,
    }
    Ok(())
}
