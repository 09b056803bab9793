//! Sync engine facade
//!
//! `SyncEngine` builds one instance of every sync component and wires them
//! together. There is no process-global state: each engine owns its store
//! handle, event bus and timers, and tearing it down with `shutdown` (or
//! dropping it) stops everything it started.
//!
//! ## Usage
//!
//! ```ignore
//! let engine = SyncEngine::open(Config::load()?)?;
//! engine.start("user-42").await?;
//!
//! engine.sync_scene(json!({"id": "s1", "title": "Dunhuang"}), Action::Create).await;
//! let mut events = engine.subscribe();
//! ```

use std::sync::{Arc, Mutex as StdMutex, MutexGuard, PoisonError, Weak};

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::identity::Identity;
use crate::models::{
    AbandonedItem, Action, ConflictRecord, DrainReport, EntityType, QueueItem, Resolution,
    SyncReport,
};
use crate::storage::LocalStore;
use crate::sync::reconcile::apply_item;
use crate::sync::{
    ClientFrame, ConflictLedger, ConflictResolver, ConnectionManager, ConnectionStatus, Connector,
    EventBus, HttpRemote, MessageHandler, PushFrame, Reconciler, RemoteService, ScheduledTask,
    SyncError, SyncEvent, SyncQueue, SyncResult, SyncState, SyncStateHandle, WsConnector,
};

/// Point-in-time view of the engine for status displays
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EngineStatus {
    pub device_id: String,
    pub account_id: Option<String>,
    pub sync_enabled: bool,
    #[serde(flatten)]
    pub state: SyncState,
    pub open_conflicts: usize,
    pub stored_entities: usize,
    pub database_size: u64,
}

struct EngineInner {
    config: Config,
    store: LocalStore,
    identity: StdMutex<Identity>,
    state: SyncStateHandle,
    events: EventBus,
    queue: SyncQueue,
    connection: ConnectionManager,
    reconciler: Reconciler,
    resolver: ConflictResolver,
    periodic: StdMutex<Option<ScheduledTask>>,
}

/// The client-side sync engine
///
/// Cloning is cheap; clones drive the same engine.
#[derive(Clone)]
pub struct SyncEngine {
    inner: Arc<EngineInner>,
}

impl SyncEngine {
    /// Open the engine against the configured database and endpoints
    pub fn open(config: Config) -> Result<Self> {
        let store = LocalStore::open(&config.database_path())
            .with_context(|| format!("Failed to open database at {:?}", config.database_path()))?;
        let remote = HttpRemote::new(
            config.api_url.clone(),
            config.api_key.clone(),
            config.sync.request_timeout(),
        )
        .context("Failed to build HTTP client")?;
        let connector = WsConnector::new(&config);

        Self::with_parts(config, store, Arc::new(remote), Arc::new(connector), true)
            .context("Failed to initialize sync engine")
    }

    /// Assemble an engine from explicit parts
    ///
    /// `online` is the initial network reachability.
    pub fn with_parts(
        config: Config,
        store: LocalStore,
        remote: Arc<dyn RemoteService>,
        connector: Arc<dyn Connector>,
        online: bool,
    ) -> SyncResult<Self> {
        let mut identity = Identity::load_or_create(&store)?;
        if let Some(account_id) = &config.account_id {
            if identity.account_id.as_deref() != Some(account_id.as_str()) {
                identity.set_account(&store, account_id)?;
            }
        }

        let state = SyncStateHandle::new(online);
        let events = EventBus::new(config.sync.event_capacity);
        let ledger = ConflictLedger::load(store.clone(), events.clone())?;
        let queue = SyncQueue::load(
            store.clone(),
            remote.clone(),
            state.clone(),
            events.clone(),
            ledger.clone(),
            identity.device_id.clone(),
            &config.sync,
        )?;
        let connection =
            ConnectionManager::new(connector, state.clone(), events.clone(), &config.sync);
        let reconciler = Reconciler::new(
            store.clone(),
            remote.clone(),
            queue.clone(),
            state.clone(),
            events.clone(),
        );
        let resolver = ConflictResolver::new(
            ledger,
            queue.clone(),
            store.clone(),
            remote,
            events.clone(),
            identity.device_id.clone(),
            config.sync.request_timeout(),
        );

        debug!(device_id = %identity.device_id, online, "Sync engine assembled");

        let inner = Arc::new(EngineInner {
            config,
            store,
            identity: StdMutex::new(identity),
            state,
            events,
            queue,
            connection,
            reconciler,
            resolver,
            periodic: StdMutex::new(None),
        });
        inner.connection.on_message(Arc::new(FrameDispatcher {
            engine: Arc::downgrade(&inner),
        }));

        Ok(Self { inner })
    }

    // ==================== Lifecycle ====================

    /// Sign in `account_id` and bring the engine up
    ///
    /// Opens the push channel, arms the periodic drain and runs the initial
    /// sync. Returns `None` when sync is disabled or the device is offline;
    /// the channel and the drain follow once it comes online.
    pub async fn start(&self, account_id: &str) -> SyncResult<Option<SyncReport>> {
        {
            let mut identity = self.inner.identity();
            identity.set_account(&self.inner.store, account_id)?;
        }

        if !self.inner.config.sync_enabled {
            info!(%account_id, "Sync disabled, running local-only");
            return Ok(None);
        }

        self.arm_periodic_drain();

        if !self.inner.state.is_online() {
            info!(%account_id, "Offline, sync deferred");
            return Ok(None);
        }

        if let Err(e) = self.inner.connection.connect(account_id).await {
            warn!(error = %e, %account_id, "Push channel unavailable, continuing without it");
        }

        let report = self.inner.reconciler.initial_sync(account_id).await?;
        if !self.inner.queue.is_empty().await {
            self.inner.queue.drain().await;
        }
        Ok(Some(report))
    }

    /// Stop timers and close the push channel
    pub fn shutdown(&self) {
        if let Some(mut task) = self.inner.periodic().take() {
            task.cancel();
        }
        self.inner.queue.cancel_follow_up();
        self.inner.connection.disconnect();
        info!("Sync engine shut down");
    }

    /// Apply a network reachability change
    ///
    /// Going online reconnects at once and runs one drain cycle.
    pub async fn set_online(&self, online: bool) {
        let was_online = self.inner.state.is_online();
        if was_online == online {
            return;
        }
        info!(online, "Network reachability changed");

        if !self.inner.config.sync_enabled {
            self.inner.connection.set_online(online).await;
            return;
        }

        if !online {
            self.inner.queue.cancel_follow_up();
        }
        self.inner.connection.set_online(online).await;
        if !online {
            return;
        }

        if self.inner.connection.account_id().is_none() {
            if let Some(account_id) = self.account_id() {
                if let Err(e) = self.inner.connection.connect(&account_id).await {
                    warn!(error = %e, %account_id, "Connect after coming online failed");
                }
            }
        }

        let report = self.inner.queue.drain().await;
        debug!(succeeded = report.succeeded, "Drain after coming online finished");
    }

    fn arm_periodic_drain(&self) {
        let mut slot = self.inner.periodic();
        if slot.is_some() {
            return;
        }

        let engine: Weak<EngineInner> = Arc::downgrade(&self.inner);
        *slot = Some(ScheduledTask::every(
            self.inner.config.sync.drain_interval(),
            move || {
                let engine = engine.clone();
                async move {
                    let Some(inner) = engine.upgrade() else {
                        return;
                    };
                    if inner.state.is_online() && !inner.queue.is_empty().await {
                        debug!("Periodic drain");
                        inner.queue.drain().await;
                    }
                }
            },
        ));
    }

    // ==================== Mutations ====================

    /// Apply a local mutation, queue it and try to deliver it
    ///
    /// The local store reflects the mutation at once; delivery happens in
    /// the background of the drain cycle.
    pub async fn enqueue(&self, entity_type: EntityType, action: Action, payload: Value) -> QueueItem {
        let item = self.inner.queue.enqueue(entity_type, action, payload).await;
        if let Err(e) = apply_item(&self.inner.store, &item) {
            error!(error = %e, entity_type = %entity_type, "Failed to apply local mutation");
        }
        if self.inner.config.sync_enabled && self.inner.state.is_online() {
            self.inner.queue.drain().await;
        }
        item
    }

    pub async fn sync_user(&self, user: Value) -> QueueItem {
        self.enqueue(EntityType::User, Action::Update, user).await
    }

    pub async fn sync_artifact(&self, artifact: Value, action: Action) -> QueueItem {
        self.enqueue(EntityType::Artifact, action, artifact).await
    }

    pub async fn sync_scene(&self, scene: Value, action: Action) -> QueueItem {
        self.enqueue(EntityType::Scene, action, scene).await
    }

    pub async fn sync_collectible(&self, collectible: Value, action: Action) -> QueueItem {
        self.enqueue(EntityType::Collectible, action, collectible).await
    }

    /// Activity entries are append-only
    pub async fn sync_activity(&self, activity: Value) -> QueueItem {
        self.enqueue(EntityType::Activity, Action::Create, activity).await
    }

    /// Run one drain cycle now
    pub async fn drain(&self) -> DrainReport {
        if !self.inner.config.sync_enabled {
            return DrainReport::skipped();
        }
        self.inner.queue.drain().await
    }

    // ==================== Reconciliation ====================

    pub async fn initial_sync(&self, account_id: &str) -> SyncResult<SyncReport> {
        self.inner.reconciler.initial_sync(account_id).await
    }

    pub async fn forced_sync(&self, account_id: &str) -> SyncResult<SyncReport> {
        self.inner.reconciler.forced_sync(account_id).await
    }

    // ==================== Conflicts ====================

    pub async fn resolve_conflict(
        &self,
        conflict_id: &str,
        policy: Resolution,
        merged: Option<Value>,
    ) -> SyncResult<ConflictRecord> {
        let record = self
            .inner
            .resolver
            .resolve(conflict_id, policy, merged)
            .await?;
        if self.inner.config.sync_enabled && self.inner.state.is_online() {
            self.inner.queue.drain().await;
        }
        Ok(record)
    }

    pub fn conflicts(&self, unresolved_only: bool) -> Vec<ConflictRecord> {
        self.inner.resolver.ledger().list(unresolved_only)
    }

    pub fn conflict(&self, conflict_id: &str) -> Option<ConflictRecord> {
        self.inner.resolver.ledger().get(conflict_id)
    }

    // ==================== Queue inspection ====================

    pub async fn pending(&self) -> Vec<QueueItem> {
        self.inner.queue.pending().await
    }

    pub async fn abandoned(&self) -> Vec<AbandonedItem> {
        self.inner.queue.abandoned().await
    }

    pub async fn retry_abandoned(&self, id: Uuid) -> Option<QueueItem> {
        self.inner.queue.retry_abandoned(id).await
    }

    pub async fn discard_abandoned(&self, id: Uuid) -> Option<AbandonedItem> {
        self.inner.queue.discard_abandoned(id).await
    }

    pub async fn clear_queue(&self) -> usize {
        self.inner.queue.clear().await
    }

    // ==================== Observation ====================

    /// Subscribe to engine events
    pub fn subscribe(&self) -> broadcast::Receiver<SyncEvent> {
        self.inner.events.subscribe()
    }

    /// Watch the shared sync state
    pub fn watch_state(&self) -> watch::Receiver<SyncState> {
        self.inner.state.subscribe()
    }

    pub fn state(&self) -> SyncState {
        self.inner.state.snapshot()
    }

    pub fn connection_status(&self) -> ConnectionStatus {
        self.inner.connection.status()
    }

    pub fn status(&self) -> SyncResult<EngineStatus> {
        let stats = self.inner.store.stats()?;
        let identity = self.inner.identity().clone();
        Ok(EngineStatus {
            device_id: identity.device_id,
            account_id: identity.account_id,
            sync_enabled: self.inner.config.sync_enabled,
            state: self.inner.state.snapshot(),
            open_conflicts: stats.open_conflicts,
            stored_entities: stats.entity_count,
            database_size: stats.database_size,
        })
    }

    /// Ask the server for a `status_update` frame
    pub fn request_status(&self) -> SyncResult<()> {
        let frame = ClientFrame::StatusRequest {
            device_id: self.device_id(),
        };
        let text = serde_json::to_string(&frame)
            .map_err(|e| SyncError::Protocol(e.to_string()))?;
        self.inner.connection.send(text)
    }

    // ==================== Local data ====================

    pub fn get(&self, entity_type: EntityType, id: &str) -> SyncResult<Option<Value>> {
        Ok(self.inner.store.get(entity_type, id)?)
    }

    pub fn list(&self, entity_type: EntityType) -> SyncResult<Vec<Value>> {
        Ok(self.inner.store.list(entity_type)?)
    }

    pub fn device_id(&self) -> String {
        self.inner.identity().device_id.clone()
    }

    pub fn account_id(&self) -> Option<String> {
        self.inner.identity().account_id.clone()
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }
}

impl EngineInner {
    fn identity(&self) -> MutexGuard<'_, Identity> {
        self.identity.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn periodic(&self) -> MutexGuard<'_, Option<ScheduledTask>> {
        self.periodic.lock().unwrap_or_else(PoisonError::into_inner)
    }

    async fn handle_frame(&self, frame: PushFrame) {
        match frame {
            PushFrame::SyncUpdate(update) => {
                if let Err(e) = self.reconciler.apply_remote_change(update).await {
                    error!(error = %e, "Failed to apply remote change");
                }
            }
            PushFrame::ConflictDetected(conflict) => {
                let conflict_id = conflict.conflict_id.clone();
                if let Err(e) = self.resolver.detect(conflict).await {
                    error!(error = %e, %conflict_id, "Failed to record conflict");
                }
            }
            PushFrame::SyncCompleted(done) => {
                info!(
                    synced_count = done.synced_count,
                    errors = done.errors.len(),
                    "Server sync completed"
                );
                self.events.publish(SyncEvent::SyncCompleted {
                    synced_count: done.synced_count,
                    errors: done.errors,
                });
            }
            PushFrame::StatusUpdate(status) => {
                debug!("Status update received");
                self.events.publish(SyncEvent::StatusUpdate(status));
            }
        }
    }
}

/// Routes push frames into the engine
struct FrameDispatcher {
    engine: Weak<EngineInner>,
}

#[async_trait]
impl MessageHandler for FrameDispatcher {
    async fn handle(&self, frame: PushFrame) {
        if let Some(engine) = self.engine.upgrade() {
            engine.handle_frame(frame).await;
        }
    }
}

impl Drop for EngineInner {
    fn drop(&mut self) {
        self.connection.disconnect();
    }
}
