//! Shared fakes for engine integration tests

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use mtrace_core::models::{Action, EntityType, SyncMode};
use mtrace_core::sync::{
    ConflictInfo, Connector, PushChannel, RemoteService, ResolveRequest, ResolveResponse,
    SnapshotResponse, SubmitOutcome, SubmitRequest, SyncError, SyncResult,
};
use mtrace_core::{Config, LocalStore, SyncEngine, SyncEvent};
use serde_json::Value;
use tokio::sync::{broadcast, mpsc};

/// One mutation as the remote saw it
#[derive(Debug, Clone, PartialEq)]
pub struct Submission {
    pub entity_type: EntityType,
    pub action: Action,
    pub id: String,
    pub payload: Value,
}

/// Recording remote with programmable per-entity outcomes
#[derive(Default)]
pub struct MockRemote {
    snapshot: Mutex<SnapshotResponse>,
    submissions: Mutex<Vec<Submission>>,
    resolutions: Mutex<Vec<(String, ResolveRequest)>>,
    snapshot_calls: Mutex<Vec<(String, SyncMode)>>,
    failing: Mutex<HashSet<String>>,
    conflicts: Mutex<HashMap<String, ConflictInfo>>,
    delay: Mutex<Duration>,
    snapshot_delay: Mutex<Duration>,
}

impl MockRemote {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_snapshot(&self, snapshot: SnapshotResponse) {
        *self.snapshot.lock().unwrap() = snapshot;
    }

    /// Every submission for `id` fails in transit
    pub fn fail_always(&self, id: &str) {
        self.failing.lock().unwrap().insert(id.to_string());
    }

    /// Submissions for `id` report a conflict until cleared
    pub fn conflict_on(&self, id: &str, info: ConflictInfo) {
        self.conflicts.lock().unwrap().insert(id.to_string(), info);
    }

    pub fn clear_conflict(&self, id: &str) {
        self.conflicts.lock().unwrap().remove(id);
    }

    /// Latency of every submission
    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock().unwrap() = delay;
    }

    /// Latency of every snapshot fetch
    pub fn set_snapshot_delay(&self, delay: Duration) {
        *self.snapshot_delay.lock().unwrap() = delay;
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn submissions_for(&self, id: &str) -> Vec<Submission> {
        self.submissions()
            .into_iter()
            .filter(|s| s.id == id)
            .collect()
    }

    pub fn resolutions(&self) -> Vec<(String, ResolveRequest)> {
        self.resolutions.lock().unwrap().clone()
    }

    pub fn snapshot_calls(&self) -> Vec<(String, SyncMode)> {
        self.snapshot_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl RemoteService for MockRemote {
    async fn fetch_snapshot(
        &self,
        account_id: &str,
        mode: SyncMode,
    ) -> SyncResult<SnapshotResponse> {
        self.snapshot_calls
            .lock()
            .unwrap()
            .push((account_id.to_string(), mode));
        let snapshot = self.snapshot.lock().unwrap().clone();

        let delay = *self.snapshot_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        Ok(snapshot)
    }

    async fn submit(
        &self,
        entity_type: EntityType,
        request: &SubmitRequest,
    ) -> SyncResult<SubmitOutcome> {
        let delay = *self.delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let id = request.data["id"].as_str().unwrap_or_default().to_string();
        self.submissions.lock().unwrap().push(Submission {
            entity_type,
            action: request.action,
            id: id.clone(),
            payload: request.data.clone(),
        });

        if self.failing.lock().unwrap().contains(&id) {
            return Err(SyncError::transport("connection reset by peer"));
        }
        if let Some(info) = self.conflicts.lock().unwrap().get(&id) {
            return Ok(SubmitOutcome::Conflict(info.clone()));
        }
        Ok(SubmitOutcome::Accepted)
    }

    async fn resolve(
        &self,
        conflict_id: &str,
        request: &ResolveRequest,
    ) -> SyncResult<ResolveResponse> {
        self.resolutions
            .lock()
            .unwrap()
            .push((conflict_id.to_string(), request.clone()));
        Ok(ResolveResponse {
            success: true,
            message: "resolved".into(),
        })
    }
}

/// Server half of an in-memory push channel
pub struct ServerEnd {
    pub to_client: mpsc::UnboundedSender<String>,
    pub from_client: mpsc::UnboundedReceiver<String>,
}

/// Connector handing tests the server side of every channel it opens
#[derive(Default)]
pub struct MockConnector {
    attempts: AtomicUsize,
    servers: Mutex<Vec<ServerEnd>>,
}

impl MockConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Push a frame on the most recently opened channel
    pub fn push(&self, frame: Value) {
        let servers = self.servers.lock().unwrap();
        let server = servers.last().expect("no channel open");
        server
            .to_client
            .send(frame.to_string())
            .expect("client end closed");
    }

    /// Frames the client sent on the most recent channel
    pub fn received(&self) -> Vec<String> {
        let mut servers = self.servers.lock().unwrap();
        let mut frames = Vec::new();
        if let Some(server) = servers.last_mut() {
            while let Ok(frame) = server.from_client.try_recv() {
                frames.push(frame);
            }
        }
        frames
    }

    /// Close every channel from the server side
    pub fn hang_up(&self) {
        self.servers.lock().unwrap().clear();
    }
}

#[async_trait]
impl Connector for MockConnector {
    async fn open(&self, _account_id: &str) -> SyncResult<PushChannel> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let (to_client, inbound) = mpsc::unbounded_channel();
        let (outbound, from_client) = mpsc::unbounded_channel();
        self.servers.lock().unwrap().push(ServerEnd {
            to_client,
            from_client,
        });
        Ok(PushChannel { outbound, inbound })
    }
}

pub struct Harness {
    pub engine: SyncEngine,
    pub remote: Arc<MockRemote>,
    pub connector: Arc<MockConnector>,
}

/// Engine over an in-memory store with mocked network edges
pub fn harness(online: bool) -> Harness {
    let remote = MockRemote::new();
    let connector = MockConnector::new();
    let store = LocalStore::open_in_memory().unwrap();
    let engine = SyncEngine::with_parts(
        Config::default(),
        store,
        remote.clone(),
        connector.clone(),
        online,
    )
    .unwrap();

    Harness {
        engine,
        remote,
        connector,
    }
}

/// Let spawned tasks run without moving the clock much
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
    tokio::time::sleep(Duration::from_millis(1)).await;
}

/// Wait until `check` holds, giving up after a few virtual seconds
pub async fn eventually<F: FnMut() -> bool>(mut check: F) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

/// Drain whatever events are buffered
pub fn drain_events(rx: &mut broadcast::Receiver<SyncEvent>) -> Vec<SyncEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
