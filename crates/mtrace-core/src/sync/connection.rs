//! Push channel connection
//!
//! Owns the single live channel to the remote service. The manager walks
//! `Disconnected -> Connecting -> Open`, falls back to `Reconnecting` when
//! the channel drops, and retries on a fixed delay for as long as the
//! device reports itself online.
//!
//! Every channel gets a generation number. Closing, replacing or going
//! offline bumps the generation, and a reader task whose generation is
//! stale stops dispatching immediately.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::{self, Message};
use tracing::{debug, info, warn};

use super::error::{SyncError, SyncResult};
use super::events::{EventBus, SyncEvent};
use super::message::{ClientFrame, PushFrame};
use super::scheduler::ScheduledTask;
use super::state::{ConnectionStatus, SyncStateHandle};
use crate::config::{Config, SyncSettings};

/// Interval between keep-alive frames on a websocket channel
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);

/// An open bidirectional text channel
pub struct PushChannel {
    /// Frames to send to the server; dropping it closes the channel
    pub outbound: mpsc::UnboundedSender<String>,
    /// Frames received from the server; ends when the channel closes
    pub inbound: mpsc::UnboundedReceiver<String>,
}

/// Opens push channels
#[async_trait]
pub trait Connector: Send + Sync {
    async fn open(&self, account_id: &str) -> SyncResult<PushChannel>;
}

/// Receives parsed push frames, one at a time in arrival order
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, frame: PushFrame);
}

/// `Connector` over a websocket
pub struct WsConnector {
    config: Config,
}

impl WsConnector {
    pub fn new(config: &Config) -> Self {
        Self {
            config: config.clone(),
        }
    }
}

#[async_trait]
impl Connector for WsConnector {
    async fn open(&self, account_id: &str) -> SyncResult<PushChannel> {
        let url = self.config.push_url(account_id);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(classify_handshake_error)?;
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<String>();

        tokio::spawn(async move {
            let start = tokio::time::Instant::now() + HEARTBEAT_INTERVAL;
            let mut heartbeat = tokio::time::interval_at(start, HEARTBEAT_INTERVAL);

            loop {
                tokio::select! {
                    outgoing = out_rx.recv() => match outgoing {
                        Some(text) => {
                            if write.send(Message::Text(text)).await.is_err() {
                                break;
                            }
                        }
                        None => {
                            // Manager dropped the channel
                            write.close().await.ok();
                            break;
                        }
                    },
                    incoming = read.next() => match incoming {
                        Some(Ok(Message::Text(text))) => {
                            if in_tx.send(text).is_err() {
                                break;
                            }
                        }
                        Some(Ok(Message::Binary(bytes))) => {
                            if let Ok(text) = String::from_utf8(bytes) {
                                if in_tx.send(text).is_err() {
                                    break;
                                }
                            }
                        }
                        Some(Ok(Message::Close(_))) | None => break,
                        Some(Err(e)) => {
                            warn!(error = %e, "Push channel error");
                            break;
                        }
                        _ => {}
                    },
                    _ = heartbeat.tick() => {
                        let ping = ClientFrame::Ping {
                            timestamp: chrono::Utc::now().timestamp_millis(),
                        };
                        let Ok(text) = serde_json::to_string(&ping) else {
                            continue;
                        };
                        if write.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                }
            }
            debug!("Push channel pump finished");
        });

        Ok(PushChannel {
            outbound: out_tx,
            inbound: in_rx,
        })
    }
}

fn classify_handshake_error(err: tungstenite::Error) -> SyncError {
    match err {
        tungstenite::Error::Http(response) => {
            let status = response.status();
            if status.as_u16() == 401 || status.as_u16() == 403 {
                SyncError::AuthenticationFailed(format!("push channel refused: {}", status))
            } else {
                SyncError::Connection(format!("handshake failed: {}", status))
            }
        }
        other => SyncError::Connection(other.to_string()),
    }
}

/// Mutable connection bookkeeping, never held across an await
#[derive(Default)]
struct Slot {
    account_id: Option<String>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    reader: Option<JoinHandle<()>>,
    reconnect: Option<ScheduledTask>,
    generation: u64,
    auto_reconnect: bool,
}

impl Slot {
    /// Invalidate the current channel and any pending reconnect
    fn close(&mut self) -> u64 {
        self.generation += 1;
        self.outbound = None;
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        if let Some(mut timer) = self.reconnect.take() {
            timer.cancel();
        }
        self.generation
    }
}

struct Inner {
    connector: Arc<dyn Connector>,
    state: SyncStateHandle,
    events: EventBus,
    handshake_timeout: Duration,
    reconnect_delay: Duration,
    slot: Mutex<Slot>,
    handler: RwLock<Option<Arc<dyn MessageHandler>>>,
}

/// Owner of the push channel
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<Inner>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn Connector>,
        state: SyncStateHandle,
        events: EventBus,
        settings: &SyncSettings,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                connector,
                state,
                events,
                handshake_timeout: settings.handshake_timeout(),
                reconnect_delay: settings.reconnect_delay(),
                slot: Mutex::new(Slot::default()),
                handler: RwLock::new(None),
            }),
        }
    }

    /// Open the push channel for `account_id`, replacing any current one
    pub async fn connect(&self, account_id: &str) -> SyncResult<()> {
        self.inner.connect(account_id).await
    }

    /// Send a text frame on the open channel
    pub fn send(&self, text: impl Into<String>) -> SyncResult<()> {
        let slot = self.inner.slot();
        let outbound = slot.outbound.as_ref().ok_or(SyncError::NotConnected)?;
        outbound
            .send(text.into())
            .map_err(|_| SyncError::NotConnected)
    }

    /// Register the dispatcher for inbound frames
    pub fn on_message(&self, handler: Arc<dyn MessageHandler>) {
        let mut slot = self
            .inner
            .handler
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        *slot = Some(handler);
    }

    /// Close the channel and stop reconnecting; safe to call repeatedly
    pub fn disconnect(&self) {
        {
            let mut slot = self.inner.slot();
            slot.close();
            slot.account_id = None;
            slot.auto_reconnect = false;
        }
        self.inner.set_status(ConnectionStatus::Disconnected);
    }

    /// Apply a network reachability change
    ///
    /// Going offline cancels any reconnect timer and closes the channel.
    /// Coming back online reconnects at once, skipping the delay.
    pub async fn set_online(&self, online: bool) {
        self.inner.state.set_online(online);

        if !online {
            self.inner.slot().close();
            self.inner.set_status(ConnectionStatus::Disconnected);
            info!("Offline, push channel closed");
            return;
        }

        let account_id = {
            let mut slot = self.inner.slot();
            if slot.outbound.is_some() {
                return;
            }
            slot.auto_reconnect = true;
            slot.account_id.clone()
        };

        if let Some(account_id) = account_id {
            if let Err(e) = self.inner.connect(&account_id).await {
                warn!(error = %e, %account_id, "Reconnect after coming online failed");
            }
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.inner.state.snapshot().connection
    }

    /// Account of the current or last requested channel
    pub fn account_id(&self) -> Option<String> {
        self.inner.slot().account_id.clone()
    }

    pub fn is_open(&self) -> bool {
        self.inner.slot().outbound.is_some()
    }

    /// Whether a reconnect timer is pending
    pub fn reconnect_pending(&self) -> bool {
        self.inner
            .slot()
            .reconnect
            .as_ref()
            .is_some_and(|timer| !timer.is_finished())
    }
}

impl Inner {
    fn slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn set_status(&self, status: ConnectionStatus) {
        if self.state.snapshot().connection != status {
            self.state.set_connection(status);
            self.events.publish(SyncEvent::ConnectionChanged(status));
        }
    }

    async fn connect(self: &Arc<Self>, account_id: &str) -> SyncResult<()> {
        let generation = {
            let mut slot = self.slot();
            let generation = slot.close();
            slot.account_id = Some(account_id.to_string());
            slot.auto_reconnect = true;
            generation
        };
        self.set_status(ConnectionStatus::Connecting);
        debug!(%account_id, "Opening push channel");

        let opened = tokio::time::timeout(self.handshake_timeout, self.connector.open(account_id))
            .await
            .unwrap_or_else(|_| {
                Err(SyncError::Connection(format!(
                    "handshake timed out after {:?}",
                    self.handshake_timeout
                )))
            });

        let mut slot = self.slot();
        if slot.generation != generation {
            // Superseded while the handshake was in flight
            return Err(SyncError::Cancelled);
        }

        match opened {
            Ok(channel) => {
                slot.outbound = Some(channel.outbound);
                slot.reader = Some(self.spawn_reader(generation, channel.inbound));
                drop(slot);
                self.set_status(ConnectionStatus::Open);
                info!(%account_id, "Push channel open");
                Ok(())
            }
            Err(e) if e.is_auth_failure() => {
                slot.auto_reconnect = false;
                drop(slot);
                warn!(error = %e, %account_id, "Push channel authentication failed");
                self.set_status(ConnectionStatus::Disconnected);
                self.events
                    .publish(SyncEvent::AuthenticationFailed(e.to_string()));
                Err(e)
            }
            Err(e) => {
                warn!(error = %e, %account_id, "Push channel handshake failed");
                let scheduled = self.schedule_reconnect(&mut slot);
                drop(slot);
                self.set_status(if scheduled {
                    ConnectionStatus::Reconnecting
                } else {
                    ConnectionStatus::Disconnected
                });
                Err(e)
            }
        }
    }

    fn spawn_reader(
        self: &Arc<Self>,
        generation: u64,
        mut inbound: mpsc::UnboundedReceiver<String>,
    ) -> JoinHandle<()> {
        let weak: Weak<Inner> = Arc::downgrade(self);
        tokio::spawn(async move {
            while let Some(text) = inbound.recv().await {
                let Some(inner) = weak.upgrade() else {
                    return;
                };
                if inner.slot().generation != generation {
                    return;
                }
                inner.dispatch(&text).await;
            }
            if let Some(inner) = weak.upgrade() {
                inner.channel_closed(generation);
            }
        })
    }

    async fn dispatch(&self, text: &str) {
        let frame = match PushFrame::parse(text) {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                warn!("Ignoring push frame of unknown type");
                return;
            }
            Err(e) => {
                warn!(error = %e, "Dropping malformed push frame");
                return;
            }
        };

        let handler = self
            .handler
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        match handler {
            Some(handler) => handler.handle(frame).await,
            None => debug!(kind = frame.kind(), "No handler registered, frame dropped"),
        }
    }

    /// The server side closed a channel we still consider current
    fn channel_closed(self: &Arc<Self>, generation: u64) {
        let mut slot = self.slot();
        if slot.generation != generation {
            return;
        }
        slot.outbound = None;
        // Reader is this task; let its handle go without aborting
        slot.reader.take();

        let scheduled = self.schedule_reconnect(&mut slot);
        drop(slot);
        info!(reconnecting = scheduled, "Push channel closed");
        self.set_status(if scheduled {
            ConnectionStatus::Reconnecting
        } else {
            ConnectionStatus::Disconnected
        });
    }

    /// Arm the fixed-delay reconnect timer if reconnecting is allowed
    fn schedule_reconnect(self: &Arc<Self>, slot: &mut Slot) -> bool {
        if !slot.auto_reconnect || slot.account_id.is_none() || !self.state.is_online() {
            return false;
        }

        let weak = Arc::downgrade(self);
        slot.reconnect = Some(ScheduledTask::after(self.reconnect_delay, async move {
            if let Some(inner) = weak.upgrade() {
                inner.reconnect_now().await;
            }
        }));
        true
    }

    async fn reconnect_now(self: Arc<Self>) {
        let account_id = {
            let mut slot = self.slot();
            // This task owns the timer; release it so connect() won't abort us
            if let Some(timer) = slot.reconnect.take() {
                timer.detach();
            }
            slot.account_id.clone()
        };

        if let Some(account_id) = account_id {
            debug!(%account_id, "Reconnecting push channel");
            if let Err(e) = self.connect(&account_id).await {
                debug!(error = %e, "Reconnect attempt failed");
            }
        }
    }
}
