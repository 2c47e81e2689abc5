//! Reconnecting WebSocket client for the bridge
//!
//! Keeps a local mirror of the server's state store and re-dispatches
//! received events on a local event bus. On every (re)connect it asks for a
//! fresh snapshot and drops events until the reply has been applied, so
//! observers never see an event on top of stale state.

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use parking_lot::RwLock;
use rand::Rng;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, warn};

use super::protocol::{ClientCommand, ServerMessage, PING, PONG};
use crate::sync::{
    Event, EventBus, StateEntry, StateSnapshot, StateStore, SubscriptionId, STATE_TOPIC_PREFIX,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub url: String,
    /// First reconnect delay; doubles per failed attempt
    pub reconnect_interval_ms: u64,
    pub max_backoff_ms: u64,
    pub keepalive_interval_secs: u64,
    pub topics: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: "ws://127.0.0.1:8765/ws".to_string(),
            reconnect_interval_ms: 1000,
            max_backoff_ms: 30_000,
            keepalive_interval_secs: 15,
            topics: vec!["*".to_string()],
        }
    }
}

impl ClientConfig {
    /// Delay before reconnect attempt `attempt` (0-based): exponential,
    /// capped, then jittered down by up to half
    pub fn backoff(&self, attempt: u32) -> Duration {
        let base = self.reconnect_interval_ms.max(1);
        let capped = base
            .saturating_mul(2u64.saturating_pow(attempt))
            .min(self.max_backoff_ms.max(base));
        let factor: f64 = rand::thread_rng().gen_range(0.5..=1.0);
        Duration::from_millis((capped as f64 * factor) as u64)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ClientStatus {
    Disconnected,
    Connecting,
    /// Connected, waiting for the snapshot
    Syncing,
    Live,
    Stopped,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ClientCounters {
    pub connections: u64,
    /// Every snapshot frame received
    pub snapshots: u64,
    /// Requested snapshots that brought a connection live
    pub syncs: u64,
    pub events: u64,
    /// Events that arrived before the snapshot of their connection
    pub dropped_unsynced: u64,
    pub errors: u64,
}

/// The server queues a snapshot when it registers a connection, before it
/// reads any frame, so the reply to our single `snapshot_request` is the
/// second snapshot on each socket.
const REQUESTED_SNAPSHOT: u32 = 2;

/// Sync progress of one connection
#[derive(Debug, Default)]
struct SyncState {
    snapshots: u32,
}

impl SyncState {
    fn is_live(&self) -> bool {
        self.snapshots >= REQUESTED_SNAPSHOT
    }
}

enum SessionEnd {
    Closed,
    Stopped,
}

type SnapshotCallback = Arc<dyn Fn(&StateSnapshot) + Send + Sync>;

pub struct WsClient {
    config: ClientConfig,
    mirror: Arc<StateStore>,
    bus: Arc<EventBus>,
    status: RwLock<ClientStatus>,
    counters: RwLock<ClientCounters>,
    snapshot_callbacks: RwLock<Vec<SnapshotCallback>>,
}

impl WsClient {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            config,
            mirror: Arc::new(StateStore::new()),
            bus: Arc::new(EventBus::new()),
            status: RwLock::new(ClientStatus::Disconnected),
            counters: RwLock::new(ClientCounters::default()),
            snapshot_callbacks: RwLock::new(Vec::new()),
        }
    }

    /// Handle events received from the server (after sync)
    pub fn subscribe<F>(&self, pattern: &str, handler: F) -> SubscriptionId
    where
        F: Fn(&Event) -> Result<()> + Send + Sync + 'static,
    {
        self.bus.subscribe(pattern, handler)
    }

    /// Called after each snapshot has been applied to the mirror
    pub fn on_snapshot<F>(&self, callback: F)
    where
        F: Fn(&StateSnapshot) + Send + Sync + 'static,
    {
        self.snapshot_callbacks.write().push(Arc::new(callback));
    }

    pub fn mirror(&self) -> &Arc<StateStore> {
        &self.mirror
    }

    pub fn status(&self) -> ClientStatus {
        *self.status.read()
    }

    pub fn counters(&self) -> ClientCounters {
        self.counters.read().clone()
    }

    pub fn spawn(self: Arc<Self>, stop: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(async move { self.run(stop).await })
    }

    /// Connect and stay connected until `stop` flips
    pub async fn run(&self, mut stop: watch::Receiver<bool>) {
        let mut attempt = 0u32;

        loop {
            if *stop.borrow() {
                break;
            }

            *self.status.write() = ClientStatus::Connecting;
            match self.connect_once(&mut stop, &mut attempt).await {
                Ok(SessionEnd::Stopped) => break,
                Ok(SessionEnd::Closed) => info!(url = %self.config.url, "Bridge connection closed"),
                Err(e) => {
                    self.counters.write().errors += 1;
                    warn!(url = %self.config.url, "Bridge connection failed: {:#}", e);
                }
            }

            *self.status.write() = ClientStatus::Disconnected;
            let delay = self.config.backoff(attempt);
            attempt = attempt.saturating_add(1);
            debug!(delay_ms = delay.as_millis() as u64, attempt, "Reconnecting");

            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = stop.changed() => break,
            }
        }

        *self.status.write() = ClientStatus::Stopped;
        info!("Bridge client stopped");
    }

    async fn connect_once(&self, stop: &mut watch::Receiver<bool>, attempt: &mut u32) -> Result<SessionEnd> {
        let (ws, _) = connect_async(self.config.url.as_str())
            .await
            .with_context(|| format!("Failed to connect to {}", self.config.url))?;

        *attempt = 0;
        self.counters.write().connections += 1;
        *self.status.write() = ClientStatus::Syncing;
        info!(url = %self.config.url, "Bridge connected, requesting snapshot");

        let (mut write, mut read) = ws.split();
        write
            .send(Message::Text(ClientCommand::SnapshotRequest.encode()?.into()))
            .await?;
        write
            .send(Message::Text(ClientCommand::Subscribe(self.config.topics.clone()).encode()?.into()))
            .await?;

        let keepalive_period = Duration::from_secs(self.config.keepalive_interval_secs.max(1));
        let mut keepalive = tokio::time::interval_at(tokio::time::Instant::now() + keepalive_period, keepalive_period);
        let mut sync = SyncState::default();

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => match text.as_str() {
                        PING => write.send(Message::Text(PONG.into())).await?,
                        PONG => {}
                        frame => self.handle_frame(frame, &mut sync),
                    },
                    Some(Ok(Message::Ping(data))) => write.send(Message::Pong(data)).await?,
                    Some(Ok(Message::Close(_))) | None => return Ok(SessionEnd::Closed),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e).context("Bridge read failed"),
                },
                _ = keepalive.tick() => {
                    write.send(Message::Text(PING.into())).await?;
                }
                _ = stop.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Stopped);
                }
            }
        }
    }

    fn handle_frame(&self, frame: &str, sync: &mut SyncState) {
        match ServerMessage::decode(frame) {
            Ok(ServerMessage::Snapshot(snapshot)) => {
                sync.snapshots += 1;
                self.apply_snapshot(&snapshot, sync.is_live());
            }
            Ok(ServerMessage::Event(event)) => {
                if sync.is_live() {
                    self.apply_event(&event);
                } else {
                    self.counters.write().dropped_unsynced += 1;
                }
            }
            Ok(ServerMessage::Error { message }) => {
                self.counters.write().errors += 1;
                warn!("Bridge server reported: {}", message);
            }
            Err(e) => {
                self.counters.write().errors += 1;
                warn!("Ignoring bridge frame: {}", e);
            }
        }
    }

    fn apply_snapshot(&self, snapshot: &StateSnapshot, live: bool) {
        self.mirror.restore(snapshot);
        self.counters.write().snapshots += 1;
        if !live {
            debug!(entries = snapshot.entries.len(), "Connect snapshot applied, awaiting requested one");
            return;
        }

        self.counters.write().syncs += 1;
        *self.status.write() = ClientStatus::Live;
        info!(entries = snapshot.entries.len(), "Snapshot applied");

        let callbacks: Vec<SnapshotCallback> = self.snapshot_callbacks.read().clone();
        for callback in callbacks {
            callback(snapshot);
        }
    }

    fn apply_event(&self, event: &Event) {
        if event.topic.starts_with(STATE_TOPIC_PREFIX) {
            match serde_json::from_value::<StateEntry>(event.payload.clone()) {
                Ok(entry) => {
                    self.mirror.apply_entry(entry);
                }
                Err(e) => warn!(topic = %event.topic, "Malformed state event: {}", e),
            }
        }
        self.counters.write().events += 1;
        self.bus.dispatch(event);
    }
}
