//! WebSocket push server
//!
//! Routes:
//! - `GET /ws` - upgrade; full snapshot on connect, then matching events
//! - `GET /state` - current snapshot as JSON
//! - `GET /health` - connection count, per-client topics and uptime
//!
//! Each connection drains a bounded queue on its own task. The bus handler
//! only `try_send`s into those queues, so a slow client is evicted instead of
//! blocking the publisher or the other clients.

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::watch;
use tower_http::cors::{Any, CorsLayer};
use tracing::{debug, info, warn};

use super::protocol::{ClientCommand, ServerMessage, PING, PONG};
use crate::sync::{topic, Event, EventBus, StateStore};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub heartbeat_interval_secs: u64,
    /// Defaults to three heartbeat intervals
    pub heartbeat_timeout_secs: Option<u64>,
    /// Per-connection outbound queue capacity
    pub client_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8765,
            heartbeat_interval_secs: 15,
            heartbeat_timeout_secs: None,
            client_queue: 256,
        }
    }
}

impl ServerConfig {
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_interval_secs.max(1))
    }

    pub fn heartbeat_timeout(&self) -> Duration {
        match self.heartbeat_timeout_secs {
            Some(secs) => Duration::from_secs(secs),
            None => self.heartbeat_interval() * 3,
        }
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

pub type ConnectionId = u64;

struct Connection {
    outbound: mpsc::Sender<String>,
    topics: Vec<String>,
    /// False until the client sends its own subscribe
    explicit_topics: bool,
    last_heartbeat_at: Instant,
    connected_at: DateTime<Utc>,
}

/// Summary of one live connection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ConnectionInfo {
    pub id: ConnectionId,
    pub topics: Vec<String>,
    pub connected_at: DateTime<Utc>,
    pub idle_ms: u64,
}

/// Sole owner of the live connections. Removing a connection drops its
/// queue sender, which ends that connection's writer task and closes the
/// socket.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<ConnectionId, Connection>>,
    next_id: AtomicU64,
    evicted: AtomicU64,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a connection subscribed to `*`. `initial` runs under the registry
    /// lock, so its frame is queued ahead of any event.
    pub fn register<F>(&self, queue: usize, initial: F) -> (ConnectionId, mpsc::Receiver<String>)
    where
        F: FnOnce() -> Option<String>,
    {
        let (tx, rx) = mpsc::channel(queue.max(1));
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;

        let mut connections = self.connections.lock();
        if let Some(frame) = initial() {
            let _ = tx.try_send(frame);
        }
        connections.insert(
            id,
            Connection {
                outbound: tx,
                topics: vec![topic::WILDCARD.to_string()],
                explicit_topics: false,
                last_heartbeat_at: Instant::now(),
                connected_at: Utc::now(),
            },
        );
        (id, rx)
    }

    pub fn remove(&self, id: ConnectionId) -> bool {
        self.connections.lock().remove(&id).is_some()
    }

    /// Record inbound traffic from `id`
    pub fn touch(&self, id: ConnectionId) {
        if let Some(conn) = self.connections.lock().get_mut(&id) {
            conn.last_heartbeat_at = Instant::now();
        }
    }

    /// Add topics; the first explicit subscribe replaces the default `*`
    pub fn subscribe(&self, id: ConnectionId, topics: &[String]) {
        if let Some(conn) = self.connections.lock().get_mut(&id) {
            if !conn.explicit_topics {
                conn.topics.clear();
                conn.explicit_topics = true;
            }
            for t in topics {
                if !conn.topics.contains(t) {
                    conn.topics.push(t.clone());
                }
            }
        }
    }

    pub fn unsubscribe(&self, id: ConnectionId, topics: &[String]) {
        if let Some(conn) = self.connections.lock().get_mut(&id) {
            conn.explicit_topics = true;
            conn.topics.retain(|t| !topics.contains(t));
        }
    }

    pub fn topics(&self, id: ConnectionId) -> Option<Vec<String>> {
        self.connections.lock().get(&id).map(|c| c.topics.clone())
    }

    /// Queue a frame for one connection; evicts it if its queue is full
    pub fn send_to(&self, id: ConnectionId, frame: String) -> bool {
        let mut connections = self.connections.lock();
        let Some(conn) = connections.get(&id) else {
            return false;
        };
        match conn.outbound.try_send(frame) {
            Ok(()) => true,
            Err(e) => {
                connections.remove(&id);
                self.note_drop(id, &e);
                false
            }
        }
    }

    /// Fan an event out to every connection subscribed to its topic.
    /// Returns the number of queues it was placed on.
    pub fn broadcast(&self, event: &Event) -> usize {
        let frame = match ServerMessage::Event(event.clone()).encode() {
            Ok(f) => f,
            Err(e) => {
                warn!(topic = %event.topic, "Failed to encode event: {}", e);
                return 0;
            }
        };

        let mut connections = self.connections.lock();
        let mut delivered = 0;
        let mut dropped = Vec::new();

        for (id, conn) in connections.iter() {
            if !topic::matches_any(&conn.topics, &event.topic) {
                continue;
            }
            match conn.outbound.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => dropped.push((*id, e)),
            }
        }

        for (id, err) in dropped {
            connections.remove(&id);
            self.note_drop(id, &err);
        }
        delivered
    }

    /// Queue a heartbeat ping on every connection
    pub fn ping_all(&self) {
        let mut connections = self.connections.lock();
        let mut dropped = Vec::new();
        for (id, conn) in connections.iter() {
            if let Err(e) = conn.outbound.try_send(PING.to_string()) {
                dropped.push((*id, e));
            }
        }
        for (id, err) in dropped {
            connections.remove(&id);
            self.note_drop(id, &err);
        }
    }

    /// Evict connections silent for longer than `timeout`
    pub fn sweep_stale(&self, timeout: Duration) -> Vec<ConnectionId> {
        let mut connections = self.connections.lock();
        let stale: Vec<ConnectionId> = connections
            .iter()
            .filter(|(_, c)| c.last_heartbeat_at.elapsed() > timeout)
            .map(|(id, _)| *id)
            .collect();

        for id in &stale {
            connections.remove(id);
            self.evicted.fetch_add(1, Ordering::Relaxed);
            warn!(connection = id, "Evicting connection after heartbeat timeout");
        }
        stale
    }

    /// Drop every connection (shutdown or forced resync)
    pub fn close_all(&self) -> usize {
        let mut connections = self.connections.lock();
        let n = connections.len();
        connections.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.connections.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    pub fn connections(&self) -> Vec<ConnectionInfo> {
        let mut out: Vec<ConnectionInfo> = self
            .connections
            .lock()
            .iter()
            .map(|(id, c)| ConnectionInfo {
                id: *id,
                topics: c.topics.clone(),
                connected_at: c.connected_at,
                idle_ms: c.last_heartbeat_at.elapsed().as_millis() as u64,
            })
            .collect();
        out.sort_by_key(|c| c.id);
        out
    }

    fn note_drop(&self, id: ConnectionId, err: &TrySendError<String>) {
        match err {
            TrySendError::Full(_) => {
                self.evicted.fetch_add(1, Ordering::Relaxed);
                warn!(connection = id, "Evicting slow client: outbound queue full");
            }
            TrySendError::Closed(_) => {
                debug!(connection = id, "Dropping closed connection");
            }
        }
    }
}

struct BridgeState {
    config: ServerConfig,
    store: Arc<StateStore>,
    registry: Arc<ConnectionRegistry>,
    started_at: Instant,
}

fn snapshot_frame(store: &StateStore) -> Option<String> {
    match ServerMessage::Snapshot(store.snapshot()).encode() {
        Ok(frame) => Some(frame),
        Err(e) => {
            warn!("Failed to encode snapshot: {}", e);
            None
        }
    }
}

pub struct WsServer {
    state: Arc<BridgeState>,
    bus: Arc<EventBus>,
}

impl WsServer {
    pub fn new(config: ServerConfig, store: Arc<StateStore>, bus: Arc<EventBus>) -> Self {
        Self {
            state: Arc::new(BridgeState {
                config,
                store,
                registry: Arc::new(ConnectionRegistry::new()),
                started_at: Instant::now(),
            }),
            bus,
        }
    }

    pub fn registry(&self) -> Arc<ConnectionRegistry> {
        self.state.registry.clone()
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(ws_handler))
            .route("/state", get(state_handler))
            .route("/health", get(health_handler))
            .layer(CorsLayer::new().allow_origin(Any))
            .with_state(self.state.clone())
    }

    pub async fn bind(&self) -> Result<TcpListener> {
        let addr = self.state.config.addr();
        TcpListener::bind(&addr)
            .await
            .with_context(|| format!("Failed to bind {}", addr))
    }

    /// Serve until `stop` flips, then close every connection
    pub async fn serve(self, listener: TcpListener, stop: watch::Receiver<bool>) -> Result<()> {
        let addr: SocketAddr = listener.local_addr()?;
        let registry = self.state.registry.clone();

        let forwarder = registry.clone();
        let subscription = self.bus.subscribe("*", move |event| {
            forwarder.broadcast(event);
            Ok(())
        });

        let heartbeat = tokio::spawn(run_heartbeat(
            registry.clone(),
            self.state.config.heartbeat_interval(),
            self.state.config.heartbeat_timeout(),
            stop.clone(),
        ));

        info!("WebSocket bridge listening on ws://{}/ws", addr);

        let app = self.router();
        let shutdown_registry = registry.clone();
        let mut shutdown = stop;
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                while !*shutdown.borrow() {
                    if shutdown.changed().await.is_err() {
                        break;
                    }
                }
                let closed = shutdown_registry.close_all();
                info!(closed, "WebSocket bridge shutting down");
            })
            .await
            .context("WebSocket server failed")?;

        self.bus.unsubscribe(subscription);
        heartbeat.abort();
        Ok(())
    }
}

async fn run_heartbeat(
    registry: Arc<ConnectionRegistry>,
    interval: Duration,
    timeout: Duration,
    mut stop: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stale = registry.sweep_stale(timeout);
                registry.ping_all();
                if !stale.is_empty() {
                    info!(evicted = stale.len(), remaining = registry.len(), "Heartbeat sweep");
                }
            }
            _ = stop.changed() => break,
        }
    }
}

async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<BridgeState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn state_handler(State(state): State<Arc<BridgeState>>) -> impl IntoResponse {
    Json(state.store.snapshot())
}

async fn health_handler(State(state): State<Arc<BridgeState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "connections": state.registry.len(),
        "evicted": state.registry.evicted(),
        "clients": state.registry.connections(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

async fn handle_socket(socket: WebSocket, state: Arc<BridgeState>) {
    let (mut sender, mut receiver) = socket.split();
    let registry = state.registry.clone();

    let (id, mut outbound) = registry.register(state.config.client_queue, || snapshot_frame(&state.store));
    info!(connection = id, clients = registry.len(), "WebSocket client connected");

    // Ends when the registry drops this connection's sender
    let send_task = tokio::spawn(async move {
        while let Some(frame) = outbound.recv().await {
            if sender.send(Message::Text(frame.into())).await.is_err() {
                return;
            }
        }
        let _ = sender.send(Message::Close(None)).await;
    });

    let recv_state = state.clone();
    let recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            recv_state.registry.touch(id);
            match msg {
                Message::Text(text) => handle_text(&recv_state, id, text.as_str()),
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = send_task => {},
        _ = recv_task => {},
    }

    registry.remove(id);
    info!(connection = id, "WebSocket client disconnected");
}

fn handle_text(state: &BridgeState, id: ConnectionId, text: &str) {
    match text {
        PING => {
            state.registry.send_to(id, PONG.to_string());
            return;
        }
        PONG => return,
        _ => {}
    }

    match ClientCommand::decode(text) {
        Ok(ClientCommand::Subscribe(topics)) => {
            debug!(connection = id, ?topics, "Client subscribed");
            state.registry.subscribe(id, &topics);
        }
        Ok(ClientCommand::Unsubscribe(topics)) => {
            debug!(connection = id, ?topics, "Client unsubscribed");
            state.registry.unsubscribe(id, &topics);
        }
        Ok(ClientCommand::SnapshotRequest) => {
            if let Some(frame) = snapshot_frame(&state.store) {
                state.registry.send_to(id, frame);
            }
        }
        Err(e) => {
            warn!(connection = id, "Rejected client frame: {}", e);
            if let Ok(frame) = (ServerMessage::Error { message: e.to_string() }).encode() {
                state.registry.send_to(id, frame);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

    fn event(topic: &str) -> Event {
        Event {
            sequence: 1,
            topic: topic.to_string(),
            payload: json!({}),
            timestamp: Utc::now(),
            source: "test".to_string(),
        }
    }

    #[test]
    fn test_full_queue_evicts_only_slow_client() {
        let registry = ConnectionRegistry::new();
        let (_slow, _slow_rx) = registry.register(1, || None);
        let (fast, mut fast_rx) = registry.register(8, || None);

        assert_eq!(registry.broadcast(&event("signal.created")), 2);
        assert!(fast_rx.try_recv().is_ok());

        // Slow client never drained its single slot
        assert_eq!(registry.broadcast(&event("signal.confirmed")), 1);
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.evicted(), 1);
        assert!(registry.topics(fast).is_some());
    }

    #[test]
    fn test_explicit_subscribe_replaces_default() {
        let registry = ConnectionRegistry::new();
        let (id, mut rx) = registry.register(8, || None);
        registry.subscribe(id, &["signal.*".to_string()]);

        assert_eq!(registry.broadcast(&event("state.trading.pnl")), 0);
        assert_eq!(registry.broadcast(&event("signal.missed")), 1);
        assert!(rx.try_recv().is_ok());

        registry.unsubscribe(id, &["signal.*".to_string()]);
        assert_eq!(registry.topics(id), Some(vec![]));
    }

    #[test]
    fn test_initial_frame_queued_first() {
        let registry = ConnectionRegistry::new();
        let (_id, mut rx) = registry.register(8, || Some("hello".to_string()));
        registry.broadcast(&event("a"));

        assert_eq!(rx.try_recv().unwrap(), "hello");
        assert!(rx.try_recv().unwrap().contains("\"event\""));
    }

    #[test]
    fn test_sweep_stale() {
        let registry = ConnectionRegistry::new();
        let (quiet, _rx1) = registry.register(8, || None);
        std::thread::sleep(Duration::from_millis(30));
        let (fresh, _rx2) = registry.register(8, || None);

        let evicted = registry.sweep_stale(Duration::from_millis(20));
        assert_eq!(evicted, vec![quiet]);
        assert!(registry.topics(fresh).is_some());
    }

    async fn next_text<S>(stream: &mut S) -> String
    where
        S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            match tokio::time::timeout(Duration::from_secs(5), stream.next()).await {
                Ok(Some(Ok(WsMessage::Text(text)))) if text.as_str() != PING => return text.as_str().to_string(),
                Ok(Some(Ok(_))) => continue,
                other => panic!("no text frame: {:?}", other.is_ok()),
            }
        }
    }

    #[tokio::test]
    async fn test_snapshot_then_events_over_socket() {
        let bus = Arc::new(EventBus::new());
        let store = Arc::new(StateStore::with_bus(bus.clone()));
        store.update("runner.status", "running").unwrap();

        let config = ServerConfig {
            port: 0,
            ..Default::default()
        };
        let server = WsServer::new(config, store.clone(), bus.clone());
        let registry = server.registry();
        let listener = server.bind().await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = watch::channel(false);
        let handle = tokio::spawn(server.serve(listener, stop_rx));

        let (ws, _) = connect_async(format!("ws://{}/ws", addr)).await.unwrap();
        let (_write, mut read) = ws.split();

        match ServerMessage::decode(&next_text(&mut read).await).unwrap() {
            ServerMessage::Snapshot(snapshot) => assert_eq!(snapshot.entries.len(), 1),
            other => panic!("expected snapshot, got {:?}", other),
        }

        store.update("trading.pnl", 42i64).unwrap();
        match ServerMessage::decode(&next_text(&mut read).await).unwrap() {
            ServerMessage::Event(event) => {
                assert_eq!(event.topic, "state.trading.pnl");
                assert_eq!(event.payload["version"], 1);
            }
            other => panic!("expected event, got {:?}", other),
        }

        let health: serde_json::Value = reqwest::get(format!("http://{}/health", addr))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(health["connections"], 1);
        assert_eq!(health["clients"][0]["topics"][0], "*");
        assert_eq!(registry.len(), 1);

        stop_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .unwrap()
            .unwrap()
            .unwrap();
    }
}
