use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::Response;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::metrics::AppMetrics;
use crate::models::{GeoPoint, TrainType};
use crate::pubsub::{channels, PubSubPort};

/// One slow client must not stall a broadcast fan-out.
const SEND_TIMEOUT: Duration = Duration::from_secs(2);

/// Per-session outbound queue depth. A client that falls this far behind
/// is dropped rather than buffered.
const OUTBOUND_BUFFER: usize = 8;

const AVAILABLE_SUBSCRIPTIONS: [&str; 6] = [
    "subscribe_train",
    "subscribe_section",
    "subscribe_all",
    "subscribe_ai",
    "subscribe_ai_training",
    "ping",
];

/// Envelope for every message the hub emits.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundMessage {
    #[serde(rename = "type")]
    pub kind: String,
    pub data: Value,
    pub timestamp: DateTime<Utc>,
}

impl OutboundMessage {
    pub fn new(kind: &str, data: Value) -> Self {
        Self {
            kind: kind.to_string(),
            data,
            timestamp: Utc::now(),
        }
    }

    fn to_text(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| "{}".to_string())
    }
}

/// Train position update as carried on the wire and the positions channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionBroadcast {
    pub train_id: i64,
    pub train_number: String,
    pub train_type: TrainType,
    pub position: PositionPayload,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PositionPayload {
    pub section_id: i64,
    pub coordinates: Option<GeoPoint>,
    pub altitude: Option<f64>,
    pub speed_kmh: f64,
    pub heading: Option<f64>,
    pub timestamp: DateTime<Utc>,
}

/// Write half of a client connection.
#[async_trait]
pub trait SessionSink: Send {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()>;
    async fn close(&mut self);
}

/// Read half of a client connection. `None` means the peer is gone.
#[async_trait]
pub trait SessionStream: Send {
    async fn receive_text(&mut self) -> Option<String>;
}

/// A connected client's transport, split into independently owned halves
/// so sends and receives proceed concurrently.
pub trait SessionTransport: Send {
    fn split(self: Box<Self>) -> (Box<dyn SessionSink>, Box<dyn SessionStream>);
}

struct SessionHandle {
    authenticated: bool,
    outbound: mpsc::Sender<String>,
    connected_at: DateTime<Utc>,
}

#[derive(Default)]
struct HubState {
    sessions: HashMap<String, SessionHandle>,
    train_subscriptions: HashMap<i64, HashSet<String>>,
    section_subscriptions: HashMap<i64, HashSet<String>>,
    general_subscribers: HashSet<String>,
    ai_subscribers: HashSet<String>,
    ai_training_subscribers: HashSet<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HubStats {
    pub total_connections: usize,
    pub general_subscribers: usize,
    pub train_subscriptions: usize,
    pub section_subscriptions: usize,
    pub active_train_subscriptions: usize,
    pub active_section_subscriptions: usize,
    pub ai_subscribers: usize,
    pub ai_training_subscribers: usize,
}

/// Subscription-filtered broadcaster for operator clients. Owns every
/// session exclusively; all index mutations go through the single state
/// mutex, and message delivery is per-session queues drained by one writer
/// task each.
pub struct ConnectionHub {
    state: Mutex<HubState>,
    metrics: Arc<AppMetrics>,
}

impl ConnectionHub {
    pub fn new(metrics: Arc<AppMetrics>) -> Self {
        Self {
            state: Mutex::new(HubState::default()),
            metrics,
        }
    }

    /// Drives one client session to completion: registers it, pumps its
    /// outbound queue and inbound messages, and tears everything down when
    /// either side ends.
    pub async fn serve(
        self: Arc<Self>,
        transport: Box<dyn SessionTransport>,
        connection_id: String,
        principal: Option<String>,
    ) {
        let (mut sink, mut stream) = transport.split();
        let (tx, mut rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);

        let authenticated = principal.is_some();
        {
            let mut state = self.state.lock().unwrap();
            state.sessions.insert(
                connection_id.clone(),
                SessionHandle {
                    authenticated,
                    outbound: tx,
                    connected_at: Utc::now(),
                },
            );
        }
        self.metrics.websocket_connections_active.inc();
        info!("WebSocket connection established: {connection_id}");

        let welcome = OutboundMessage::new(
            "connection_established",
            json!({
                "connection_id": connection_id,
                "authenticated": authenticated,
                "principal": principal,
                "server_time": Utc::now().to_rfc3339(),
                "available_subscriptions": AVAILABLE_SUBSCRIPTIONS,
            }),
        );
        self.send_personal(&connection_id, welcome);

        let metrics = self.metrics.clone();
        let writer_id = connection_id.clone();
        let mut writer = tokio::spawn(async move {
            while let Some(text) = rx.recv().await {
                match tokio::time::timeout(SEND_TIMEOUT, sink.send_text(text)).await {
                    Ok(Ok(())) => {
                        metrics.websocket_messages_sent.inc();
                    }
                    Ok(Err(e)) => {
                        metrics.websocket_send_failures_total.inc();
                        debug!("Send to {writer_id} failed: {e}");
                        break;
                    }
                    Err(_) => {
                        metrics.websocket_send_failures_total.inc();
                        debug!("Send to {writer_id} timed out");
                        break;
                    }
                }
            }
            sink.close().await;
        });

        let hub = self.clone();
        let reader_id = connection_id.clone();
        let mut reader = tokio::spawn(async move {
            while let Some(text) = stream.receive_text().await {
                hub.metrics.websocket_messages_received.inc();
                hub.handle_client_message(&reader_id, &text);
            }
        });

        tokio::select! {
            _ = &mut writer => {},
            _ = &mut reader => {},
        }

        self.disconnect(&connection_id);
        writer.abort();
        reader.abort();
    }

    /// Removes the session from every subscription index. Idempotent.
    pub fn disconnect(&self, connection_id: &str) {
        let mut state = self.state.lock().unwrap();
        if state.sessions.remove(connection_id).is_none() {
            return;
        }

        state.general_subscribers.remove(connection_id);
        state.ai_subscribers.remove(connection_id);
        state.ai_training_subscribers.remove(connection_id);
        state.train_subscriptions.retain(|_, subscribers| {
            subscribers.remove(connection_id);
            !subscribers.is_empty()
        });
        state.section_subscriptions.retain(|_, subscribers| {
            subscribers.remove(connection_id);
            !subscribers.is_empty()
        });
        drop(state);

        self.metrics.websocket_connections_active.dec();
        info!("WebSocket connection closed: {connection_id}");
    }

    /// Dispatches one raw client frame. Malformed input earns an `error`
    /// reply on that session only, never a disconnect.
    pub fn handle_client_message(&self, connection_id: &str, text: &str) {
        let parsed: Result<Value, _> = serde_json::from_str(text);
        let Ok(message) = parsed else {
            self.send_personal(
                connection_id,
                OutboundMessage::new("error", json!({"message": "Malformed message"})),
            );
            return;
        };

        let kind = message["type"].as_str().unwrap_or_default().to_string();
        let data = &message["data"];

        match kind.as_str() {
            "subscribe_train" => {
                if let Some(train_id) = data["train_id"].as_i64() {
                    self.with_state(|state| {
                        state
                            .train_subscriptions
                            .entry(train_id)
                            .or_default()
                            .insert(connection_id.to_string());
                    });
                    info!("Connection {connection_id} subscribed to train {train_id}");
                    self.confirm(connection_id, "subscription_confirmed", json!({"train_id": train_id}));
                }
            }
            "unsubscribe_train" => {
                if let Some(train_id) = data["train_id"].as_i64() {
                    self.with_state(|state| {
                        if let Some(subscribers) = state.train_subscriptions.get_mut(&train_id) {
                            subscribers.remove(connection_id);
                            if subscribers.is_empty() {
                                state.train_subscriptions.remove(&train_id);
                            }
                        }
                    });
                    self.confirm(connection_id, "unsubscription_confirmed", json!({"train_id": train_id}));
                }
            }
            "subscribe_section" => {
                if let Some(section_id) = data["section_id"].as_i64() {
                    self.with_state(|state| {
                        state
                            .section_subscriptions
                            .entry(section_id)
                            .or_default()
                            .insert(connection_id.to_string());
                    });
                    info!("Connection {connection_id} subscribed to section {section_id}");
                    self.confirm(connection_id, "subscription_confirmed", json!({"section_id": section_id}));
                }
            }
            "subscribe_all" => {
                self.with_state(|state| {
                    state.general_subscribers.insert(connection_id.to_string());
                });
                self.confirm(connection_id, "subscription_confirmed", json!({"scope": "all"}));
            }
            "subscribe_ai" => {
                self.with_state(|state| {
                    state.ai_subscribers.insert(connection_id.to_string());
                });
                self.confirm(connection_id, "subscription_confirmed", json!({"scope": "ai_updates"}));
            }
            "unsubscribe_ai" => {
                self.with_state(|state| {
                    state.ai_subscribers.remove(connection_id);
                });
                self.confirm(connection_id, "unsubscription_confirmed", json!({"scope": "ai_updates"}));
            }
            "subscribe_ai_training" => {
                self.with_state(|state| {
                    state.ai_training_subscribers.insert(connection_id.to_string());
                });
                self.confirm(connection_id, "subscription_confirmed", json!({"scope": "ai_training"}));
            }
            "unsubscribe_ai_training" => {
                self.with_state(|state| {
                    state.ai_training_subscribers.remove(connection_id);
                });
                self.confirm(connection_id, "unsubscription_confirmed", json!({"scope": "ai_training"}));
            }
            "ping" => {
                self.send_personal(
                    connection_id,
                    OutboundMessage::new("pong", json!({"timestamp": Utc::now().to_rfc3339()})),
                );
            }
            other => {
                self.send_personal(
                    connection_id,
                    OutboundMessage::new(
                        "error",
                        json!({"message": format!("Unknown message type: {other}")}),
                    ),
                );
            }
        }
    }

    /// Position input port: fans the update out to general, per-train and
    /// per-section subscribers.
    pub async fn broadcast_position_update(&self, update: &PositionBroadcast) {
        let message = OutboundMessage::new(
            "position_update",
            serde_json::to_value(update).unwrap_or(Value::Null),
        );
        let recipients = self.with_state(|state| {
            let mut targets = state.general_subscribers.clone();
            if let Some(subscribers) = state.train_subscriptions.get(&update.train_id) {
                targets.extend(subscribers.iter().cloned());
            }
            if let Some(subscribers) = state.section_subscriptions.get(&update.position.section_id) {
                targets.extend(subscribers.iter().cloned());
            }
            state.collect_senders(&targets)
        });
        self.deliver(recipients, &message);
    }

    pub async fn broadcast_conflict_alert(&self, conflict_data: Value) {
        let message = OutboundMessage::new("conflict_alert", conflict_data);
        let recipients =
            self.with_state(|state| state.collect_senders(&state.general_subscribers.clone()));
        self.deliver(recipients, &message);
    }

    pub async fn broadcast_ai_update(&self, ai_data: Value) {
        let train_id = ai_data["train_id"].as_i64();
        let section_id = ai_data["section_id"].as_i64();
        let message = OutboundMessage::new("ai_optimization", ai_data);
        let recipients = self.with_state(|state| {
            let mut targets: HashSet<String> = state
                .ai_subscribers
                .union(&state.general_subscribers)
                .cloned()
                .collect();
            if let Some(subscribers) = train_id.and_then(|id| state.train_subscriptions.get(&id)) {
                targets.extend(subscribers.iter().cloned());
            }
            if let Some(subscribers) = section_id.and_then(|id| state.section_subscriptions.get(&id)) {
                targets.extend(subscribers.iter().cloned());
            }
            state.collect_senders(&targets)
        });
        self.deliver(recipients, &message);
    }

    pub async fn broadcast_ai_training_update(&self, training_data: Value) {
        let message = OutboundMessage::new("ai_training", training_data);
        let recipients = self.with_state(|state| {
            let targets: HashSet<String> = state
                .ai_training_subscribers
                .union(&state.general_subscribers)
                .cloned()
                .collect();
            state.collect_senders(&targets)
        });
        self.deliver(recipients, &message);
    }

    pub async fn broadcast_system_status(&self, status_data: Value) {
        let message = OutboundMessage::new("system_status", status_data);
        let recipients =
            self.with_state(|state| state.collect_senders(&state.general_subscribers.clone()));
        self.deliver(recipients, &message);
    }

    pub fn connection_stats(&self) -> HubStats {
        let state = self.state.lock().unwrap();
        HubStats {
            total_connections: state.sessions.len(),
            general_subscribers: state.general_subscribers.len(),
            train_subscriptions: state.train_subscriptions.len(),
            section_subscriptions: state.section_subscriptions.len(),
            active_train_subscriptions: state.train_subscriptions.values().map(|s| s.len()).sum(),
            active_section_subscriptions: state.section_subscriptions.values().map(|s| s.len()).sum(),
            ai_subscribers: state.ai_subscribers.len(),
            ai_training_subscribers: state.ai_training_subscribers.len(),
        }
    }

    fn with_state<T>(&self, f: impl FnOnce(&mut HubState) -> T) -> T {
        let mut state = self.state.lock().unwrap();
        f(&mut state)
    }

    fn confirm(&self, connection_id: &str, kind: &str, data: Value) {
        self.send_personal(connection_id, OutboundMessage::new(kind, data));
    }

    fn send_personal(&self, connection_id: &str, message: OutboundMessage) {
        let sender = self.with_state(|state| {
            state
                .sessions
                .get(connection_id)
                .map(|session| session.outbound.clone())
        });
        if let Some(sender) = sender {
            if sender.try_send(message.to_text()).is_err() {
                self.disconnect(connection_id);
            }
        }
    }

    /// At-most-once delivery per session; any enqueue failure drops that
    /// session and never touches the others.
    fn deliver(&self, recipients: Vec<(String, mpsc::Sender<String>)>, message: &OutboundMessage) {
        if recipients.is_empty() {
            return;
        }
        let text = message.to_text();
        for (connection_id, sender) in recipients {
            if sender.try_send(text.clone()).is_err() {
                warn!("Dropping unresponsive session {connection_id}");
                self.disconnect(&connection_id);
            }
        }
    }

    pub fn session_uptime(&self, connection_id: &str) -> Option<chrono::Duration> {
        let state = self.state.lock().unwrap();
        state
            .sessions
            .get(connection_id)
            .map(|session| Utc::now() - session.connected_at)
    }

    pub fn is_authenticated(&self, connection_id: &str) -> Option<bool> {
        let state = self.state.lock().unwrap();
        state.sessions.get(connection_id).map(|s| s.authenticated)
    }
}

impl HubState {
    fn collect_senders(&self, targets: &HashSet<String>) -> Vec<(String, mpsc::Sender<String>)> {
        targets
            .iter()
            .filter_map(|id| {
                self.sessions
                    .get(id)
                    .map(|session| (id.clone(), session.outbound.clone()))
            })
            .collect()
    }
}

/// Re-broadcasts cross-instance traffic to local clients. Runs until the
/// pub/sub stream ends; local service continues without it.
pub async fn run_bridge(hub: Arc<ConnectionHub>, pubsub: Arc<dyn PubSubPort>) {
    let mut stream = match pubsub.subscribe(&channels::ALL).await {
        Ok(stream) => stream,
        Err(e) => {
            error!("Failed to subscribe to pub/sub channels: {e}");
            return;
        }
    };
    info!("Cross-instance bridge listening on {:?}", channels::ALL);

    while let Some((channel, payload)) = stream.next().await {
        match channel.as_str() {
            channels::POSITIONS => match serde_json::from_value::<PositionBroadcast>(payload) {
                Ok(update) => hub.broadcast_position_update(&update).await,
                Err(e) => warn!("Malformed position broadcast: {e}"),
            },
            channels::CONFLICTS => hub.broadcast_conflict_alert(payload).await,
            channels::SYSTEM => hub.broadcast_system_status(payload).await,
            other => debug!("Ignoring message on unexpected channel {other}"),
        }
    }

    error!("Pub/sub listener ended; cross-instance bridge stopped");
}

/// WebSocket upgrade endpoint.
pub async fn websocket_handler(ws: WebSocketUpgrade, State(state): State<crate::AppState>) -> Response {
    ws.on_upgrade(move |socket| {
        let hub = state.hub.clone();
        let connection_id = Uuid::new_v4().to_string();
        async move {
            hub.serve(Box::new(AxumTransport::new(socket)), connection_id, None)
                .await;
        }
    })
}

pub struct AxumTransport {
    socket: WebSocket,
}

impl AxumTransport {
    pub fn new(socket: WebSocket) -> Self {
        Self { socket }
    }
}

impl SessionTransport for AxumTransport {
    fn split(self: Box<Self>) -> (Box<dyn SessionSink>, Box<dyn SessionStream>) {
        let (sink, stream) = self.socket.split();
        (Box::new(AxumSink { sink }), Box::new(AxumStream { stream }))
    }
}

struct AxumSink {
    sink: SplitSink<WebSocket, Message>,
}

#[async_trait]
impl SessionSink for AxumSink {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
        self.sink.send(Message::Text(text)).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.sink.send(Message::Close(None)).await;
    }
}

struct AxumStream {
    stream: SplitStream<WebSocket>,
}

#[async_trait]
impl SessionStream for AxumStream {
    async fn receive_text(&mut self) -> Option<String> {
        while let Some(message) = self.stream.next().await {
            match message {
                Ok(Message::Text(text)) => return Some(text),
                Ok(Message::Close(_)) | Err(_) => return None,
                Ok(_) => continue,
            }
        }
        None
    }
}
