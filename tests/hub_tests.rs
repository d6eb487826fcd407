mod common;

use chrono::Utc;
use serde_json::json;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use common::*;
use railway_core::metrics::AppMetrics;
use railway_core::models::TrainType;
use railway_core::pubsub::{channels, MemoryPubSub, PubSubPort};
use railway_core::websocket::{run_bridge, ConnectionHub, PositionBroadcast, PositionPayload};

struct Client {
    tx: mpsc::Sender<String>,
    rx: mpsc::Receiver<String>,
    serve: JoinHandle<()>,
}

fn hub() -> Arc<ConnectionHub> {
    Arc::new(ConnectionHub::new(Arc::new(AppMetrics::new().unwrap())))
}

async fn connect(hub: &Arc<ConnectionHub>, connection_id: &str) -> Client {
    let (transport, tx, mut rx) = test_transport();
    let serve = tokio::spawn(hub.clone().serve(transport, connection_id.to_string(), None));
    let welcome = recv_json(&mut rx).await;
    assert_eq!(welcome["type"], "connection_established");
    assert_eq!(welcome["data"]["connection_id"], connection_id);
    assert_eq!(welcome["data"]["authenticated"], false);
    Client { tx, rx, serve }
}

impl Client {
    async fn send(&self, kind: &str, data: serde_json::Value) {
        self.tx
            .send(json!({"type": kind, "data": data}).to_string())
            .await
            .unwrap();
    }

    async fn expect(&mut self, kind: &str) -> serde_json::Value {
        let message = recv_json(&mut self.rx).await;
        assert_eq!(message["type"], kind, "unexpected message: {message}");
        message
    }
}

fn position_broadcast(train_id: i64, section_id: i64) -> PositionBroadcast {
    PositionBroadcast {
        train_id,
        train_number: format!("T{train_id:04}"),
        train_type: TrainType::Express,
        position: PositionPayload {
            section_id,
            coordinates: None,
            altitude: None,
            speed_kmh: 110.0,
            heading: Some(180.0),
            timestamp: Utc::now(),
        },
    }
}

#[tokio::test]
async fn subscribe_train_routes_position_updates_once() {
    let hub = hub();
    let mut client = connect(&hub, "conn-1").await;

    client.send("subscribe_train", json!({"train_id": 42})).await;
    let confirm = client.expect("subscription_confirmed").await;
    assert_eq!(confirm["data"]["train_id"], 42);

    hub.broadcast_position_update(&position_broadcast(42, 7)).await;
    let update = client.expect("position_update").await;
    assert_eq!(update["data"]["train_id"], 42);
    assert_eq!(update["data"]["position"]["section_id"], 7);

    // A different train's update does not reach this session.
    hub.broadcast_position_update(&position_broadcast(43, 7)).await;
    expect_silence(&mut client.rx).await;

    drop(client.tx);
    let _ = client.serve.await;
}

#[tokio::test]
async fn all_subscriber_gets_each_message_exactly_once() {
    let hub = hub();
    let mut client = connect(&hub, "conn-1").await;

    // Subscribed both to everything and to the specific train: still one copy.
    client.send("subscribe_all", json!({})).await;
    client.expect("subscription_confirmed").await;
    client.send("subscribe_train", json!({"train_id": 42})).await;
    client.expect("subscription_confirmed").await;

    hub.broadcast_position_update(&position_broadcast(42, 7)).await;
    client.expect("position_update").await;
    expect_silence(&mut client.rx).await;

    drop(client.tx);
    let _ = client.serve.await;
}

#[tokio::test]
async fn disconnect_clears_every_subscription_index() {
    let hub = hub();
    let mut client = connect(&hub, "conn-1").await;

    client.send("subscribe_train", json!({"train_id": 1})).await;
    client.expect("subscription_confirmed").await;
    client.send("subscribe_section", json!({"section_id": 2})).await;
    client.expect("subscription_confirmed").await;
    client.send("subscribe_all", json!({})).await;
    client.expect("subscription_confirmed").await;
    client.send("subscribe_ai", json!({})).await;
    client.expect("subscription_confirmed").await;
    client.send("subscribe_ai_training", json!({})).await;
    client.expect("subscription_confirmed").await;

    let stats = hub.connection_stats();
    assert_eq!(stats.total_connections, 1);
    assert_eq!(stats.active_train_subscriptions, 1);
    assert_eq!(stats.active_section_subscriptions, 1);
    assert_eq!(stats.ai_subscribers, 1);
    assert_eq!(stats.ai_training_subscribers, 1);

    // Peer hangs up.
    drop(client.tx);
    let _ = client.serve.await;

    let stats = hub.connection_stats();
    assert_eq!(stats.total_connections, 0);
    assert_eq!(stats.general_subscribers, 0);
    assert_eq!(stats.train_subscriptions, 0);
    assert_eq!(stats.section_subscriptions, 0);
    assert_eq!(stats.ai_subscribers, 0);
    assert_eq!(stats.ai_training_subscribers, 0);

    // Disconnecting an already-gone session is a no-op.
    hub.disconnect("conn-1");
    assert_eq!(hub.connection_stats().total_connections, 0);
}

#[tokio::test]
async fn per_session_ordering_is_preserved() {
    let hub = hub();
    let mut client = connect(&hub, "conn-1").await;
    client.send("subscribe_all", json!({})).await;
    client.expect("subscription_confirmed").await;

    for sequence in 0..10 {
        hub.broadcast_system_status(json!({"sequence": sequence})).await;
        // Let the session writer drain between bursts.
        tokio::task::yield_now().await;
    }
    for sequence in 0..10 {
        let status = client.expect("system_status").await;
        assert_eq!(status["data"]["sequence"], sequence);
    }

    drop(client.tx);
    let _ = client.serve.await;
}

#[tokio::test]
async fn failing_session_does_not_block_the_others() {
    let hub = hub();
    let mut healthy = connect(&hub, "healthy").await;
    let mut doomed = connect(&hub, "doomed").await;

    healthy.send("subscribe_all", json!({})).await;
    healthy.expect("subscription_confirmed").await;
    doomed.send("subscribe_all", json!({})).await;
    doomed.expect("subscription_confirmed").await;

    // Kill the doomed client's receive side: its next send fails.
    drop(doomed.rx);

    hub.broadcast_conflict_alert(json!({"severity": 9})).await;
    let alert = healthy.expect("conflict_alert").await;
    assert_eq!(alert["data"]["severity"], 9);

    let _ = doomed.serve.await;
    assert_eq!(hub.connection_stats().total_connections, 1);

    drop(healthy.tx);
    let _ = healthy.serve.await;
}

#[tokio::test]
async fn ping_pong_and_error_replies() {
    let hub = hub();
    let mut client = connect(&hub, "conn-1").await;

    client.send("ping", json!({})).await;
    let pong = client.expect("pong").await;
    assert!(pong["data"]["timestamp"].is_string());

    client.send("teleport_train", json!({})).await;
    let unknown = client.expect("error").await;
    assert!(unknown["data"]["message"]
        .as_str()
        .unwrap()
        .contains("teleport_train"));

    // Malformed JSON earns an error but keeps the session alive.
    client.tx.send("{not json".to_string()).await.unwrap();
    client.expect("error").await;

    client.send("ping", json!({})).await;
    client.expect("pong").await;

    drop(client.tx);
    let _ = client.serve.await;
}

#[tokio::test]
async fn unsubscribe_stops_deliveries() {
    let hub = hub();
    let mut client = connect(&hub, "conn-1").await;

    client.send("subscribe_train", json!({"train_id": 42})).await;
    client.expect("subscription_confirmed").await;
    client.send("unsubscribe_train", json!({"train_id": 42})).await;
    client.expect("unsubscription_confirmed").await;

    hub.broadcast_position_update(&position_broadcast(42, 7)).await;
    expect_silence(&mut client.rx).await;

    drop(client.tx);
    let _ = client.serve.await;
}

#[tokio::test]
async fn ai_updates_reach_ai_and_general_subscribers() {
    let hub = hub();
    let mut ai_client = connect(&hub, "ai").await;
    let mut general_client = connect(&hub, "general").await;
    let mut bystander = connect(&hub, "bystander").await;

    ai_client.send("subscribe_ai", json!({})).await;
    ai_client.expect("subscription_confirmed").await;
    general_client.send("subscribe_all", json!({})).await;
    general_client.expect("subscription_confirmed").await;

    hub.broadcast_ai_update(json!({"train_id": 5, "solution": "delay"})).await;
    assert_eq!(ai_client.expect("ai_optimization").await["data"]["train_id"], 5);
    general_client.expect("ai_optimization").await;
    expect_silence(&mut bystander.rx).await;

    for client in [ai_client, general_client, bystander] {
        drop(client.tx);
        let _ = client.serve.await;
    }
}

#[tokio::test]
async fn bridge_rebroadcasts_cross_instance_traffic() {
    let hub = hub();
    let bus = Arc::new(MemoryPubSub::new());
    let bridge = tokio::spawn(run_bridge(hub.clone(), bus.clone()));
    // Let the bridge subscribe before publishing.
    tokio::task::yield_now().await;

    let mut client = connect(&hub, "conn-1").await;
    client.send("subscribe_all", json!({})).await;
    client.expect("subscription_confirmed").await;

    bus.publish(
        channels::POSITIONS,
        &serde_json::to_value(position_broadcast(42, 7)).unwrap(),
    )
    .await
    .unwrap();
    let update = client.expect("position_update").await;
    assert_eq!(update["data"]["train_id"], 42);

    bus.publish(channels::CONFLICTS, &json!({"severity": 8}))
        .await
        .unwrap();
    assert_eq!(client.expect("conflict_alert").await["data"]["severity"], 8);

    bus.publish(channels::SYSTEM, &json!({"status": "ok"}))
        .await
        .unwrap();
    client.expect("system_status").await;

    bridge.abort();
    drop(client.tx);
    let _ = client.serve.await;
}
