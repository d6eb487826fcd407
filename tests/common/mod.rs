#![allow(dead_code)]

use anyhow::anyhow;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use serde_json::Value;
use tokio::sync::mpsc;

use railway_core::models::*;
use railway_core::websocket::{SessionSink, SessionStream, SessionTransport};

pub fn train(id: i64, kind: TrainType, priority: u8, max_speed_kmh: u32, current_load: u32) -> Train {
    let now = Utc::now();
    Train {
        id,
        train_number: format!("T{id:04}"),
        kind,
        priority,
        max_speed_kmh,
        length_meters: 350.0,
        weight_tons: 600.0,
        capacity: 1_000,
        current_load,
        current_section_id: None,
        speed_kmh: 80.0,
        operational_status: OperationalStatus::Active,
        created_at: now,
        updated_at: now,
    }
}

pub fn section(id: i64, kind: SectionKind, capacity: u32, length_meters: f64, max_speed_kmh: u32) -> Section {
    let now = Utc::now();
    Section {
        id,
        section_code: format!("SEC-{id}"),
        name: format!("Section {id}"),
        kind,
        length_meters,
        max_speed_kmh,
        capacity,
        junction_ids: None,
        active: true,
        created_at: now,
        updated_at: now,
    }
}

pub fn position(train_id: i64, section_id: i64, speed_kmh: f64, distance_from_start: f64) -> Position {
    Position {
        train_id,
        timestamp: Utc::now(),
        section_id,
        speed_kmh,
        distance_from_start: Some(distance_from_start),
        coordinates: Some(GeoPoint {
            latitude: 52.52,
            longitude: 13.40,
        }),
        altitude: None,
        heading: Some(90.0),
    }
}

pub fn schedule(train_id: i64, route_sections: Vec<i64>) -> TrainSchedule {
    TrainSchedule {
        id: train_id * 10,
        train_id,
        route_sections,
        scheduled_times: vec![],
        active: true,
    }
}

/// Occupancy window in minutes relative to `now`.
pub fn prediction(
    train_id: i64,
    section_id: i64,
    now: DateTime<Utc>,
    arrival_min: f64,
    exit_min: f64,
) -> TrainPrediction {
    TrainPrediction {
        train_id,
        section_id,
        arrival_time: now + Duration::milliseconds((arrival_min * 60_000.0) as i64),
        exit_time: now + Duration::milliseconds((exit_min * 60_000.0) as i64),
        speed_kmh: 80.0,
        confidence: 0.9,
    }
}

/// Channel-backed transport: the test side plays the remote client.
pub struct TestTransport {
    incoming: mpsc::Receiver<String>,
    outgoing: mpsc::Sender<String>,
}

/// Returns the transport plus the client's two channel ends: a sender for
/// frames the "client" sends to the hub, and a receiver for frames the hub
/// delivers to the "client". Dropping the receiver makes sends fail, which
/// simulates a dead peer.
pub fn test_transport() -> (
    Box<TestTransport>,
    mpsc::Sender<String>,
    mpsc::Receiver<String>,
) {
    let (client_tx, incoming) = mpsc::channel(32);
    let (outgoing, client_rx) = mpsc::channel(32);
    (
        Box::new(TestTransport { incoming, outgoing }),
        client_tx,
        client_rx,
    )
}

impl SessionTransport for TestTransport {
    fn split(self: Box<Self>) -> (Box<dyn SessionSink>, Box<dyn SessionStream>) {
        (
            Box::new(TestSink { tx: self.outgoing }),
            Box::new(TestStream { rx: self.incoming }),
        )
    }
}

struct TestSink {
    tx: mpsc::Sender<String>,
}

#[async_trait]
impl SessionSink for TestSink {
    async fn send_text(&mut self, text: String) -> anyhow::Result<()> {
        self.tx.send(text).await.map_err(|_| anyhow!("peer closed"))
    }

    async fn close(&mut self) {}
}

struct TestStream {
    rx: mpsc::Receiver<String>,
}

#[async_trait]
impl SessionStream for TestStream {
    async fn receive_text(&mut self) -> Option<String> {
        self.rx.recv().await
    }
}

pub async fn recv_json(rx: &mut mpsc::Receiver<String>) -> Value {
    let text = tokio::time::timeout(std::time::Duration::from_secs(2), rx.recv())
        .await
        .expect("timed out waiting for hub message")
        .expect("hub closed the session");
    serde_json::from_str(&text).expect("hub emitted invalid JSON")
}

pub async fn expect_silence(rx: &mut mpsc::Receiver<String>) {
    let outcome = tokio::time::timeout(std::time::Duration::from_millis(200), rx.recv()).await;
    assert!(outcome.is_err(), "expected no further messages, got {outcome:?}");
}
