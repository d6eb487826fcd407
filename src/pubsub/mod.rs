use anyhow::Result;
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use redis::AsyncCommands;
use serde_json::Value;
use std::collections::HashSet;
use tokio::sync::broadcast;
use tracing::{info, warn};

/// Channel names shared by every instance of the system.
pub mod channels {
    pub const POSITIONS: &str = "railway:positions";
    pub const CONFLICTS: &str = "railway:conflicts";
    pub const SYSTEM: &str = "railway:system";

    pub const ALL: [&str; 3] = [POSITIONS, CONFLICTS, SYSTEM];
}

/// Cross-instance pub/sub. Payloads are JSON objects; delivery is
/// fire-and-forget on publish and a stream of `(channel, payload)` pairs
/// on subscribe.
#[async_trait]
pub trait PubSubPort: Send + Sync {
    async fn publish(&self, channel: &str, payload: &Value) -> Result<()>;

    async fn subscribe(&self, channels: &[&str]) -> Result<BoxStream<'static, (String, Value)>>;
}

/// Redis-backed implementation. One multiplexed connection serves all
/// publishes; each subscriber gets its own pub/sub connection.
pub struct RedisPubSub {
    client: redis::Client,
    conn: redis::aio::MultiplexedConnection,
}

impl RedisPubSub {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        info!("Connected to Redis at {url}");
        Ok(Self { client, conn })
    }
}

#[async_trait]
impl PubSubPort for RedisPubSub {
    async fn publish(&self, channel: &str, payload: &Value) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: i64 = conn.publish(channel, payload.to_string()).await?;
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<BoxStream<'static, (String, Value)>> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        for channel in channels {
            pubsub.subscribe(*channel).await?;
        }

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let channel = msg.get_channel_name().to_string();
            let payload: String = match msg.get_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("Undecodable pub/sub payload on {channel}: {e}");
                    return None;
                }
            };
            match serde_json::from_str(&payload) {
                Ok(value) => Some((channel, value)),
                Err(e) => {
                    warn!("Malformed JSON on {channel}: {e}");
                    None
                }
            }
        });

        Ok(stream.boxed())
    }
}

/// Process-local implementation for tests and single-instance deployments.
#[derive(Debug, Clone)]
pub struct MemoryPubSub {
    tx: broadcast::Sender<(String, Value)>,
}

impl MemoryPubSub {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(256);
        Self { tx }
    }
}

impl Default for MemoryPubSub {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PubSubPort for MemoryPubSub {
    async fn publish(&self, channel: &str, payload: &Value) -> Result<()> {
        // No subscribers is not an error for a broadcaster.
        let _ = self.tx.send((channel.to_string(), payload.clone()));
        Ok(())
    }

    async fn subscribe(&self, channels: &[&str]) -> Result<BoxStream<'static, (String, Value)>> {
        let wanted: HashSet<String> = channels.iter().map(|c| c.to_string()).collect();
        let rx = self.tx.subscribe();

        let stream = stream::unfold(rx, |mut rx| async move {
            loop {
                match rx.recv().await {
                    Ok(item) => return Some((item, rx)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!("In-memory pub/sub lagged, skipped {skipped} messages");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        })
        .filter_map(move |(channel, payload)| {
            let keep = wanted.contains(&channel);
            async move { keep.then_some((channel, payload)) }
        });

        Ok(stream.boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn memory_pubsub_routes_by_channel() {
        let bus = MemoryPubSub::new();
        let mut stream = bus.subscribe(&[channels::CONFLICTS]).await.unwrap();

        bus.publish(channels::POSITIONS, &json!({"train_id": 1}))
            .await
            .unwrap();
        bus.publish(channels::CONFLICTS, &json!({"severity": 8}))
            .await
            .unwrap();

        let (channel, payload) = stream.next().await.unwrap();
        assert_eq!(channel, channels::CONFLICTS);
        assert_eq!(payload["severity"], 8);
    }
}
