use anyhow::{Context, Result};
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use serde::Serialize;

use super::pubsub_reconnect::ReconnectingPubSub;

/// Publish side of the Redis pub/sub bus.
///
/// Publishing goes through a `ConnectionManager`, which multiplexes and
/// reconnects on its own, so the bus is cheap to clone into every task.
#[derive(Clone)]
pub struct RedisBus {
    client: Client,
    connection: ConnectionManager,
}

impl RedisBus {
    pub async fn connect(redis_url: &str) -> Result<Self> {
        let client = Client::open(redis_url)
            .with_context(|| format!("Invalid Redis URL: {}", redis_url))?;
        let connection = ConnectionManager::new(client.clone())
            .await
            .context("Failed to open Redis connection")?;

        Ok(Self { client, connection })
    }

    pub async fn publish<T: Serialize>(&self, channel: &str, message: &T) -> Result<()> {
        let payload = serde_json::to_string(message)?;
        self.publish_str(channel, &payload).await
    }

    pub async fn publish_str(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.connection.clone();
        conn.publish::<_, _, ()>(channel, message)
            .await
            .with_context(|| format!("Failed to publish to {}", channel))?;
        Ok(())
    }

    /// Reconnecting subscription to `channels`
    pub fn subscribe(&self, channels: &[&str]) -> ReconnectingPubSub {
        ReconnectingPubSub::subscribe(
            self.client.clone(),
            channels.iter().map(|c| c.to_string()).collect(),
        )
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }
}
