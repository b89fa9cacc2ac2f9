//! Redis pub/sub subscription that survives connection loss
//!
//! A background task owns the `PubSub` connection, resubscribes after every
//! drop, and forwards messages into an unbounded channel exposed as a
//! `Stream`. Reconnect delays come from [`Backoff`].

use crate::config::{parse_env, parse_millis};
use crate::persistence::backoff::Backoff;
use anyhow::{Context, Result};
use futures_util::stream::{Stream, StreamExt};
use redis::{aio::PubSub, Client, Msg};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{error, info, warn};

#[derive(Clone, Debug)]
pub struct ReconnectConfig {
    /// Consecutive failures before reconnects pause for `cool_off`
    pub max_consecutive_failures: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub cool_off: Duration,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            max_consecutive_failures: 10,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            cool_off: Duration::from_secs(60),
        }
    }
}

impl ReconnectConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_consecutive_failures: parse_env(
                "REDIS_RECONNECT_MAX_FAILURES",
                defaults.max_consecutive_failures,
            )?,
            base_delay: parse_millis("REDIS_RECONNECT_BASE_DELAY_MS", defaults.base_delay)?,
            max_delay: parse_millis("REDIS_RECONNECT_MAX_DELAY_MS", defaults.max_delay)?,
            cool_off: defaults.cool_off,
        })
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(self.base_delay, self.max_delay)
    }
}

/// Counters for heartbeats
#[derive(Debug, Default)]
pub struct ReconnectStats {
    pub reconnect_attempts: AtomicU64,
    pub successful_reconnects: AtomicU64,
    pub failed_reconnects: AtomicU64,
    pub consecutive_failures: AtomicU32,
}

impl ReconnectStats {
    pub fn record_attempt(&self) {
        self.reconnect_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_success(&self) {
        self.successful_reconnects.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.store(0, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.failed_reconnects.fetch_add(1, Ordering::Relaxed);
        self.consecutive_failures.fetch_add(1, Ordering::Relaxed);
    }

    pub fn get_consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

#[derive(Clone)]
pub struct ReconnectingPubSub {
    client: Client,
    channels: Vec<String>,
    config: ReconnectConfig,
    stats: Arc<ReconnectStats>,
}

impl ReconnectingPubSub {
    pub fn subscribe(client: Client, channels: Vec<String>) -> Self {
        Self {
            client,
            channels,
            config: ReconnectConfig::default(),
            stats: Arc::new(ReconnectStats::default()),
        }
    }

    pub fn with_config(mut self, config: ReconnectConfig) -> Self {
        self.config = config;
        self
    }

    /// Spawn the connection task and return its message stream
    pub fn into_message_stream(self) -> ReconnectingMessageStream {
        ReconnectingMessageStream::new(self)
    }

    pub fn stats(&self) -> &Arc<ReconnectStats> {
        &self.stats
    }

    async fn connect_and_subscribe(&self) -> Result<PubSub> {
        let conn = self
            .client
            .get_async_connection()
            .await
            .context("Failed to get async Redis connection")?;

        let mut pubsub = conn.into_pubsub();
        for channel in &self.channels {
            pubsub
                .subscribe(channel)
                .await
                .with_context(|| format!("Failed to subscribe to channel: {}", channel))?;
        }
        info!("Subscribed to channels: {:?}", self.channels);
        Ok(pubsub)
    }
}

pub struct ReconnectingMessageStream {
    receiver: mpsc::UnboundedReceiver<Msg>,
}

impl ReconnectingMessageStream {
    fn new(pubsub: ReconnectingPubSub) -> Self {
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(reconnecting_task(pubsub, sender));
        Self { receiver }
    }
}

async fn reconnecting_task(pubsub: ReconnectingPubSub, sender: mpsc::UnboundedSender<Msg>) {
    let stats = pubsub.stats.clone();
    let config = pubsub.config.clone();
    let mut backoff = config.backoff();

    loop {
        if stats.get_consecutive_failures() >= config.max_consecutive_failures {
            error!(
                "Pub/sub reconnects failing {} times in a row, cooling off for {:?}",
                stats.get_consecutive_failures(),
                config.cool_off
            );
            tokio::time::sleep(config.cool_off).await;
            stats.consecutive_failures.store(0, Ordering::Relaxed);
            backoff.reset();
            continue;
        }

        stats.record_attempt();
        match pubsub.connect_and_subscribe().await {
            Ok(mut conn) => {
                stats.record_success();
                backoff.reset();

                let mut messages = conn.on_message();
                while let Some(msg) = messages.next().await {
                    if sender.send(msg).is_err() {
                        info!("Subscriber dropped, stopping pub/sub task");
                        return;
                    }
                }

                warn!("Redis pub/sub stream ended, reconnecting");
                stats.record_failure();
            }
            Err(e) => {
                stats.record_failure();
                let delay = backoff.next_delay();
                error!(
                    "Pub/sub connect failed (attempt {}): {:#}. Retrying in {:?}",
                    backoff.attempt(),
                    e,
                    delay
                );
                tokio::time::sleep(delay).await;
            }
        }

        if sender.is_closed() {
            return;
        }
    }
}

impl Stream for ReconnectingMessageStream {
    type Item = Msg;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.receiver).poll_recv(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_reconnect_delays_follow_backoff() {
        let config = ReconnectConfig {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(4),
            ..ReconnectConfig::default()
        };
        let mut backoff = config.backoff();
        assert_eq!(backoff.next_delay(), Duration::from_secs(1));
        assert_eq!(backoff.next_delay(), Duration::from_secs(2));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
        assert_eq!(backoff.next_delay(), Duration::from_secs(4));
    }

    #[test]
    fn test_stats() {
        let stats = ReconnectStats::default();

        stats.record_attempt();
        assert_eq!(stats.reconnect_attempts.load(Ordering::Relaxed), 1);

        stats.record_failure();
        stats.record_failure();
        assert_eq!(stats.failed_reconnects.load(Ordering::Relaxed), 2);
        assert_eq!(stats.get_consecutive_failures(), 2);

        stats.record_success();
        assert_eq!(stats.successful_reconnects.load(Ordering::Relaxed), 1);
        assert_eq!(stats.get_consecutive_failures(), 0);
    }
}
