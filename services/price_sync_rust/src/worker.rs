//! Per-process price sync worker
//!
//! `run` wires the core to Redis and Postgres and drives four tasks:
//! - event loop: `feed:clob:events` and `games:lifecycle` on one reconnecting
//!   subscription, handled in arrival order so an index rebuild never races
//!   a price batch
//! - maintenance loop: orphaned secondary-index cleanup in the shared cache
//!   and stale baseline pruning
//! - heartbeat loop: ingestion stats on `health:heartbeats`
//! - Ctrl-C: abort the loops, final flush, stop the cache health probe

use crate::config::PriceSyncConfig;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use futures_util::StreamExt;
use livegames_core::cache::HistoricalChangeCache;
use livegames_core::db::{create_pool, PgGameStore, PgGameWriter};
use livegames_core::models::{channels, parse_feed_payload, LifecycleEvent};
use livegames_core::providers::RedisFeedTransport;
use livegames_core::redis::RedisBus;
use livegames_core::sinks::RedisBroadcastSink;
use livegames_core::{
    AssetIndex, BatchReport, CachedGamesProvider, FlushOutcome, IngestStatsSnapshot,
    IngestorDeps, LocalGamesCache, PriceIngestor, SharedCache, WriteQueue,
};
use log::{debug, error, info, warn};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

#[derive(Debug, Clone, Serialize)]
pub struct Heartbeat {
    pub worker_id: String,
    pub timestamp: DateTime<Utc>,
    pub stats: IngestStatsSnapshot,
    pub cache_backend: &'static str,
    pub cache_degraded: bool,
    pub cache_breaker_trips: u64,
    pub queue_depth: usize,
    pub queue_paused: bool,
    pub local_games: usize,
    pub indexed_assets: usize,
    pub baselines_cached: usize,
}

pub struct PriceSyncWorker {
    worker_id: String,
    ingestor: PriceIngestor,
    shared: SharedCache,
    queue: WriteQueue,
    local: Arc<LocalGamesCache>,
    index: Arc<AssetIndex>,
    changes: HistoricalChangeCache,
}

impl PriceSyncWorker {
    pub fn new(worker_id: &str, deps: IngestorDeps) -> Self {
        Self {
            worker_id: worker_id.to_string(),
            shared: deps.shared.clone(),
            queue: deps.queue.clone(),
            local: deps.local.clone(),
            index: deps.index.clone(),
            changes: deps.changes.clone(),
            ingestor: PriceIngestor::new(deps),
        }
    }

    /// Honour refreshes already in flight, then build the asset index.
    /// A failed rebuild is not fatal: the first feed batch retries it.
    pub async fn start(&self, pipelines: &[String]) {
        for pipeline in pipelines {
            match self.shared.is_refresh_in_progress(pipeline).await {
                Ok(true) => {
                    info!("Refresh of {} already running, pausing writes", pipeline);
                    self.queue.pause(pipeline);
                }
                Ok(false) => {}
                Err(e) => warn!("Could not read refresh flag for {}: {:#}", pipeline, e),
            }
        }

        if let Err(e) = self.ingestor.rebuild_index().await {
            error!("Initial index rebuild failed: {:#}", e);
        }
    }

    /// Dispatch one pub/sub message by channel
    pub async fn handle_message(&self, channel: &str, payload: &[u8]) -> Result<()> {
        match channel {
            channels::FEED_EVENTS => self.handle_feed_payload(payload).await.map(|_| ()),
            channels::GAMES_LIFECYCLE => {
                let event: LifecycleEvent = serde_json::from_slice(payload)
                    .context("Malformed lifecycle notification")?;
                self.handle_lifecycle(event).await
            }
            other => {
                debug!("Ignoring message on {}", other);
                Ok(())
            }
        }
    }

    pub async fn handle_feed_payload(&self, payload: &[u8]) -> Result<Option<BatchReport>> {
        let changes = parse_feed_payload(payload).context("Malformed feed payload")?;
        if changes.is_empty() {
            return Ok(None);
        }
        let report = self.ingestor.handle_price_changes(&changes).await?;
        debug!(
            "Batch: {} received, {} resolved, {} dropped, {} games updated",
            report.received, report.resolved, report.dropped, report.games_updated
        );
        Ok(Some(report))
    }

    pub async fn handle_lifecycle(&self, event: LifecycleEvent) -> Result<()> {
        match event {
            LifecycleEvent::RefreshStarting { pipeline } => {
                self.queue.pause(&pipeline);
            }
            LifecycleEvent::RefreshEnded { pipeline } => {
                self.queue.resume(&pipeline);
            }
            LifecycleEvent::GamesRefreshed { pipeline } => {
                let report = self.ingestor.rebuild_index().await?;
                info!(
                    "Games refreshed by {}: {} games, {} assets",
                    pipeline.as_deref().unwrap_or("unknown pipeline"),
                    report.games,
                    report.assets
                );
            }
            LifecycleEvent::GameRemoved { game_id } => {
                self.ingestor.remove_game(&game_id).await?;
                info!("Game {} removed", game_id);
            }
        }
        Ok(())
    }

    pub async fn run_maintenance(&self) -> Result<usize> {
        let pruned = self.changes.prune_stale();
        if pruned > 0 {
            debug!("Pruned {} stale baseline entries", pruned);
        }
        let removed = self.shared.cleanup_orphaned_indices().await?;
        if removed > 0 {
            info!("Removed {} orphaned cache index entries", removed);
        }
        Ok(removed)
    }

    pub fn heartbeat(&self) -> Heartbeat {
        let breaker = self.shared.breaker_status();
        Heartbeat {
            worker_id: self.worker_id.clone(),
            timestamp: Utc::now(),
            stats: self.ingestor.stats(),
            cache_backend: self.shared.backend_name(),
            cache_degraded: breaker.degraded,
            cache_breaker_trips: breaker.trips,
            queue_depth: self.queue.pending_len(),
            queue_paused: self.queue.is_paused(),
            local_games: self.local.len(),
            indexed_assets: self.index.len(),
            baselines_cached: self.changes.len(),
        }
    }

    pub async fn shutdown(&self) -> FlushOutcome {
        let outcome = self.queue.shutdown().await;
        self.shared.shutdown();
        info!("Worker {} stopped ({:?})", self.worker_id, outcome);
        outcome
    }
}

/// Connect everything and run until Ctrl-C
pub async fn run(config: PriceSyncConfig) -> Result<()> {
    info!("Starting price sync worker {}", config.worker_id);

    let bus = RedisBus::connect(&config.redis_url).await?;
    let worker_token = format!("{}:{}", config.worker_id, Uuid::new_v4());
    let shared = SharedCache::connect(
        config.core.shared_cache.clone(),
        config.shared_cache_url(),
        &worker_token,
    )
    .await;

    let pool = create_pool(&config.database_url, &config.db_pool).await?;
    let store = Arc::new(PgGameStore::new(pool.clone()));
    let writer = Arc::new(PgGameWriter::new(pool, &config.core.write_queue));

    let deps = IngestorDeps {
        index: Arc::new(AssetIndex::new()),
        local: Arc::new(LocalGamesCache::new()),
        shared: shared.clone(),
        provider: Arc::new(CachedGamesProvider::new(shared, store.clone())),
        feed: Arc::new(RedisFeedTransport::new(bus.clone())),
        sink: Arc::new(RedisBroadcastSink::new(bus.clone())),
        changes: HistoricalChangeCache::new(config.core.change_cache.clone(), store),
        queue: WriteQueue::new(config.core.write_queue.clone(), writer),
    };
    let worker = Arc::new(PriceSyncWorker::new(&config.worker_id, deps));
    worker.start(&config.refresh_pipelines).await;

    let mut tasks = Vec::new();

    // 1. Feed and lifecycle events
    let mut stream = bus
        .subscribe(&[channels::FEED_EVENTS, channels::GAMES_LIFECYCLE])
        .with_config(config.reconnect.clone())
        .into_message_stream();
    let w = worker.clone();
    tasks.push(tokio::spawn(async move {
        info!("Event loop started");
        while let Some(msg) = stream.next().await {
            let channel = msg.get_channel_name().to_string();
            if let Err(e) = w.handle_message(&channel, msg.get_payload_bytes()).await {
                error!("Failed to handle message on {}: {:#}", channel, e);
            }
        }
        warn!("Event stream closed");
    }));

    // 2. Maintenance
    let w = worker.clone();
    let maintenance_interval = config.maintenance_interval;
    tasks.push(tokio::spawn(async move {
        info!("Maintenance loop started (interval: {:?})", maintenance_interval);
        loop {
            tokio::time::sleep(maintenance_interval).await;
            if let Err(e) = w.run_maintenance().await {
                warn!("Cache maintenance failed: {:#}", e);
            }
        }
    }));

    // 3. Heartbeat
    let w = worker.clone();
    let heartbeat_bus = bus.clone();
    let heartbeat_interval = config.heartbeat_interval;
    tasks.push(tokio::spawn(async move {
        loop {
            tokio::time::sleep(heartbeat_interval).await;
            publish_heartbeat(&heartbeat_bus, &w.heartbeat()).await;
        }
    }));

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Received shutdown signal"),
        Err(err) => error!("Unable to listen for shutdown signal: {}", err),
    }

    for task in &tasks {
        task.abort();
    }
    worker.shutdown().await;
    Ok(())
}

async fn publish_heartbeat(bus: &RedisBus, heartbeat: &Heartbeat) {
    info!(
        "Heartbeat: {} events, {} games updated, {} failures, queue {} (paused: {}), cache {} (degraded: {})",
        heartbeat.stats.events_received,
        heartbeat.stats.games_updated,
        heartbeat.stats.game_failures,
        heartbeat.queue_depth,
        heartbeat.queue_paused,
        heartbeat.cache_backend,
        heartbeat.cache_degraded
    );
    if let Err(e) = tokio::time::timeout(
        Duration::from_secs(5),
        bus.publish(channels::HEALTH_HEARTBEATS, heartbeat),
    )
    .await
    .map_err(anyhow::Error::from)
    .and_then(|r| r)
    {
        warn!("Failed to publish heartbeat: {:#}", e);
    }
}
