//! Price-change ingestion
//!
//! `PriceIngestor::handle_price_changes` takes one feed batch through:
//! 1. resolve each tuple to its game/market/outcome via the asset index
//! 2. derive probability and executable prices, fan out per-asset updates
//! 3. per game, in first-seen order: mutate the local cache synchronously,
//!    write the shared cache, build projections, broadcast, queue a write
//!
//! Only a failed refresh propagates. Per-game failures are logged and the
//! batch continues.

pub mod mutation;
pub mod pricing;

use crate::cache::{HistoricalChangeCache, LocalGamesCache, SharedCache};
use crate::index::{AssetIndex, RebuildReport};
use crate::models::{
    ActivityView, GameView, PositionPriceUpdate, PriceChange, TokenPriceEntry, REASON_PRICE_UPDATE,
};
use crate::persistence::WriteQueue;
use crate::providers::{FeedTransport, GamesProvider};
use crate::sinks::BroadcastSink;
use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

pub use mutation::{apply_updates, ResolvedUpdate};
pub use pricing::{format_price, DerivedPrices};

/// Outcome of one feed batch
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub received: usize,
    pub resolved: usize,
    /// Unknown assets, or assets whose game could not be loaded
    pub dropped: usize,
    pub games_updated: usize,
    pub games_unchanged: usize,
    /// Games whose cache write or broadcasts failed
    pub games_failed: usize,
    pub index_refreshed: bool,
}

#[derive(Debug, Default)]
pub struct IngestStats {
    pub events_received: AtomicU64,
    pub updates_resolved: AtomicU64,
    pub updates_dropped: AtomicU64,
    pub games_updated: AtomicU64,
    pub game_failures: AtomicU64,
    pub index_rebuilds: AtomicU64,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestStatsSnapshot {
    pub events_received: u64,
    pub updates_resolved: u64,
    pub updates_dropped: u64,
    pub games_updated: u64,
    pub game_failures: u64,
    pub index_rebuilds: u64,
}

impl IngestStats {
    fn record(&self, report: &BatchReport) {
        self.events_received
            .fetch_add(report.received as u64, Ordering::Relaxed);
        self.updates_resolved
            .fetch_add(report.resolved as u64, Ordering::Relaxed);
        self.updates_dropped
            .fetch_add(report.dropped as u64, Ordering::Relaxed);
        self.games_updated
            .fetch_add(report.games_updated as u64, Ordering::Relaxed);
        self.game_failures
            .fetch_add(report.games_failed as u64, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> IngestStatsSnapshot {
        IngestStatsSnapshot {
            events_received: self.events_received.load(Ordering::Relaxed),
            updates_resolved: self.updates_resolved.load(Ordering::Relaxed),
            updates_dropped: self.updates_dropped.load(Ordering::Relaxed),
            games_updated: self.games_updated.load(Ordering::Relaxed),
            game_failures: self.game_failures.load(Ordering::Relaxed),
            index_rebuilds: self.index_rebuilds.load(Ordering::Relaxed),
        }
    }
}

/// Everything the ingestor talks to
pub struct IngestorDeps {
    pub index: Arc<AssetIndex>,
    pub local: Arc<LocalGamesCache>,
    pub shared: SharedCache,
    pub provider: Arc<dyn GamesProvider>,
    pub feed: Arc<dyn FeedTransport>,
    pub sink: Arc<dyn BroadcastSink>,
    pub changes: HistoricalChangeCache,
    pub queue: WriteQueue,
}

pub struct PriceIngestor {
    deps: IngestorDeps,
    stats: IngestStats,
}

impl PriceIngestor {
    pub fn new(deps: IngestorDeps) -> Self {
        Self {
            deps,
            stats: IngestStats::default(),
        }
    }

    pub async fn handle_price_changes(&self, changes: &[PriceChange]) -> Result<BatchReport> {
        let mut report = BatchReport {
            received: changes.len(),
            ..BatchReport::default()
        };

        let resolved = self.resolve(changes, &mut report).await?;
        report.resolved = resolved.len();

        self.fan_out_positions(&resolved).await;

        for (game_id, updates) in group_by_game(resolved) {
            if !self.ensure_loaded(&game_id).await? {
                let evicted = self.deps.index.evict_game(&game_id);
                debug!(
                    "Game {} not found anywhere, evicted its {} assets",
                    game_id, evicted
                );
                report.dropped += updates.len();
                continue;
            }
            self.apply_game(&game_id, &updates, &mut report).await;
        }

        self.stats.record(&report);
        Ok(report)
    }

    /// Reload live games, the local cache and the asset index
    pub async fn rebuild_index(&self) -> Result<RebuildReport> {
        let report = self
            .deps
            .index
            .rebuild(
                self.deps.provider.as_ref(),
                &self.deps.local,
                self.deps.feed.as_ref(),
            )
            .await?;
        self.stats.index_rebuilds.fetch_add(1, Ordering::Relaxed);
        let local = &self.deps.local;
        let dropped = self
            .deps
            .changes
            .retain_games(|game_id| local.get(game_id).is_some());
        if dropped > 0 {
            debug!("Dropped baselines for {} games no longer live", dropped);
        }
        Ok(report)
    }

    /// Forget a game everywhere this worker tracks it
    pub async fn remove_game(&self, game_id: &str) -> Result<()> {
        self.deps.local.remove(game_id);
        let assets = self.deps.index.evict_game(game_id);
        let had_pending = self.deps.queue.remove(game_id);
        self.deps.changes.remove(game_id);
        self.deps
            .shared
            .remove_game(game_id)
            .await
            .with_context(|| format!("Failed to remove game {} from shared cache", game_id))?;
        debug!(
            "Removed game {} ({} assets, pending write dropped: {})",
            game_id, assets, had_pending
        );
        Ok(())
    }

    pub fn stats(&self) -> IngestStatsSnapshot {
        self.stats.snapshot()
    }

    async fn resolve(
        &self,
        changes: &[PriceChange],
        report: &mut BatchReport,
    ) -> Result<Vec<ResolvedUpdate>> {
        let mut resolved = Vec::with_capacity(changes.len());
        for change in changes {
            let mut location = self.deps.index.resolve(&change.asset_id);
            if location.is_none() && !report.index_refreshed && self.deps.local.is_empty() {
                // Nothing loaded yet: this worker missed the refresh notification
                report.index_refreshed = true;
                self.rebuild_index()
                    .await
                    .context("Index refresh for unknown asset failed")?;
                location = self.deps.index.resolve(&change.asset_id);
            }

            let Some(location) = location else {
                debug!("Dropping price change for unknown asset {}", change.asset_id);
                report.dropped += 1;
                continue;
            };

            resolved.push(ResolvedUpdate {
                asset_id: change.asset_id.clone(),
                location,
                best_bid: change.best_bid,
                best_ask: change.best_ask,
                prices: DerivedPrices::from_quote(change.best_bid, change.best_ask),
            });
        }
        Ok(resolved)
    }

    async fn fan_out_positions(&self, resolved: &[ResolvedUpdate]) {
        let mut token_prices = Vec::with_capacity(resolved.len());
        for update in resolved {
            let position = PositionPriceUpdate {
                asset_id: update.asset_id.clone(),
                price: update.prices.unit_price(),
                buy_price: update.prices.buy_price,
                sell_price: update.prices.sell_price,
            };
            if let Err(e) = self.deps.sink.publish_position(&position).await {
                warn!("Position broadcast failed for {}: {:#}", update.asset_id, e);
            }

            let is_ended = self
                .deps
                .local
                .get(&update.location.game_id)
                .map(|game| game.ended)
                .unwrap_or(false);
            token_prices.push((
                update.asset_id.clone(),
                TokenPriceEntry {
                    buy_price: update.prices.buy_price,
                    sell_price: update.prices.sell_price,
                    is_ended,
                },
            ));
        }

        if let Err(e) = self.deps.shared.set_token_prices(&token_prices).await {
            warn!("Failed to cache {} token prices: {:#}", token_prices.len(), e);
        }
    }

    /// Make sure the game is in the local cache, loading it from the shared
    /// cache or the provider. Load errors propagate.
    async fn ensure_loaded(&self, game_id: &str) -> Result<bool> {
        if self.deps.local.get(game_id).is_some() {
            return Ok(true);
        }

        let game = match self
            .deps
            .shared
            .get_game(game_id)
            .await
            .with_context(|| format!("Failed to read game {} from shared cache", game_id))?
        {
            Some(game) => Some(game),
            None => self
                .deps
                .provider
                .get_game(game_id)
                .await
                .with_context(|| format!("Failed to load game {}", game_id))?,
        };

        match game {
            Some(game) => {
                self.deps.local.insert(game);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn apply_game(&self, game_id: &str, updates: &[ResolvedUpdate], report: &mut BatchReport) {
        // No await between reading and storing the snapshot
        let Some(updated) = self
            .deps
            .local
            .update(game_id, |game| apply_updates(game, updates, Utc::now()))
        else {
            report.games_unchanged += 1;
            return;
        };
        report.games_updated += 1;

        let baselines = self.deps.changes.baselines(game_id);
        let view = GameView::build(&updated, &baselines);
        let activity = ActivityView::build(&updated, &baselines);

        let results = [
            self.deps
                .shared
                .set_game(&updated)
                .await
                .context("shared cache write"),
            self.deps
                .sink
                .publish_game(&view, REASON_PRICE_UPDATE)
                .await
                .context("game broadcast"),
            self.deps
                .sink
                .publish_activity(&activity)
                .await
                .context("activity broadcast"),
        ];

        let mut failed = false;
        for error in results.into_iter().filter_map(Result::err) {
            warn!("Game {} update partially failed: {:#}", game_id, error);
            failed = true;
        }
        if failed {
            report.games_failed += 1;
        }

        self.deps
            .queue
            .queue_write(game_id, updated.markets.clone(), Some(view));
    }
}

/// Group updates by game, keeping the order games first appear in
fn group_by_game(updates: Vec<ResolvedUpdate>) -> Vec<(String, Vec<ResolvedUpdate>)> {
    let mut positions: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<(String, Vec<ResolvedUpdate>)> = Vec::new();
    for update in updates {
        let game_id = update.location.game_id.clone();
        match positions.get(&game_id) {
            Some(&i) => groups[i].1.push(update),
            None => {
                positions.insert(game_id.clone(), groups.len());
                groups.push((game_id, vec![update]));
            }
        }
    }
    groups
}
