//! Asset-to-market index
//!
//! Maps feed asset ids to the game, market and outcome they price. The index
//! is rebuilt wholesale when the bulk refresher announces new games; there is
//! no incremental diffing, and a game that appears between rebuilds is not
//! subscribed until the next one.

use crate::cache::LocalGamesCache;
use crate::models::{AssetLocation, Game};
use crate::providers::{FeedTransport, GamesProvider};
use anyhow::{Context, Result};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RebuildReport {
    pub games: usize,
    pub assets: usize,
    pub subscribe_failures: usize,
}

#[derive(Default)]
pub struct AssetIndex {
    locations: RwLock<FxHashMap<String, AssetLocation>>,
}

impl AssetIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn resolve(&self, asset_id: &str) -> Option<AssetLocation> {
        self.locations.read().get(asset_id).cloned()
    }

    /// Reload every live game into `local` and this index, then subscribe the
    /// feed to each asset. Safe to call repeatedly.
    pub async fn rebuild(
        &self,
        provider: &dyn GamesProvider,
        local: &LocalGamesCache,
        feed: &dyn FeedTransport,
    ) -> Result<RebuildReport> {
        let games = provider
            .get_all_live_games()
            .await
            .context("Failed to load live games for index rebuild")?;

        let locations = Self::locations_of(&games);
        let asset_ids: Vec<String> = locations.keys().cloned().collect();
        let game_count = games.len();

        local.replace_all(games);
        *self.locations.write() = locations;

        let mut subscribe_failures = 0;
        for asset_id in &asset_ids {
            if let Err(e) = feed.subscribe(asset_id).await {
                subscribe_failures += 1;
                warn!("Feed subscribe failed for {}: {:#}", asset_id, e);
            }
        }

        info!(
            "Asset index rebuilt: {} games, {} assets, {} subscribe failures",
            game_count,
            asset_ids.len(),
            subscribe_failures
        );

        Ok(RebuildReport {
            games: game_count,
            assets: asset_ids.len(),
            subscribe_failures,
        })
    }

    /// Forget every asset of `game_id`. Returns how many were removed.
    pub fn evict_game(&self, game_id: &str) -> usize {
        let mut locations = self.locations.write();
        let before = locations.len();
        locations.retain(|_, location| location.game_id != game_id);
        before - locations.len()
    }

    pub fn len(&self) -> usize {
        self.locations.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locations.read().is_empty()
    }

    fn locations_of(games: &[Game]) -> FxHashMap<String, AssetLocation> {
        games.iter().flat_map(Game::asset_locations).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::game::fixtures::{game, market, moneyline_game, outcome};
    use async_trait::async_trait;
    use parking_lot::Mutex;

    struct StaticGames(Vec<Game>);

    #[async_trait]
    impl GamesProvider for StaticGames {
        async fn get_all_live_games(&self) -> Result<Vec<Game>> {
            Ok(self.0.clone())
        }

        async fn get_game(&self, game_id: &str) -> Result<Option<Game>> {
            Ok(self.0.iter().find(|g| g.id == game_id).cloned())
        }
    }

    #[derive(Default)]
    struct RecordingFeed {
        subscribed: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FeedTransport for RecordingFeed {
        async fn subscribe(&self, asset_id: &str) -> Result<()> {
            if asset_id == "tok-bad" {
                anyhow::bail!("socket closed");
            }
            self.subscribed.lock().push(asset_id.to_string());
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_rebuild_indexes_caches_and_subscribes() {
        let provider = StaticGames(vec![
            moneyline_game(),
            game(
                "game-2",
                "nfl-kc-buf",
                vec![market("mkt-2", vec![outcome("KC", "tok-c"), outcome("BUF", "tok-bad")])],
            ),
        ]);
        let local = LocalGamesCache::new();
        local.insert(game("stale", "old", vec![]));
        let feed = RecordingFeed::default();
        let index = AssetIndex::new();

        let report = index.rebuild(&provider, &local, &feed).await.unwrap();
        assert_eq!(
            report,
            RebuildReport {
                games: 2,
                assets: 4,
                subscribe_failures: 1
            }
        );

        assert_eq!(local.len(), 2);
        assert!(local.get("stale").is_none());
        let location = index.resolve("tok-b").unwrap();
        assert_eq!(location.game_id, "game-1");
        assert_eq!(location.market_id, "mkt-1");
        assert_eq!(location.outcome_index, 1);

        let mut subscribed = feed.subscribed.lock().clone();
        subscribed.sort();
        assert_eq!(subscribed, vec!["tok-a", "tok-b", "tok-c"]);

        // Idempotent
        index.rebuild(&provider, &local, &feed).await.unwrap();
        assert_eq!(index.len(), 4);
    }

    #[tokio::test]
    async fn test_evict_game_drops_its_assets() {
        let provider = StaticGames(vec![moneyline_game()]);
        let index = AssetIndex::new();
        index
            .rebuild(&provider, &LocalGamesCache::new(), &RecordingFeed::default())
            .await
            .unwrap();

        assert_eq!(index.evict_game("game-1"), 2);
        assert!(index.resolve("tok-a").is_none());
        assert!(index.is_empty());
    }
}
