//! Collaborator seams: where live games come from and where feed
//! subscriptions go.

use crate::cache::SharedCache;
use crate::models::{channels, Game};
use crate::redis::RedisBus;
use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

#[async_trait]
pub trait GamesProvider: Send + Sync {
    async fn get_all_live_games(&self) -> Result<Vec<Game>>;

    async fn get_game(&self, game_id: &str) -> Result<Option<Game>>;
}

#[async_trait]
pub trait FeedTransport: Send + Sync {
    /// Ask the feed to start streaming `asset_id`
    async fn subscribe(&self, asset_id: &str) -> Result<()>;
}

/// Serves live games from the shared cache once another worker has warmed
/// it, otherwise from the database, warming the cache on the way.
pub struct CachedGamesProvider {
    shared: SharedCache,
    database: Arc<dyn GamesProvider>,
}

impl CachedGamesProvider {
    pub fn new(shared: SharedCache, database: Arc<dyn GamesProvider>) -> Self {
        Self { shared, database }
    }
}

#[async_trait]
impl GamesProvider for CachedGamesProvider {
    async fn get_all_live_games(&self) -> Result<Vec<Game>> {
        if self.shared.has_games_in_cache().await? {
            let games = self.shared.get_all_games().await?;
            if !games.is_empty() {
                return Ok(games);
            }
        }

        let games = self.database.get_all_live_games().await?;
        info!("Loaded {} live games from the database", games.len());
        if let Err(e) = self.shared.set_games(&games).await {
            warn!("Failed to warm shared cache: {:#}", e);
        }
        Ok(games)
    }

    async fn get_game(&self, game_id: &str) -> Result<Option<Game>> {
        if let Some(game) = self.shared.get_game(game_id).await? {
            return Ok(Some(game));
        }
        let game = self.database.get_game(game_id).await?;
        if let Some(game) = &game {
            if let Err(e) = self.shared.set_game(game).await {
                warn!("Failed to cache game {}: {:#}", game_id, e);
            }
        }
        Ok(game)
    }
}

#[derive(Debug, Serialize)]
struct SubscribeCommand<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    assets_ids: [&'a str; 1],
}

/// Sends subscribe commands to the feed connector over pub/sub
pub struct RedisFeedTransport {
    bus: RedisBus,
    channel: String,
}

impl RedisFeedTransport {
    pub fn new(bus: RedisBus) -> Self {
        Self {
            bus,
            channel: channels::FEED_COMMANDS.to_string(),
        }
    }
}

#[async_trait]
impl FeedTransport for RedisFeedTransport {
    async fn subscribe(&self, asset_id: &str) -> Result<()> {
        let command = SubscribeCommand {
            kind: "subscribe",
            assets_ids: [asset_id],
        };
        self.bus.publish(&self.channel, &command).await
    }
}
