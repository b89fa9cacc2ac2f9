// Shared models for the live game price pipeline
pub mod feed;
pub mod game;
pub mod views;

pub use feed::{parse_feed_payload, FeedEvent, LifecycleEvent, PriceChange};
pub use game::{AssetLocation, Game, Market, Outcome, SharedMarket, TokenPriceEntry};
pub use views::{ActivityOutcome, ActivityView, GameView, MarketView, OutcomeView, PositionPriceUpdate};

// ============================================================================
// Redis Channels
// ============================================================================

pub mod channels {
    /// Order-book feed events (price_change batches)
    pub const FEED_EVENTS: &str = "feed:clob:events";
    /// Subscribe commands sent to the feed transport
    pub const FEED_COMMANDS: &str = "feed:clob:commands";
    /// Bulk refresh lifecycle notifications
    pub const GAMES_LIFECYCLE: &str = "games:lifecycle";
    pub const GAMES_UPDATES: &str = "games:updates";
    pub const ACTIVITY_GAMES: &str = "activity:games";
    pub const POSITIONS_PRICES: &str = "positions:prices";
    pub const HEALTH_HEARTBEATS: &str = "health:heartbeats";
}

/// Reason tag attached to game broadcasts originating from the price feed
pub const REASON_PRICE_UPDATE: &str = "price_update";
