//! Broadcast sinks for game, activity and position updates

use crate::models::{channels, ActivityView, GameView, PositionPriceUpdate};
use crate::redis::RedisBus;
use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[async_trait]
pub trait BroadcastSink: Send + Sync {
    async fn publish_game(&self, view: &GameView, reason: &str) -> Result<()>;

    async fn publish_activity(&self, view: &ActivityView) -> Result<()>;

    async fn publish_position(&self, update: &PositionPriceUpdate) -> Result<()>;
}

/// Envelope on the games channel
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GameBroadcast<V> {
    pub reason: String,
    pub view: V,
}

pub struct RedisBroadcastSink {
    bus: RedisBus,
}

impl RedisBroadcastSink {
    pub fn new(bus: RedisBus) -> Self {
        Self { bus }
    }
}

#[async_trait]
impl BroadcastSink for RedisBroadcastSink {
    async fn publish_game(&self, view: &GameView, reason: &str) -> Result<()> {
        let message = GameBroadcast {
            reason: reason.to_string(),
            view,
        };
        self.bus.publish(channels::GAMES_UPDATES, &message).await
    }

    async fn publish_activity(&self, view: &ActivityView) -> Result<()> {
        self.bus.publish(channels::ACTIVITY_GAMES, view).await
    }

    async fn publish_position(&self, update: &PositionPriceUpdate) -> Result<()> {
        self.bus.publish(channels::POSITIONS_PRICES, update).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::game::fixtures::moneyline_game;
    use crate::models::REASON_PRICE_UPDATE;
    use std::collections::HashMap;

    #[test]
    fn test_game_broadcast_envelope() {
        let view = GameView::build(&moneyline_game(), &HashMap::new());
        let json = serde_json::to_value(GameBroadcast {
            reason: REASON_PRICE_UPDATE.to_string(),
            view: &view,
        })
        .unwrap();

        assert_eq!(json["reason"], "price_update");
        assert_eq!(json["view"]["gameId"], "game-1");
        assert_eq!(json["view"]["markets"][0]["outcomes"][1]["tokenId"], "tok-b");
    }

    #[test]
    fn test_position_update_wire_names() {
        let update = PositionPriceUpdate {
            asset_id: "tok-a".to_string(),
            price: 0.41,
            buy_price: 42,
            sell_price: 40,
        };
        let json = serde_json::to_value(&update).unwrap();
        assert_eq!(json["assetId"], "tok-a");
        assert_eq!(json["buyPrice"], 42);
        assert_eq!(json["sellPrice"], 40);
    }
}
