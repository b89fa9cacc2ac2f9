//! Read-optimized projections broadcast to clients and stored in the read model.

use super::game::Game;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Probability change in points, rounded to two decimals.
/// No baseline means no change.
fn change_from_baseline(probability: f64, baseline: Option<f64>) -> f64 {
    match baseline {
        Some(base) => ((probability - base) * 100.0).round() / 100.0,
        None => 0.0,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OutcomeView {
    pub label: String,
    pub token_id: String,
    pub probability: f64,
    pub buy_price: u8,
    pub sell_price: u8,
    /// Probability change against the historical baseline
    pub change: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MarketView {
    pub market_id: String,
    pub condition_id: String,
    pub best_bid: Option<f64>,
    pub best_ask: Option<f64>,
    pub outcomes: Vec<OutcomeView>,
}

/// Full per-game view for the games channel and the read-model table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GameView {
    pub game_id: String,
    pub slug: String,
    pub external_id: Option<i64>,
    pub ended: bool,
    pub markets: Vec<MarketView>,
    pub updated_at: DateTime<Utc>,
}

impl GameView {
    pub fn build(game: &Game, baselines: &HashMap<String, f64>) -> Self {
        let markets = game
            .markets
            .iter()
            .map(|market| MarketView {
                market_id: market.id.clone(),
                condition_id: market.condition_id.clone(),
                best_bid: market.best_bid,
                best_ask: market.best_ask,
                outcomes: market
                    .outcomes
                    .iter()
                    .map(|o| OutcomeView {
                        label: o.label.clone(),
                        token_id: o.token_id.clone(),
                        probability: o.probability,
                        buy_price: o.buy_price,
                        sell_price: o.sell_price,
                        change: change_from_baseline(
                            o.probability,
                            baselines.get(&o.token_id).copied(),
                        ),
                    })
                    .collect(),
            })
            .collect();

        Self {
            game_id: game.id.clone(),
            slug: game.slug.clone(),
            external_id: game.external_id,
            ended: game.ended,
            markets,
            updated_at: game.updated_at,
        }
    }
}

/// Compact view for the activity watcher: primary market only
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityView {
    pub game_id: String,
    pub slug: String,
    pub market_id: Option<String>,
    pub outcomes: Vec<ActivityOutcome>,
    /// Label of the outcome with the largest absolute change, if any moved
    pub biggest_mover: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActivityOutcome {
    pub label: String,
    pub probability: f64,
    pub change: f64,
}

impl ActivityView {
    pub fn build(game: &Game, baselines: &HashMap<String, f64>) -> Self {
        let primary = game.markets.first();
        let outcomes: Vec<ActivityOutcome> = primary
            .map(|market| {
                market
                    .outcomes
                    .iter()
                    .map(|o| ActivityOutcome {
                        label: o.label.clone(),
                        probability: o.probability,
                        change: change_from_baseline(
                            o.probability,
                            baselines.get(&o.token_id).copied(),
                        ),
                    })
                    .collect()
            })
            .unwrap_or_default();

        let biggest_mover = outcomes
            .iter()
            .filter(|o| o.change != 0.0)
            .max_by(|a, b| a.change.abs().total_cmp(&b.change.abs()))
            .map(|o| o.label.clone());

        Self {
            game_id: game.id.clone(),
            slug: game.slug.clone(),
            market_id: primary.map(|m| m.id.clone()),
            outcomes,
            biggest_mover,
            updated_at: game.updated_at,
        }
    }
}

/// Per-asset price notification for position valuation
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PositionPriceUpdate {
    pub asset_id: String,
    /// Probability as a 0-1 price
    pub price: f64,
    pub buy_price: u8,
    pub sell_price: u8,
}
