//! Live game records as stored in the game-blob table and the shared cache.
//!
//! Records keep unknown keys in `extra` because the bulk refresher owns fields
//! (teams, logos, volumes) this crate never touches but must not drop when it
//! writes a game back to the shared cache.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::sync::Arc;

/// Markets are shared between game snapshots; a price update only replaces
/// the markets it actually changed.
pub type SharedMarket = Arc<Market>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Game {
    pub id: String,
    #[serde(default)]
    pub slug: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ticker: Option<String>,
    /// Numeric id assigned by the upstream venue
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<i64>,
    #[serde(default)]
    pub ended: bool,
    #[serde(default)]
    pub markets: Vec<SharedMarket>,
    pub updated_at: DateTime<Utc>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Game {
    /// Lowercased slug and ticker, the keys of the slug index
    pub fn lookup_keys(&self) -> Vec<String> {
        let mut keys = Vec::with_capacity(2);
        if !self.slug.is_empty() {
            keys.push(self.slug.to_lowercase());
        }
        if let Some(ticker) = &self.ticker {
            let ticker = ticker.to_lowercase();
            if !ticker.is_empty() && !keys.contains(&ticker) {
                keys.push(ticker);
            }
        }
        keys
    }

    /// Every tradable outcome token of this game with its location
    pub fn asset_locations(&self) -> impl Iterator<Item = (String, AssetLocation)> + '_ {
        self.markets.iter().flat_map(move |market| {
            market
                .outcomes
                .iter()
                .enumerate()
                .filter(|(_, outcome)| !outcome.token_id.is_empty())
                .map(move |(index, outcome)| {
                    (
                        outcome.token_id.clone(),
                        AssetLocation {
                            game_id: self.id.clone(),
                            market_id: market.id.clone(),
                            outcome_index: index,
                            outcome_label: outcome.label.clone(),
                        },
                    )
                })
        })
    }

    pub fn market(&self, market_id: &str) -> Option<&Market> {
        self.markets
            .iter()
            .find(|m| m.id == market_id)
            .map(|m| m.as_ref())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Market {
    pub id: String,
    #[serde(default)]
    pub condition_id: String,
    /// Structured outcomes
    #[serde(default)]
    pub outcomes: Vec<Outcome>,
    /// Legacy array parallel to `outcomes`, still read by older clients
    #[serde(default)]
    pub outcome_prices: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_bid: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub best_ask: Option<f64>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl Market {
    /// Position of the outcome carrying `token_id`, trying the indexed slot first
    pub fn outcome_position(&self, hint: usize, token_id: &str) -> Option<usize> {
        match self.outcomes.get(hint) {
            Some(outcome) if outcome.token_id == token_id => Some(hint),
            _ => self.outcomes.iter().position(|o| o.token_id == token_id),
        }
    }

    /// Rewrite the legacy price array from the structured outcomes
    pub fn sync_outcome_prices(&mut self) {
        self.outcome_prices = self.outcomes.iter().map(|o| o.price.clone()).collect();
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Outcome {
    pub label: String,
    #[serde(default)]
    pub token_id: String,
    /// Decimal price string, e.g. "0.41"
    #[serde(default)]
    pub price: String,
    /// 0-100
    #[serde(default)]
    pub probability: f64,
    /// Integer cents 0-100
    #[serde(default)]
    pub buy_price: u8,
    #[serde(default)]
    pub sell_price: u8,
}

/// Where a feed asset id lives inside the live games
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AssetLocation {
    pub game_id: String,
    pub market_id: String,
    pub outcome_index: usize,
    pub outcome_label: String,
}

/// Latest executable prices for one token, read by position valuation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPriceEntry {
    pub buy_price: u8,
    pub sell_price: u8,
    pub is_ended: bool,
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;
    use chrono::TimeZone;

    pub fn outcome(label: &str, token_id: &str) -> Outcome {
        Outcome {
            label: label.to_string(),
            token_id: token_id.to_string(),
            price: "0.5".to_string(),
            probability: 50.0,
            buy_price: 50,
            sell_price: 50,
        }
    }

    pub fn market(id: &str, outcomes: Vec<Outcome>) -> Market {
        let mut market = Market {
            id: id.to_string(),
            condition_id: format!("0x{}", id),
            outcomes,
            outcome_prices: Vec::new(),
            best_bid: None,
            best_ask: None,
            extra: Map::new(),
        };
        market.sync_outcome_prices();
        market
    }

    pub fn game(id: &str, slug: &str, markets: Vec<Market>) -> Game {
        Game {
            id: id.to_string(),
            slug: slug.to_string(),
            ticker: None,
            external_id: Some(1000),
            ended: false,
            markets: markets.into_iter().map(Arc::new).collect(),
            updated_at: Utc.with_ymd_and_hms(2026, 10, 18, 20, 0, 0).unwrap(),
            extra: Map::new(),
        }
    }

    /// One game, one moneyline market, two outcomes (tokens "tok-a", "tok-b")
    pub fn moneyline_game() -> Game {
        game(
            "game-1",
            "NBA-LAL-BOS",
            vec![market(
                "mkt-1",
                vec![outcome("Lakers", "tok-a"), outcome("Celtics", "tok-b")],
            )],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_game_json_keeps_unknown_keys_and_dates() {
        let raw = r#"{
            "id": "g1",
            "slug": "nba-lal-bos",
            "externalId": 42,
            "updatedAt": "2026-10-18T20:00:00Z",
            "homeTeam": {"name": "Lakers"},
            "markets": [{
                "id": "m1",
                "conditionId": "0xabc",
                "question": "Who wins?",
                "outcomes": [{"label": "Lakers", "tokenId": "t1", "price": "0.4"}],
                "outcomePrices": ["0.4"]
            }]
        }"#;

        let game: Game = serde_json::from_str(raw).unwrap();
        assert_eq!(game.external_id, Some(42));
        assert_eq!(game.updated_at.to_rfc3339(), "2026-10-18T20:00:00+00:00");
        assert!(game.extra.contains_key("homeTeam"));
        assert!(game.markets[0].extra.contains_key("question"));

        let back = serde_json::to_value(&game).unwrap();
        assert_eq!(back["homeTeam"]["name"], "Lakers");
        assert_eq!(back["markets"][0]["question"], "Who wins?");
        assert_eq!(back["markets"][0]["outcomes"][0]["tokenId"], "t1");
    }

    #[test]
    fn test_lookup_keys_lowercased_and_deduplicated() {
        let mut game = moneyline_game();
        game.ticker = Some("nba-lal-bos".to_string());
        assert_eq!(game.lookup_keys(), vec!["nba-lal-bos".to_string()]);

        game.ticker = Some("LALBOS".to_string());
        assert_eq!(
            game.lookup_keys(),
            vec!["nba-lal-bos".to_string(), "lalbos".to_string()]
        );
    }

    #[test]
    fn test_asset_locations_skip_missing_tokens() {
        let mut game = moneyline_game();
        let market = Arc::make_mut(&mut game.markets[0]);
        market.outcomes.push(outcome("Draw", ""));

        let locations: Vec<_> = game.asset_locations().collect();
        assert_eq!(locations.len(), 2);
        assert_eq!(locations[1].0, "tok-b");
        assert_eq!(locations[1].1.outcome_index, 1);
        assert_eq!(locations[1].1.outcome_label, "Celtics");
    }

    #[test]
    fn test_outcome_position_falls_back_to_search() {
        let game = moneyline_game();
        let market = &game.markets[0];
        assert_eq!(market.outcome_position(0, "tok-a"), Some(0));
        assert_eq!(market.outcome_position(0, "tok-b"), Some(1));
        assert_eq!(market.outcome_position(7, "tok-b"), Some(1));
        assert_eq!(market.outcome_position(0, "nope"), None);
    }
}
