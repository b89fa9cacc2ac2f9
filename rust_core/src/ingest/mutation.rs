//! Pure game mutation for a group of resolved price updates

use super::pricing::DerivedPrices;
use crate::models::{AssetLocation, Game, Market};
use chrono::{DateTime, Utc};
use std::sync::Arc;

/// A feed tuple matched to its location
#[derive(Debug, Clone)]
pub struct ResolvedUpdate {
    pub asset_id: String,
    pub location: AssetLocation,
    pub best_bid: f64,
    pub best_ask: f64,
    pub prices: DerivedPrices,
}

/// Apply `updates` to `game`. Returns the new snapshot if any market changed,
/// `None` when the updates leave the game as it was.
///
/// Unchanged markets keep their shared allocation. A market's best bid/ask
/// comes from the first update in the batch that matched one of its outcomes.
pub fn apply_updates(game: &Game, updates: &[ResolvedUpdate], now: DateTime<Utc>) -> Option<Game> {
    let mut changed = false;
    let markets = game
        .markets
        .iter()
        .map(|market| match apply_to_market(market, updates) {
            Some(next) => {
                changed = true;
                Arc::new(next)
            }
            None => market.clone(),
        })
        .collect();

    if !changed {
        return None;
    }

    let mut next = game.clone();
    next.markets = markets;
    next.updated_at = now;
    Some(next)
}

fn apply_to_market(market: &Market, updates: &[ResolvedUpdate]) -> Option<Market> {
    let mut relevant = updates
        .iter()
        .filter(|u| u.location.market_id == market.id)
        .peekable();
    relevant.peek()?;

    let mut next = market.clone();
    let mut quote_taken = false;
    for update in relevant {
        let Some(position) = next.outcome_position(update.location.outcome_index, &update.asset_id)
        else {
            continue;
        };

        let outcome = &mut next.outcomes[position];
        outcome.price = update.prices.price_string();
        outcome.probability = update.prices.probability;
        outcome.buy_price = update.prices.buy_price;
        outcome.sell_price = update.prices.sell_price;

        if !quote_taken {
            next.best_bid = Some(update.best_bid);
            next.best_ask = Some(update.best_ask);
            quote_taken = true;
        }
    }
    next.sync_outcome_prices();

    (next != *market).then_some(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::game::fixtures::{market, moneyline_game, outcome};
    use chrono::TimeZone;

    fn resolved(game: &Game, asset_id: &str, bid: f64, ask: f64) -> ResolvedUpdate {
        let location = game
            .asset_locations()
            .find(|(id, _)| id == asset_id)
            .map(|(_, loc)| loc)
            .unwrap();
        ResolvedUpdate {
            asset_id: asset_id.to_string(),
            location,
            best_bid: bid,
            best_ask: ask,
            prices: DerivedPrices::from_quote(bid, ask),
        }
    }

    fn now() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 10, 19, 12, 0, 0).unwrap()
    }

    #[test]
    fn test_updates_outcomes_and_legacy_prices() {
        let game = moneyline_game();
        let updates = vec![
            resolved(&game, "tok-a", 0.40, 0.42),
            resolved(&game, "tok-b", 0.55, 0.58),
        ];

        let next = apply_updates(&game, &updates, now()).unwrap();
        let market = &next.markets[0];
        assert_eq!(market.outcomes[0].probability, 41.0);
        assert_eq!(market.outcomes[1].probability, 56.5);
        assert_eq!(market.outcomes[0].buy_price, 42);
        assert_eq!(market.outcomes[1].sell_price, 55);
        assert_eq!(market.outcome_prices, vec!["0.41", "0.565"]);
        assert_eq!(next.updated_at, now());
        // Original snapshot untouched
        assert_eq!(game.markets[0].outcomes[0].probability, 50.0);
    }

    #[test]
    fn test_first_matching_update_sets_market_quote() {
        let game = moneyline_game();
        let updates = vec![
            resolved(&game, "tok-b", 0.55, 0.58),
            resolved(&game, "tok-a", 0.40, 0.42),
        ];

        let next = apply_updates(&game, &updates, now()).unwrap();
        assert_eq!(next.markets[0].best_bid, Some(0.55));
        assert_eq!(next.markets[0].best_ask, Some(0.58));
    }

    #[test]
    fn test_untouched_markets_keep_their_allocation() {
        let mut game = moneyline_game();
        game.markets
            .push(Arc::new(market("mkt-2", vec![outcome("Over", "tok-o")])));
        let updates = vec![resolved(&game, "tok-a", 0.40, 0.42)];

        let next = apply_updates(&game, &updates, now()).unwrap();
        assert!(!Arc::ptr_eq(&next.markets[0], &game.markets[0]));
        assert!(Arc::ptr_eq(&next.markets[1], &game.markets[1]));
    }

    #[test]
    fn test_reapplying_same_batch_is_a_no_op() {
        let game = moneyline_game();
        let updates = vec![
            resolved(&game, "tok-a", 0.40, 0.42),
            resolved(&game, "tok-b", 0.55, 0.58),
        ];

        let once = apply_updates(&game, &updates, now()).unwrap();
        assert!(apply_updates(&once, &updates, now()).is_none());
    }

    #[test]
    fn test_stale_outcome_index_falls_back_to_token_search() {
        let game = moneyline_game();
        let mut update = resolved(&game, "tok-b", 0.30, 0.32);
        update.location.outcome_index = 0;

        let next = apply_updates(&game, &[update], now()).unwrap();
        assert_eq!(next.markets[0].outcomes[0].probability, 50.0);
        assert_eq!(next.markets[0].outcomes[1].probability, 31.0);
    }
}
