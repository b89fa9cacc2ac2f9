//! Price derivation from a best bid/ask quote

/// Prices derived for one outcome from its top of book
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DerivedPrices {
    /// 0-100, two decimals
    pub probability: f64,
    /// Integer cents to buy (from the ask)
    pub buy_price: u8,
    /// Integer cents to sell (from the bid)
    pub sell_price: u8,
}

impl DerivedPrices {
    /// Probability is the midpoint when both sides are quoted and the ask is
    /// below 1, otherwise whichever side is present (bid first).
    pub fn from_quote(best_bid: f64, best_ask: f64) -> Self {
        let unit = if best_bid > 0.0 && best_ask > 0.0 && best_ask < 1.0 {
            (best_bid + best_ask) / 2.0
        } else if best_bid > 0.0 {
            best_bid
        } else {
            best_ask
        };

        Self {
            probability: round_to(unit * 100.0, 2),
            buy_price: to_cents(best_ask),
            sell_price: to_cents(best_bid),
        }
    }

    /// Probability as a 0-1 price
    pub fn unit_price(&self) -> f64 {
        round_to(self.probability / 100.0, 4)
    }

    /// Decimal price string stored on the outcome
    pub fn price_string(&self) -> String {
        format_price(self.unit_price())
    }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

fn to_cents(unit: f64) -> u8 {
    (unit * 100.0).round().clamp(0.0, 100.0) as u8
}

/// Shortest decimal form with at most four places: 0.41, 0.565, 1, 0
pub fn format_price(unit: f64) -> String {
    let fixed = format!("{:.4}", unit);
    let trimmed = fixed.trim_end_matches('0').trim_end_matches('.');
    if trimmed.is_empty() || trimmed == "-" {
        "0".to_string()
    } else {
        trimmed.to_string()
    }
}
