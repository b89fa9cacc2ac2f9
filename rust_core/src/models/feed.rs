//! Inbound messages: order-book feed events and bulk refresh notifications.

use serde::{Deserialize, Deserializer, Serialize};

/// Accepts a decimal string or a JSON number. Missing, unparsable or
/// non-finite values become 0; everything else is clamped into [0, 1].
fn deserialize_unit_price<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum PriceValue {
        Number(f64),
        Text(String),
        Other(serde::de::IgnoredAny),
    }

    let value = Option::<PriceValue>::deserialize(deserializer)?;
    let parsed = match value {
        Some(PriceValue::Number(n)) => n,
        Some(PriceValue::Text(s)) => s.trim().parse::<f64>().unwrap_or(0.0),
        Some(PriceValue::Other(_)) | None => 0.0,
    };
    Ok(if parsed.is_finite() {
        parsed.clamp(0.0, 1.0)
    } else {
        0.0
    })
}

/// One `{asset_id, best_bid, best_ask}` tuple of a price_change batch
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PriceChange {
    pub asset_id: String,
    #[serde(default, deserialize_with = "deserialize_unit_price")]
    pub best_bid: f64,
    #[serde(default, deserialize_with = "deserialize_unit_price")]
    pub best_ask: f64,
    /// Last trade price; carried through but not used for derivation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub price: Option<String>,
}

impl PriceChange {
    pub fn new(asset_id: &str, best_bid: f64, best_ask: f64) -> Self {
        Self {
            asset_id: asset_id.to_string(),
            best_bid,
            best_ask,
            price: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedEvent {
    pub event_type: String,
    #[serde(default)]
    pub market: Option<String>,
    #[serde(default)]
    pub price_changes: Vec<PriceChange>,
}

impl FeedEvent {
    pub fn is_price_change(&self) -> bool {
        self.event_type == "price_change"
    }
}

/// Parse a feed payload (a single event or an array of events) and return the
/// price_change tuples it carries, in order. Other event types are ignored.
pub fn parse_feed_payload(payload: &[u8]) -> serde_json::Result<Vec<PriceChange>> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Payload {
        Many(Vec<FeedEvent>),
        One(FeedEvent),
    }

    let events = match serde_json::from_slice::<Payload>(payload)? {
        Payload::Many(events) => events,
        Payload::One(event) => vec![event],
    };

    Ok(events
        .into_iter()
        .filter(FeedEvent::is_price_change)
        .flat_map(|e| e.price_changes)
        .collect())
}

/// Notifications pushed by the bulk "all live games" refresher
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum LifecycleEvent {
    RefreshStarting {
        pipeline: String,
    },
    RefreshEnded {
        pipeline: String,
    },
    GamesRefreshed {
        #[serde(default)]
        pipeline: Option<String>,
    },
    GameRemoved {
        game_id: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_single_price_change_event() {
        let payload = br#"{
            "event_type": "price_change",
            "market": "0xabc",
            "price_changes": [
                {"asset_id": "t1", "best_bid": "0.40", "best_ask": "0.42", "price": "0.41"},
                {"asset_id": "t2", "best_bid": "0.55", "best_ask": "0.58"}
            ]
        }"#;

        let changes = parse_feed_payload(payload).unwrap();
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].asset_id, "t1");
        assert!((changes[0].best_bid - 0.40).abs() < 1e-9);
        assert!((changes[1].best_ask - 0.58).abs() < 1e-9);
        assert_eq!(changes[0].price.as_deref(), Some("0.41"));
    }

    #[test]
    fn test_parse_array_skips_other_event_types() {
        let payload = br#"[
            {"event_type": "book", "market": "0xabc"},
            {"event_type": "price_change", "price_changes": [{"asset_id": "t1", "best_bid": 0.3, "best_ask": 0.35}]}
        ]"#;

        let changes = parse_feed_payload(payload).unwrap();
        assert_eq!(changes.len(), 1);
        assert!((changes[0].best_bid - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_missing_or_invalid_prices_become_zero() {
        let payload = br#"{"event_type": "price_change", "price_changes": [
            {"asset_id": "t1", "best_bid": "abc"},
            {"asset_id": "t2", "best_bid": null, "best_ask": "1.7"},
            {"asset_id": "t3", "best_bid": {"nested": true}, "best_ask": "-0.2"}
        ]}"#;

        let changes = parse_feed_payload(payload).unwrap();
        assert_eq!(changes[0].best_bid, 0.0);
        assert_eq!(changes[0].best_ask, 0.0);
        assert_eq!(changes[1].best_bid, 0.0);
        assert_eq!(changes[1].best_ask, 1.0);
        assert_eq!(changes[2].best_bid, 0.0);
        assert_eq!(changes[2].best_ask, 0.0);
    }

    #[test]
    fn test_lifecycle_event_tags() {
        let starting: LifecycleEvent =
            serde_json::from_str(r#"{"event": "refresh_starting", "pipeline": "games"}"#).unwrap();
        assert_eq!(
            starting,
            LifecycleEvent::RefreshStarting {
                pipeline: "games".to_string()
            }
        );

        let refreshed: LifecycleEvent =
            serde_json::from_str(r#"{"event": "games_refreshed"}"#).unwrap();
        assert_eq!(refreshed, LifecycleEvent::GamesRefreshed { pipeline: None });

        let removed: LifecycleEvent =
            serde_json::from_str(r#"{"event": "game_removed", "game_id": "g1"}"#).unwrap();
        assert_eq!(
            removed,
            LifecycleEvent::GameRemoved {
                game_id: "g1".to_string()
            }
        );
    }
}
