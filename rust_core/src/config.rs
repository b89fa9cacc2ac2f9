//! Configuration for the price pipeline core
//!
//! Each component owns its config struct (`BreakerConfig`, `SharedCacheConfig`,
//! `WriteQueueConfig`, `ChangeCacheConfig`); `CoreConfig` loads them together.
//! Unset variables fall back to defaults, malformed ones are errors.

use crate::cache::changes::ChangeCacheConfig;
use crate::cache::shared::SharedCacheConfig;
use crate::persistence::queue::WriteQueueConfig;
use anyhow::{anyhow, Result};
use std::env;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Default)]
pub struct CoreConfig {
    pub shared_cache: SharedCacheConfig,
    pub write_queue: WriteQueueConfig,
    pub change_cache: ChangeCacheConfig,
}

impl CoreConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            shared_cache: SharedCacheConfig::from_env()?,
            write_queue: WriteQueueConfig::from_env()?,
            change_cache: ChangeCacheConfig::from_env()?,
        })
    }
}

/// Parse environment variable with default fallback
pub fn parse_env<T: FromStr>(var_name: &str, default: T) -> Result<T> {
    match env::var(var_name) {
        Ok(val) => val
            .trim()
            .parse()
            .map_err(|_| anyhow!("{} has an invalid value: {:?}", var_name, val)),
        Err(_) => Ok(default),
    }
}

/// Parse a millisecond duration
pub fn parse_millis(var_name: &str, default: Duration) -> Result<Duration> {
    parse_env(var_name, default.as_millis() as u64).map(Duration::from_millis)
}

/// Parse a second duration
pub fn parse_secs(var_name: &str, default: Duration) -> Result<Duration> {
    parse_env(var_name, default.as_secs()).map(Duration::from_secs)
}

/// Read model upserts only run in production deployments
pub fn is_production() -> bool {
    env::var("APP_ENV")
        .map(|v| v.eq_ignore_ascii_case("production"))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    // Only unset variables are used here; tests share one process environment.

    #[test]
    fn test_parse_env_with_default() {
        assert_eq!(parse_env("LIVEGAMES_NON_EXISTENT_U64", 42u64).unwrap(), 42);
        assert!(parse_env("LIVEGAMES_NON_EXISTENT_BOOL", true).unwrap());
    }

    #[test]
    fn test_duration_helpers_with_default() {
        assert_eq!(
            parse_millis("LIVEGAMES_NON_EXISTENT_MS", Duration::from_millis(1500)).unwrap(),
            Duration::from_millis(1500)
        );
        assert_eq!(
            parse_secs("LIVEGAMES_NON_EXISTENT_SECS", Duration::from_secs(300)).unwrap(),
            Duration::from_secs(300)
        );
    }

    #[test]
    fn test_core_defaults_match_documented_values() {
        let config = CoreConfig::default();
        assert_eq!(config.write_queue.flush_interval, Duration::from_millis(1000));
        assert_eq!(config.change_cache.freshness, Duration::from_secs(300));
        assert_eq!(config.shared_cache.breaker.window, Duration::from_secs(30));
        assert_eq!(config.shared_cache.breaker.threshold, 10);
        assert_eq!(config.shared_cache.refresh_flag_ttl, Duration::from_secs(300));
        assert_eq!(config.shared_cache.token_price_trust_floor, 50);
    }
}
