use anyhow::{Context, Result};
use livegames_core::config::{parse_env, parse_secs};
use livegames_core::db::DbPoolConfig;
use livegames_core::redis::ReconnectConfig;
use livegames_core::CoreConfig;
use std::env;
use std::time::Duration;

#[derive(Clone, Debug)]
pub struct PriceSyncConfig {
    pub worker_id: String,
    pub redis_url: String,
    /// When false the shared cache stays in process memory
    pub shared_cache_remote: bool,
    pub database_url: String,
    /// Pipelines whose refresh flag is checked at startup
    pub refresh_pipelines: Vec<String>,
    pub heartbeat_interval: Duration,
    pub maintenance_interval: Duration,
    pub core: CoreConfig,
    pub db_pool: DbPoolConfig,
    pub reconnect: ReconnectConfig,
}

impl PriceSyncConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            worker_id: env::var("WORKER_ID").unwrap_or_else(|_| default_worker_id()),
            redis_url: env::var("REDIS_URL").unwrap_or_else(|_| "redis://redis:6379".to_string()),
            shared_cache_remote: parse_env("SHARED_CACHE_REMOTE", true)?,
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            refresh_pipelines: parse_list(
                &env::var("REFRESH_PIPELINES").unwrap_or_else(|_| "games,crypto".to_string()),
            ),
            heartbeat_interval: parse_secs("HEARTBEAT_INTERVAL_SECS", Duration::from_secs(15))?,
            maintenance_interval: parse_secs(
                "MAINTENANCE_INTERVAL_SECS",
                Duration::from_secs(300),
            )?,
            core: CoreConfig::from_env()?,
            db_pool: DbPoolConfig::from_env()?,
            reconnect: ReconnectConfig::from_env()?,
        })
    }

    /// Redis URL for the shared cache, if it should leave process memory
    pub fn shared_cache_url(&self) -> Option<&str> {
        self.shared_cache_remote.then_some(self.redis_url.as_str())
    }
}

fn default_worker_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "price-sync".to_string());
    format!("{}-{}", host, std::process::id())
}

fn parse_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_list_trims_and_skips_empty() {
        assert_eq!(parse_list(" games, crypto ,,"), vec!["games", "crypto"]);
        assert!(parse_list("").is_empty());
    }

    #[test]
    fn test_default_worker_id_ends_with_pid() {
        let id = default_worker_id();
        assert!(id.ends_with(&format!("-{}", std::process::id())));
    }

    #[test]
    fn test_shared_cache_url_respects_switch() {
        let mut config = PriceSyncConfig {
            worker_id: "w1".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            shared_cache_remote: true,
            database_url: "postgres://localhost/live".to_string(),
            refresh_pipelines: vec![],
            heartbeat_interval: Duration::from_secs(15),
            maintenance_interval: Duration::from_secs(300),
            core: CoreConfig::default(),
            db_pool: DbPoolConfig::default(),
            reconnect: ReconnectConfig::default(),
        };
        assert_eq!(config.shared_cache_url(), Some("redis://localhost:6379"));

        config.shared_cache_remote = false;
        assert_eq!(config.shared_cache_url(), None);
    }
}
