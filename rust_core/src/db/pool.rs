//! Postgres connection pool
//!
//! One worker holds few connections: the flush transaction, index rebuild
//! reads, and background baseline loads.

use crate::config::{parse_env, parse_secs};
use anyhow::{Context, Result};
use sqlx::postgres::{PgConnectOptions, PgPoolOptions};
use sqlx::PgPool;
use std::str::FromStr;
use std::time::Duration;
use tracing::info;

#[derive(Clone, Debug)]
pub struct DbPoolConfig {
    pub max_connections: u32,
    pub min_connections: u32,
    /// Recycle connections older than this
    pub max_lifetime: Duration,
    pub idle_timeout: Duration,
    pub acquire_timeout: Duration,
}

impl Default for DbPoolConfig {
    fn default() -> Self {
        Self {
            max_connections: 5,
            min_connections: 1,
            max_lifetime: Duration::from_secs(1800),
            idle_timeout: Duration::from_secs(600),
            acquire_timeout: Duration::from_secs(10),
        }
    }
}

impl DbPoolConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            max_connections: parse_env("DB_POOL_MAX_CONNECTIONS", defaults.max_connections)?,
            min_connections: parse_env("DB_POOL_MIN_CONNECTIONS", defaults.min_connections)?,
            max_lifetime: parse_secs("DB_POOL_MAX_LIFETIME_SECS", defaults.max_lifetime)?,
            idle_timeout: parse_secs("DB_POOL_IDLE_TIMEOUT_SECS", defaults.idle_timeout)?,
            acquire_timeout: parse_secs(
                "DB_POOL_ACQUIRE_TIMEOUT_SECS",
                defaults.acquire_timeout,
            )?,
        })
    }
}

pub async fn create_pool(database_url: &str, config: &DbPoolConfig) -> Result<PgPool> {
    info!(
        "Creating database pool: max={}, min={}, acquire_timeout={:?}",
        config.max_connections, config.min_connections, config.acquire_timeout
    );

    let connect_opts =
        PgConnectOptions::from_str(database_url).context("Failed to parse database URL")?;

    let pool = PgPoolOptions::new()
        .max_connections(config.max_connections)
        .min_connections(config.min_connections.min(config.max_connections))
        .max_lifetime(config.max_lifetime)
        .idle_timeout(config.idle_timeout)
        .acquire_timeout(config.acquire_timeout)
        .connect_with(connect_opts)
        .await
        .context("Failed to create database pool")?;

    Ok(pool)
}
