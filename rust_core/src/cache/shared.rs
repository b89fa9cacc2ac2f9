//! Shared cross-worker cache of live games.
//!
//! This module provides:
//! - Games by id plus two secondary indices (numeric id, lowercased slug/ticker)
//! - Token prices for position valuation
//! - TTL-bounded refresh flags used as advisory mutual exclusion between workers
//! - A connection circuit breaker that demotes the remote hash store to process
//!   memory under churn, with a background probe that promotes it back
//!
//! Writing a game pipelines the primary and index commands into one round
//! trip. That batch is not atomic; `cleanup_orphaned_indices` repairs drift.
//!
//! The process-memory fallback only holds what was written during the
//! current degraded window: it is emptied when the breaker trips and again
//! when the remote store is promoted back.

use crate::circuit_breaker::{BreakerConfig, BreakerStatus, ConnectionBreaker};
use crate::config::{parse_env, parse_secs};
use crate::models::{Game, TokenPriceEntry};
use crate::redis::store::{HashOp, HashStore, MemoryHashStore, RedisHashStore, StoreError};
use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct SharedCacheConfig {
    /// Namespace for every key this cache touches
    pub key_prefix: String,
    pub breaker: BreakerConfig,
    pub refresh_flag_ttl: Duration,
    /// Minimum token price entries before the hash is trusted as warm
    pub token_price_trust_floor: usize,
    /// Ping interval while degraded
    pub probe_interval: Duration,
}

impl Default for SharedCacheConfig {
    fn default() -> Self {
        Self {
            key_prefix: "livegames".to_string(),
            breaker: BreakerConfig::default(),
            refresh_flag_ttl: Duration::from_secs(300),
            token_price_trust_floor: 50,
            probe_interval: Duration::from_secs(5),
        }
    }
}

impl SharedCacheConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            key_prefix: parse_env("CACHE_KEY_PREFIX", defaults.key_prefix)?,
            breaker: BreakerConfig::from_env()?,
            refresh_flag_ttl: parse_secs("REFRESH_FLAG_TTL_SECS", defaults.refresh_flag_ttl)?,
            token_price_trust_floor: parse_env(
                "TOKEN_PRICE_TRUST_FLOOR",
                defaults.token_price_trust_floor,
            )?,
            probe_interval: parse_secs("CACHE_PROBE_INTERVAL_SECS", defaults.probe_interval)?,
        })
    }
}

#[derive(Debug, Clone)]
struct CacheKeys {
    games: String,
    by_numeric_id: String,
    by_slug: String,
    token_prices: String,
    prefix: String,
}

impl CacheKeys {
    fn new(prefix: &str) -> Self {
        Self {
            games: format!("{}:games", prefix),
            by_numeric_id: format!("{}:games:by_numeric_id", prefix),
            by_slug: format!("{}:games:by_slug", prefix),
            token_prices: format!("{}:token_prices", prefix),
            prefix: prefix.to_string(),
        }
    }

    fn refresh_flag(&self, pipeline: &str) -> String {
        format!("{}:refresh:{}", self.prefix, pipeline)
    }
}

/// Run a store call against the remote backend when the breaker allows it,
/// falling back to process memory on connection-class failures.
macro_rules! routed {
    ($cache:expr, $store:ident => $call:expr) => {{
        let cache = $cache;
        let mut settled = None;
        if let Some($store) = cache.remote_if_allowed() {
            match $call.await {
                Ok(value) => settled = Some(Ok(value)),
                Err(e) if e.is_connection() => cache.on_connection_error(&e),
                Err(e) => settled = Some(Err(anyhow::Error::from(e))),
            }
        }
        match settled {
            Some(result) => result,
            None => {
                let $store: &dyn HashStore = cache.inner.local.as_ref();
                $call.await.map_err(anyhow::Error::from)
            }
        }
    }};
}

struct Inner {
    config: SharedCacheConfig,
    keys: CacheKeys,
    remote: Option<Arc<dyn HashStore>>,
    local: Arc<MemoryHashStore>,
    breaker: Arc<ConnectionBreaker>,
    probe: Mutex<Option<JoinHandle<()>>>,
    worker_token: String,
}

/// Handle to the shared cache; clones share one backend and breaker
#[derive(Clone)]
pub struct SharedCache {
    inner: Arc<Inner>,
}

impl SharedCache {
    /// Connect to Redis when a URL is given. An unreachable server leaves the
    /// cache memory-only for the life of the process.
    pub async fn connect(
        config: SharedCacheConfig,
        redis_url: Option<&str>,
        worker_token: &str,
    ) -> Self {
        let remote: Option<Arc<dyn HashStore>> = match redis_url {
            Some(url) => match RedisHashStore::connect(url).await {
                Ok(store) => {
                    info!("Shared cache connected to Redis");
                    Some(Arc::new(store))
                }
                Err(e) => {
                    warn!("Shared cache could not reach Redis ({}), using process memory", e);
                    None
                }
            },
            None => {
                info!("REDIS_URL not set, shared cache is process-local");
                None
            }
        };
        Self::build(config, remote, worker_token)
    }

    pub fn in_memory(config: SharedCacheConfig, worker_token: &str) -> Self {
        Self::build(config, None, worker_token)
    }

    /// Use an explicit remote backend
    pub fn with_remote(
        config: SharedCacheConfig,
        remote: Arc<dyn HashStore>,
        worker_token: &str,
    ) -> Self {
        Self::build(config, Some(remote), worker_token)
    }

    fn build(
        config: SharedCacheConfig,
        remote: Option<Arc<dyn HashStore>>,
        worker_token: &str,
    ) -> Self {
        let keys = CacheKeys::new(&config.key_prefix);
        let breaker = Arc::new(ConnectionBreaker::new(
            "shared_cache",
            config.breaker.clone(),
        ));
        Self {
            inner: Arc::new(Inner {
                config,
                keys,
                remote,
                local: Arc::new(MemoryHashStore::new()),
                breaker,
                probe: Mutex::new(None),
                worker_token: worker_token.to_string(),
            }),
        }
    }

    // ========================================================================
    // Games
    // ========================================================================

    pub async fn set_game(&self, game: &Game) -> Result<()> {
        let ops = self.game_ops(game)?;
        routed!(self, store => store.apply(ops.clone()))
            .with_context(|| format!("Failed to cache game {}", game.id))
    }

    /// Write many games and their indices in one pipeline
    pub async fn set_games(&self, games: &[Game]) -> Result<()> {
        if games.is_empty() {
            return Ok(());
        }
        let mut ops = Vec::with_capacity(games.len() * 3);
        for game in games {
            ops.extend(self.game_ops(game)?);
        }
        routed!(self, store => store.apply(ops.clone()))
            .with_context(|| format!("Failed to cache {} games", games.len()))
    }

    pub async fn get_game(&self, game_id: &str) -> Result<Option<Game>> {
        let keys = &self.inner.keys;
        let raw = routed!(self, store => store.hget(&keys.games, game_id))?;
        raw.map(|json| {
            serde_json::from_str::<Game>(&json)
                .with_context(|| format!("Corrupt cached game {}", game_id))
        })
        .transpose()
    }

    /// All cached games; unreadable entries are skipped
    pub async fn get_all_games(&self) -> Result<Vec<Game>> {
        let keys = &self.inner.keys;
        let values = routed!(self, store => store.hvals(&keys.games))?;
        let mut games = Vec::with_capacity(values.len());
        for json in values {
            match serde_json::from_str::<Game>(&json) {
                Ok(game) => games.push(game),
                Err(e) => warn!("Skipping unreadable cached game: {}", e),
            }
        }
        Ok(games)
    }

    pub async fn get_game_id_by_slug(&self, slug: &str) -> Result<Option<String>> {
        let keys = &self.inner.keys;
        let slug = slug.to_lowercase();
        routed!(self, store => store.hget(&keys.by_slug, &slug))
    }

    pub async fn get_game_id_by_numeric_id(&self, external_id: i64) -> Result<Option<String>> {
        let keys = &self.inner.keys;
        let field = external_id.to_string();
        routed!(self, store => store.hget(&keys.by_numeric_id, &field))
    }

    /// Remove a game and the index entries derived from its content.
    /// Returns whether the game was cached.
    pub async fn remove_game(&self, game_id: &str) -> Result<bool> {
        let keys = &self.inner.keys;
        let raw = routed!(self, store => store.hget(&keys.games, game_id))?;
        let existing = raw.as_deref().and_then(|json| {
            serde_json::from_str::<Game>(json)
                .map_err(|e| {
                    warn!(
                        "Cached game {} is unreadable, removing without its indices: {}",
                        game_id, e
                    )
                })
                .ok()
        });

        let mut ops = vec![HashOp::delete(&keys.games, game_id)];
        if let Some(game) = &existing {
            if let Some(external_id) = game.external_id {
                ops.push(HashOp::delete(&keys.by_numeric_id, external_id.to_string()));
            }
            for key in game.lookup_keys() {
                ops.push(HashOp::delete(&keys.by_slug, key));
            }
        }
        routed!(self, store => store.apply(ops.clone()))?;
        Ok(raw.is_some())
    }

    pub async fn clear_games(&self) -> Result<()> {
        let keys = &self.inner.keys;
        let ops: Vec<HashOp> = [&keys.games, &keys.by_numeric_id, &keys.by_slug]
            .into_iter()
            .map(|key| HashOp::DeleteKey { key: key.clone() })
            .collect();
        routed!(self, store => store.apply(ops.clone()))
    }

    pub async fn has_games_in_cache(&self) -> Result<bool> {
        let keys = &self.inner.keys;
        Ok(routed!(self, store => store.hlen(&keys.games))? > 0)
    }

    fn game_ops(&self, game: &Game) -> Result<Vec<HashOp>, StoreError> {
        let keys = &self.inner.keys;
        let mut ops = vec![HashOp::set(
            &keys.games,
            game.id.clone(),
            serde_json::to_string(game)?,
        )];
        if let Some(external_id) = game.external_id {
            ops.push(HashOp::set(
                &keys.by_numeric_id,
                external_id.to_string(),
                game.id.clone(),
            ));
        }
        for key in game.lookup_keys() {
            ops.push(HashOp::set(&keys.by_slug, key, game.id.clone()));
        }
        Ok(ops)
    }

    /// Drop index entries whose target game is gone. Returns entries removed.
    pub async fn cleanup_orphaned_indices(&self) -> Result<usize> {
        let keys = &self.inner.keys;
        let by_numeric = routed!(self, store => store.hgetall(&keys.by_numeric_id))?;
        let by_slug = routed!(self, store => store.hgetall(&keys.by_slug))?;

        let targets: Vec<String> = by_numeric
            .values()
            .chain(by_slug.values())
            .cloned()
            .collect::<HashSet<_>>()
            .into_iter()
            .collect();
        if targets.is_empty() {
            return Ok(0);
        }

        let present = routed!(self, store => store.hmget(&keys.games, &targets))?;
        let missing: HashSet<&str> = targets
            .iter()
            .zip(present.iter())
            .filter(|(_, value)| value.is_none())
            .map(|(id, _)| id.as_str())
            .collect();

        let mut ops = Vec::new();
        for (index_key, entries) in [(&keys.by_numeric_id, &by_numeric), (&keys.by_slug, &by_slug)] {
            for (field, target) in entries {
                if missing.contains(target.as_str()) {
                    ops.push(HashOp::delete(index_key, field.clone()));
                }
            }
        }

        let removed = ops.len();
        if removed > 0 {
            routed!(self, store => store.apply(ops.clone()))?;
            info!("Removed {} orphaned index entries", removed);
        }
        Ok(removed)
    }

    // ========================================================================
    // Token prices
    // ========================================================================

    pub async fn set_token_prices(&self, prices: &[(String, TokenPriceEntry)]) -> Result<()> {
        if prices.is_empty() {
            return Ok(());
        }
        let keys = &self.inner.keys;
        let mut ops = Vec::with_capacity(prices.len());
        for (asset_id, entry) in prices {
            ops.push(HashOp::set(
                &keys.token_prices,
                asset_id.clone(),
                serde_json::to_string(entry)?,
            ));
        }
        routed!(self, store => store.apply(ops.clone()))
            .context("Failed to cache token prices")
    }

    pub async fn get_token_price(&self, asset_id: &str) -> Result<Option<TokenPriceEntry>> {
        let keys = &self.inner.keys;
        let raw = routed!(self, store => store.hget(&keys.token_prices, asset_id))?;
        Ok(raw.and_then(|json| serde_json::from_str(&json).ok()))
    }

    /// Prices for the requested assets that are cached, in one read
    pub async fn get_token_prices(
        &self,
        asset_ids: &[String],
    ) -> Result<HashMap<String, TokenPriceEntry>> {
        let keys = &self.inner.keys;
        let values = routed!(self, store => store.hmget(&keys.token_prices, asset_ids))?;
        Ok(asset_ids
            .iter()
            .zip(values)
            .filter_map(|(asset_id, raw)| {
                let entry = serde_json::from_str(raw.as_deref()?).ok()?;
                Some((asset_id.clone(), entry))
            })
            .collect())
    }

    /// Whether enough token prices are cached to skip a cold start
    pub async fn has_token_prices_in_cache(&self) -> Result<bool> {
        let keys = &self.inner.keys;
        let count = routed!(self, store => store.hlen(&keys.token_prices))?;
        Ok(count >= self.inner.config.token_price_trust_floor)
    }

    // ========================================================================
    // Refresh flags
    // ========================================================================

    /// Claim the refresh flag for `pipeline`. Advisory: the flag expires
    /// after the configured TTL even if never released.
    pub async fn acquire_refresh_flag(&self, pipeline: &str) -> Result<bool> {
        let key = self.inner.keys.refresh_flag(pipeline);
        let token = &self.inner.worker_token;
        let ttl = self.inner.config.refresh_flag_ttl;
        let acquired = routed!(self, store => store.set_nx_ex(&key, token, ttl))?;
        debug!("Refresh flag {} acquired={}", key, acquired);
        Ok(acquired)
    }

    pub async fn is_refresh_in_progress(&self, pipeline: &str) -> Result<bool> {
        let key = self.inner.keys.refresh_flag(pipeline);
        Ok(routed!(self, store => store.get(&key))?.is_some())
    }

    /// Release the flag if this worker holds it
    pub async fn release_refresh_flag(&self, pipeline: &str) -> Result<bool> {
        let key = self.inner.keys.refresh_flag(pipeline);
        let holder = routed!(self, store => store.get(&key))?;
        if holder.as_deref() != Some(self.inner.worker_token.as_str()) {
            return Ok(false);
        }
        let ops = vec![HashOp::DeleteKey { key: key.clone() }];
        routed!(self, store => store.apply(ops.clone()))?;
        Ok(true)
    }

    // ========================================================================
    // Breaker and lifecycle
    // ========================================================================

    pub fn is_degraded(&self) -> bool {
        self.inner.breaker.is_degraded()
    }

    pub fn breaker_status(&self) -> BreakerStatus {
        self.inner.breaker.status()
    }

    /// Backend that currently serves requests
    pub fn backend_name(&self) -> &'static str {
        match self.remote_if_allowed() {
            Some(remote) => remote.backend_name(),
            None => self.inner.local.backend_name(),
        }
    }

    pub fn shutdown(&self) {
        if let Some(handle) = self.inner.probe.lock().take() {
            handle.abort();
        }
    }

    fn remote_if_allowed(&self) -> Option<&dyn HashStore> {
        match &self.inner.remote {
            Some(remote) if self.inner.breaker.allows_remote() => Some(remote.as_ref()),
            _ => None,
        }
    }

    fn on_connection_error(&self, error: &StoreError) {
        warn!("Shared cache remote call failed, serving from memory: {}", error);
        if self.inner.breaker.record_close() {
            self.inner.local.clear();
            self.start_probe();
        }
    }

    /// Ping the remote store while degraded. Stops after recovery.
    fn start_probe(&self) {
        let Some(remote) = self.inner.remote.clone() else {
            return;
        };
        let mut probe = self.inner.probe.lock();
        if probe.as_ref().is_some_and(|handle| !handle.is_finished()) {
            return;
        }

        let breaker = self.inner.breaker.clone();
        let local = self.inner.local.clone();
        let interval = self.inner.config.probe_interval;
        *probe = Some(tokio::spawn(async move {
            loop {
                tokio::time::sleep(interval).await;
                match remote.ping().await {
                    Ok(()) => {
                        if breaker.record_ready() {
                            local.clear();
                            break;
                        }
                    }
                    Err(e) => {
                        debug!("Shared cache probe failed: {}", e);
                        breaker.record_close();
                    }
                }
            }
        }));
    }
}
