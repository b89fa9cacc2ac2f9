//! Historical probability baselines per game
//!
//! The change shown next to each probability is measured against a baseline
//! loaded from the price history. Baselines are cached per game for the
//! configured freshness window. A missing or stale entry is served as empty
//! (every change reads 0) while one background reload runs; callers never
//! wait on the database.
//!
//! Entries for games that leave the index are dropped on rebuild, stale ones
//! on the maintenance tick. A reload that finishes after its game was removed
//! is discarded.

use crate::config::parse_secs;
use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// Token id to baseline probability (0-100)
pub type Baselines = HashMap<String, f64>;

#[derive(Debug, Clone)]
pub struct ChangeCacheConfig {
    pub freshness: Duration,
}

impl Default for ChangeCacheConfig {
    fn default() -> Self {
        Self {
            freshness: Duration::from_secs(300),
        }
    }
}

impl ChangeCacheConfig {
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            freshness: parse_secs(
                "PROBABILITY_CHANGE_FRESHNESS_SECS",
                Self::default().freshness,
            )?,
        })
    }
}

#[async_trait]
pub trait ChangeSource: Send + Sync {
    async fn load_baselines(&self, game_id: &str) -> Result<Baselines>;
}

struct Entry {
    baselines: Arc<Baselines>,
    loaded_at: Instant,
}

struct Inner {
    config: ChangeCacheConfig,
    source: Arc<dyn ChangeSource>,
    entries: Mutex<HashMap<String, Entry>>,
    in_flight: Mutex<HashSet<String>>,
    /// Ticket of the latest load per game; removal forgets it
    loads: Mutex<HashMap<String, u64>>,
    next_ticket: AtomicU64,
}

#[derive(Clone)]
pub struct HistoricalChangeCache {
    inner: Arc<Inner>,
}

impl HistoricalChangeCache {
    pub fn new(config: ChangeCacheConfig, source: Arc<dyn ChangeSource>) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                source,
                entries: Mutex::new(HashMap::new()),
                in_flight: Mutex::new(HashSet::new()),
                loads: Mutex::new(HashMap::new()),
                next_ticket: AtomicU64::new(0),
            }),
        }
    }

    /// Fresh baselines for `game_id`, or empty while a reload is scheduled
    pub fn baselines(&self, game_id: &str) -> Arc<Baselines> {
        let now = Instant::now();
        if let Some(entry) = self.inner.entries.lock().get(game_id) {
            if now.duration_since(entry.loaded_at) < self.inner.config.freshness {
                return entry.baselines.clone();
            }
        }
        self.spawn_refresh(game_id);
        Arc::new(Baselines::new())
    }

    /// Load baselines now and cache them, unless the game was removed or a
    /// newer load started meanwhile
    pub async fn refresh(&self, game_id: &str) -> Result<Arc<Baselines>> {
        let ticket = self.inner.next_ticket.fetch_add(1, Ordering::Relaxed);
        self.inner.loads.lock().insert(game_id.to_string(), ticket);

        let loaded = self.inner.source.load_baselines(game_id).await;

        let mut loads = self.inner.loads.lock();
        if loads.get(game_id) != Some(&ticket) {
            debug!("Discarding baselines for {}, superseded or removed", game_id);
            return loaded.map(Arc::new);
        }
        loads.remove(game_id);
        let baselines = Arc::new(loaded?);
        self.inner.entries.lock().insert(
            game_id.to_string(),
            Entry {
                baselines: baselines.clone(),
                loaded_at: Instant::now(),
            },
        );
        Ok(baselines)
    }

    pub fn remove(&self, game_id: &str) {
        self.inner.loads.lock().remove(game_id);
        self.inner.entries.lock().remove(game_id);
    }

    /// Keep only the games for which `keep` holds. Returns how many were dropped.
    pub fn retain_games<F>(&self, keep: F) -> usize
    where
        F: Fn(&str) -> bool,
    {
        self.inner.loads.lock().retain(|game_id, _| keep(game_id));
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|game_id, _| keep(game_id));
        before - entries.len()
    }

    /// Drop entries past the freshness window. Returns how many were dropped.
    pub fn prune_stale(&self) -> usize {
        let now = Instant::now();
        let freshness = self.inner.config.freshness;
        let mut entries = self.inner.entries.lock();
        let before = entries.len();
        entries.retain(|_, entry| now.duration_since(entry.loaded_at) < freshness);
        before - entries.len()
    }

    pub fn len(&self) -> usize {
        self.inner.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn spawn_refresh(&self, game_id: &str) {
        if !self.inner.in_flight.lock().insert(game_id.to_string()) {
            return;
        }

        let cache = self.clone();
        let game_id = game_id.to_string();
        tokio::spawn(async move {
            match cache.refresh(&game_id).await {
                Ok(baselines) => debug!(
                    "Loaded {} probability baselines for {}",
                    baselines.len(),
                    game_id
                ),
                Err(e) => warn!("Failed to load probability baselines for {}: {:#}", game_id, e),
            }
            cache.inner.in_flight.lock().remove(&game_id);
        });
    }
}
