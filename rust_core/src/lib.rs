//! Live Games Core - real-time market price propagation.
//!
//! This crate provides:
//! - Asset-to-market index rebuilt on bulk refresh notifications
//! - Per-process games cache with synchronous read-modify-write
//! - Price-change ingestion: derivation, mutation, projections, broadcasts
//! - Batched transactional persistence with per-pipeline pause and backoff
//! - Shared cross-worker cache over Redis with a connection circuit breaker
//!   and TTL-bounded refresh flags

pub mod cache;
pub mod circuit_breaker;
pub mod config;
pub mod db;
pub mod index;
pub mod ingest;
pub mod models;
pub mod persistence;
pub mod providers;
pub mod redis;
pub mod sinks;

pub use cache::{HistoricalChangeCache, LocalGamesCache, SharedCache, SharedCacheConfig};
pub use circuit_breaker::{BreakerConfig, BreakerStatus, ConnectionBreaker};
pub use config::CoreConfig;
pub use index::{AssetIndex, RebuildReport};
pub use ingest::{BatchReport, IngestStatsSnapshot, IngestorDeps, PriceIngestor};
pub use persistence::{FlushOutcome, GameWriter, WriteQueue, WriteQueueConfig};
pub use providers::{CachedGamesProvider, FeedTransport, GamesProvider};
pub use sinks::BroadcastSink;
