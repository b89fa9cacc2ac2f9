//! Game caches: per-process, shared across workers, and probability baselines.

pub mod changes;
pub mod local;
pub mod shared;

pub use changes::{Baselines, ChangeCacheConfig, ChangeSource, HistoricalChangeCache};
pub use local::LocalGamesCache;
pub use shared::{SharedCache, SharedCacheConfig};
