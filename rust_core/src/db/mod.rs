//! Postgres persistence.
//!
//! - `pool`: connection pool sizing
//! - `games`: live game reads and probability baselines
//! - `writer`: the transactional flush target of the write queue
//! - `retry`: transient-failure retry for reads

pub mod games;
pub mod pool;
pub mod retry;
pub mod writer;

pub use games::PgGameStore;
pub use pool::{create_pool, DbPoolConfig};
pub use writer::PgGameWriter;
