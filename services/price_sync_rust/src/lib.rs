//! Price sync worker: one process of the live game price pipeline.
//!
//! - `config`: environment-driven worker settings
//! - `worker`: wiring, event dispatch, maintenance and heartbeat loops

pub mod config;
pub mod worker;

pub use config::PriceSyncConfig;
pub use worker::{Heartbeat, PriceSyncWorker};
