//! Price Sync Rust Service
//!
//! Propagates order-book price changes into live game state.
//!
//! This service:
//! - Resolves feed price changes to games through the asset index
//! - Updates the local and shared game caches and broadcasts projections
//! - Batches game writes to Postgres, pausing while bulk refreshes run
//! - Publishes heartbeats with ingestion and cache health

use anyhow::Result;
use dotenv::dotenv;
use price_sync_rust::{worker, PriceSyncConfig};
use tracing_subscriber::EnvFilter;

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    dotenv().ok();

    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let config = PriceSyncConfig::from_env()?;
    worker::run(config).await
}
