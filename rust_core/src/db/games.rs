//! Live game reads from Postgres
//!
//! `live_games.data` holds the full game record as JSON. Rows that no longer
//! deserialize are skipped with a warning instead of failing the whole load.

use super::retry::with_retry;
use crate::cache::changes::{Baselines, ChangeSource};
use crate::models::Game;
use crate::providers::GamesProvider;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde_json::Value;
use sqlx::types::Json;
use sqlx::PgPool;
use tracing::warn;

const READ_ATTEMPTS: u32 = 3;

#[derive(Clone)]
pub struct PgGameStore {
    pool: PgPool,
}

impl PgGameStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    fn decode(id: &str, data: Value) -> Option<Game> {
        match serde_json::from_value::<Game>(data) {
            Ok(game) => Some(game),
            Err(e) => {
                warn!("Skipping unreadable live_games row {}: {}", id, e);
                None
            }
        }
    }
}

#[async_trait]
impl GamesProvider for PgGameStore {
    async fn get_all_live_games(&self) -> Result<Vec<Game>> {
        let rows = with_retry("load live games", READ_ATTEMPTS, || async {
            sqlx::query_as::<_, (String, Json<Value>)>(
                "SELECT id, data FROM live_games WHERE is_live ORDER BY id",
            )
            .fetch_all(&self.pool)
            .await
            .context("Failed to query live_games")
        })
        .await?;

        Ok(rows
            .into_iter()
            .filter_map(|(id, Json(data))| Self::decode(&id, data))
            .collect())
    }

    async fn get_game(&self, game_id: &str) -> Result<Option<Game>> {
        let row = with_retry("load live game", READ_ATTEMPTS, || async {
            sqlx::query_scalar::<_, Json<Value>>("SELECT data FROM live_games WHERE id = $1")
                .bind(game_id)
                .fetch_optional(&self.pool)
                .await
                .with_context(|| format!("Failed to query live game {}", game_id))
        })
        .await?;

        Ok(row.and_then(|Json(data)| Self::decode(game_id, data)))
    }
}

#[async_trait]
impl ChangeSource for PgGameStore {
    /// Latest recorded probability per token that is at least a day old
    async fn load_baselines(&self, game_id: &str) -> Result<Baselines> {
        let rows = sqlx::query_as::<_, (String, f64)>(
            r#"
            SELECT DISTINCT ON (token_id) token_id, probability
            FROM outcome_price_history
            WHERE game_id = $1 AND recorded_at <= NOW() - INTERVAL '24 hours'
            ORDER BY token_id, recorded_at DESC
            "#,
        )
        .bind(game_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("Failed to load probability history for {}", game_id))?;

        Ok(rows.into_iter().collect())
    }
}
