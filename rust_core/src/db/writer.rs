//! Transactional batch writer for the persistence queue
//!
//! One transaction per flush:
//! 1. `pg_advisory_xact_lock` serializes against the bulk refresher
//! 2. per game, a savepoint around a partial JSON update of `markets` and
//!    `updatedAt`; a failing row rolls back to its savepoint and is skipped
//! 3. optionally a multi-row upsert of the read-model views
//!
//! Any error outside a savepoint aborts the transaction and is returned, so
//! the queue re-queues the whole batch.

use crate::models::GameView;
use crate::persistence::queue::{GameWriter, PendingWrite, WriteQueueConfig, WriteReport};
use anyhow::{Context, Result};
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{Acquire, PgPool, Postgres, QueryBuilder};
use std::collections::HashSet;
use tracing::{debug, warn};

const UPDATE_MARKETS_SQL: &str = r#"
    UPDATE live_games
    SET data = jsonb_set(
            jsonb_set(data, '{markets}', $2::jsonb, true),
            '{updatedAt}', to_jsonb($3::timestamptz), true
        ),
        updated_at = $3
    WHERE id = $1
"#;

const UPSERT_VIEWS_PREFIX: &str = "INSERT INTO live_game_views (game_id, slug, view, updated_at) ";

const UPSERT_VIEWS_CONFLICT: &str = " ON CONFLICT (game_id) DO UPDATE SET \
     slug = EXCLUDED.slug, view = EXCLUDED.view, updated_at = EXCLUDED.updated_at";

pub struct PgGameWriter {
    pool: PgPool,
    lock_key: i64,
    read_model_enabled: bool,
}

impl PgGameWriter {
    pub fn new(pool: PgPool, config: &WriteQueueConfig) -> Self {
        Self {
            pool,
            lock_key: config.advisory_lock_key,
            read_model_enabled: config.read_model_enabled,
        }
    }
}

#[async_trait]
impl GameWriter for PgGameWriter {
    async fn write_batch(&self, batch: &[PendingWrite]) -> Result<WriteReport> {
        let mut report = WriteReport::default();
        let mut tx = self
            .pool
            .begin()
            .await
            .context("Failed to begin flush transaction")?;

        sqlx::query("SELECT pg_advisory_xact_lock($1)")
            .bind(self.lock_key)
            .execute(&mut *tx)
            .await
            .context("Failed to take live_games advisory lock")?;

        let mut written: HashSet<&str> = HashSet::with_capacity(batch.len());
        for write in batch {
            let mut savepoint = (&mut tx).begin().await.context("Failed to open savepoint")?;
            let result = sqlx::query(UPDATE_MARKETS_SQL)
                .bind(&write.game_id)
                .bind(Json(&write.markets))
                .bind(write.queued_at)
                .execute(&mut *savepoint)
                .await;

            match result {
                Ok(done) => {
                    savepoint.commit().await.context("Failed to release savepoint")?;
                    if done.rows_affected() == 0 {
                        debug!("Game {} no longer in live_games, write dropped", write.game_id);
                        report.games_skipped += 1;
                    } else {
                        written.insert(write.game_id.as_str());
                        report.games_written += 1;
                    }
                }
                Err(e) => {
                    warn!("Failed to persist game {}: {}", write.game_id, e);
                    savepoint
                        .rollback()
                        .await
                        .context("Failed to roll back savepoint")?;
                    report.games_skipped += 1;
                }
            }
        }

        if self.read_model_enabled {
            let views: Vec<&GameView> = batch
                .iter()
                .filter(|w| written.contains(w.game_id.as_str()))
                .filter_map(|w| w.view.as_ref())
                .collect();

            if !views.is_empty() {
                let mut savepoint = (&mut tx).begin().await.context("Failed to open savepoint")?;
                let mut qb: QueryBuilder<Postgres> = QueryBuilder::new(UPSERT_VIEWS_PREFIX);
                qb.push_values(views.iter().copied(), |mut b, view| {
                    b.push_bind(&view.game_id)
                        .push_bind(&view.slug)
                        .push_bind(Json(view))
                        .push_bind(view.updated_at);
                });
                qb.push(UPSERT_VIEWS_CONFLICT);

                match qb.build().execute(&mut *savepoint).await {
                    Ok(_) => {
                        savepoint.commit().await.context("Failed to release savepoint")?;
                        report.views_upserted = views.len();
                    }
                    Err(e) => {
                        warn!("Read-model upsert of {} views failed: {}", views.len(), e);
                        savepoint
                            .rollback()
                            .await
                            .context("Failed to roll back savepoint")?;
                    }
                }
            }
        }

        tx.commit().await.context("Failed to commit flush transaction")?;
        Ok(report)
    }
}
