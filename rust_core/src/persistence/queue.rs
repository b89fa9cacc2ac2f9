//! Batched persistence queue
//!
//! Price updates are coalesced per game (last write wins) and flushed on a
//! timer in one transaction. The queue can be paused per refresh pipeline so
//! flushes never contend with the bulk refresher for the same rows; while
//! any pipeline is paused no timer is armed.
//!
//! At most one flush runs at a time. A failed flush puts its batch back
//! (newer writes for the same game win) and re-arms with doubled delay.
//! Shutdown waits for an in-flight flush before the final one, and no timer
//! is armed after it.

use super::backoff::Backoff;
use crate::config::{is_production, parse_env, parse_millis};
use crate::models::{GameView, SharedMarket};
use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

#[derive(Debug, Clone)]
pub struct WriteQueueConfig {
    pub flush_interval: Duration,
    pub max_backoff: Duration,
    /// Key for `pg_advisory_xact_lock`, shared with the bulk refresher
    pub advisory_lock_key: i64,
    /// Upsert the read-model rows alongside the game blobs
    pub read_model_enabled: bool,
}

impl Default for WriteQueueConfig {
    fn default() -> Self {
        Self {
            flush_interval: Duration::from_millis(1000),
            max_backoff: Duration::from_secs(30),
            advisory_lock_key: 7_240_001,
            read_model_enabled: false,
        }
    }
}

impl WriteQueueConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            flush_interval: parse_millis("FLUSH_INTERVAL_MS", defaults.flush_interval)?,
            max_backoff: parse_millis("FLUSH_MAX_BACKOFF_MS", defaults.max_backoff)?,
            advisory_lock_key: parse_env("LIVE_GAMES_LOCK_KEY", defaults.advisory_lock_key)?,
            read_model_enabled: is_production(),
        })
    }
}

/// Latest unpersisted state of one game
#[derive(Debug, Clone)]
pub struct PendingWrite {
    pub game_id: String,
    pub markets: Vec<SharedMarket>,
    pub queued_at: DateTime<Utc>,
    pub view: Option<GameView>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WriteReport {
    pub games_written: usize,
    /// Rows that failed individually and were rolled back to their savepoint
    pub games_skipped: usize,
    pub views_upserted: usize,
}

/// Durable sink for a flushed batch. An `Err` means nothing was committed.
#[async_trait]
pub trait GameWriter: Send + Sync {
    async fn write_batch(&self, batch: &[PendingWrite]) -> Result<WriteReport>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Paused, empty, or another flush in flight
    Skipped,
    Written(WriteReport),
    Retrying { attempt: u32, delay: Duration },
}

struct QueueState {
    pending: BTreeMap<String, PendingWrite>,
    paused: HashSet<String>,
    flushing: bool,
    closed: bool,
    timer: Option<(u64, JoinHandle<()>)>,
    timer_generation: u64,
    backoff: Backoff,
}

struct Inner {
    config: WriteQueueConfig,
    writer: Arc<dyn GameWriter>,
    write_lock: Arc<tokio::sync::Mutex<()>>,
    state: Mutex<QueueState>,
    flush_done: Notify,
}

#[derive(Clone)]
pub struct WriteQueue {
    inner: Arc<Inner>,
}

impl WriteQueue {
    pub fn new(config: WriteQueueConfig, writer: Arc<dyn GameWriter>) -> Self {
        Self::with_write_lock(config, writer, Arc::new(tokio::sync::Mutex::new(())))
    }

    /// Share `write_lock` with a co-located bulk writer
    pub fn with_write_lock(
        config: WriteQueueConfig,
        writer: Arc<dyn GameWriter>,
        write_lock: Arc<tokio::sync::Mutex<()>>,
    ) -> Self {
        let backoff = Backoff::new(config.flush_interval, config.max_backoff);
        Self {
            inner: Arc::new(Inner {
                config,
                writer,
                write_lock,
                state: Mutex::new(QueueState {
                    pending: BTreeMap::new(),
                    paused: HashSet::new(),
                    flushing: false,
                    closed: false,
                    timer: None,
                    timer_generation: 0,
                    backoff,
                }),
                flush_done: Notify::new(),
            }),
        }
    }

    /// Replace any pending write for `game_id` and arm the flush timer
    pub fn queue_write(&self, game_id: &str, markets: Vec<SharedMarket>, view: Option<GameView>) {
        let mut state = self.inner.state.lock();
        state.pending.insert(
            game_id.to_string(),
            PendingWrite {
                game_id: game_id.to_string(),
                markets,
                queued_at: Utc::now(),
                view,
            },
        );
        self.arm_locked(&mut state, self.inner.config.flush_interval);
    }

    /// Drop the pending write for a removed game
    pub fn remove(&self, game_id: &str) -> bool {
        self.inner.state.lock().pending.remove(game_id).is_some()
    }

    pub async fn flush(&self) -> FlushOutcome {
        let batch: Vec<PendingWrite> = {
            let mut state = self.inner.state.lock();
            if state.flushing || !state.paused.is_empty() || state.pending.is_empty() {
                return FlushOutcome::Skipped;
            }
            state.flushing = true;
            if let Some((_, handle)) = state.timer.take() {
                handle.abort();
            }
            std::mem::take(&mut state.pending).into_values().collect()
        };

        let result = {
            let _guard = self.inner.write_lock.lock().await;
            self.inner.writer.write_batch(&batch).await
        };

        let mut state = self.inner.state.lock();
        state.flushing = false;
        self.inner.flush_done.notify_waiters();
        match result {
            Ok(report) => {
                state.backoff.reset();
                debug!(
                    "Flushed {} games ({} skipped, {} views)",
                    report.games_written, report.games_skipped, report.views_upserted
                );
                if !state.pending.is_empty() {
                    self.arm_locked(&mut state, self.inner.config.flush_interval);
                }
                FlushOutcome::Written(report)
            }
            Err(e) => {
                let size = batch.len();
                requeue(&mut state.pending, batch);
                let delay = state.backoff.next_delay();
                let attempt = state.backoff.attempt();
                warn!(
                    "Flush of {} games failed (attempt {}), retrying in {:?}: {:#}",
                    size, attempt, delay, e
                );
                self.arm_locked(&mut state, delay);
                FlushOutcome::Retrying { attempt, delay }
            }
        }
    }

    /// Stop flushing while `pipeline` refreshes
    pub fn pause(&self, pipeline: &str) {
        let mut state = self.inner.state.lock();
        state.paused.insert(pipeline.to_string());
        if let Some((_, handle)) = state.timer.take() {
            handle.abort();
        }
        info!(
            "Write queue paused by {} ({} pending)",
            pipeline,
            state.pending.len()
        );
    }

    /// Lift the pause for `pipeline`. Returns true if this armed a flush.
    pub fn resume(&self, pipeline: &str) -> bool {
        let mut state = self.inner.state.lock();
        if !state.paused.remove(pipeline) {
            return false;
        }
        if !state.paused.is_empty() {
            debug!("Write queue still paused by {:?}", state.paused);
            return false;
        }
        info!("Write queue resumed ({} pending)", state.pending.len());
        if state.pending.is_empty() {
            return false;
        }
        self.arm_locked(&mut state, self.inner.config.flush_interval)
    }

    /// Stop arming timers, wait out any in-flight flush, then flush what is
    /// left unless paused
    pub async fn shutdown(&self) -> FlushOutcome {
        loop {
            let done = self.inner.flush_done.notified();
            tokio::pin!(done);
            done.as_mut().enable();

            let (flushing, paused) = {
                let mut state = self.inner.state.lock();
                state.closed = true;
                if let Some((_, handle)) = state.timer.take() {
                    handle.abort();
                }
                (state.flushing, !state.paused.is_empty())
            };

            if flushing {
                debug!("Waiting for in-flight flush before shutdown");
                done.await;
                continue;
            }
            if paused {
                warn!(
                    "Shutting down while paused, {} writes not persisted",
                    self.pending_len()
                );
                return FlushOutcome::Skipped;
            }

            let outcome = self.flush().await;
            // Another caller may have started a flush between the check and ours
            if outcome == FlushOutcome::Skipped && self.inner.state.lock().flushing {
                continue;
            }
            return outcome;
        }
    }

    pub fn pending_len(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    pub fn is_paused(&self) -> bool {
        !self.inner.state.lock().paused.is_empty()
    }

    pub fn timer_armed(&self) -> bool {
        self.inner.state.lock().timer.is_some()
    }

    pub fn write_lock(&self) -> Arc<tokio::sync::Mutex<()>> {
        self.inner.write_lock.clone()
    }

    fn arm_locked(&self, state: &mut QueueState, delay: Duration) -> bool {
        if state.closed || !state.paused.is_empty() || state.flushing || state.timer.is_some() {
            return false;
        }

        state.timer_generation += 1;
        let generation = state.timer_generation;
        let weak: Weak<Inner> = Arc::downgrade(&self.inner);
        let handle = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            {
                let mut state = inner.state.lock();
                if matches!(state.timer, Some((g, _)) if g == generation) {
                    state.timer = None;
                } else {
                    return;
                }
            }
            WriteQueue { inner }.flush().await;
        });
        state.timer = Some((generation, handle));
        true
    }
}

/// Put a failed batch back without clobbering writes queued since
fn requeue(pending: &mut BTreeMap<String, PendingWrite>, batch: Vec<PendingWrite>) {
    for write in batch {
        pending.entry(write.game_id.clone()).or_insert(write);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::game::fixtures::{market, outcome};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingWriter {
        batches: parking_lot::Mutex<Vec<Vec<PendingWrite>>>,
        failures_left: AtomicUsize,
        write_delay: Duration,
    }

    impl RecordingWriter {
        fn failing(times: usize) -> Self {
            Self {
                failures_left: AtomicUsize::new(times),
                ..Self::default()
            }
        }

        fn slow(write_delay: Duration) -> Self {
            Self {
                write_delay,
                ..Self::default()
            }
        }

        fn batch_count(&self) -> usize {
            self.batches.lock().len()
        }
    }

    #[async_trait]
    impl GameWriter for RecordingWriter {
        async fn write_batch(&self, batch: &[PendingWrite]) -> Result<WriteReport> {
            if !self.write_delay.is_zero() {
                tokio::time::sleep(self.write_delay).await;
            }
            if self
                .failures_left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("connection reset by peer");
            }
            self.batches.lock().push(batch.to_vec());
            Ok(WriteReport {
                games_written: batch.len(),
                ..WriteReport::default()
            })
        }
    }

    fn markets(price_label: &str) -> Vec<SharedMarket> {
        vec![Arc::new(market("mkt-1", vec![outcome(price_label, "tok-a")]))]
    }

    fn queue(writer: Arc<RecordingWriter>) -> WriteQueue {
        WriteQueue::new(WriteQueueConfig::default(), writer)
    }

    #[tokio::test(start_paused = true)]
    async fn test_writes_for_one_game_coalesce() {
        let writer = Arc::new(RecordingWriter::default());
        let queue = queue(writer.clone());

        queue.queue_write("game-1", markets("first"), None);
        queue.queue_write("game-1", markets("second"), None);
        assert_eq!(queue.pending_len(), 1);
        assert!(queue.timer_armed());

        tokio::time::sleep(Duration::from_millis(1100)).await;

        let batches = writer.batches.lock();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 1);
        assert_eq!(batches[0][0].markets[0].outcomes[0].label, "second");
        assert_eq!(queue.pending_len(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pause_blocks_timer_and_resume_flushes_once() {
        let writer = Arc::new(RecordingWriter::default());
        let queue = queue(writer.clone());

        queue.queue_write("game-1", markets("a"), None);
        queue.pause("games");
        assert!(!queue.timer_armed());

        queue.queue_write("game-2", markets("b"), None);
        assert!(!queue.timer_armed());
        assert_eq!(queue.flush().await, FlushOutcome::Skipped);

        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(writer.batch_count(), 0);

        assert!(queue.resume("games"));
        assert!(queue.timer_armed());
        tokio::time::sleep(Duration::from_secs(10)).await;

        assert_eq!(writer.batch_count(), 1);
        assert_eq!(writer.batches.lock()[0].len(), 2);
        assert!(!queue.timer_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_queue_stays_paused_until_every_pipeline_ends() {
        let writer = Arc::new(RecordingWriter::default());
        let queue = queue(writer.clone());

        queue.pause("games");
        queue.pause("crypto");
        queue.queue_write("game-1", markets("a"), None);

        assert!(!queue.resume("games"));
        assert!(queue.is_paused());
        assert!(!queue.resume("unknown"));
        assert!(queue.resume("crypto"));
        assert!(!queue.is_paused());
    }

    #[tokio::test(start_paused = true)]
    async fn test_resume_without_pending_work_arms_nothing() {
        let queue = queue(Arc::new(RecordingWriter::default()));
        queue.pause("games");
        assert!(!queue.resume("games"));
        assert!(!queue.timer_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_flush_requeues_and_backs_off() {
        let writer = Arc::new(RecordingWriter::failing(2));
        let queue = queue(writer.clone());

        queue.queue_write("game-1", markets("a"), None);
        assert_eq!(
            queue.flush().await,
            FlushOutcome::Retrying {
                attempt: 1,
                delay: Duration::from_secs(2)
            }
        );
        assert_eq!(queue.pending_len(), 1);
        assert!(queue.timer_armed());

        // Timer fires at 2s and fails again, re-arming at 4s
        tokio::time::sleep(Duration::from_millis(2100)).await;
        assert_eq!(writer.batch_count(), 0);
        assert!(queue.timer_armed());

        tokio::time::sleep(Duration::from_millis(4100)).await;
        assert_eq!(writer.batch_count(), 1);
        assert_eq!(queue.pending_len(), 0);
    }

    #[test]
    fn test_requeue_keeps_newer_writes() {
        let mut pending = BTreeMap::new();
        pending.insert(
            "game-1".to_string(),
            PendingWrite {
                game_id: "game-1".to_string(),
                markets: markets("newer"),
                queued_at: Utc::now(),
                view: None,
            },
        );
        let failed = vec![
            PendingWrite {
                game_id: "game-1".to_string(),
                markets: markets("older"),
                queued_at: Utc::now(),
                view: None,
            },
            PendingWrite {
                game_id: "game-2".to_string(),
                markets: markets("other"),
                queued_at: Utc::now(),
                view: None,
            },
        ];

        requeue(&mut pending, failed);
        assert_eq!(pending.len(), 2);
        assert_eq!(pending["game-1"].markets[0].outcomes[0].label, "newer");
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_flushes_unless_paused() {
        let writer = Arc::new(RecordingWriter::default());
        let queue = queue(writer.clone());

        queue.queue_write("game-1", markets("a"), None);
        queue.pause("games");
        assert_eq!(queue.shutdown().await, FlushOutcome::Skipped);
        assert_eq!(queue.pending_len(), 1);

        queue.resume("games");
        match queue.shutdown().await {
            FlushOutcome::Written(report) => assert_eq!(report.games_written, 1),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(!queue.timer_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_waits_for_in_flight_flush() {
        let writer = Arc::new(RecordingWriter::slow(Duration::from_millis(500)));
        let queue = queue(writer.clone());

        queue.queue_write("game-1", markets("a"), None);
        // Timer flush starts at 1s and holds the writer until 1.5s
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(queue.pending_len(), 0);

        queue.queue_write("game-2", markets("b"), None);
        assert!(!queue.timer_armed());

        match queue.shutdown().await {
            FlushOutcome::Written(report) => assert_eq!(report.games_written, 1),
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(queue.pending_len(), 0);

        let batches = writer.batches.lock();
        assert_eq!(batches.len(), 2);
        assert_eq!(batches[0][0].game_id, "game-1");
        assert_eq!(batches[1][0].game_id, "game-2");
        drop(batches);

        queue.queue_write("game-3", markets("c"), None);
        assert!(!queue.timer_armed());
    }
}
