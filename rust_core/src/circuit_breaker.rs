//! Circuit breaker for the shared cache connection.
//!
//! This module provides:
//! - Rolling-window counting of connection close events
//! - Degraded mode once the window holds `threshold` closes
//! - Recovery only on a "ready" event observed after `ready_stability`
//!   without further closes
//!
//! All transitions take an explicit `Instant` (`*_at` methods) so the state
//! machine can be driven without real time.

use crate::config::{parse_env, parse_secs};
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, Instant};

/// Circuit breaker configuration
#[derive(Debug, Clone)]
pub struct BreakerConfig {
    /// Rolling window for close events
    pub window: Duration,
    /// Close events inside the window that trip the breaker
    pub threshold: u32,
    /// Quiet period required before a ready event re-enables the remote store
    pub ready_stability: Duration,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(30),
            threshold: 10,
            ready_stability: Duration::from_secs(5),
        }
    }
}

impl BreakerConfig {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        Ok(Self {
            window: parse_secs("CACHE_BREAKER_WINDOW_SECS", defaults.window)?,
            threshold: parse_env("CACHE_BREAKER_THRESHOLD", defaults.threshold)?,
            ready_stability: parse_secs(
                "CACHE_BREAKER_READY_STABILITY_SECS",
                defaults.ready_stability,
            )?,
        })
    }
}

/// Snapshot for heartbeats and logs
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BreakerStatus {
    pub degraded: bool,
    pub closes_in_window: usize,
    pub trips: u64,
}

#[derive(Debug, Default)]
struct BreakerState {
    closes: VecDeque<Instant>,
    last_close: Option<Instant>,
    degraded: bool,
    trips: u64,
}

/// Demotes the remote store to process memory under connection churn
pub struct ConnectionBreaker {
    name: String,
    config: BreakerConfig,
    state: Mutex<BreakerState>,
}

impl ConnectionBreaker {
    pub fn new(name: &str, config: BreakerConfig) -> Self {
        Self {
            name: name.to_string(),
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Whether callers may use the remote store
    pub fn allows_remote(&self) -> bool {
        !self.state.lock().degraded
    }

    pub fn is_degraded(&self) -> bool {
        self.state.lock().degraded
    }

    pub fn record_close(&self) -> bool {
        self.record_close_at(Instant::now())
    }

    /// Record a connection close. Returns true if this event tripped the breaker.
    pub fn record_close_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        state.closes.push_back(now);
        state.last_close = Some(now);
        Self::prune(&mut state.closes, now, self.config.window);

        if !state.degraded && state.closes.len() >= self.config.threshold as usize {
            state.degraded = true;
            state.trips += 1;
            tracing::warn!(
                "Circuit breaker '{}' OPENED: {} connection closes within {:?}, using process memory",
                self.name,
                state.closes.len(),
                self.config.window
            );
            return true;
        }
        false
    }

    pub fn record_ready(&self) -> bool {
        self.record_ready_at(Instant::now())
    }

    /// Record a "ready" event. Clears degraded mode and the close window only
    /// when no close happened within `ready_stability`. Returns true on recovery.
    pub fn record_ready_at(&self, now: Instant) -> bool {
        let mut state = self.state.lock();
        if !state.degraded {
            return false;
        }

        let stable = state
            .last_close
            .map(|t| now.saturating_duration_since(t) >= self.config.ready_stability)
            .unwrap_or(true);
        if !stable {
            tracing::debug!(
                "Circuit breaker '{}' ready event ignored, connection not yet stable",
                self.name
            );
            return false;
        }

        state.degraded = false;
        state.closes.clear();
        tracing::info!(
            "Circuit breaker '{}' closed after stable ready, remote store re-enabled",
            self.name
        );
        true
    }

    pub fn status(&self) -> BreakerStatus {
        self.status_at(Instant::now())
    }

    pub fn status_at(&self, now: Instant) -> BreakerStatus {
        let mut state = self.state.lock();
        Self::prune(&mut state.closes, now, self.config.window);
        BreakerStatus {
            degraded: state.degraded,
            closes_in_window: state.closes.len(),
            trips: state.trips,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    fn prune(closes: &mut VecDeque<Instant>, now: Instant, window: Duration) {
        while let Some(front) = closes.front() {
            if now.saturating_duration_since(*front) > window {
                closes.pop_front();
            } else {
                break;
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================
