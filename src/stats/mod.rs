//! Datapath statistics.
//!
//! Update methods are relaxed atomics safe for concurrent sessions; the
//! snapshot path reads without locking and tolerates inter-field skew by
//! construction. Stats failures never propagate into the datapath.

pub mod control;

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use serde::Serialize;

/// Point-in-time view of the counters.
///
/// `qps` is queries over the elapsed window, `block_rate` is
/// blocked/total (0.0 when no queries yet), `captured_at_ms` is Unix epoch
/// milliseconds.
#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub total_connections: u64,
    pub active_sessions: u64,
    pub total_queries: u64,
    pub blocked_queries: u64,
    pub qps: f64,
    pub block_rate: f64,
    pub captured_at_ms: i64,
}

pub struct StatsCollector {
    total_connections: AtomicU64,
    active_sessions: AtomicU64,
    total_queries: AtomicU64,
    blocked_queries: AtomicU64,
    window_queries: AtomicU64,
    window_start: Instant,
}

impl StatsCollector {
    pub fn new() -> Self {
        Self {
            total_connections: AtomicU64::new(0),
            active_sessions: AtomicU64::new(0),
            total_queries: AtomicU64::new(0),
            blocked_queries: AtomicU64::new(0),
            window_queries: AtomicU64::new(0),
            window_start: Instant::now(),
        }
    }

    pub fn on_connection_open(&self) {
        self.total_connections.fetch_add(1, Ordering::Relaxed);
        self.active_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Underflow-guarded: a stray double-close clamps at zero instead of
    /// wrapping.
    pub fn on_connection_close(&self) {
        let _ = self
            .active_sessions
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn on_query(&self, blocked: bool) {
        self.total_queries.fetch_add(1, Ordering::Relaxed);
        self.window_queries.fetch_add(1, Ordering::Relaxed);
        if blocked {
            self.blocked_queries.fetch_add(1, Ordering::Relaxed);
        }
    }

    pub fn active_sessions(&self) -> u64 {
        self.active_sessions.load(Ordering::Relaxed)
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        let total_connections = self.total_connections.load(Ordering::Relaxed);
        let active_sessions = self.active_sessions.load(Ordering::Relaxed);
        let total_queries = self.total_queries.load(Ordering::Relaxed);
        let blocked_queries = self.blocked_queries.load(Ordering::Relaxed);
        let window_queries = self.window_queries.load(Ordering::Relaxed);

        let elapsed = self.window_start.elapsed().as_secs_f64();
        let qps = if elapsed > 0.0 {
            window_queries as f64 / elapsed
        } else {
            0.0
        };
        let block_rate = if total_queries > 0 {
            blocked_queries as f64 / total_queries as f64
        } else {
            0.0
        };

        StatsSnapshot {
            total_connections,
            active_sessions,
            total_queries,
            blocked_queries,
            qps,
            block_rate,
            captured_at_ms: chrono::Utc::now().timestamp_millis(),
        }
    }
}

impl Default for StatsCollector {
    fn default() -> Self {
        Self::new()
    }
}
