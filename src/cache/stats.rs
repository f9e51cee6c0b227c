//! Cache Statistics
//!
//! Lock-free counters for hits, misses, loads and evictions.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Per-cache statistics collector
#[derive(Debug, Default)]
pub struct CacheStats {
    hits: AtomicU64,
    misses: AtomicU64,
    loads: AtomicU64,
    load_successes: AtomicU64,
    load_failures: AtomicU64,
    evictions: AtomicU64,
    // Nanoseconds spent in loaders
    total_load_time_ns: AtomicU64,
}

impl CacheStats {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_eviction(&self) {
        self.evictions.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_load_success(&self, load_time: Duration) {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.load_successes.fetch_add(1, Ordering::Relaxed);
        self.add_load_time(load_time);
    }

    pub fn record_load_failure(&self, load_time: Duration) {
        self.loads.fetch_add(1, Ordering::Relaxed);
        self.load_failures.fetch_add(1, Ordering::Relaxed);
        self.add_load_time(load_time);
    }

    fn add_load_time(&self, load_time: Duration) {
        let ns = u64::try_from(load_time.as_nanos()).unwrap_or(u64::MAX);
        self.total_load_time_ns.fetch_add(ns, Ordering::Relaxed);
    }

    pub fn hits(&self) -> u64 {
        self.hits.load(Ordering::Relaxed)
    }

    pub fn misses(&self) -> u64 {
        self.misses.load(Ordering::Relaxed)
    }

    pub fn loads(&self) -> u64 {
        self.loads.load(Ordering::Relaxed)
    }

    pub fn evictions(&self) -> u64 {
        self.evictions.load(Ordering::Relaxed)
    }

    /// Get snapshot of all counters
    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            hits: self.hits(),
            misses: self.misses(),
            loads: self.loads(),
            load_successes: self.load_successes.load(Ordering::Relaxed),
            load_failures: self.load_failures.load(Ordering::Relaxed),
            evictions: self.evictions(),
            total_load_time: Duration::from_nanos(self.total_load_time_ns.load(Ordering::Relaxed)),
        }
    }

    /// Reset all counters
    pub fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
        self.loads.store(0, Ordering::Relaxed);
        self.load_successes.store(0, Ordering::Relaxed);
        self.load_failures.store(0, Ordering::Relaxed);
        self.evictions.store(0, Ordering::Relaxed);
        self.total_load_time_ns.store(0, Ordering::Relaxed);
    }
}

/// Point-in-time copy of [`CacheStats`]
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSnapshot {
    pub hits: u64,
    pub misses: u64,
    pub loads: u64,
    pub load_successes: u64,
    pub load_failures: u64,
    pub evictions: u64,
    pub total_load_time: Duration,
}

impl StatsSnapshot {
    pub fn request_count(&self) -> u64 {
        self.hits + self.misses
    }

    /// Hit rate in [0, 1]. A cache that served nothing counts as 1.0.
    pub fn hit_rate(&self) -> f64 {
        let requests = self.request_count();
        if requests == 0 {
            1.0
        } else {
            self.hits as f64 / requests as f64
        }
    }

    /// Share of loads that succeeded. 1.0 when nothing was loaded.
    pub fn load_success_rate(&self) -> f64 {
        if self.loads == 0 {
            1.0
        } else {
            self.load_successes as f64 / self.loads as f64
        }
    }

    pub fn avg_load_time(&self) -> Duration {
        if self.loads == 0 {
            Duration::ZERO
        } else {
            let avg = self.total_load_time.as_nanos() / u128::from(self.loads);
            Duration::from_nanos(u64::try_from(avg).unwrap_or(u64::MAX))
        }
    }
}

/// Latency tracker helper
pub struct LatencyTracker {
    start: Instant,
}

impl LatencyTracker {
    /// Start tracking latency
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    /// Get elapsed duration
    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }
}

// =============================================================================
// Tests
// =============================================================================
