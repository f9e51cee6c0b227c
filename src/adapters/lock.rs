//! In-Process Lock
//!
//! [`DistributedLock`] backed by a concurrent map of lease deadlines. It only
//! excludes tasks of the same process; deployments with several processes use
//! the Redis lock instead.

use std::time::Duration;

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::trace;

use crate::domain::ports::DistributedLock;

/// Default lease after which an unreleased lock expires.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(30);

const POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Lease-based lock for a single process.
#[derive(Debug)]
pub struct LocalLock {
    leases: DashMap<String, Instant>,
    lease: Duration,
}

impl Default for LocalLock {
    fn default() -> Self {
        Self::new(DEFAULT_LEASE)
    }
}

impl LocalLock {
    pub fn new(lease: Duration) -> Self {
        Self {
            leases: DashMap::new(),
            lease,
        }
    }

    /// Returns true if `key` is currently held by someone.
    pub fn is_locked(&self, key: &str) -> bool {
        self.leases
            .get(key)
            .map(|deadline| *deadline > Instant::now())
            .unwrap_or(false)
    }

    fn acquire_once(&self, key: &str) -> bool {
        let now = Instant::now();
        match self.leases.entry(key.to_string()) {
            Entry::Occupied(mut held) => {
                if *held.get() <= now {
                    // Previous holder's lease ran out
                    held.insert(now + self.lease);
                    true
                } else {
                    false
                }
            }
            Entry::Vacant(free) => {
                free.insert(now + self.lease);
                true
            }
        }
    }
}

#[async_trait]
impl DistributedLock for LocalLock {
    async fn try_lock(&self, key: &str, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if self.acquire_once(key) {
                trace!(key, "Lock acquired");
                return true;
            }
            let now = Instant::now();
            if now >= deadline {
                trace!(key, "Lock wait timed out");
                return false;
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn unlock(&self, key: &str) {
        if self.leases.remove(key).is_some() {
            trace!(key, "Lock released");
        }
    }
}
