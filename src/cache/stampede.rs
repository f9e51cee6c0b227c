//! Stampede Protection
//!
//! On a miss only the instance holding the load lock runs the loader; the
//! others back off briefly and re-read once.
//!
//! ```text
//! miss ─→ try_lock(load key, lock_timeout)
//!           ├─ acquired: re-check tiers ─hit→ Found
//!           │                          └miss→ run loader, store → Loaded
//!           └─ busy:     sleep(lock_backoff), re-read ─hit→ Found
//!                                                    └miss→ Absent
//! ```

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::future::BoxFuture;
use futures::FutureExt;
use tracing::debug;

use super::stats::{CacheStats, LatencyTracker};
use super::strategy::ConsistencyStrategy;
use crate::domain::ports::{CacheKey, CacheValue, DistributedLock, DistributedLockExt, Loader};
use crate::error::Result;

/// How a guarded load ended.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome<V> {
    /// This caller ran the loader (and stored the value if there was one)
    Loaded(Option<V>),
    /// The value was already cached, possibly stored by a concurrent loader
    Found(V),
    /// Another caller held the lock and nothing was cached after the backoff
    Absent,
}

impl<V> LoadOutcome<V> {
    pub fn into_value(self) -> Option<V> {
        match self {
            LoadOutcome::Loaded(value) => value,
            LoadOutcome::Found(value) => Some(value),
            LoadOutcome::Absent => None,
        }
    }
}

/// Wraps a loader so its runs are timed into `stats` and observable by the caller.
pub(crate) fn instrument<'a, K, V>(
    loader: Loader<'a, K, V>,
    stats: Option<Arc<CacheStats>>,
) -> (Loader<'a, K, V>, Arc<AtomicBool>)
where
    K: CacheKey,
    V: CacheValue,
{
    let ran = Arc::new(AtomicBool::new(false));
    let flag = ran.clone();

    let wrapped: Loader<'a, K, V> = Box::new(
        move |key: K| -> BoxFuture<'a, anyhow::Result<Option<V>>> {
            flag.store(true, Ordering::SeqCst);
            let load = loader(key);
            async move {
                let tracker = LatencyTracker::start();
                let result = load.await;
                if let Some(stats) = stats {
                    match &result {
                        Ok(Some(_)) => stats.record_load_success(tracker.elapsed()),
                        _ => stats.record_load_failure(tracker.elapsed()),
                    }
                }
                result
            }
            .boxed()
        },
    );
    (wrapped, ran)
}

/// Lock-guarded, double-checked load around a strategy.
pub(crate) struct StampedeGuard<'c, K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub strategy: &'c dyn ConsistencyStrategy<K, V>,
    pub lock: &'c dyn DistributedLock,
    pub lock_timeout: Duration,
    pub backoff: Duration,
}

impl<'c, K, V> StampedeGuard<'c, K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub async fn load<'a>(
        &self,
        lock_key: &str,
        key: &K,
        loader: Loader<'a, K, V>,
        ran: &AtomicBool,
        ttl: Option<Duration>,
    ) -> Result<LoadOutcome<V>> {
        let mut loaded = None;

        let acquired = self
            .lock
            .try_lock_and_run(lock_key, self.lock_timeout, || async {
                // compute_if_absent re-reads first, so a value stored while we
                // waited for the lock is returned without loading
                loaded = Some(self.strategy.compute_if_absent(key, loader, ttl).await);
            })
            .await;

        if acquired {
            let value = match loaded {
                Some(result) => result?,
                None => None,
            };
            return Ok(match value {
                Some(value) if !ran.load(Ordering::SeqCst) => LoadOutcome::Found(value),
                value => LoadOutcome::Loaded(value),
            });
        }

        debug!(lock_key, backoff_ms = self.backoff.as_millis() as u64, "Load lock busy, backing off");
        tokio::time::sleep(self.backoff).await;

        Ok(match self.strategy.get(key).await {
            Some(value) => LoadOutcome::Found(value),
            None => LoadOutcome::Absent,
        })
    }
}
