//! Multi-Level Cache
//!
//! The object callers use. Binds one named cache's tiers, strategy, notifier
//! and lock. Reads and writes go through the strategy; every successful
//! mutation is then announced to other instances.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, trace, warn};

use super::config::CacheConfig;
use super::stampede::{instrument, LoadOutcome, StampedeGuard};
use super::stats::{CacheStats, StatsSnapshot};
use super::strategy::{create_strategy, ConsistencyStrategy};
use crate::domain::events::{CacheEvent, InstanceId};
use crate::domain::ports::{
    CacheEventListener, CacheKey, CacheNotifier, CacheValue, DistributedLock, DistributedLockExt,
    Loader, Tier,
};
use crate::error::Result;

/// A named cache over an ordered chain of tiers.
pub struct MultiLevelCache<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    name: String,
    config: CacheConfig,
    strategy: Box<dyn ConsistencyStrategy<K, V>>,
    notifier: Arc<dyn CacheNotifier>,
    lock: Arc<dyn DistributedLock>,
    instance_id: InstanceId,
    stats: Arc<CacheStats>,
    /// Tier eviction total at the last `reset_stats`
    eviction_baseline: AtomicU64,
}

impl<K, V> MultiLevelCache<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    /// Build a cache over `tiers` (nearest first, at least two).
    ///
    /// The cache takes its instance id from `notifier`, so events it
    /// publishes are recognised as its own when they come back.
    pub fn new(
        name: impl Into<String>,
        config: CacheConfig,
        tiers: Vec<Arc<dyn Tier<K, V>>>,
        notifier: Arc<dyn CacheNotifier>,
        lock: Arc<dyn DistributedLock>,
    ) -> Result<Self> {
        let name = name.into();
        config.validate()?;
        let strategy = create_strategy(config.consistency, &name, tiers)?;
        let instance_id = notifier.instance_id().clone();

        debug!(
            cache = %name,
            mode = %config.consistency,
            tiers = strategy.tiers().len(),
            instance_id = %instance_id,
            "Multi-level cache created"
        );

        Ok(Self {
            name,
            config,
            strategy,
            notifier,
            lock,
            instance_id,
            stats: Arc::new(CacheStats::new()),
            eviction_baseline: AtomicU64::new(0),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    pub fn tiers(&self) -> &[Arc<dyn Tier<K, V>>] {
        self.strategy.tiers()
    }

    /// Counters of this cache. Evictions are summed over its tiers.
    pub fn stats(&self) -> StatsSnapshot {
        let mut snapshot = self.stats.snapshot();
        if self.config.stats_enabled {
            let baseline = self.eviction_baseline.load(Ordering::Relaxed);
            snapshot.evictions += self.tier_evictions().saturating_sub(baseline);
        }
        snapshot
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
        self.eviction_baseline.store(self.tier_evictions(), Ordering::Relaxed);
    }

    fn tier_evictions(&self) -> u64 {
        self.strategy.tiers().iter().map(|t| t.evictions()).sum()
    }

    // =========================================================================
    // Reads
    // =========================================================================

    pub async fn get(&self, key: &K) -> Option<V> {
        let value = self.strategy.get(key).await;
        self.record_lookup(value.is_some());
        value
    }

    /// Look up several keys, skipping absent ones.
    pub async fn get_all(&self, keys: &[K]) -> HashMap<K, V> {
        let mut found = HashMap::with_capacity(keys.len());
        for key in keys {
            if let Some(value) = self.get(key).await {
                found.insert(key.clone(), value);
            }
        }
        found
    }

    pub async fn compute_if_absent<'a>(
        &self,
        key: &K,
        loader: Loader<'a, K, V>,
    ) -> Result<Option<V>> {
        self.compute_if_absent_with_ttl(key, loader, None).await
    }

    /// Return the cached value or load it.
    ///
    /// With `penetration_protect` only one caller across all instances
    /// sharing the lock runs the loader for a key at a time; the others
    /// wait `lock_backoff` and re-read.
    pub async fn compute_if_absent_with_ttl<'a>(
        &self,
        key: &K,
        loader: Loader<'a, K, V>,
        ttl: Option<Duration>,
    ) -> Result<Option<V>> {
        let stats = self.config.stats_enabled.then(|| self.stats.clone());
        let (loader, ran) = instrument(loader, stats);

        let outcome = if self.config.penetration_protect {
            if let Some(value) = self.strategy.get(key).await {
                self.record_lookup(true);
                return Ok(Some(value));
            }
            self.record_lookup(false);

            let guard = StampedeGuard {
                strategy: self.strategy.as_ref(),
                lock: self.lock.as_ref(),
                lock_timeout: self.config.lock_timeout,
                backoff: self.config.lock_backoff,
            };
            guard
                .load(&self.lock_key("load", key), key, loader, &ran, ttl)
                .await?
        } else {
            let result = self.strategy.compute_if_absent(key, loader, ttl).await;
            let loaded = ran.load(Ordering::SeqCst);
            self.record_lookup(!loaded);
            match result? {
                value if loaded => LoadOutcome::Loaded(value),
                Some(value) => LoadOutcome::Found(value),
                None => LoadOutcome::Absent,
            }
        };

        if let LoadOutcome::Loaded(Some(_)) = &outcome {
            self.announce_put(key).await;
        }
        Ok(outcome.into_value())
    }

    // =========================================================================
    // Writes
    // =========================================================================

    pub async fn put(&self, key: &K, value: &V) {
        self.put_with_ttl(key, value, None).await;
    }

    pub async fn put_with_ttl(&self, key: &K, value: &V, ttl: Option<Duration>) {
        self.strategy.put(key, value, ttl).await;
        self.announce_put(key).await;
    }

    pub async fn put_all(&self, entries: &HashMap<K, V>) {
        if entries.is_empty() {
            return;
        }
        self.strategy.put_all(entries).await;
        for key in entries.keys() {
            self.announce_put(key).await;
        }
    }

    /// Best-effort bulk load; returns the number of entries submitted.
    pub async fn warm_up(&self, entries: HashMap<K, V>) -> usize {
        let count = entries.len();
        self.put_all(&entries).await;
        debug!(cache = %self.name, entries = count, "Warm-up complete");
        count
    }

    /// Returns true if any tier held the key.
    pub async fn remove(&self, key: &K) -> bool {
        let removed = self.strategy.remove(key).await;
        if let Some(key) = self.key_value(key) {
            if let Err(e) = self.notifier.notify_remove(&self.name, key).await {
                warn!(cache = %self.name, error = %e, "Failed to publish remove event");
            }
        }
        removed
    }

    pub async fn clear(&self) {
        self.strategy.clear().await;
        if let Err(e) = self.notifier.notify_clear(&self.name).await {
            warn!(cache = %self.name, error = %e, "Failed to publish clear event");
        }
    }

    // =========================================================================
    // Locking
    // =========================================================================

    pub async fn try_lock(&self, key: &K, timeout: Duration) -> bool {
        self.lock.try_lock(&self.lock_key("lock", key), timeout).await
    }

    pub async fn unlock(&self, key: &K) {
        self.lock.unlock(&self.lock_key("lock", key)).await;
    }

    /// Run `action` while holding the lock of `key`.
    pub async fn try_lock_and_run<F, Fut>(&self, key: &K, timeout: Duration, action: F) -> bool
    where
        F: FnOnce() -> Fut + Send,
        Fut: std::future::Future<Output = ()> + Send,
    {
        let lock_key = self.lock_key("lock", key);
        self.lock.try_lock_and_run(&lock_key, timeout, action).await
    }

    // =========================================================================
    // Inbound events
    // =========================================================================

    /// Apply an event from another instance to the near tiers.
    pub async fn handle_cache_update(&self, event: &CacheEvent) {
        if event.is_from(&self.instance_id) {
            trace!(cache = %self.name, "Ignoring own event");
            return;
        }
        if event.cache_name() != self.name {
            trace!(cache = %self.name, other = event.cache_name(), "Ignoring event for another cache");
            return;
        }
        self.strategy.handle_cache_update(event).await;
    }

    // =========================================================================
    // Helpers
    // =========================================================================

    fn record_lookup(&self, hit: bool) {
        if !self.config.stats_enabled {
            return;
        }
        if hit {
            self.stats.record_hit();
        } else {
            self.stats.record_miss();
        }
    }

    async fn announce_put(&self, key: &K) {
        if let Some(key) = self.key_value(key) {
            if let Err(e) = self.notifier.notify_update(&self.name, key).await {
                warn!(cache = %self.name, error = %e, "Failed to publish put event");
            }
        }
    }

    fn key_value(&self, key: &K) -> Option<serde_json::Value> {
        match serde_json::to_value(key) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(cache = %self.name, ?key, error = %e, "Key is not JSON-encodable, event not published");
                None
            }
        }
    }

    fn lock_key(&self, scope: &str, key: &K) -> String {
        format!("{}:{}:{}", self.name, scope, key_token(key))
    }
}

fn key_token<K: Serialize + std::fmt::Debug>(key: &K) -> String {
    serde_json::to_string(key).unwrap_or_else(|_| format!("{:?}", key))
}

#[async_trait]
impl<K, V> CacheEventListener for MultiLevelCache<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    async fn on_event(&self, event: CacheEvent) {
        self.handle_cache_update(&event).await;
    }
}

impl<K, V> std::fmt::Debug for MultiLevelCache<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiLevelCache")
            .field("name", &self.name)
            .field("mode", &self.strategy.mode())
            .field("tiers", &self.strategy.tiers().iter().map(|t| t.name()).collect::<Vec<_>>())
            .field("instance_id", &self.instance_id)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
