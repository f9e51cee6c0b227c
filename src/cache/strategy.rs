//! Consistency Strategies
//!
//! A strategy owns the ordered tier list of one cache (index 0 nearest, last
//! = shared remote tier) and decides how reads, writes and inbound events
//! move through it.
//!
//! # Write-through
//!
//! ```text
//! get:    L1 ─miss→ L2 ─miss→ … Ln      first hit wins, nearer tiers backfilled
//! put:    Ln ← … ← L2 ← L1               farthest first, nearest last
//! event:  L1 … Ln-1 invalidated          Ln (shared) never touched
//! ```
//!
//! Tier failures never escape: they are logged and the tier is skipped.
//! Only loader errors propagate.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, trace, warn};

use super::config::ConsistencyMode;
use crate::domain::events::{CacheEvent, CacheEventType};
use crate::domain::ports::{CacheKey, CacheValue, Loader, Tier};
use crate::error::{Error, Result};

/// Minimum number of tiers in a multi-level cache
pub const MIN_TIERS: usize = 2;

/// Read/write policy over an ordered list of tiers.
#[async_trait]
pub trait ConsistencyStrategy<K, V>: Send + Sync
where
    K: CacheKey,
    V: CacheValue,
{
    fn mode(&self) -> ConsistencyMode;

    fn tiers(&self) -> &[Arc<dyn Tier<K, V>>];

    async fn get(&self, key: &K) -> Option<V>;

    async fn put(&self, key: &K, value: &V, ttl: Option<Duration>);

    async fn put_all(&self, entries: &HashMap<K, V>);

    /// Returns true if any tier held the key.
    async fn remove(&self, key: &K) -> bool;

    async fn clear(&self);

    /// Return the cached value, or load, store and return it.
    ///
    /// Concurrent callers are not deduplicated here.
    async fn compute_if_absent<'a>(
        &self,
        key: &K,
        loader: Loader<'a, K, V>,
        ttl: Option<Duration>,
    ) -> Result<Option<V>>;

    /// Apply an event published by another instance.
    async fn handle_cache_update(&self, event: &CacheEvent);
}

/// Build the strategy for `mode`.
pub fn create_strategy<K, V>(
    mode: ConsistencyMode,
    cache_name: &str,
    tiers: Vec<Arc<dyn Tier<K, V>>>,
) -> Result<Box<dyn ConsistencyStrategy<K, V>>>
where
    K: CacheKey,
    V: CacheValue,
{
    match mode {
        ConsistencyMode::WriteThrough => Ok(Box::new(WriteThroughStrategy::new(cache_name, tiers)?)),
    }
}

/// Synchronous write to every tier, read from the nearest tier holding the key.
pub struct WriteThroughStrategy<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    cache_name: String,
    tiers: Vec<Arc<dyn Tier<K, V>>>,
}

impl<K, V> WriteThroughStrategy<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub fn new(cache_name: impl Into<String>, tiers: Vec<Arc<dyn Tier<K, V>>>) -> Result<Self> {
        let cache_name = cache_name.into();
        if tiers.len() < MIN_TIERS {
            return Err(Error::Config(format!(
                "cache '{}' needs at least {} tiers, got {}",
                cache_name,
                MIN_TIERS,
                tiers.len()
            )));
        }
        Ok(Self { cache_name, tiers })
    }

    /// Every tier except the shared one
    fn near_tiers(&self) -> &[Arc<dyn Tier<K, V>>] {
        &self.tiers[..self.tiers.len() - 1]
    }

    async fn backfill(&self, key: &K, value: &V, depth: usize) {
        for tier in self.tiers[..depth].iter().rev() {
            if let Err(e) = tier.put(key, value, None).await {
                warn!(cache = %self.cache_name, tier = tier.name(), error = %e, "Backfill failed");
            }
        }
        trace!(cache = %self.cache_name, ?key, depth, "Backfilled");
    }

    async fn invalidate_near(&self, key: &K) {
        for tier in self.near_tiers().iter().rev() {
            if let Err(e) = tier.remove(key).await {
                warn!(cache = %self.cache_name, tier = tier.name(), error = %e, "Invalidation failed");
            }
        }
    }

    async fn clear_near(&self) {
        for tier in self.near_tiers().iter().rev() {
            if let Err(e) = tier.clear().await {
                warn!(cache = %self.cache_name, tier = tier.name(), error = %e, "Clear failed");
            }
        }
    }
}

#[async_trait]
impl<K, V> ConsistencyStrategy<K, V> for WriteThroughStrategy<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn mode(&self) -> ConsistencyMode {
        ConsistencyMode::WriteThrough
    }

    fn tiers(&self) -> &[Arc<dyn Tier<K, V>>] {
        &self.tiers
    }

    async fn get(&self, key: &K) -> Option<V> {
        for (depth, tier) in self.tiers.iter().enumerate() {
            match tier.get(key).await {
                Ok(Some(value)) => {
                    if depth > 0 {
                        self.backfill(key, &value, depth).await;
                    }
                    return Some(value);
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(cache = %self.cache_name, tier = tier.name(), error = %e, "Read failed, treating as miss");
                }
            }
        }
        None
    }

    async fn put(&self, key: &K, value: &V, ttl: Option<Duration>) {
        for tier in self.tiers.iter().rev() {
            if let Err(e) = tier.put(key, value, ttl).await {
                warn!(cache = %self.cache_name, tier = tier.name(), error = %e, "Write failed");
            }
        }
    }

    async fn put_all(&self, entries: &HashMap<K, V>) {
        if entries.is_empty() {
            return;
        }
        for tier in self.tiers.iter().rev() {
            if let Err(e) = tier.put_all(entries).await {
                warn!(
                    cache = %self.cache_name,
                    tier = tier.name(),
                    entries = entries.len(),
                    error = %e,
                    "Batch write failed"
                );
            }
        }
    }

    async fn remove(&self, key: &K) -> bool {
        let mut removed = false;
        for tier in self.tiers.iter().rev() {
            match tier.remove(key).await {
                Ok(hit) => removed |= hit,
                Err(e) => {
                    warn!(cache = %self.cache_name, tier = tier.name(), error = %e, "Remove failed");
                }
            }
        }
        removed
    }

    async fn clear(&self) {
        for tier in self.tiers.iter().rev() {
            if let Err(e) = tier.clear().await {
                warn!(cache = %self.cache_name, tier = tier.name(), error = %e, "Clear failed");
            }
        }
    }

    async fn compute_if_absent<'a>(
        &self,
        key: &K,
        loader: Loader<'a, K, V>,
        ttl: Option<Duration>,
    ) -> Result<Option<V>> {
        if let Some(value) = self.get(key).await {
            return Ok(Some(value));
        }

        let loaded = loader(key.clone())
            .await
            .map_err(|source| Error::LoadFailed {
                key: format!("{:?}", key),
                source,
            })?;

        if let Some(value) = &loaded {
            self.put(key, value, ttl).await;
        }
        Ok(loaded)
    }

    async fn handle_cache_update(&self, event: &CacheEvent) {
        match event.event_type() {
            CacheEventType::Clear => {
                debug!(cache = %self.cache_name, "Clearing near tiers on peer clear");
                self.clear_near().await;
            }
            CacheEventType::Put | CacheEventType::Remove => {
                let key = match event.decode_key::<K>() {
                    Ok(Some(key)) => key,
                    Ok(None) => {
                        warn!(cache = %self.cache_name, event_type = %event.event_type(), "Event without key");
                        return;
                    }
                    Err(e) => {
                        warn!(cache = %self.cache_name, error = %e, "Undecodable event key");
                        return;
                    }
                };
                debug!(cache = %self.cache_name, ?key, event_type = %event.event_type(), "Invalidating near tiers");
                self.invalidate_near(&key).await;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
