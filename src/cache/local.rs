//! Local Tier - In-Process Cache
//!
//! Bounded LRU map with per-entry expiry. Expired entries are dropped lazily
//! when read.
//!
//! # Design
//!
//! - One `parking_lot::Mutex` around an `lru::LruCache`; never held across an await
//! - A put without TTL uses the tier's default TTL
//! - Capacity overflow evicts the least recently used entry

use std::collections::HashMap;
use std::marker::PhantomData;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use lru::LruCache;
use parking_lot::Mutex;
use tracing::{debug, trace};

use super::entry::CacheEntry;
use super::stats::CacheStats;
use crate::domain::ports::{CacheKey, CacheValue, Tier, TierManager, TierSettings};
use crate::error::{Error, Result};

/// Capacity used when the settings carry no limit
pub const DEFAULT_MAX_ENTRIES: usize = 10_000;

/// In-process cache tier
pub struct LocalTier<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    name: String,
    entries: Mutex<LruCache<K, CacheEntry<V>>>,
    default_ttl: Option<Duration>,
    stats: CacheStats,
}

impl<K, V> LocalTier<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub fn new(name: impl Into<String>, settings: &TierSettings) -> Result<Self> {
        let name = name.into();
        let max_entries = settings.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES);
        let capacity = NonZeroUsize::new(max_entries).ok_or_else(|| {
            Error::Config(format!("local tier '{}' needs a capacity of at least 1", name))
        })?;

        Ok(Self {
            name,
            entries: Mutex::new(LruCache::new(capacity)),
            default_ttl: settings.default_ttl,
            stats: CacheStats::new(),
        })
    }

    /// Number of resident entries, expired ones included
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }

    /// Returns true if `key` is resident and not expired, without touching LRU order
    pub fn contains(&self, key: &K) -> bool {
        self.entries
            .lock()
            .peek(key)
            .map(|e| !e.is_expired())
            .unwrap_or(false)
    }

    /// Tier-level hit/miss/eviction counters
    pub fn stats(&self) -> &CacheStats {
        &self.stats
    }

    fn insert(&self, entries: &mut LruCache<K, CacheEntry<V>>, key: &K, value: &V, ttl: Option<Duration>) {
        let entry = CacheEntry::with_optional_ttl(value.clone(), ttl.or(self.default_ttl));
        if let Some((evicted, _)) = entries.push(key.clone(), entry) {
            // push hands back the replaced entry too; only a different key is an eviction
            if &evicted != key {
                trace!(tier = %self.name, key = ?evicted, "Evicted");
                self.stats.record_eviction();
            }
        }
    }
}

#[async_trait]
impl<K, V> Tier<K, V> for LocalTier<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &K) -> Result<Option<V>> {
        let mut entries = self.entries.lock();

        let expired = match entries.get_mut(key) {
            Some(entry) if !entry.is_expired() => {
                entry.record_access();
                let value = entry.value().clone();
                self.stats.record_hit();
                return Ok(Some(value));
            }
            Some(_) => true,
            None => false,
        };

        if expired {
            entries.pop(key);
            self.stats.record_eviction();
        }
        self.stats.record_miss();
        Ok(None)
    }

    async fn put(&self, key: &K, value: &V, ttl: Option<Duration>) -> Result<()> {
        let mut entries = self.entries.lock();
        self.insert(&mut entries, key, value, ttl);
        Ok(())
    }

    async fn put_all(&self, batch: &HashMap<K, V>) -> Result<()> {
        let mut entries = self.entries.lock();
        for (key, value) in batch {
            self.insert(&mut entries, key, value, None);
        }
        Ok(())
    }

    async fn remove(&self, key: &K) -> Result<bool> {
        let removed = self.entries.lock().pop(key);
        Ok(removed.map(|e| !e.is_expired()).unwrap_or(false))
    }

    async fn clear(&self) -> Result<()> {
        self.entries.lock().clear();
        Ok(())
    }

    fn evictions(&self) -> u64 {
        self.stats.evictions()
    }
}

/// Registry of local tiers, keyed by tier name
pub struct LocalTierManager<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    tiers: DashMap<String, Arc<LocalTier<K, V>>>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> Default for LocalTierManager<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn default() -> Self {
        Self {
            tiers: DashMap::new(),
            _marker: PhantomData,
        }
    }
}

impl<K, V> LocalTierManager<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Concrete handle to a registered tier
    pub fn tier(&self, name: &str) -> Option<Arc<LocalTier<K, V>>> {
        self.tiers.get(name).map(|t| t.value().clone())
    }
}

impl<K, V> TierManager<K, V> for LocalTierManager<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn kind(&self) -> &'static str {
        "local"
    }

    fn create_tier(&self, name: &str, settings: &TierSettings) -> Result<Arc<dyn Tier<K, V>>> {
        if let Some(existing) = self.tiers.get(name) {
            return Ok(existing.value().clone());
        }

        let tier = self
            .tiers
            .entry(name.to_string())
            .or_try_insert_with(|| {
                debug!(tier = name, ?settings, "Creating local tier");
                LocalTier::new(name, settings).map(Arc::new)
            })?
            .value()
            .clone();
        Ok(tier)
    }

    fn remove_tier(&self, name: &str) -> bool {
        self.tiers.remove(name).is_some()
    }

    fn tier_names(&self) -> Vec<String> {
        self.tiers.iter().map(|t| t.key().clone()).collect()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    fn tier(max_entries: usize) -> LocalTier<String, u32> {
        LocalTier::new(
            "test:local",
            &TierSettings {
                max_entries: Some(max_entries),
                default_ttl: None,
            },
        )
        .unwrap()
    }

    fn key(s: &str) -> String {
        s.to_string()
    }

    #[tokio::test]
    async fn test_put_get_remove() {
        let tier = tier(10);

        assert_eq!(tier.get(&key("a")).await.unwrap(), None);
        tier.put(&key("a"), &1, None).await.unwrap();
        assert_eq!(tier.get(&key("a")).await.unwrap(), Some(1));

        assert!(tier.remove(&key("a")).await.unwrap());
        assert!(!tier.remove(&key("a")).await.unwrap());
        assert_eq!(tier.get(&key("a")).await.unwrap(), None);

        let stats = tier.stats().snapshot();
        assert_eq!(stats.hits, 1);
        assert_eq!(stats.misses, 2);
    }

    #[tokio::test]
    async fn test_lru_eviction() {
        let tier = tier(2);

        tier.put(&key("a"), &1, None).await.unwrap();
        tier.put(&key("b"), &2, None).await.unwrap();
        // Touch "a" so "b" is the least recently used
        tier.get(&key("a")).await.unwrap();
        tier.put(&key("c"), &3, None).await.unwrap();

        assert!(tier.contains(&key("a")));
        assert!(!tier.contains(&key("b")));
        assert!(tier.contains(&key("c")));
        assert_eq!(tier.stats().evictions(), 1);
    }

    #[tokio::test]
    async fn test_overwrite_is_not_eviction() {
        let tier = tier(2);

        tier.put(&key("a"), &1, None).await.unwrap();
        tier.put(&key("a"), &2, None).await.unwrap();

        assert_eq!(tier.get(&key("a")).await.unwrap(), Some(2));
        assert_eq!(tier.stats().evictions(), 0);
        assert_eq!(tier.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_entry_ttl_overrides_default() {
        let tier: LocalTier<String, u32> = LocalTier::new(
            "ttl",
            &TierSettings {
                max_entries: Some(10),
                default_ttl: Some(Duration::from_secs(60)),
            },
        )
        .unwrap();

        tier.put(&key("short"), &1, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        tier.put(&key("default"), &2, None).await.unwrap();

        tokio::time::advance(Duration::from_secs(2)).await;

        assert_eq!(tier.get(&key("short")).await.unwrap(), None);
        assert_eq!(tier.get(&key("default")).await.unwrap(), Some(2));
        assert_eq!(tier.stats().evictions(), 1);

        tokio::time::advance(Duration::from_secs(60)).await;
        assert_eq!(tier.get(&key("default")).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_put_all_and_clear() {
        let tier = tier(10);
        let batch: HashMap<String, u32> = [(key("a"), 1), (key("b"), 2)].into_iter().collect();

        tier.put_all(&batch).await.unwrap();
        assert_eq!(tier.len(), 2);

        tier.clear().await.unwrap();
        assert!(tier.is_empty());
    }

    #[test]
    fn test_zero_capacity_is_rejected() {
        let result: Result<LocalTier<String, u32>> = LocalTier::new(
            "bad",
            &TierSettings {
                max_entries: Some(0),
                default_ttl: None,
            },
        );
        assert_matches!(result.err(), Some(Error::Config(_)));
    }

    #[tokio::test]
    async fn test_manager_get_or_create() {
        let manager: LocalTierManager<String, u32> = LocalTierManager::new();
        let settings = TierSettings::default();

        let first = manager.create_tier("users:local", &settings).unwrap();
        let second = manager.create_tier("users:local", &settings).unwrap();

        first.put(&key("a"), &1, None).await.unwrap();
        assert_eq!(second.get(&key("a")).await.unwrap(), Some(1));
        assert_eq!(manager.tier_names(), vec!["users:local".to_string()]);
        assert_eq!(
            manager.tier("users:local").unwrap().capacity(),
            DEFAULT_MAX_ENTRIES
        );

        assert!(manager.remove_tier("users:local"));
        assert!(!manager.remove_tier("users:local"));
        assert!(manager.tier_names().is_empty());
    }
}
