//! Cache Manager - Registry of Multi-Level Caches
//!
//! Creates named caches from a local and a remote tier manager, subscribes
//! them to the invalidation channel and routes inbound events by cache name.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────┐
//! │                 MultiLevelCacheManager                   │
//! │   create / get_or_create / remove (name-scoped locks)    │
//! │                          │                               │
//! │        ┌─────────────────┼──────────────────┐            │
//! │        ▼                 ▼                  ▼            │
//! │  local TierManager  remote TierManager   EventRouter ◄── notifier
//! │   "{name}:local"     "{name}:remote"    name → cache     │
//! └──────────────────────────────────────────────────────────┘
//! ```

use std::sync::Arc;

use async_trait::async_trait;
use dashmap::DashMap;
use tracing::{debug, info, trace, warn};

use super::config::{CacheConfig, ManagerConfig};
use super::multilevel::MultiLevelCache;
use crate::adapters::lock::LocalLock;
use crate::domain::events::CacheEvent;
use crate::domain::ports::{
    CacheEventListener, CacheKey, CacheNotifier, CacheValue, DistributedLock, Tier, TierManager,
};
use crate::error::{Error, Result};

/// Name of the in-process tier of `cache`
pub fn local_tier_name(cache: &str) -> String {
    format!("{}:local", cache)
}

/// Name of the shared tier of `cache`
pub fn remote_tier_name(cache: &str) -> String {
    format!("{}:remote", cache)
}

/// Routes inbound events to the registered cache of the same name.
struct EventRouter<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    caches: DashMap<String, Arc<MultiLevelCache<K, V>>>,
}

impl<K, V> EventRouter<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    async fn dispatch(&self, event: &CacheEvent) {
        // Clone out of the map before awaiting
        let cache = self
            .caches
            .get(event.cache_name())
            .map(|c| c.value().clone());

        match cache {
            Some(cache) => cache.handle_cache_update(event).await,
            None => trace!(cache = event.cache_name(), "No cache registered for event"),
        }
    }
}

#[async_trait]
impl<K, V> CacheEventListener for EventRouter<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    async fn on_event(&self, event: CacheEvent) {
        self.dispatch(&event).await;
    }
}

/// Registry of named multi-level caches
pub struct MultiLevelCacheManager<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    local: Arc<dyn TierManager<K, V>>,
    remote: Arc<dyn TierManager<K, V>>,
    notifier: Arc<dyn CacheNotifier>,
    lock: Arc<dyn DistributedLock>,
    config: ManagerConfig,
    router: Arc<EventRouter<K, V>>,
    /// Serialises create/remove per cache name
    creation_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl<K, V> MultiLevelCacheManager<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub fn builder() -> MultiLevelCacheManagerBuilder<K, V> {
        MultiLevelCacheManagerBuilder::default()
    }

    pub fn notifier(&self) -> &Arc<dyn CacheNotifier> {
        &self.notifier
    }

    /// Create a new cache. Fails if `name` is already registered.
    pub async fn create_cache(
        &self,
        name: &str,
        config: CacheConfig,
    ) -> Result<Arc<MultiLevelCache<K, V>>> {
        let name_lock = self.name_lock(name);
        let created = {
            let _guard = name_lock.lock().await;
            if self.router.caches.contains_key(name) {
                Err(Error::CacheAlreadyExists(name.to_string()))
            } else {
                self.build_cache(name, config).await
            }
        };
        self.release_name_lock(name, name_lock);
        created
    }

    /// Return the cache registered under `name`, creating it with `config` if needed.
    pub async fn get_or_create_cache(
        &self,
        name: &str,
        config: CacheConfig,
    ) -> Result<Arc<MultiLevelCache<K, V>>> {
        if let Some(cache) = self.get_cache(name) {
            return Ok(cache);
        }

        let name_lock = self.name_lock(name);
        let created = {
            let _guard = name_lock.lock().await;
            // Another task may have created it while we waited
            match self.get_cache(name) {
                Some(cache) => Ok(cache),
                None => self.build_cache(name, config).await,
            }
        };
        self.release_name_lock(name, name_lock);
        created
    }

    /// Like [`get_or_create_cache`](Self::get_or_create_cache), using the
    /// manager's configuration for `name`.
    pub async fn cache(&self, name: &str) -> Result<Arc<MultiLevelCache<K, V>>> {
        self.get_or_create_cache(name, self.config.cache(name)).await
    }

    pub fn get_cache(&self, name: &str) -> Option<Arc<MultiLevelCache<K, V>>> {
        self.router.caches.get(name).map(|c| c.value().clone())
    }

    pub fn cache_names(&self) -> Vec<String> {
        self.router.caches.iter().map(|c| c.key().clone()).collect()
    }

    /// Detach a cache, stop its events and release its tiers.
    ///
    /// Returns false if no cache was registered under `name`.
    pub async fn remove_cache(&self, name: &str) -> Result<bool> {
        let name_lock = self.name_lock(name);
        let removed = {
            let _guard = name_lock.lock().await;
            self.detach_cache(name).await
        };
        self.release_name_lock(name, name_lock);
        removed
    }

    /// Route an inbound event. Events for unknown caches are ignored.
    pub async fn dispatch_event(&self, event: &CacheEvent) {
        self.router.dispatch(event).await;
    }

    /// Remove every cache.
    pub async fn close(&self) -> Result<()> {
        let mut first_error = None;
        for name in self.cache_names() {
            if let Err(e) = self.remove_cache(&name).await {
                warn!(cache = %name, error = %e, "Failed to remove cache on close");
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn name_lock(&self, name: &str) -> Arc<tokio::sync::Mutex<()>> {
        self.creation_locks
            .entry(name.to_string())
            .or_default()
            .clone()
    }

    /// Drop our handle and forget the name's mutex once no other task holds
    /// or waits on it.
    fn release_name_lock(&self, name: &str, name_lock: Arc<tokio::sync::Mutex<()>>) {
        drop(name_lock);
        self.creation_locks
            .remove_if(name, |_, lock| Arc::strong_count(lock) == 1);
    }

    async fn detach_cache(&self, name: &str) -> Result<bool> {
        if self.router.caches.remove(name).is_none() {
            return Ok(false);
        }

        let unsubscribed = self.notifier.unsubscribe(name).await;
        self.release_tiers(name);
        info!(cache = name, "Cache removed");

        unsubscribed.map(|_| true)
    }

    async fn build_cache(
        &self,
        name: &str,
        config: CacheConfig,
    ) -> Result<Arc<MultiLevelCache<K, V>>> {
        let tiers = self.create_tiers(name, &config)?;

        let cache = match MultiLevelCache::new(
            name,
            config,
            tiers,
            self.notifier.clone(),
            self.lock.clone(),
        ) {
            Ok(cache) => Arc::new(cache),
            Err(e) => {
                self.release_tiers(name);
                return Err(e);
            }
        };

        // Subscribe before registering so no event published after the
        // cache becomes visible is missed
        if let Err(e) = self.notifier.subscribe(name, self.router.clone()).await {
            self.release_tiers(name);
            return Err(e);
        }

        self.router.caches.insert(name.to_string(), cache.clone());
        info!(
            cache = name,
            local = self.local.kind(),
            remote = self.remote.kind(),
            "Cache created"
        );
        Ok(cache)
    }

    fn create_tiers(&self, name: &str, config: &CacheConfig) -> Result<Vec<Arc<dyn Tier<K, V>>>> {
        let local = self
            .local
            .create_tier(&local_tier_name(name), &config.local_settings())?;
        let remote = match self
            .remote
            .create_tier(&remote_tier_name(name), &config.remote_settings())
        {
            Ok(tier) => tier,
            Err(e) => {
                self.local.remove_tier(&local_tier_name(name));
                return Err(e);
            }
        };
        Ok(vec![local, remote])
    }

    fn release_tiers(&self, name: &str) {
        self.local.remove_tier(&local_tier_name(name));
        self.remote.remove_tier(&remote_tier_name(name));
        debug!(cache = name, "Tiers released");
    }
}

impl<K, V> std::fmt::Debug for MultiLevelCacheManager<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MultiLevelCacheManager")
            .field("caches", &self.cache_names())
            .field("local", &self.local.kind())
            .field("remote", &self.remote.kind())
            .field("instance_id", self.notifier.instance_id())
            .finish()
    }
}

/// Builder for [`MultiLevelCacheManager`].
pub struct MultiLevelCacheManagerBuilder<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    local: Option<Arc<dyn TierManager<K, V>>>,
    remote: Option<Arc<dyn TierManager<K, V>>>,
    notifier: Option<Arc<dyn CacheNotifier>>,
    lock: Option<Arc<dyn DistributedLock>>,
    config: ManagerConfig,
}

impl<K, V> Default for MultiLevelCacheManagerBuilder<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn default() -> Self {
        Self {
            local: None,
            remote: None,
            notifier: None,
            lock: None,
            config: ManagerConfig::default(),
        }
    }
}

impl<K, V> MultiLevelCacheManagerBuilder<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub fn local_tiers(mut self, manager: Arc<dyn TierManager<K, V>>) -> Self {
        self.local = Some(manager);
        self
    }

    pub fn remote_tiers(mut self, manager: Arc<dyn TierManager<K, V>>) -> Self {
        self.remote = Some(manager);
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn CacheNotifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Lock shared by all caches. Defaults to an in-process [`LocalLock`]
    /// with the configured `lock_lease`.
    pub fn lock(mut self, lock: Arc<dyn DistributedLock>) -> Self {
        self.lock = Some(lock);
        self
    }

    /// Lock lease and per-cache configuration used by
    /// [`MultiLevelCacheManager::cache`].
    pub fn config(mut self, config: ManagerConfig) -> Self {
        self.config = config;
        self
    }

    pub fn build(self) -> Result<MultiLevelCacheManager<K, V>> {
        let local = self
            .local
            .ok_or_else(|| Error::Config("local tier manager is required".into()))?;
        let remote = self
            .remote
            .ok_or_else(|| Error::Config("remote tier manager is required".into()))?;
        let notifier = self
            .notifier
            .ok_or_else(|| Error::Config("cache notifier is required".into()))?;
        if self.config.lock_lease.is_zero() {
            return Err(Error::Config("lock_lease must be greater than zero".into()));
        }
        let lease = self.config.lock_lease;
        let lock = self
            .lock
            .unwrap_or_else(|| Arc::new(LocalLock::new(lease)) as Arc<dyn DistributedLock>);

        Ok(MultiLevelCacheManager {
            local,
            remote,
            notifier,
            lock,
            config: self.config,
            router: Arc::new(EventRouter {
                caches: DashMap::new(),
            }),
            creation_locks: DashMap::new(),
        })
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{InMemoryTransport, PubSubNotifier};
    use crate::cache::config::NotifierConfig;
    use crate::cache::local::LocalTierManager;
    use crate::domain::events::InstanceId;
    use crate::domain::ports::{MessageHandler, SubscriptionId, Transport};
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use serde_json::json;
    use std::time::Duration;

    type Manager = MultiLevelCacheManager<String, String>;

    struct Process {
        manager: Manager,
        local: Arc<LocalTierManager<String, String>>,
    }

    fn process(bus: &InMemoryTransport, remote: &Arc<LocalTierManager<String, String>>) -> Process {
        let local = Arc::new(LocalTierManager::new());
        let manager = Manager::builder()
            .local_tiers(local.clone())
            .remote_tiers(remote.clone())
            .notifier(Arc::new(PubSubNotifier::new(
                Arc::new(bus.clone()),
                NotifierConfig::default(),
            )))
            .build()
            .unwrap();
        Process { manager, local }
    }

    fn single() -> (Process, Arc<LocalTierManager<String, String>>) {
        let remote = Arc::new(LocalTierManager::new());
        (process(&InMemoryTransport::new(), &remote), remote)
    }

    #[tokio::test]
    async fn test_create_cache_rejects_duplicates() {
        let (p, _) = single();

        p.manager
            .create_cache("users", CacheConfig::default())
            .await
            .unwrap();
        assert_matches!(
            p.manager.create_cache("users", CacheConfig::default()).await,
            Err(Error::CacheAlreadyExists(name)) if name == "users"
        );
        assert_eq!(p.manager.cache_names(), vec!["users".to_string()]);
    }

    #[tokio::test]
    async fn test_tiers_are_named_after_cache() {
        let (p, remote) = single();

        let cache = p
            .manager
            .create_cache("users", CacheConfig::default())
            .await
            .unwrap();

        let names: Vec<&str> = cache.tiers().iter().map(|t| t.name()).collect();
        assert_eq!(names, vec!["users:local", "users:remote"]);
        assert_eq!(p.local.tier_names(), vec!["users:local".to_string()]);
        assert_eq!(remote.tier_names(), vec!["users:remote".to_string()]);
    }

    #[tokio::test]
    async fn test_get_or_create_is_idempotent_under_concurrency() {
        let (p, _) = single();
        let manager = Arc::new(p.manager);

        let tasks: Vec<_> = (0..16)
            .map(|_| {
                let manager = manager.clone();
                tokio::spawn(async move {
                    manager
                        .get_or_create_cache("users", CacheConfig::default())
                        .await
                        .unwrap()
                })
            })
            .collect();

        let mut caches = Vec::new();
        for task in tasks {
            caches.push(task.await.unwrap());
        }
        assert!(caches.iter().all(|c| Arc::ptr_eq(c, &caches[0])));
        assert_eq!(manager.cache_names().len(), 1);
    }

    #[tokio::test]
    async fn test_remove_cache_releases_tiers() {
        let (p, remote) = single();
        p.manager
            .create_cache("users", CacheConfig::default())
            .await
            .unwrap();

        assert!(p.manager.remove_cache("users").await.unwrap());
        assert!(!p.manager.remove_cache("users").await.unwrap());

        assert!(p.manager.get_cache("users").is_none());
        assert!(p.local.tier_names().is_empty());
        assert!(remote.tier_names().is_empty());

        // Name can be reused
        p.manager
            .create_cache("users", CacheConfig::default())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_invalid_config_releases_tiers() {
        let (p, remote) = single();
        let config = CacheConfig {
            local_limit: 0,
            ..CacheConfig::default()
        };

        assert_matches!(
            p.manager.create_cache("users", config).await,
            Err(Error::Config(_))
        );
        assert!(p.local.tier_names().is_empty());
        assert!(remote.tier_names().is_empty());
    }

    #[tokio::test]
    async fn test_dispatch_routes_by_name() {
        let (p, _) = single();
        let cache = p
            .manager
            .create_cache("users", CacheConfig::default())
            .await
            .unwrap();
        cache.put(&"a".to_string(), &"1".to_string()).await;

        let peer = InstanceId::generate();
        // Unknown cache, ignored
        p.manager
            .dispatch_event(&CacheEvent::clear("orders", peer.clone()))
            .await;
        let local = p.local.tier("users:local").unwrap();
        assert!(local.contains(&"a".to_string()));

        p.manager
            .dispatch_event(&CacheEvent::put("users", json!("a"), peer))
            .await;
        assert!(!local.contains(&"a".to_string()));
        // Shared tier keeps the value, so the next read refills L1
        assert_eq!(cache.get(&"a".to_string()).await.as_deref(), Some("1"));
    }

    #[tokio::test]
    async fn test_events_flow_between_managers() {
        let bus = InMemoryTransport::new();
        let remote = Arc::new(LocalTierManager::new());
        let a = process(&bus, &remote);
        let b = process(&bus, &remote);

        let cache_a = a.manager.cache("users").await.unwrap();
        let cache_b = b.manager.cache("users").await.unwrap();
        let key = "k".to_string();

        cache_a.put(&key, &"v1".to_string()).await;
        assert_eq!(cache_b.get(&key).await.as_deref(), Some("v1"));

        cache_a.put(&key, &"v2".to_string()).await;
        let b_local = b.local.tier("users:local").unwrap();
        assert!(!b_local.contains(&key));
        assert_eq!(cache_b.get(&key).await.as_deref(), Some("v2"));
    }

    #[tokio::test]
    async fn test_close_removes_everything() {
        let bus = InMemoryTransport::new();
        let remote = Arc::new(LocalTierManager::new());
        let p = process(&bus, &remote);

        p.manager.cache("users").await.unwrap();
        p.manager.cache("orders").await.unwrap();
        assert_eq!(bus.subscriber_count("tiercache:topic:users"), 1);

        p.manager.close().await.unwrap();

        assert!(p.manager.cache_names().is_empty());
        assert_eq!(bus.subscriber_count("tiercache:topic:users"), 0);
        assert_eq!(bus.subscriber_count("tiercache:topic:orders"), 0);
    }

    struct DownTransport;

    #[async_trait]
    impl Transport for DownTransport {
        async fn publish(&self, _channel: &str, _payload: Bytes) -> Result<()> {
            Err(Error::Transport("down".into()))
        }

        async fn subscribe(
            &self,
            _channel: &str,
            _handler: Arc<dyn MessageHandler>,
        ) -> Result<SubscriptionId> {
            Err(Error::Transport("down".into()))
        }

        async fn unsubscribe(&self, _id: SubscriptionId) -> Result<()> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_subscribe_failure_fails_creation() {
        let local = Arc::new(LocalTierManager::<String, String>::new());
        let remote = Arc::new(LocalTierManager::new());
        let manager = Manager::builder()
            .local_tiers(local.clone())
            .remote_tiers(remote.clone())
            .notifier(Arc::new(PubSubNotifier::new(
                Arc::new(DownTransport),
                NotifierConfig::default(),
            )))
            .build()
            .unwrap();

        assert_matches!(
            manager.create_cache("users", CacheConfig::default()).await,
            Err(Error::Transport(_))
        );
        assert!(manager.get_cache("users").is_none());
        assert!(local.tier_names().is_empty());
        assert!(remote.tier_names().is_empty());
    }

    #[tokio::test]
    async fn test_name_locks_do_not_accumulate() {
        let (p, _) = single();

        for i in 0..3 {
            let name = format!("cache-{}", i);
            p.manager.cache(&name).await.unwrap();
            assert!(p.manager.remove_cache(&name).await.unwrap());
        }
        assert!(!p.manager.remove_cache("never-created").await.unwrap());
        let _ = p
            .manager
            .create_cache("users", CacheConfig { local_limit: 0, ..CacheConfig::default() })
            .await;

        assert!(p.manager.creation_locks.is_empty());
    }

    #[tokio::test]
    async fn test_concurrent_get_or_create_still_builds_once() {
        let (p, _) = single();

        let (a, b) = tokio::join!(
            p.manager.get_or_create_cache("users", CacheConfig::default()),
            p.manager.get_or_create_cache("users", CacheConfig::default()),
        );

        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert!(p.manager.creation_locks.is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_default_lock_uses_configured_lease() {
        let remote = Arc::new(LocalTierManager::new());
        let manager = Manager::builder()
            .local_tiers(Arc::new(LocalTierManager::new()))
            .remote_tiers(remote)
            .notifier(Arc::new(PubSubNotifier::new(
                Arc::new(InMemoryTransport::new()),
                NotifierConfig::default(),
            )))
            .config(ManagerConfig {
                lock_lease: Duration::from_millis(50),
                ..ManagerConfig::default()
            })
            .build()
            .unwrap();
        let users = manager.cache("users").await.unwrap();
        let key = "u1".to_string();

        assert!(users.try_lock(&key, Duration::ZERO).await);
        assert!(!users.try_lock(&key, Duration::ZERO).await);

        tokio::time::advance(Duration::from_millis(60)).await;
        assert!(users.try_lock(&key, Duration::ZERO).await);
    }

    #[test]
    fn test_builder_rejects_zero_lease() {
        let result = Manager::builder()
            .local_tiers(Arc::new(LocalTierManager::new()))
            .remote_tiers(Arc::new(LocalTierManager::new()))
            .notifier(Arc::new(PubSubNotifier::new(
                Arc::new(InMemoryTransport::new()),
                NotifierConfig::default(),
            )))
            .config(ManagerConfig {
                lock_lease: Duration::ZERO,
                ..ManagerConfig::default()
            })
            .build();

        assert_matches!(result, Err(Error::Config(msg)) if msg.contains("lock_lease"));
    }

    #[test]
    fn test_builder_requires_components() {
        let remote: Arc<dyn TierManager<String, String>> = Arc::new(LocalTierManager::new());

        assert_matches!(Manager::builder().build(), Err(Error::Config(_)));
        assert_matches!(
            Manager::builder().remote_tiers(remote.clone()).build(),
            Err(Error::Config(_))
        );
        assert_matches!(
            Manager::builder()
                .local_tiers(Arc::new(LocalTierManager::new()))
                .remote_tiers(remote)
                .build(),
            Err(Error::Config(msg)) if msg.contains("notifier")
        );
    }
}
