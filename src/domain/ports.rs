//! Domain Ports (Port/Adapter Pattern)
//!
//! The cache engine only talks to the traits defined here. Adapters provide
//! the concrete tiers, transports and locks.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Cache Engine                          │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │                    Ports (Traits)                    │    │
//! │  │  Tier │ TierManager │ CacheNotifier │ DistributedLock│    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//!                              │
//!                              ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                         Adapters                             │
//! │  ┌─────────────────────────────────────────────────────┐    │
//! │  │  LocalTier │ RedisTier │ PubSubNotifier │ LocalLock  │    │
//! │  └─────────────────────────────────────────────────────┘    │
//! └─────────────────────────────────────────────────────────────┘
//! ```

use std::collections::HashMap;
use std::fmt::Debug;
use std::future::Future;
use std::hash::Hash;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::events::{CacheEvent, InstanceId};
use crate::error::Result;

// =============================================================================
// Key / Value Bounds
// =============================================================================

/// Anything usable as a cache key.
///
/// Keys travel inside invalidation events, so they must be JSON-encodable.
pub trait CacheKey:
    Clone + Eq + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

impl<T> CacheKey for T where
    T: Clone + Eq + Hash + Debug + Serialize + DeserializeOwned + Send + Sync + 'static
{
}

/// Anything storable as a cache value.
pub trait CacheValue: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

impl<T> CacheValue for T where T: Clone + Serialize + DeserializeOwned + Send + Sync + 'static {}

/// Loader invoked by `compute_if_absent` on a miss.
///
/// `Ok(None)` means the backing source has no value either.
pub type Loader<'a, K, V> =
    Box<dyn FnOnce(K) -> BoxFuture<'a, anyhow::Result<Option<V>>> + Send + 'a>;

/// Wrap an async closure as a [`Loader`].
///
/// ```ignore
/// let value = cache
///     .compute_if_absent(&id, loader(|id| async move { db.find_user(id).await }))
///     .await?;
/// ```
pub fn loader<'a, K, V, F, Fut>(f: F) -> Loader<'a, K, V>
where
    F: FnOnce(K) -> Fut + Send + 'a,
    Fut: Future<Output = anyhow::Result<Option<V>>> + Send + 'a,
{
    Box::new(move |key| f(key).boxed())
}

// =============================================================================
// Tier Port
// =============================================================================

/// A single storage level of a multi-level cache.
///
/// Errors are reserved for I/O failures of the backing store. A missing key
/// is `Ok(None)`.
#[async_trait]
pub trait Tier<K, V>: Send + Sync
where
    K: CacheKey,
    V: CacheValue,
{
    /// Tier name, used in logs.
    fn name(&self) -> &str;

    async fn get(&self, key: &K) -> Result<Option<V>>;

    /// Store a value. `ttl` overrides the tier's default expiry.
    async fn put(&self, key: &K, value: &V, ttl: Option<Duration>) -> Result<()>;

    async fn put_all(&self, entries: &HashMap<K, V>) -> Result<()>;

    /// Returns true if the key was present.
    async fn remove(&self, key: &K) -> Result<bool>;

    async fn clear(&self) -> Result<()>;

    /// Entries dropped for capacity or expiry since the tier was created.
    /// Tiers that expire out of the process's sight report 0.
    fn evictions(&self) -> u64 {
        0
    }
}

/// Settings handed to a [`TierManager`] when a tier is created.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TierSettings {
    /// Upper bound on resident entries (in-process tiers only)
    pub max_entries: Option<usize>,
    /// Expiry applied when a put carries no TTL
    pub default_ttl: Option<Duration>,
}

/// Factory and registry of tiers of one kind.
///
/// `create_tier` returns the existing tier when `name` is already registered,
/// so one manager can back several caches or several simulated processes.
pub trait TierManager<K, V>: Send + Sync
where
    K: CacheKey,
    V: CacheValue,
{
    /// Short label for logs ("local", "redis").
    fn kind(&self) -> &'static str;

    fn create_tier(&self, name: &str, settings: &TierSettings) -> Result<Arc<dyn Tier<K, V>>>;

    /// Release a tier. Returns false if it was not registered.
    fn remove_tier(&self, name: &str) -> bool;

    fn tier_names(&self) -> Vec<String>;
}

// =============================================================================
// Transport Port
// =============================================================================

/// Handle returned by [`Transport::subscribe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

/// Receiver of raw pub/sub payloads.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn on_message(&self, channel: &str, payload: Bytes);
}

/// Raw pub/sub channel (Redis PUBLISH/SUBSCRIBE or an in-process bus).
#[async_trait]
pub trait Transport: Send + Sync {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()>;

    async fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId>;

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()>;
}

// =============================================================================
// Notifier Port
// =============================================================================

/// Receiver of decoded cache events from other processes.
#[async_trait]
pub trait CacheEventListener: Send + Sync {
    async fn on_event(&self, event: CacheEvent);
}

/// Publishes and receives cache events.
///
/// Implementations drop events whose origin is [`CacheNotifier::instance_id`]
/// before any listener sees them.
#[async_trait]
pub trait CacheNotifier: Send + Sync {
    /// Identity stamped on every event this notifier publishes.
    fn instance_id(&self) -> &InstanceId;

    async fn publish(&self, event: CacheEvent) -> Result<()>;

    async fn notify_update(&self, cache_name: &str, key: serde_json::Value) -> Result<()> {
        self.publish(CacheEvent::put(cache_name, key, self.instance_id().clone()))
            .await
    }

    async fn notify_remove(&self, cache_name: &str, key: serde_json::Value) -> Result<()> {
        self.publish(CacheEvent::remove(cache_name, key, self.instance_id().clone()))
            .await
    }

    async fn notify_clear(&self, cache_name: &str) -> Result<()> {
        self.publish(CacheEvent::clear(cache_name, self.instance_id().clone()))
            .await
    }

    /// Register a listener for `cache_name`. Subscribing the same listener
    /// twice does not duplicate delivery.
    async fn subscribe(&self, cache_name: &str, listener: Arc<dyn CacheEventListener>)
        -> Result<()>;

    /// Stop delivering events for `cache_name`.
    async fn unsubscribe(&self, cache_name: &str) -> Result<()>;
}

// =============================================================================
// Lock Port
// =============================================================================

/// Key-scoped mutual exclusion with a bounded wait.
///
/// Not reentrant. Leases expire on their own so a crashed holder cannot
/// wedge a key forever.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Try to acquire `key`, waiting at most `timeout`.
    async fn try_lock(&self, key: &str, timeout: Duration) -> bool;

    /// Release `key`. Releasing an unheld key is a no-op.
    async fn unlock(&self, key: &str);
}

/// Run-under-lock helper available on every [`DistributedLock`].
pub trait DistributedLockExt: DistributedLock {
    /// Acquire `key`, run `action`, release.
    ///
    /// Returns false without running `action` if the lock was not acquired.
    /// The lock is released even if `action` panics; the panic then resumes.
    fn try_lock_and_run<'a, F, Fut>(
        &'a self,
        key: &'a str,
        timeout: Duration,
        action: F,
    ) -> impl Future<Output = bool> + Send + 'a
    where
        F: FnOnce() -> Fut + Send + 'a,
        Fut: Future<Output = ()> + Send + 'a,
    {
        async move {
            if !self.try_lock(key, timeout).await {
                return false;
            }

            let outcome = AssertUnwindSafe(action()).catch_unwind().await;
            self.unlock(key).await;

            if let Err(panic) = outcome {
                std::panic::resume_unwind(panic);
            }
            true
        }
    }
}

impl<L: DistributedLock + ?Sized> DistributedLockExt for L {}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::collections::HashSet;

    #[derive(Default)]
    struct SetLock {
        held: Mutex<HashSet<String>>,
        unlocks: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl DistributedLock for SetLock {
        async fn try_lock(&self, key: &str, _timeout: Duration) -> bool {
            self.held.lock().insert(key.to_string())
        }

        async fn unlock(&self, key: &str) {
            self.held.lock().remove(key);
            self.unlocks.lock().push(key.to_string());
        }
    }

    #[tokio::test]
    async fn test_try_lock_and_run_releases() {
        let lock = SetLock::default();
        let ran = Arc::new(Mutex::new(false));

        let flag = ran.clone();
        let acquired = lock
            .try_lock_and_run("k", Duration::from_millis(10), || async move {
                *flag.lock() = true;
            })
            .await;

        assert!(acquired);
        assert!(*ran.lock());
        assert!(lock.held.lock().is_empty());
    }

    #[tokio::test]
    async fn test_try_lock_and_run_skips_when_held() {
        let lock = SetLock::default();
        assert!(lock.try_lock("k", Duration::ZERO).await);

        let ran = Arc::new(Mutex::new(false));
        let flag = ran.clone();
        let acquired = lock
            .try_lock_and_run("k", Duration::ZERO, || async move {
                *flag.lock() = true;
            })
            .await;

        assert!(!acquired);
        assert!(!*ran.lock());
        // The holder's lock is untouched
        assert!(lock.held.lock().contains("k"));
        assert!(lock.unlocks.lock().is_empty());
    }

    #[tokio::test]
    async fn test_try_lock_and_run_releases_on_panic() {
        let lock = Arc::new(SetLock::default());

        let inner = lock.clone();
        let result = tokio::spawn(async move {
            inner
                .try_lock_and_run("k", Duration::ZERO, || async {
                    panic!("action failed");
                })
                .await
        })
        .await;

        assert!(result.is_err());
        assert!(lock.held.lock().is_empty());
        assert_eq!(lock.unlocks.lock().as_slice(), ["k".to_string()]);
    }

    #[test]
    fn test_tier_settings_default() {
        let settings = TierSettings::default();
        assert_eq!(settings.max_entries, None);
        assert_eq!(settings.default_ttl, None);
    }
}
