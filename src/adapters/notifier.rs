//! Pub/Sub Cache Notifier
//!
//! Implements [`CacheNotifier`] over any [`Transport`]. Every cache gets its
//! own channel, `"{topic_prefix}:topic:{cache_name}"`.
//!
//! ## Example Flow
//!
//! ```text
//! Instance 1: cache.put("k", v)
//!   ↓ tiers written (remote first, local last)
//! PUBLISH tiercache:topic:users {"key":"k","eventType":"PUT","instanceId":"i1",...}
//!   ↓
//! Instance 1: receives its own event → dropped (instanceId matches)
//! Instance 2: receives event → removes "k" from its local tier
//! ```

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use tracing::{debug, info, trace, warn};

use crate::cache::config::NotifierConfig;
use crate::domain::events::{CacheEvent, InstanceId};
use crate::domain::ports::{
    CacheEventListener, CacheNotifier, MessageHandler, SubscriptionId, Transport,
};
use crate::error::Result;

type Listeners = Arc<DashMap<String, Vec<Arc<dyn CacheEventListener>>>>;

/// Cache notifier publishing JSON events on a pub/sub transport.
pub struct PubSubNotifier {
    transport: Arc<dyn Transport>,
    instance_id: InstanceId,
    config: NotifierConfig,
    /// cache name -> transport subscription
    subscriptions: tokio::sync::Mutex<HashMap<String, SubscriptionId>>,
    listeners: Listeners,
}

impl PubSubNotifier {
    /// Create a notifier with a freshly generated instance id.
    pub fn new(transport: Arc<dyn Transport>, config: NotifierConfig) -> Self {
        Self::with_instance_id(transport, config, InstanceId::generate())
    }

    pub fn with_instance_id(
        transport: Arc<dyn Transport>,
        config: NotifierConfig,
        instance_id: InstanceId,
    ) -> Self {
        info!(instance_id = %instance_id, prefix = %config.topic_prefix, "Cache notifier created");
        Self {
            transport,
            instance_id,
            config,
            subscriptions: tokio::sync::Mutex::new(HashMap::new()),
            listeners: Arc::new(DashMap::new()),
        }
    }

    /// Channel carrying events of `cache_name`.
    pub fn channel(&self, cache_name: &str) -> String {
        self.config.channel(cache_name)
    }

    /// Names of caches with an active subscription.
    pub async fn subscribed_caches(&self) -> Vec<String> {
        self.subscriptions.lock().await.keys().cloned().collect()
    }

    fn add_listener(&self, cache_name: &str, listener: Arc<dyn CacheEventListener>) {
        let mut entry = self.listeners.entry(cache_name.to_string()).or_default();
        let already = entry
            .iter()
            .any(|l| std::ptr::addr_eq(Arc::as_ptr(l), Arc::as_ptr(&listener)));
        if !already {
            entry.push(listener);
        }
    }
}

impl std::fmt::Debug for PubSubNotifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PubSubNotifier")
            .field("instance_id", &self.instance_id)
            .field("topic_prefix", &self.config.topic_prefix)
            .field("caches", &self.listeners.len())
            .finish()
    }
}

#[async_trait]
impl CacheNotifier for PubSubNotifier {
    fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    async fn publish(&self, event: CacheEvent) -> Result<()> {
        let channel = self.channel(event.cache_name());
        let payload = event.encode()?;
        self.transport.publish(&channel, payload).await?;

        debug!(
            channel = %channel,
            event_type = %event.event_type(),
            "Published cache event"
        );
        Ok(())
    }

    async fn subscribe(
        &self,
        cache_name: &str,
        listener: Arc<dyn CacheEventListener>,
    ) -> Result<()> {
        let mut subscriptions = self.subscriptions.lock().await;

        if !subscriptions.contains_key(cache_name) {
            let channel = self.channel(cache_name);
            let handler = Arc::new(ChannelHandler {
                cache_name: cache_name.to_string(),
                instance_id: self.instance_id.clone(),
                listeners: self.listeners.clone(),
            });
            let id = self.transport.subscribe(&channel, handler).await?;
            subscriptions.insert(cache_name.to_string(), id);
            info!(cache = cache_name, channel = %channel, "Subscribed to cache events");
        }

        self.add_listener(cache_name, listener);
        Ok(())
    }

    async fn unsubscribe(&self, cache_name: &str) -> Result<()> {
        self.listeners.remove(cache_name);

        let id = self.subscriptions.lock().await.remove(cache_name);
        if let Some(id) = id {
            self.transport.unsubscribe(id).await?;
            info!(cache = cache_name, "Unsubscribed from cache events");
        }
        Ok(())
    }
}

/// Decodes payloads of one cache channel and fans them out to listeners.
struct ChannelHandler {
    cache_name: String,
    instance_id: InstanceId,
    listeners: Listeners,
}

#[async_trait]
impl MessageHandler for ChannelHandler {
    async fn on_message(&self, channel: &str, payload: Bytes) {
        let event = match CacheEvent::decode(&payload) {
            Ok(event) => event,
            Err(e) => {
                warn!(channel, error = %e, "Dropping malformed cache event");
                return;
            }
        };

        if event.is_from(&self.instance_id) {
            trace!(channel, "Ignoring own cache event");
            return;
        }
        if event.cache_name() != self.cache_name {
            debug!(
                channel,
                cache = event.cache_name(),
                "Ignoring event for another cache"
            );
            return;
        }

        // Clone out so no map guard is held across listener awaits
        let listeners: Vec<Arc<dyn CacheEventListener>> = self
            .listeners
            .get(&self.cache_name)
            .map(|l| l.value().clone())
            .unwrap_or_default();

        for listener in listeners {
            listener.on_event(event.clone()).await;
        }
    }
}
