//! In-Process Transport
//!
//! A pub/sub bus living in one process. Cloned handles share the same bus, so
//! several notifiers built on clones behave like separate processes talking
//! over Redis.
//!
//! Delivery is synchronous: `publish` returns after every subscriber of the
//! channel has handled the message, including subscribers owned by the
//! publisher itself. Loopback suppression is the notifier's job.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::RwLock;
use tracing::trace;

use crate::domain::ports::{MessageHandler, SubscriptionId, Transport};
use crate::error::Result;

type Subscribers = HashMap<String, Vec<(SubscriptionId, Arc<dyn MessageHandler>)>>;

#[derive(Default)]
struct Bus {
    next_id: AtomicU64,
    subscribers: RwLock<Subscribers>,
}

/// Shared in-memory pub/sub bus.
#[derive(Clone, Default)]
pub struct InMemoryTransport {
    bus: Arc<Bus>,
}

impl InMemoryTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live subscriptions on `channel`.
    pub fn subscriber_count(&self, channel: &str) -> usize {
        self.bus
            .subscribers
            .read()
            .get(channel)
            .map(Vec::len)
            .unwrap_or(0)
    }
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InMemoryTransport")
            .field("channels", &self.bus.subscribers.read().len())
            .finish()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        // Snapshot so handlers run without the lock held
        let handlers: Vec<Arc<dyn MessageHandler>> = self
            .bus
            .subscribers
            .read()
            .get(channel)
            .map(|subs| subs.iter().map(|(_, h)| h.clone()).collect())
            .unwrap_or_default();

        trace!(channel, receivers = handlers.len(), "Publishing");

        for handler in handlers {
            handler.on_message(channel, payload.clone()).await;
        }
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId> {
        let id = SubscriptionId(self.bus.next_id.fetch_add(1, Ordering::Relaxed));
        self.bus
            .subscribers
            .write()
            .entry(channel.to_string())
            .or_default()
            .push((id, handler));
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        let mut subscribers = self.bus.subscribers.write();
        for subs in subscribers.values_mut() {
            subs.retain(|(sub_id, _)| *sub_id != id);
        }
        subscribers.retain(|_, subs| !subs.is_empty());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;

    #[derive(Default)]
    struct Collector {
        received: Mutex<Vec<(String, Bytes)>>,
    }

    #[async_trait]
    impl MessageHandler for Collector {
        async fn on_message(&self, channel: &str, payload: Bytes) {
            self.received.lock().push((channel.to_string(), payload));
        }
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_of_channel_only() {
        let transport = InMemoryTransport::new();
        let a = Arc::new(Collector::default());
        let b = Arc::new(Collector::default());

        transport.subscribe("users", a.clone()).await.unwrap();
        transport.subscribe("orders", b.clone()).await.unwrap();

        transport
            .publish("users", Bytes::from_static(b"hello"))
            .await
            .unwrap();

        assert_eq!(a.received.lock().len(), 1);
        assert_eq!(a.received.lock()[0].1, Bytes::from_static(b"hello"));
        assert!(b.received.lock().is_empty());
    }

    #[tokio::test]
    async fn test_clones_share_the_bus() {
        let process_a = InMemoryTransport::new();
        let process_b = process_a.clone();
        let collector = Arc::new(Collector::default());

        process_b.subscribe("users", collector.clone()).await.unwrap();
        process_a
            .publish("users", Bytes::from_static(b"x"))
            .await
            .unwrap();

        assert_eq!(collector.received.lock().len(), 1);
    }

    #[tokio::test]
    async fn test_unsubscribe_stops_delivery() {
        let transport = InMemoryTransport::new();
        let collector = Arc::new(Collector::default());

        let id = transport.subscribe("users", collector.clone()).await.unwrap();
        assert_eq!(transport.subscriber_count("users"), 1);

        transport.unsubscribe(id).await.unwrap();
        assert_eq!(transport.subscriber_count("users"), 0);

        transport
            .publish("users", Bytes::from_static(b"x"))
            .await
            .unwrap();
        assert!(collector.received.lock().is_empty());

        // Unknown ids are ignored
        transport.unsubscribe(SubscriptionId(999)).await.unwrap();
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let transport = InMemoryTransport::new();
        transport
            .publish("nobody", Bytes::from_static(b"x"))
            .await
            .unwrap();
    }
}
