//! Event Listener Adapters
//!
//! `CacheEventListener` implementations that do not touch a cache: a logging
//! listener for operators and a recording listener for tests.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use crate::domain::events::{CacheEvent, CacheEventType};
use crate::domain::ports::CacheEventListener;

/// Logs every received cache event.
#[derive(Debug, Clone, Default)]
pub struct LoggingEventListener {
    /// Whether to log events at info level (true) or debug level (false)
    info_level: bool,
}

impl LoggingEventListener {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a listener that logs at info level.
    pub fn info_level() -> Self {
        Self { info_level: true }
    }

    /// Create a listener that logs at debug level.
    pub fn debug_level() -> Self {
        Self { info_level: false }
    }
}

#[async_trait]
impl CacheEventListener for LoggingEventListener {
    async fn on_event(&self, event: CacheEvent) {
        let key = event
            .key()
            .map(|k| k.to_string())
            .unwrap_or_else(|| "-".to_string());

        if self.info_level {
            info!(
                cache = event.cache_name(),
                event_type = %event.event_type(),
                key = %key,
                origin = %event.instance_id(),
                "Cache event"
            );
        } else {
            debug!(
                cache = event.cache_name(),
                event_type = %event.event_type(),
                key = %key,
                origin = %event.instance_id(),
                "Cache event"
            );
        }
    }
}

/// Collects received events in memory for later inspection.
#[derive(Debug, Default)]
pub struct RecordingListener {
    events: parking_lot::RwLock<Vec<CacheEvent>>,
}

impl RecordingListener {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Get all collected events.
    pub fn events(&self) -> Vec<CacheEvent> {
        self.events.read().clone()
    }

    pub fn len(&self) -> usize {
        self.events.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.read().is_empty()
    }

    pub fn clear(&self) {
        self.events.write().clear();
    }

    /// Get events of a specific type.
    pub fn events_of_type(&self, event_type: CacheEventType) -> Vec<CacheEvent> {
        self.events
            .read()
            .iter()
            .filter(|e| e.event_type() == event_type)
            .cloned()
            .collect()
    }
}

#[async_trait]
impl CacheEventListener for RecordingListener {
    async fn on_event(&self, event: CacheEvent) {
        self.events.write().push(event);
    }
}
