//! Cache Events
//!
//! Events describing a mutation of a named cache, exchanged between processes
//! that share the same backing store.
//!
//! # Wire format
//!
//! ```json
//! {"cacheName":"users","key":"u-42","eventType":"PUT","instanceId":"6f1c..."}
//! ```
//!
//! `key` is `null` exactly when `eventType` is `CLEAR`. Events never carry the
//! value: receivers invalidate and re-read from the shared tier.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// =============================================================================
// Instance Identity
// =============================================================================

/// Identity of the process that published an event.
///
/// Only used to recognise (and drop) the echo of our own writes.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InstanceId(String);

impl InstanceId {
    /// Generate a fresh random instance id.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for InstanceId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for InstanceId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for InstanceId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

// =============================================================================
// Event Type
// =============================================================================

/// Kind of mutation an event reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum CacheEventType {
    /// A key was written (older publishers call this UPDATE)
    #[serde(alias = "UPDATE")]
    Put,
    /// A key was removed
    Remove,
    /// The whole cache was cleared
    Clear,
}

impl std::fmt::Display for CacheEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CacheEventType::Put => write!(f, "PUT"),
            CacheEventType::Remove => write!(f, "REMOVE"),
            CacheEventType::Clear => write!(f, "CLEAR"),
        }
    }
}

// =============================================================================
// Cache Event
// =============================================================================

/// An immutable notification that a named cache changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheEvent {
    cache_name: String,
    #[serde(default)]
    key: Option<serde_json::Value>,
    event_type: CacheEventType,
    instance_id: InstanceId,
}

impl CacheEvent {
    /// A key of `cache_name` was written.
    pub fn put(
        cache_name: impl Into<String>,
        key: serde_json::Value,
        instance_id: InstanceId,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            key: Some(key),
            event_type: CacheEventType::Put,
            instance_id,
        }
    }

    /// A key of `cache_name` was removed.
    pub fn remove(
        cache_name: impl Into<String>,
        key: serde_json::Value,
        instance_id: InstanceId,
    ) -> Self {
        Self {
            cache_name: cache_name.into(),
            key: Some(key),
            event_type: CacheEventType::Remove,
            instance_id,
        }
    }

    /// `cache_name` was cleared.
    pub fn clear(cache_name: impl Into<String>, instance_id: InstanceId) -> Self {
        Self {
            cache_name: cache_name.into(),
            key: None,
            event_type: CacheEventType::Clear,
            instance_id,
        }
    }

    pub fn cache_name(&self) -> &str {
        &self.cache_name
    }

    pub fn key(&self) -> Option<&serde_json::Value> {
        self.key.as_ref()
    }

    pub fn event_type(&self) -> CacheEventType {
        self.event_type
    }

    pub fn instance_id(&self) -> &InstanceId {
        &self.instance_id
    }

    /// Returns true if this event was published by `instance_id`.
    pub fn is_from(&self, instance_id: &InstanceId) -> bool {
        &self.instance_id == instance_id
    }

    /// Decode the event key into the cache's key type.
    ///
    /// Returns `Ok(None)` for CLEAR events.
    pub fn decode_key<K: DeserializeOwned>(&self) -> Result<Option<K>> {
        match &self.key {
            Some(value) => Ok(Some(serde_json::from_value(value.clone())?)),
            None => Ok(None),
        }
    }

    /// Serialize to the JSON wire format.
    pub fn encode(&self) -> Result<Bytes> {
        Ok(Bytes::from(serde_json::to_vec(self)?))
    }

    /// Parse and validate an event received from the transport.
    pub fn decode(payload: &[u8]) -> Result<Self> {
        let event: CacheEvent = serde_json::from_slice(payload)?;
        event.validate()?;
        Ok(event)
    }

    fn validate(&self) -> Result<()> {
        let has_key = matches!(&self.key, Some(v) if !v.is_null());
        match (self.event_type, has_key) {
            (CacheEventType::Clear, false) => Ok(()),
            (CacheEventType::Clear, true) => Err(Error::InvalidEvent(format!(
                "CLEAR event for '{}' carries a key",
                self.cache_name
            ))),
            (_, true) => Ok(()),
            (event_type, false) => Err(Error::InvalidEvent(format!(
                "{} event for '{}' has no key",
                event_type, self.cache_name
            ))),
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
