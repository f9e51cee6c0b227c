//! Infrastructure Adapters
//!
//! Implementations of the domain ports, following the Port/Adapter
//! (Hexagonal) architecture pattern.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                        Domain Layer                              │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │                    Ports (Traits)                           │ │
//! │  │  Tier │ TierManager │ Transport │ CacheNotifier │ Lock     │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Adapters (This Module)                       │
//! │  ┌────────────────────────────────────────────────────────────┐ │
//! │  │ InMemoryTransport │ PubSubNotifier │ LocalLock             │ │
//! │  │ RedisTier │ RedisLock │ RedisTransport  (feature "redis")  │ │
//! │  │ LoggingEventListener │ RecordingListener                   │ │
//! │  └────────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Usage
//!
//! ```ignore
//! use tiercache::adapters::{InMemoryTransport, PubSubNotifier};
//! use tiercache::cache::NotifierConfig;
//!
//! let transport = Arc::new(InMemoryTransport::new());
//! let notifier = PubSubNotifier::new(transport, NotifierConfig::default());
//! notifier.notify_remove("users", serde_json::json!("u-42")).await?;
//! ```

mod listeners;
pub mod lock;
mod notifier;
#[cfg(feature = "redis")]
pub mod redis;
mod transport;

pub use listeners::{LoggingEventListener, RecordingListener};
pub use lock::LocalLock;
pub use notifier::PubSubNotifier;
pub use transport::InMemoryTransport;

#[cfg(feature = "redis")]
pub use self::redis::{RedisLock, RedisTier, RedisTierManager, RedisTransport};
