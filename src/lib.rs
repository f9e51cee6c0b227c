//! tiercache - Multi-Level Cache with Cross-Instance Invalidation
//!
//! A read-through, write-through cache that stacks an in-process LRU tier in
//! front of a shared remote tier (Redis) and keeps every process's local tier
//! coherent through pub/sub invalidation events.
//!
//! # Architecture
//!
//! ```text
//! Application ─→ MultiLevelCache ─→ ConsistencyStrategy ─→ [L1 local, L2 remote]
//!                      │                                         ▲
//!                      └─ PUT/REMOVE/CLEAR ─→ CacheNotifier ─→ peers invalidate L1
//! ```
//!
//! # Features
//!
//! - Write-through consistency (farthest tier written first)
//! - Read-through backfill of nearer tiers
//! - Stampede protection with a key-scoped lock
//! - Hit/miss/load statistics
//! - Redis tier, lock and transport (feature `redis`, on by default)
//!
//! # Modules
//!
//! - [`adapters`] - Transport, notifier, lock and Redis adapters
//! - [`cache`] - Cache engine, strategies, configuration and statistics
//! - [`domain`] - Ports (traits) and cache events
//! - [`error`] - Error types

pub mod adapters;
pub mod cache;
pub mod domain;
pub mod error;

// Re-export commonly used types
pub use adapters::{InMemoryTransport, LocalLock, LoggingEventListener, PubSubNotifier};
pub use cache::{
    CacheConfig, ConsistencyMode, ManagerConfig, MultiLevelCache, MultiLevelCacheManager,
    NotifierConfig, StatsSnapshot,
};
pub use domain::events::{CacheEvent, CacheEventType, InstanceId};
pub use domain::ports::{loader, CacheNotifier, DistributedLock, DistributedLockExt, Loader, Tier};
pub use error::{Error, Result};
