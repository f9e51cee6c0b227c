//! Multi-Level Cache Engine
//!
//! Ordered tiers behind a single cache API, kept consistent across processes
//! by a consistency strategy and a pub/sub invalidation channel.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                     MultiLevelCacheManager                                │
//! ├──────────────────────────────────────────────────────────────────────────┤
//! │  MultiLevelCache "users"                                                  │
//! │  ┌───────────────┐    ┌──────────────────────┐    ┌──────────────────┐   │
//! │  │ Stats / Lock  │ →  │ WriteThroughStrategy │ →  │ L1 local  (LRU)  │   │
//! │  │ (stampede)    │    │                      │    │ L2 remote (Redis)│   │
//! │  └───────────────┘    └──────────────────────┘    └──────────────────┘   │
//! │          │                                                               │
//! │          └── publish PUT/REMOVE/CLEAR ──→ CacheNotifier ──→ peers        │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Consistency
//!
//! - Reads backfill nearer tiers from the first tier that hits
//! - Writes go farthest tier first, so the shared tier is never behind a local one
//! - Peer events only invalidate local tiers; the next read refills them

pub mod config;
mod entry;
mod local;
mod manager;
mod multilevel;
mod stampede;
mod stats;
mod strategy;

#[cfg(test)]
mod testing;

pub use config::{CacheConfig, CacheConfigBuilder, ConsistencyMode, ManagerConfig, NotifierConfig};
pub use entry::CacheEntry;
pub use local::{LocalTier, LocalTierManager, DEFAULT_MAX_ENTRIES};
pub use manager::{
    local_tier_name, remote_tier_name, MultiLevelCacheManager, MultiLevelCacheManagerBuilder,
};
pub use multilevel::MultiLevelCache;
pub use stampede::LoadOutcome;
pub use stats::{CacheStats, LatencyTracker, StatsSnapshot};
pub use strategy::{create_strategy, ConsistencyStrategy, WriteThroughStrategy, MIN_TIERS};
