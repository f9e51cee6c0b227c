//! Domain Layer
//!
//! # Architecture
//!
//! The domain layer is organized into:
//!
//! - **Ports** (`ports.rs`) - Trait abstractions for tiers, transports, notifiers and locks
//! - **Events** (`events.rs`) - Cache events exchanged between processes
//!
//! # Usage
//!
//! ```ignore
//! use tiercache::domain::ports::{DistributedLock, DistributedLockExt};
//!
//! async fn rebuild<L: DistributedLock>(lock: &L) -> bool {
//!     lock.try_lock_and_run("users:rebuild", Duration::from_secs(1), || async {
//!         // ...
//!     })
//!     .await
//! }
//! ```

pub mod events;
pub mod ports;

pub use events::{CacheEvent, CacheEventType, InstanceId};
pub use ports::{
    loader, CacheEventListener, CacheKey, CacheNotifier, CacheValue, DistributedLock,
    DistributedLockExt, Loader, MessageHandler, SubscriptionId, Tier, TierManager, TierSettings,
    Transport,
};
