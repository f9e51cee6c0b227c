//! Cache Entry Types
//!
//! Values as stored by the in-process tier, with an optional absolute expiry.

use std::time::Duration;

use tokio::time::Instant;

/// A value held by the local tier.
#[derive(Clone)]
pub struct CacheEntry<V> {
    value: V,
    created_at: Instant,
    /// None = never expires
    expires_at: Option<Instant>,
    access_count: u32,
}

impl<V> CacheEntry<V> {
    /// Create an entry that never expires
    pub fn new(value: V) -> Self {
        Self {
            value,
            created_at: Instant::now(),
            expires_at: None,
            access_count: 0,
        }
    }

    /// Create an entry expiring `ttl` from now
    pub fn with_ttl(value: V, ttl: Duration) -> Self {
        let now = Instant::now();
        Self {
            value,
            created_at: now,
            expires_at: now.checked_add(ttl),
            access_count: 0,
        }
    }

    /// Create an entry with an optional TTL
    pub fn with_optional_ttl(value: V, ttl: Option<Duration>) -> Self {
        match ttl {
            Some(ttl) => Self::with_ttl(value, ttl),
            None => Self::new(value),
        }
    }

    #[inline]
    pub fn value(&self) -> &V {
        &self.value
    }

    pub fn into_value(self) -> V {
        self.value
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time left before expiry, None if the entry never expires
    pub fn remaining_ttl(&self) -> Option<Duration> {
        self.expires_at
            .map(|at| at.saturating_duration_since(Instant::now()))
    }

    #[inline]
    pub fn is_expired(&self) -> bool {
        self.expires_at
            .map(|at| Instant::now() >= at)
            .unwrap_or(false)
    }

    /// Record an access, returns the new count
    pub fn record_access(&mut self) -> u32 {
        self.access_count = self.access_count.saturating_add(1);
        self.access_count
    }

    pub fn access_count(&self) -> u32 {
        self.access_count
    }
}

impl<V> std::fmt::Debug for CacheEntry<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheEntry")
            .field("age", &self.age())
            .field("remaining_ttl", &self.remaining_ttl())
            .field("access_count", &self.access_count)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
