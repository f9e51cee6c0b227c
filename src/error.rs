//! Error types for tiercache

use thiserror::Error;

/// Result type alias using our Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in tiercache
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Tier Errors
    // =========================================================================
    /// A single tier failed (network, timeout, encoding)
    #[error("Tier '{tier}' failed: {reason}")]
    Tier { tier: String, reason: String },

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Redis error
    #[cfg(feature = "redis")]
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    // =========================================================================
    // Loader Errors
    // =========================================================================
    /// The user-supplied loader of `compute_if_absent` failed
    #[error("Loader failed for key {key}")]
    LoadFailed {
        key: String,
        #[source]
        source: anyhow::Error,
    },

    // =========================================================================
    // Protocol Errors
    // =========================================================================
    /// Pub/sub transport error
    #[error("Transport error: {0}")]
    Transport(String),

    /// Malformed cache event
    #[error("Invalid cache event: {0}")]
    InvalidEvent(String),

    // =========================================================================
    // Registry / Configuration Errors
    // =========================================================================
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Cache already registered under this name
    #[error("Cache already exists: {0}")]
    CacheAlreadyExists(String),
}

impl Error {
    /// Build a tier error from any displayable cause.
    pub fn tier(tier: impl Into<String>, reason: impl std::fmt::Display) -> Self {
        Error::Tier {
            tier: tier.into(),
            reason: reason.to_string(),
        }
    }
}
