//! Cache Configuration
//!
//! Per-cache settings, notifier settings and the YAML document tying them
//! together. Durations are written as integer milliseconds.
//!
//! ```yaml
//! notifier:
//!   topic_prefix: shop
//! lock_lease: 30000
//! caches:
//!   users:
//!     expire: 600000
//!     local_limit: 1000
//!   sessions:
//!     expire: 30000
//!     penetration_protect: false
//! ```

use std::collections::HashMap;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::adapters::lock::DEFAULT_LEASE;
use crate::domain::ports::TierSettings;
use crate::error::{Error, Result};

/// Consistency strategy used by a multi-level cache.
///
/// Only write-through exists; other modes are rejected at configuration time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ConsistencyMode {
    #[default]
    WriteThrough,
}

impl FromStr for ConsistencyMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().replace('_', "-").as_str() {
            "write-through" => Ok(ConsistencyMode::WriteThrough),
            other => Err(Error::Config(format!(
                "unsupported consistency mode '{}'",
                other
            ))),
        }
    }
}

impl TryFrom<String> for ConsistencyMode {
    type Error = Error;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<ConsistencyMode> for String {
    fn from(mode: ConsistencyMode) -> String {
        mode.to_string()
    }
}

impl std::fmt::Display for ConsistencyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConsistencyMode::WriteThrough => write!(f, "write-through"),
        }
    }
}

/// Configuration of one named cache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Expiry of entries in the remote tier
    #[serde(with = "duration_ms")]
    pub expire: Duration,
    /// Expiry of entries in the local tier (falls back to `expire`)
    #[serde(with = "option_duration_ms")]
    pub local_expire: Option<Duration>,
    /// Maximum number of entries held by the local tier
    pub local_limit: usize,
    /// Consistency strategy
    pub consistency: ConsistencyMode,
    /// Record hit/miss/load statistics
    pub stats_enabled: bool,
    /// Guard loads behind a lock so concurrent misses load once
    pub penetration_protect: bool,
    /// How long a loader waits for the load lock
    #[serde(with = "duration_ms")]
    pub lock_timeout: Duration,
    /// Pause before re-reading when another instance holds the load lock
    #[serde(with = "duration_ms")]
    pub lock_backoff: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            expire: Duration::from_secs(300),
            local_expire: None,
            local_limit: 200,
            consistency: ConsistencyMode::WriteThrough,
            stats_enabled: true,
            penetration_protect: true,
            lock_timeout: Duration::from_millis(100),
            lock_backoff: Duration::from_millis(100),
        }
    }
}

impl CacheConfig {
    pub fn builder() -> CacheConfigBuilder {
        CacheConfigBuilder::default()
    }

    /// Settings for the in-process tier.
    pub fn local_settings(&self) -> TierSettings {
        TierSettings {
            max_entries: Some(self.local_limit),
            default_ttl: Some(self.local_expire.unwrap_or(self.expire)),
        }
    }

    /// Settings for the shared remote tier.
    pub fn remote_settings(&self) -> TierSettings {
        TierSettings {
            max_entries: None,
            default_ttl: Some(self.expire),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.expire.is_zero() {
            return Err(Error::Config("expire must be greater than zero".into()));
        }
        if self.local_expire.is_some_and(|d| d.is_zero()) {
            return Err(Error::Config(
                "local_expire must be greater than zero".into(),
            ));
        }
        if self.local_limit == 0 {
            return Err(Error::Config("local_limit must be at least 1".into()));
        }
        Ok(())
    }
}

/// Fluent builder for [`CacheConfig`].
#[derive(Debug, Clone, Default)]
pub struct CacheConfigBuilder {
    config: CacheConfig,
}

impl CacheConfigBuilder {
    pub fn expire(mut self, expire: Duration) -> Self {
        self.config.expire = expire;
        self
    }

    pub fn local_expire(mut self, expire: Duration) -> Self {
        self.config.local_expire = Some(expire);
        self
    }

    pub fn local_limit(mut self, limit: usize) -> Self {
        self.config.local_limit = limit;
        self
    }

    pub fn consistency(mut self, mode: ConsistencyMode) -> Self {
        self.config.consistency = mode;
        self
    }

    pub fn stats_enabled(mut self, enabled: bool) -> Self {
        self.config.stats_enabled = enabled;
        self
    }

    pub fn penetration_protect(mut self, enabled: bool) -> Self {
        self.config.penetration_protect = enabled;
        self
    }

    pub fn lock_timeout(mut self, timeout: Duration) -> Self {
        self.config.lock_timeout = timeout;
        self
    }

    pub fn lock_backoff(mut self, backoff: Duration) -> Self {
        self.config.lock_backoff = backoff;
        self
    }

    pub fn build(self) -> Result<CacheConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Settings of the invalidation channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifierConfig {
    /// Prefix of every cache channel
    pub topic_prefix: String,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            topic_prefix: "tiercache".to_string(),
        }
    }
}

impl NotifierConfig {
    /// Channel carrying events for `cache_name`.
    pub fn channel(&self, cache_name: &str) -> String {
        format!("{}:topic:{}", self.topic_prefix, cache_name)
    }
}

/// Top-level configuration document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    pub notifier: NotifierConfig,
    /// Lease of the lock shared by every cache of the manager
    #[serde(with = "duration_ms")]
    pub lock_lease: Duration,
    pub caches: HashMap<String, CacheConfig>,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            notifier: NotifierConfig::default(),
            lock_lease: DEFAULT_LEASE,
            caches: HashMap::new(),
        }
    }
}

impl ManagerConfig {
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: ManagerConfig = serde_yaml::from_str(yaml)
            .map_err(|e| Error::Config(format!("invalid YAML: {}", e)))?;
        if config.lock_lease.is_zero() {
            return Err(Error::Config("lock_lease must be greater than zero".into()));
        }
        for (name, cache) in &config.caches {
            cache
                .validate()
                .map_err(|e| Error::Config(format!("cache '{}': {}", name, e)))?;
        }
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let yaml = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::from_yaml(&yaml)
    }

    /// Configuration for `name`, or the defaults if it is not listed.
    pub fn cache(&self, name: &str) -> CacheConfig {
        self.caches.get(name).cloned().unwrap_or_default()
    }
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> std::result::Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

mod option_duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(
        d: &Option<Duration>,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        match d {
            Some(d) => s.serialize_some(&(d.as_millis() as u64)),
            None => s.serialize_none(),
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(
        d: D,
    ) -> std::result::Result<Option<Duration>, D::Error> {
        Ok(Option::<u64>::deserialize(d)?.map(Duration::from_millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_defaults() {
        let config = CacheConfig::default();
        assert_eq!(config.expire, Duration::from_secs(300));
        assert_eq!(config.local_limit, 200);
        assert!(config.stats_enabled);
        assert!(config.penetration_protect);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_tier_settings() {
        let config = CacheConfig::builder()
            .expire(Duration::from_secs(60))
            .local_limit(10)
            .build()
            .unwrap();

        let local = config.local_settings();
        assert_eq!(local.max_entries, Some(10));
        assert_eq!(local.default_ttl, Some(Duration::from_secs(60)));

        let config = CacheConfig::builder()
            .local_expire(Duration::from_secs(5))
            .build()
            .unwrap();
        assert_eq!(
            config.local_settings().default_ttl,
            Some(Duration::from_secs(5))
        );
        assert_eq!(config.remote_settings().max_entries, None);
        assert_eq!(
            config.remote_settings().default_ttl,
            Some(Duration::from_secs(300))
        );
    }

    #[test]
    fn test_builder_rejects_invalid() {
        assert_matches!(
            CacheConfig::builder().local_limit(0).build(),
            Err(Error::Config(_))
        );
        assert_matches!(
            CacheConfig::builder().expire(Duration::ZERO).build(),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_consistency_mode_parse() {
        assert_eq!(
            "write-through".parse::<ConsistencyMode>().unwrap(),
            ConsistencyMode::WriteThrough
        );
        assert_eq!(
            "WRITE_THROUGH".parse::<ConsistencyMode>().unwrap(),
            ConsistencyMode::WriteThrough
        );
        assert_matches!("write-back".parse::<ConsistencyMode>(), Err(Error::Config(_)));
        assert_matches!("read-only".parse::<ConsistencyMode>(), Err(Error::Config(_)));
    }

    #[test]
    fn test_channel_name() {
        assert_eq!(
            NotifierConfig::default().channel("users"),
            "tiercache:topic:users"
        );
    }

    #[test]
    fn test_manager_config_from_yaml() {
        let yaml = r#"
notifier:
  topic_prefix: shop
caches:
  users:
    expire: 600000
    local_limit: 1000
    consistency: WRITE_THROUGH
  sessions:
    local_expire: 1000
    penetration_protect: false
"#;
        let config = ManagerConfig::from_yaml(yaml).unwrap();

        assert_eq!(config.notifier.channel("users"), "shop:topic:users");
        let users = config.cache("users");
        assert_eq!(users.expire, Duration::from_secs(600));
        assert_eq!(users.local_limit, 1000);

        let sessions = config.cache("sessions");
        assert_eq!(sessions.local_expire, Some(Duration::from_secs(1)));
        assert!(!sessions.penetration_protect);

        assert_eq!(config.cache("unlisted"), CacheConfig::default());
    }

    #[test]
    fn test_manager_config_rejects_bad_yaml() {
        assert_matches!(
            ManagerConfig::from_yaml("caches:\n  users:\n    consistency: write-back\n"),
            Err(Error::Config(_))
        );
        assert_matches!(
            ManagerConfig::from_yaml("caches:\n  users:\n    local_limit: 0\n"),
            Err(Error::Config(_))
        );
        assert_matches!(
            ManagerConfig::from_yaml("lock_lease: 0\n"),
            Err(Error::Config(_))
        );
    }

    #[test]
    fn test_yaml_consistency_accepts_every_parsed_spelling() {
        for spelling in ["write-through", "WRITE_THROUGH", "write_through", "Write-Through"] {
            let yaml = format!("caches:\n  users:\n    consistency: {}\n", spelling);
            let config = ManagerConfig::from_yaml(&yaml).unwrap();
            assert_eq!(
                config.cache("users").consistency,
                ConsistencyMode::WriteThrough,
                "{}",
                spelling
            );
        }
    }

    #[test]
    fn test_manager_lock_lease() {
        assert_eq!(ManagerConfig::default().lock_lease, Duration::from_secs(30));

        let config = ManagerConfig::from_yaml("lock_lease: 5000\n").unwrap();
        assert_eq!(config.lock_lease, Duration::from_secs(5));
    }

    #[test]
    fn test_config_roundtrips_through_json() {
        let config = CacheConfig::builder()
            .local_expire(Duration::from_millis(1500))
            .build()
            .unwrap();
        let json = serde_json::to_value(&config).unwrap();
        assert_eq!(json["local_expire"], 1500);
        assert_eq!(json["consistency"], "write-through");

        let back: CacheConfig = serde_json::from_value(json).unwrap();
        assert_eq!(back, config);
    }
}
