//! Redis Adapters
//!
//! The shared remote tier, the cross-process lock and the pub/sub transport,
//! all backed by one Redis deployment.
//!
//! ## Key layout
//!
//! | Purpose | Key |
//! |---------|-----|
//! | Tier entry | `{prefix}{tier}:{json key}` e.g. `tc:users:remote:"u-42"` |
//! | Lock | `{prefix}lock:{lock key}` |
//! | Events | channel `{topic_prefix}:topic:{cache}` |

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use dashmap::DashMap;
use futures::StreamExt;
use parking_lot::Mutex;
use redis::aio::{ConnectionManager, PubSub};
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use crate::domain::ports::{
    CacheKey, CacheValue, DistributedLock, MessageHandler, SubscriptionId, Tier, TierManager,
    TierSettings, Transport,
};
use crate::error::Result;

/// Default key prefix for everything this crate stores in Redis
pub const DEFAULT_KEY_PREFIX: &str = "tc:";

const SCAN_BATCH: usize = 500;
const LOCK_POLL_INTERVAL: Duration = Duration::from_millis(10);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(300);

/// Open a client and a multiplexed, auto-reconnecting connection.
pub async fn connect(url: &str) -> Result<(redis::Client, ConnectionManager)> {
    let client = redis::Client::open(url)?;
    let conn = ConnectionManager::new(client.clone()).await?;
    info!(url = %redact(url), "Connected to Redis");
    Ok((client, conn))
}

/// Strip credentials before logging a connection URL.
fn redact(url: &str) -> String {
    match (url.find("://"), url.rfind('@')) {
        (Some(scheme), Some(at)) if at > scheme => format!("{}://***{}", &url[..scheme], &url[at..]),
        _ => url.to_string(),
    }
}

/// Escape glob metacharacters for SCAN MATCH.
fn escape_glob(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    for c in s.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

/// PX argument; Redis rejects zero.
fn expiry_millis(ttl: Duration) -> u64 {
    u64::try_from(ttl.as_millis()).unwrap_or(u64::MAX).max(1)
}

// =============================================================================
// Remote Tier
// =============================================================================

/// Cache tier stored in Redis as JSON strings.
pub struct RedisTier<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    name: String,
    prefix: String,
    conn: ConnectionManager,
    default_ttl: Option<Duration>,
    _marker: PhantomData<fn() -> (K, V)>,
}

impl<K, V> RedisTier<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub fn new(
        name: impl Into<String>,
        prefix: impl Into<String>,
        conn: ConnectionManager,
        settings: &TierSettings,
    ) -> Self {
        Self {
            name: name.into(),
            prefix: prefix.into(),
            conn,
            default_ttl: settings.default_ttl,
            _marker: PhantomData,
        }
    }

    fn namespace(&self) -> String {
        format!("{}{}:", self.prefix, self.name)
    }

    fn redis_key(&self, key: &K) -> Result<String> {
        Ok(format!("{}{}", self.namespace(), serde_json::to_string(key)?))
    }

    fn set_command(&self, key: String, value: String, ttl: Option<Duration>) -> redis::Cmd {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if let Some(ttl) = ttl.or(self.default_ttl) {
            cmd.arg("PX").arg(expiry_millis(ttl));
        }
        cmd
    }
}

#[async_trait]
impl<K, V> Tier<K, V> for RedisTier<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn name(&self) -> &str {
        &self.name
    }

    async fn get(&self, key: &K) -> Result<Option<V>> {
        let redis_key = self.redis_key(key)?;
        let mut conn = self.conn.clone();
        let raw: Option<String> = conn.get(&redis_key).await?;
        match raw {
            Some(json) => Ok(Some(serde_json::from_str(&json)?)),
            None => Ok(None),
        }
    }

    async fn put(&self, key: &K, value: &V, ttl: Option<Duration>) -> Result<()> {
        let cmd = self.set_command(self.redis_key(key)?, serde_json::to_string(value)?, ttl);
        let mut conn = self.conn.clone();
        let _: () = cmd.query_async(&mut conn).await?;
        Ok(())
    }

    async fn put_all(&self, entries: &HashMap<K, V>) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut pipe = redis::pipe();
        for (key, value) in entries {
            let cmd = self.set_command(self.redis_key(key)?, serde_json::to_string(value)?, None);
            pipe.add_command(cmd).ignore();
        }
        let mut conn = self.conn.clone();
        let _: () = pipe.query_async(&mut conn).await?;
        Ok(())
    }

    async fn remove(&self, key: &K) -> Result<bool> {
        let redis_key = self.redis_key(key)?;
        let mut conn = self.conn.clone();
        let deleted: i64 = conn.del(&redis_key).await?;
        Ok(deleted > 0)
    }

    async fn clear(&self) -> Result<()> {
        let pattern = format!("{}*", escape_glob(&self.namespace()));
        let mut conn = self.conn.clone();
        let mut cursor: u64 = 0;
        let mut deleted = 0usize;

        loop {
            let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut conn)
                .await?;

            if !keys.is_empty() {
                deleted += keys.len();
                let _: () = conn.del(keys).await?;
            }
            if next == 0 {
                break;
            }
            cursor = next;
        }

        debug!(tier = %self.name, deleted, "Cleared remote tier");
        Ok(())
    }
}

/// Hands out [`RedisTier`]s sharing one connection.
///
/// Removing a tier only drops the handle; entries stay in Redis for the
/// other instances and expire on their own.
pub struct RedisTierManager<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    conn: ConnectionManager,
    prefix: String,
    tiers: DashMap<String, Arc<RedisTier<K, V>>>,
}

impl<K, V> RedisTierManager<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            tiers: DashMap::new(),
        }
    }
}

impl<K, V> TierManager<K, V> for RedisTierManager<K, V>
where
    K: CacheKey,
    V: CacheValue,
{
    fn kind(&self) -> &'static str {
        "redis"
    }

    fn create_tier(&self, name: &str, settings: &TierSettings) -> Result<Arc<dyn Tier<K, V>>> {
        let tier = self
            .tiers
            .entry(name.to_string())
            .or_insert_with(|| {
                debug!(tier = name, ?settings, "Creating redis tier");
                Arc::new(RedisTier::new(name, self.prefix.clone(), self.conn.clone(), settings))
            })
            .value()
            .clone();
        Ok(tier)
    }

    fn remove_tier(&self, name: &str) -> bool {
        self.tiers.remove(name).is_some()
    }

    fn tier_names(&self) -> Vec<String> {
        self.tiers.iter().map(|t| t.key().clone()).collect()
    }
}

// =============================================================================
// Lock
// =============================================================================

/// Lease lock using `SET key "" NX PX lease` and `DEL`.
pub struct RedisLock {
    conn: ConnectionManager,
    prefix: String,
    lease: Duration,
}

impl RedisLock {
    pub fn new(conn: ConnectionManager, prefix: impl Into<String>, lease: Duration) -> Self {
        Self {
            conn,
            prefix: prefix.into(),
            lease,
        }
    }

    fn lock_key(&self, key: &str) -> String {
        format!("{}lock:{}", self.prefix, key)
    }

    async fn acquire_once(&self, lock_key: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let reply: Option<String> = redis::cmd("SET")
            .arg(lock_key)
            .arg("")
            .arg("NX")
            .arg("PX")
            .arg(expiry_millis(self.lease))
            .query_async(&mut conn)
            .await?;
        Ok(reply.is_some())
    }
}

#[async_trait]
impl DistributedLock for RedisLock {
    async fn try_lock(&self, key: &str, timeout: Duration) -> bool {
        let lock_key = self.lock_key(key);
        let deadline = tokio::time::Instant::now() + timeout;

        loop {
            match self.acquire_once(&lock_key).await {
                Ok(true) => {
                    trace!(key = %lock_key, "Lock acquired");
                    return true;
                }
                Ok(false) => {}
                Err(e) => {
                    // Backend trouble counts as not acquired
                    warn!(key = %lock_key, error = %e, "Lock attempt failed");
                }
            }

            let now = tokio::time::Instant::now();
            if now >= deadline {
                return false;
            }
            tokio::time::sleep(LOCK_POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn unlock(&self, key: &str) {
        let lock_key = self.lock_key(key);
        let mut conn = self.conn.clone();
        let result: redis::RedisResult<i64> = conn.del(&lock_key).await;
        if let Err(e) = result {
            warn!(key = %lock_key, error = %e, "Lock release failed, lease will expire");
        }
    }
}

// =============================================================================
// Transport
// =============================================================================

/// Redis PUBLISH/SUBSCRIBE transport.
///
/// Each subscription owns a dedicated pub/sub connection driven by a
/// background task that reconnects with exponential backoff (1s up to 5min).
pub struct RedisTransport {
    client: redis::Client,
    conn: ConnectionManager,
    next_id: AtomicU64,
    subscriptions: Mutex<HashMap<SubscriptionId, CancellationToken>>,
}

impl RedisTransport {
    pub fn new(client: redis::Client, conn: ConnectionManager) -> Self {
        Self {
            client,
            conn,
            next_id: AtomicU64::new(0),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }
}

impl Drop for RedisTransport {
    fn drop(&mut self) {
        for (_, token) in self.subscriptions.lock().drain() {
            token.cancel();
        }
    }
}

async fn open_subscription(client: &redis::Client, channel: &str) -> redis::RedisResult<PubSub> {
    let mut pubsub = client.get_async_pubsub().await?;
    pubsub.subscribe(channel).await?;
    Ok(pubsub)
}

async fn pump(pubsub: &mut PubSub, channel: &str, handler: &dyn MessageHandler) {
    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        handler
            .on_message(channel, Bytes::copy_from_slice(msg.get_payload_bytes()))
            .await;
    }
}

async fn listen(
    client: redis::Client,
    channel: String,
    handler: Arc<dyn MessageHandler>,
    mut pubsub: PubSub,
    token: CancellationToken,
) {
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                debug!(channel = %channel, "Subscription cancelled");
                return;
            }
            _ = pump(&mut pubsub, &channel, handler.as_ref()) => {
                warn!(channel = %channel, "Pub/sub stream ended, reconnecting");
            }
        }

        let mut backoff = INITIAL_BACKOFF;
        loop {
            tokio::select! {
                _ = token.cancelled() => return,
                _ = tokio::time::sleep(backoff) => {}
            }
            match open_subscription(&client, &channel).await {
                Ok(reopened) => {
                    pubsub = reopened;
                    info!(channel = %channel, "Resubscribed");
                    break;
                }
                Err(e) => {
                    error!(
                        channel = %channel,
                        error = %e,
                        backoff_secs = backoff.as_secs(),
                        "Resubscribe failed"
                    );
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                }
            }
        }
    }
}

#[async_trait]
impl Transport for RedisTransport {
    async fn publish(&self, channel: &str, payload: Bytes) -> Result<()> {
        let mut conn = self.conn.clone();
        let _: () = conn.publish(channel, payload.as_ref()).await?;
        Ok(())
    }

    async fn subscribe(
        &self,
        channel: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<SubscriptionId> {
        // First subscription inline so failures reach the caller
        let pubsub = open_subscription(&self.client, channel).await?;

        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        let token = CancellationToken::new();
        self.subscriptions.lock().insert(id, token.clone());

        tokio::spawn(listen(
            self.client.clone(),
            channel.to_string(),
            handler,
            pubsub,
            token,
        ));
        info!(channel, "Subscribed to Redis channel");
        Ok(id)
    }

    async fn unsubscribe(&self, id: SubscriptionId) -> Result<()> {
        if let Some(token) = self.subscriptions.lock().remove(&id) {
            token.cancel();
        }
        Ok(())
    }
}
