//! tiercache CLI
//!
//! Operates on a multi-level cache backed by Redis from the command line,
//! and can watch the invalidation channel of a cache.
//!
//! ```text
//! tiercache get users u-42
//! tiercache put users u-42 '{"name":"Ada"}' --ttl-ms 60000
//! tiercache watch users
//! ```

use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde_json::Value;
use tracing::{info, Level};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use tiercache::adapters::redis::{
    connect, RedisLock, RedisTierManager, RedisTransport, DEFAULT_KEY_PREFIX,
};
use tiercache::cache::{LocalTierManager, ManagerConfig, MultiLevelCache, MultiLevelCacheManager};
use tiercache::domain::ports::CacheNotifier;
use tiercache::{LoggingEventListener, PubSubNotifier};

// =============================================================================
// CLI Arguments
// =============================================================================

/// tiercache - multi-level cache with cross-instance invalidation
#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Redis server URL
    #[arg(long, env = "REDIS_URL", default_value = "redis://127.0.0.1:6379")]
    redis_url: String,

    /// YAML file with notifier and per-cache settings
    #[arg(long, env = "TIERCACHE_CONFIG")]
    config: Option<String>,

    /// Prefix for keys stored in Redis
    #[arg(long, env = "TIERCACHE_KEY_PREFIX", default_value = DEFAULT_KEY_PREFIX)]
    key_prefix: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, env = "LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Output logs as JSON
    #[arg(long, env = "LOG_JSON")]
    log_json: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the cached value of a key
    Get {
        cache: String,
        key: String,
    },
    /// Store a value in every tier and notify peers
    Put {
        cache: String,
        key: String,
        /// Value as JSON
        value: String,
        /// Per-entry TTL in milliseconds
        #[arg(long)]
        ttl_ms: Option<u64>,
    },
    /// Remove a key from every tier and notify peers
    Remove { cache: String, key: String },
    /// Clear a cache and notify peers
    Clear { cache: String },
    /// Log events published on a cache's channel until interrupted
    Watch { cache: String },
}

impl Command {
    fn cache(&self) -> &str {
        match self {
            Command::Get { cache, .. }
            | Command::Put { cache, .. }
            | Command::Remove { cache, .. }
            | Command::Clear { cache }
            | Command::Watch { cache } => cache,
        }
    }
}

// =============================================================================
// Main
// =============================================================================

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = match &args.config {
        Some(path) => ManagerConfig::from_file(path)?,
        None => ManagerConfig::default(),
    };
    let cache_name = args.command.cache().to_string();
    let cache_config = config.cache(&cache_name);

    info!("Starting tiercache");
    info!("  Cache: {}", cache_name);
    info!("  Topic prefix: {}", config.notifier.topic_prefix);
    info!("  Expire: {:?}", cache_config.expire);

    let (client, conn) = connect(&args.redis_url).await?;

    let transport = Arc::new(RedisTransport::new(client, conn.clone()));
    let notifier = Arc::new(PubSubNotifier::new(transport, config.notifier.clone()));

    if let Command::Watch { cache } = &args.command {
        return watch(notifier, cache).await;
    }

    let manager: MultiLevelCacheManager<String, Value> = MultiLevelCacheManager::builder()
        .local_tiers(Arc::new(LocalTierManager::new()))
        .remote_tiers(Arc::new(RedisTierManager::new(conn.clone(), &args.key_prefix)))
        .notifier(notifier)
        .lock(Arc::new(RedisLock::new(conn, &args.key_prefix, config.lock_lease)))
        .config(config)
        .build()?;

    let cache = manager.cache(&cache_name).await?;
    let outcome = run(&cache, args.command).await;

    manager.close().await?;
    outcome
}

async fn run(cache: &MultiLevelCache<String, Value>, command: Command) -> anyhow::Result<()> {
    match command {
        Command::Get { key, .. } => {
            match cache.get(&key).await {
                Some(value) => println!("{}", serde_json::to_string_pretty(&value)?),
                None => println!("(miss)"),
            }
        }
        Command::Put {
            key, value, ttl_ms, ..
        } => {
            let value: Value = serde_json::from_str(&value)?;
            cache
                .put_with_ttl(&key, &value, ttl_ms.map(Duration::from_millis))
                .await;
            info!(cache = cache.name(), key = %key, "Stored");
        }
        Command::Remove { key, .. } => {
            let removed = cache.remove(&key).await;
            info!(cache = cache.name(), key = %key, removed, "Removed");
        }
        Command::Clear { .. } => {
            cache.clear().await;
            info!(cache = cache.name(), "Cleared");
        }
        // Handled before a cache is built
        Command::Watch { .. } => {}
    }
    Ok(())
}

async fn watch(notifier: Arc<PubSubNotifier>, cache: &str) -> anyhow::Result<()> {
    notifier
        .subscribe(cache, Arc::new(LoggingEventListener::info_level()))
        .await?;
    info!(channel = %notifier.channel(cache), "Watching, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;

    notifier.unsubscribe(cache).await?;
    info!("Watch stopped");
    Ok(())
}

// =============================================================================
// Logging Setup
// =============================================================================

fn init_logging(args: &Args) {
    let level = match args.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "info" => Level::INFO,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let mut filter = EnvFilter::from_default_env().add_directive(level.into());
    if let Ok(directive) = "redis=warn".parse() {
        filter = filter.add_directive(directive);
    }

    if args.log_json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true))
            .init();
    }
}
