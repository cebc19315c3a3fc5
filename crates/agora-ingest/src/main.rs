//! Agora gateway daemon.
//!
//! Mirrors the upstream firehose into the local event store for local users
//! and the accounts they follow, keeps derived stats current, and serves
//! event lookups through the coalescing cache.
//!
//! # Usage
//!
//! ```bash
//! agora-gateway \
//!     --upstream-relays wss://relay.damus.io,wss://nos.lol \
//!     --local-relay wss://agora.example.com \
//!     --admin-pubkey <hex> \
//!     --local-users <hex>,<hex>
//! ```
//!
//! Every option can also be set through an `AGORA_*` environment variable.
//!
//! # Graceful Shutdown
//!
//! On Ctrl+C the daemon:
//! 1. Stops the firehose
//! 2. Disconnects from upstream relays
//! 3. Drains the stats recount queue
//! 4. Logs a summary

use std::path::PathBuf;
use std::time::Duration;

use agora_core::metrics::{init_metrics, start_metrics_server};
use agora_ingest::{Gateway, GatewayConfig};
use anyhow::{Context, Result, anyhow};
use clap::Parser;
use metrics::gauge;
use tracing_subscriber::EnvFilter;

/// Agora gateway daemon.
#[derive(Parser, Debug)]
#[command(name = "agora-gateway")]
#[command(about = "Nostr gateway core: firehose ingestion, stats and outbox routing")]
#[command(version)]
struct Args {
    /// Upstream relay URLs (comma-separated)
    #[arg(long, env = "AGORA_UPSTREAM_RELAYS", value_delimiter = ',')]
    upstream_relays: Vec<String>,

    /// This gateway's own relay URL
    #[arg(long, env = "AGORA_LOCAL_RELAY")]
    local_relay: Option<String>,

    /// Admin pubkey (hex)
    #[arg(long, env = "AGORA_ADMIN_PUBKEY")]
    admin_pubkey: Option<String>,

    /// Pubkeys (hex, comma-separated) registered as local users
    #[arg(long, env = "AGORA_LOCAL_USERS", value_delimiter = ',')]
    local_users: Vec<String>,

    /// Event store database path
    #[arg(long, env = "AGORA_DATABASE_PATH", default_value = "./data/agora.db")]
    database_path: PathBuf,

    /// Relay directory and trends database path
    #[arg(long, env = "AGORA_INGEST_DATABASE_PATH", default_value = "./data/agora-ingest.db")]
    ingest_database_path: PathBuf,

    /// Maximum hot-cache entries
    #[arg(long, env = "AGORA_CACHE_SIZE", default_value = "10000")]
    cache_size: u64,

    /// Positive cache TTL in seconds
    #[arg(long, env = "AGORA_POSITIVE_CACHE_TTL", default_value = "300")]
    positive_cache_ttl_secs: u64,

    /// Negative cache TTL in seconds
    #[arg(long, env = "AGORA_NEGATIVE_CACHE_TTL", default_value = "30")]
    negative_cache_ttl_secs: u64,

    /// Coalescing window in milliseconds
    #[arg(long, env = "AGORA_BATCH_DELAY_MS", default_value = "50")]
    batch_delay_ms: u64,

    /// Ids per batch before it flushes early
    #[arg(long, env = "AGORA_BATCH_MAX_SIZE", default_value = "100")]
    batch_max_size: usize,

    /// Maximum wait per upstream fetch in milliseconds
    #[arg(long, env = "AGORA_BATCH_TIMEOUT_MS", default_value = "5000")]
    batch_timeout_ms: u64,

    /// Store operation timeout in milliseconds
    #[arg(long, env = "AGORA_QUERY_TIMEOUT_MS", default_value = "5000")]
    query_timeout_ms: u64,

    /// Maximum pending stats recount keys
    #[arg(long, env = "AGORA_STATS_DEBOUNCE_CAPACITY", default_value = "1000")]
    stats_debounce_capacity: usize,

    /// Maximum outbox relays per publish
    #[arg(long, env = "AGORA_OUTBOX_MAX_RELAYS", default_value = "4")]
    outbox_max_relays: usize,

    /// Hashtags per event counted for trends
    #[arg(long, env = "AGORA_TREND_TAG_LIMIT", default_value = "5")]
    trend_tag_limit: usize,

    /// Metrics HTTP server port (0 to disable)
    #[arg(long, env = "AGORA_METRICS_PORT", default_value = "9091")]
    metrics_port: u16,
}

impl From<Args> for GatewayConfig {
    fn from(args: Args) -> Self {
        Self {
            upstream_relays: args.upstream_relays,
            local_relay: args.local_relay,
            admin_pubkey: args.admin_pubkey,
            local_users: args.local_users,
            database_path: args.database_path,
            ingest_database_path: args.ingest_database_path,
            cache_size: args.cache_size,
            positive_cache_ttl: Duration::from_secs(args.positive_cache_ttl_secs),
            negative_cache_ttl: Duration::from_secs(args.negative_cache_ttl_secs),
            batch_delay: Duration::from_millis(args.batch_delay_ms),
            batch_max_size: args.batch_max_size,
            batch_timeout: Duration::from_millis(args.batch_timeout_ms),
            query_timeout: Duration::from_millis(args.query_timeout_ms),
            stats_debounce_capacity: args.stats_debounce_capacity,
            outbox_max_relays: args.outbox_max_relays,
            trend_tag_limit: args.trend_tag_limit,
            metrics_port: args.metrics_port,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls crypto provider (required when both ring and aws-lc-rs are present)
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow!("Failed to install rustls crypto provider"))?;

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("info".parse()?)
                .add_directive("agora_ingest=debug".parse()?),
        )
        .init();

    let config = GatewayConfig::from(Args::parse());

    tracing::info!("Agora gateway starting...");
    tracing::info!("Configuration:");
    tracing::info!("  Event store: {}", config.database_path.display());
    tracing::info!("  Ingest store: {}", config.ingest_database_path.display());
    tracing::info!("  Upstream relays: {}", config.upstream_relays.len());
    tracing::info!("  Local relay: {}", config.local_relay.as_deref().unwrap_or("(none)"));
    tracing::info!("  Local users: {}", config.local_users.len());
    tracing::info!("  Cache size: {}", config.cache_size);

    if config.metrics_port > 0 {
        match init_metrics() {
            Some(handle) => {
                start_metrics_server(config.metrics_port, handle)
                    .await
                    .context("Failed to start metrics server")?;
                gauge!("gateway_running").set(1.0);
            }
            None => tracing::warn!("Metrics recorder already installed, exporter disabled"),
        }
    }

    let gateway = Gateway::start(config)
        .await
        .context("Failed to start gateway")?;

    tracing::info!("Gateway running, press Ctrl+C to stop");
    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl+C")?;
    tracing::info!("Shutdown signal received, stopping gracefully...");

    let summary = gateway.shutdown().await;
    gauge!("gateway_running").set(0.0);

    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("SHUTDOWN COMPLETE");
    tracing::info!("═══════════════════════════════════════════════════════");
    tracing::info!("Events received:      {}", summary.firehose.received);
    tracing::info!("Events stored:        {}", summary.firehose.stored);
    tracing::info!("Events duplicate:     {}", summary.firehose.duplicate);
    tracing::info!("Events discarded:     {}", summary.firehose.discarded);
    tracing::info!("Events dropped:       {}", summary.firehose.dropped);
    tracing::info!("Stats recounts:       {}", summary.recounts_completed);
    tracing::info!(
        "Cache hits:           {} hot / {} store / {} remote ({} misses)",
        summary.cache.hot_hits,
        summary.cache.store_hits,
        summary.cache.remote_hits,
        summary.cache.misses
    );

    Ok(())
}
