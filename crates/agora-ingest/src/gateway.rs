//! The assembled gateway: every component, constructed in order and shut
//! down explicitly.

use std::sync::Arc;

use agora_core::{Event, Filter};
use agora_store::{EventCache, EventStore, Hydrator, RemoteFetcher, StatsEngine};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::GatewayConfig;
use crate::pipeline::{Firehose, FirehoseStats, TrendTracker};
use crate::relay::{
    NostrTransport, PublishReport, RelayDirectory, RelayPool, RelayTransport, TransportConfig,
};
use crate::Result;

/// Handles to every gateway component.
pub struct Gateway {
    store: EventStore,
    stats: Arc<StatsEngine>,
    directory: Arc<RelayDirectory>,
    trends: Arc<TrendTracker>,
    pool: Arc<RelayPool>,
    cache: EventCache,
    hydrator: Hydrator,
    firehose: Arc<Firehose>,
    shutdown: CancellationToken,
    firehose_task: Mutex<Option<JoinHandle<FirehoseStats>>>,
}

/// Totals reported on shutdown.
#[derive(Debug, Clone, Copy, Default)]
pub struct ShutdownSummary {
    pub firehose: FirehoseStats,
    pub recounts_completed: u64,
    pub cache: agora_store::CacheStats,
}

impl Gateway {
    /// Start the gateway against live relays.
    pub async fn start(config: GatewayConfig) -> Result<Self> {
        let transport = Arc::new(NostrTransport::new(TransportConfig::default()));
        Self::with_transport(config, transport).await
    }

    /// Start the gateway over an arbitrary transport.
    ///
    /// Only opening the event store is fatal. A firehose subscription that
    /// cannot be opened leaves the gateway running without live ingestion.
    pub async fn with_transport(config: GatewayConfig, transport: Arc<dyn RelayTransport>) -> Result<Self> {
        config.validate()?;

        let store = EventStore::open(&config.store_config())?;
        info!("Event store open at {}", config.database_path.display());
        for user in &config.local_users {
            store.add_local_user(user).await?;
        }

        let stats = Arc::new(StatsEngine::start(store.clone(), config.stats_config()));

        let directory = Arc::new(RelayDirectory::open(&config.ingest_database_path)?);
        directory.register_seed_relays(&config.upstream_relays)?;
        let trends = Arc::new(TrendTracker::open(
            &config.ingest_database_path,
            config.trend_tag_limit,
        )?);

        let pool = Arc::new(RelayPool::new(transport, store.clone(), config.pool_config()));
        let fetcher: Arc<dyn RemoteFetcher> = pool.clone();
        let cache = EventCache::new(store.clone(), fetcher, config.cache_config());
        let hydrator = Hydrator::new(store.clone(), config.admin_pubkey.clone());

        let firehose = Arc::new(Firehose::new(stats.clone(), trends.clone(), directory.clone()));
        let gateway = Self {
            store,
            stats,
            directory,
            trends,
            pool,
            cache,
            hydrator,
            firehose,
            shutdown: CancellationToken::new(),
            firehose_task: Mutex::new(None),
        };

        gateway.subscribe().await;
        Ok(gateway)
    }

    /// Open the live subscription on the write set and spawn the firehose.
    async fn subscribe(&self) {
        let relays = match self.pool.write_set().await {
            Ok(relays) if !relays.is_empty() => relays,
            Ok(_) => {
                warn!("No upstream relays configured, live ingestion disabled");
                return;
            }
            Err(e) => {
                warn!("Failed to resolve the write set, live ingestion disabled: {}", e);
                return;
            }
        };

        let since = chrono::Utc::now().timestamp().max(0) as u64;
        let filter = Filter::new().since(since);
        let events = match self.pool.transport().subscribe(&relays, &[filter]).await {
            Ok(events) => events,
            Err(e) => {
                warn!("Failed to open firehose subscription: {}", e);
                return;
            }
        };
        info!("Firehose subscribed to {} relays", relays.len());

        let firehose = self.firehose.clone();
        let shutdown = self.shutdown.clone();
        let task = tokio::spawn(async move { firehose.run(events, shutdown).await });
        *self.firehose_task.lock() = Some(task);
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn stats(&self) -> &StatsEngine {
        &self.stats
    }

    pub fn directory(&self) -> &RelayDirectory {
        &self.directory
    }

    pub fn trends(&self) -> &TrendTracker {
        &self.trends
    }

    pub fn pool(&self) -> &RelayPool {
        &self.pool
    }

    pub fn cache(&self) -> &EventCache {
        &self.cache
    }

    pub fn hydrator(&self) -> &Hydrator {
        &self.hydrator
    }

    pub fn firehose(&self) -> &Firehose {
        &self.firehose
    }

    /// Publish a locally authored event to its author's outbox relays and
    /// make it resolvable through the cache right away.
    pub async fn publish(&self, event: &Event) -> Result<PublishReport> {
        let report = self.pool.publish(event).await?;
        self.cache.prime(Arc::new(event.clone())).await;
        Ok(report)
    }

    /// Stop ingestion, close relay connections and finish queued recounts.
    pub async fn shutdown(&self) -> ShutdownSummary {
        self.shutdown.cancel();

        let task = self.firehose_task.lock().take();
        let firehose = match task {
            Some(task) => match task.await {
                Ok(stats) => stats,
                Err(e) => {
                    warn!("Firehose task failed: {}", e);
                    self.firehose.stats()
                }
            },
            None => self.firehose.stats(),
        };

        self.pool.transport().disconnect().await;
        self.stats.drain().await;

        ShutdownSummary {
            firehose,
            recounts_completed: self.stats.queue().completed(),
            cache: self.cache.stats(),
        }
    }
}
