//! Three-tier single-event lookup: hot cache, event store, upstream relays.
//!
//! Remote lookups are coalesced: concurrent requests inside one batch window
//! share one upstream round trip, and concurrent requests for the same id
//! never fetch it twice. Absences are negative-cached for a shorter TTL than
//! hits, so an event that shows up upstream later is found on a later call.

mod batch;

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use agora_core::Event;
use agora_core::event::validate_hex;
use async_trait::async_trait;
use moka::Expiry;
use moka::future::Cache;
use tokio_util::sync::CancellationToken;

pub use batch::BatchStatus;
use batch::{Batcher, Resolution};

use crate::error::{Error, Result};
use crate::store::EventStore;

/// Source of events the local store does not have.
#[async_trait]
pub trait RemoteFetcher: Send + Sync {
    /// Fetch whichever of `ids` the upstream has. Missing ids are simply
    /// absent from the result; an error means upstream was unreachable.
    async fn fetch_ids(&self, ids: &[String]) -> Result<Vec<Event>>;
}

/// Configuration for the event cache.
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Maximum hot-cache entries.
    pub capacity: u64,
    pub positive_ttl: Duration,
    /// Kept shorter than `positive_ttl`.
    pub negative_ttl: Duration,
    /// Batch window length.
    pub batch_delay: Duration,
    /// Ids per batch before it flushes early.
    pub batch_max_size: usize,
    /// Maximum wait per fetch, independent of the batch window.
    pub batch_timeout: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            positive_ttl: Duration::from_secs(300),
            negative_ttl: Duration::from_secs(30),
            batch_delay: Duration::from_millis(50),
            batch_max_size: 100,
            batch_timeout: Duration::from_secs(5),
        }
    }
}

/// Hot-cache value.
#[derive(Debug, Clone)]
pub(crate) enum Entry {
    Found(Arc<Event>),
    Missing,
}

struct EntryExpiry {
    positive: Duration,
    negative: Duration,
}

impl Expiry<String, Entry> for EntryExpiry {
    fn expire_after_create(&self, _key: &String, value: &Entry, _created_at: Instant) -> Option<Duration> {
        match value {
            Entry::Found(_) => Some(self.positive),
            Entry::Missing => Some(self.negative),
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct CacheCounters {
    hot_hits: AtomicU64,
    store_hits: AtomicU64,
    remote_hits: AtomicU64,
    misses: AtomicU64,
    batches_flushed: AtomicU64,
    ids_fetched: AtomicU64,
}

impl CacheCounters {
    fn hit(&self, tier: &'static str) {
        let counter = match tier {
            "hot" => &self.hot_hits,
            "store" => &self.store_hits,
            "remote" => &self.remote_hits,
            _ => &self.misses,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        metrics::counter!("cache_hits_total", "tier" => tier).increment(1);
    }

    pub(crate) fn batch_flushed(&self, ids: usize) {
        self.batches_flushed.fetch_add(1, Ordering::Relaxed);
        self.ids_fetched.fetch_add(ids as u64, Ordering::Relaxed);
        metrics::counter!("cache_batches_flushed_total").increment(1);
    }
}

/// Point-in-time cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hot_hits: u64,
    pub store_hits: u64,
    pub remote_hits: u64,
    /// Lookups that resolved to "not found" at any tier.
    pub misses: u64,
    pub batches_flushed: u64,
    pub ids_fetched: u64,
}

/// Event lookup by id through the hot cache, the store and upstream.
pub struct EventCache {
    hot: Cache<String, Entry>,
    store: EventStore,
    batcher: Arc<Batcher>,
    counters: Arc<CacheCounters>,
    batch_timeout: Duration,
}

impl EventCache {
    pub fn new(store: EventStore, fetcher: Arc<dyn RemoteFetcher>, config: CacheConfig) -> Self {
        let hot = Cache::builder()
            .max_capacity(config.capacity)
            .expire_after(EntryExpiry {
                positive: config.positive_ttl,
                negative: config.negative_ttl,
            })
            .build();
        let counters = Arc::new(CacheCounters::default());
        let batcher = Arc::new(Batcher::new(
            fetcher,
            hot.clone(),
            Arc::clone(&counters),
            config.batch_delay,
            config.batch_max_size,
            config.batch_timeout,
        ));
        Self {
            hot,
            store,
            batcher,
            counters,
            batch_timeout: config.batch_timeout,
        }
    }

    /// Look up one event by id.
    ///
    /// `Ok(None)` is a normal "not found". `Timeout` and `Cancelled` only
    /// affect this caller; other callers sharing the batch still resolve.
    pub async fn fetch(&self, id: &str, signal: Option<CancellationToken>) -> Result<Option<Arc<Event>>> {
        validate_hex(id, 64, "id")?;

        if let Some(entry) = self.hot.get(id).await {
            return Ok(match entry {
                Entry::Found(event) => {
                    self.counters.hit("hot");
                    Some(event)
                }
                Entry::Missing => {
                    self.counters.hit("miss");
                    None
                }
            });
        }

        if let Some(event) = self
            .store
            .get_many(&[id.to_string()], signal.clone())
            .await?
            .pop()
        {
            let event = Arc::new(event);
            self.hot.insert(id.to_string(), Entry::Found(Arc::clone(&event))).await;
            self.counters.hit("store");
            return Ok(Some(event));
        }

        let receiver = self.batcher.enqueue(id);
        let wait = tokio::time::timeout(self.batch_timeout, receiver);
        let outcome = match &signal {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => return Err(Error::Cancelled),
                outcome = wait => outcome,
            },
            None => wait.await,
        };

        match outcome {
            Err(_) => Err(Error::Timeout(self.batch_timeout)),
            Ok(Err(_)) => Err(Error::Shutdown("fetch batch")),
            Ok(Ok(Resolution::Found(event))) => {
                self.counters.hit("remote");
                Ok(Some(event))
            }
            Ok(Ok(Resolution::Missing)) => {
                self.counters.hit("miss");
                Ok(None)
            }
            Ok(Ok(Resolution::Failed(reason))) => Err(Error::UpstreamUnavailable(reason)),
        }
    }

    /// Seed the hot cache with an event obtained elsewhere.
    pub async fn prime(&self, event: Arc<Event>) {
        self.hot.insert(event.id.clone(), Entry::Found(event)).await;
    }

    /// Snapshot of the lookup counters.
    pub fn stats(&self) -> CacheStats {
        let c = &self.counters;
        CacheStats {
            hot_hits: c.hot_hits.load(Ordering::Relaxed),
            store_hits: c.store_hits.load(Ordering::Relaxed),
            remote_hits: c.remote_hits.load(Ordering::Relaxed),
            misses: c.misses.load(Ordering::Relaxed),
            batches_flushed: c.batches_flushed.load(Ordering::Relaxed),
            ids_fetched: c.ids_fetched.load(Ordering::Relaxed),
        }
    }

    /// Lifecycle position of a coalesced batch.
    pub fn batch_status(&self, generation: u64) -> BatchStatus {
        self.batcher.status(generation)
    }

    /// Generation of the batch currently collecting, if any.
    pub fn open_batch(&self) -> Option<u64> {
        self.batcher.open_generation()
    }
}
