//! Firehose: the ingestion loop over the upstream subscription.
//!
//! For every event:
//! 1. hashtag usages go to the [`TrendTracker`]
//! 2. relay addresses go to the [`RelayDirectory`]
//! 3. the event is stored only if its author is a local user or is followed
//!    by one
//!
//! Steps 1 and 2 never fail the event. Storage failures drop the event and
//! the loop moves on.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use agora_core::Event;
use agora_store::{InsertOutcome, StatsEngine};
use metrics::{counter, gauge};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::trends::TrendTracker;
use crate::relay::RelayDirectory;

/// What happened to one firehose event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Written to the event store.
    Stored,
    /// Already stored.
    Duplicate,
    /// Not stored: author outside the local graph, malformed, ephemeral or
    /// superseded.
    Discarded,
    /// Storage failed.
    Dropped,
}

impl Disposition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stored => "stored",
            Self::Duplicate => "duplicate",
            Self::Discarded => "discarded",
            Self::Dropped => "dropped",
        }
    }
}

/// Snapshot of firehose counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FirehoseStats {
    pub received: u64,
    pub stored: u64,
    pub duplicate: u64,
    pub discarded: u64,
    pub dropped: u64,
}

#[derive(Default)]
struct Counters {
    received: AtomicU64,
    stored: AtomicU64,
    duplicate: AtomicU64,
    discarded: AtomicU64,
    dropped: AtomicU64,
}

impl Counters {
    fn record(&self, disposition: Disposition) {
        self.received.fetch_add(1, Ordering::Relaxed);
        let counter = match disposition {
            Disposition::Stored => &self.stored,
            Disposition::Duplicate => &self.duplicate,
            Disposition::Discarded => &self.discarded,
            Disposition::Dropped => &self.dropped,
        };
        counter.fetch_add(1, Ordering::Relaxed);
        counter!("firehose_events_total", "disposition" => disposition.as_str()).increment(1);
    }

    fn snapshot(&self) -> FirehoseStats {
        FirehoseStats {
            received: self.received.load(Ordering::Relaxed),
            stored: self.stored.load(Ordering::Relaxed),
            duplicate: self.duplicate.load(Ordering::Relaxed),
            discarded: self.discarded.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
        }
    }
}

/// Applies trend tracking, relay discovery and the persistence policy to
/// incoming events.
pub struct Firehose {
    stats: Arc<StatsEngine>,
    trends: Arc<TrendTracker>,
    directory: Arc<RelayDirectory>,
    counters: Counters,
}

impl Firehose {
    pub fn new(stats: Arc<StatsEngine>, trends: Arc<TrendTracker>, directory: Arc<RelayDirectory>) -> Self {
        Self {
            stats,
            trends,
            directory,
            counters: Counters::default(),
        }
    }

    pub fn stats(&self) -> FirehoseStats {
        self.counters.snapshot()
    }

    /// Process one event. Idempotent.
    pub async fn process(&self, event: &Event) -> Disposition {
        let disposition = self.handle(event).await;
        self.counters.record(disposition);
        disposition
    }

    async fn handle(&self, event: &Event) -> Disposition {
        if let Err(e) = event.validate_now() {
            debug!(id = %event.id, "Discarding malformed event: {}", e);
            return Disposition::Discarded;
        }
        debug!(id = %event.id, kind = event.kind, "firehose event");

        if let Err(e) = self.trends.add_tag_usages(event) {
            warn!(id = %event.id, "Failed to track hashtags: {}", e);
        }
        if let Err(e) = self.directory.record_event(event) {
            warn!(id = %event.id, "Failed to record relays: {}", e);
        }

        match self.should_store(&event.pubkey).await {
            Ok(true) => {}
            Ok(false) => return Disposition::Discarded,
            Err(e) => {
                error!(id = %event.id, "Persistence policy lookup failed: {}", e);
                return Disposition::Dropped;
            }
        }

        match self.stats.ingest(event).await {
            Ok(InsertOutcome::Inserted | InsertOutcome::Masked) => Disposition::Stored,
            Ok(InsertOutcome::Duplicate) => Disposition::Duplicate,
            Ok(InsertOutcome::Superseded | InsertOutcome::Rejected) => Disposition::Discarded,
            Err(e) if e.is_soft() => {
                warn!(id = %event.id, "Insert did not complete: {}", e);
                Disposition::Dropped
            }
            Err(e) => {
                error!(id = %event.id, "Failed to store event: {}", e);
                Disposition::Dropped
            }
        }
    }

    /// Local users and the accounts they follow are stored.
    async fn should_store(&self, pubkey: &str) -> agora_store::Result<bool> {
        let store = self.stats.store();
        Ok(store.is_local_user(pubkey).await? || store.is_locally_followed(pubkey).await?)
    }

    /// Consume `events` until the channel closes or `shutdown` fires.
    pub async fn run(
        &self,
        mut events: mpsc::Receiver<(String, Event)>,
        shutdown: CancellationToken,
    ) -> FirehoseStats {
        const PROGRESS_INTERVAL: u64 = 10_000;

        gauge!("firehose_running").set(1.0);
        info!("Firehose started");
        let started = Instant::now();

        loop {
            let next = tokio::select! {
                biased;
                _ = shutdown.cancelled() => break,
                next = events.recv() => next,
            };
            let Some((relay, event)) = next else {
                info!("Subscription closed");
                break;
            };

            let disposition = self.process(&event).await;
            debug!(id = %event.id, relay = %relay, disposition = disposition.as_str(), "processed");

            let received = self.counters.received.load(Ordering::Relaxed);
            if received % PROGRESS_INTERVAL == 0 {
                let stats = self.stats();
                info!(
                    "Firehose progress: {} received, {} stored, {} discarded",
                    stats.received, stats.stored, stats.discarded
                );
            }
        }

        gauge!("firehose_running").set(0.0);
        let stats = self.stats();
        info!(
            "Firehose stopped after {:.1}s: {} events",
            started.elapsed().as_secs_f64(),
            stats.received
        );
        stats
    }
}
