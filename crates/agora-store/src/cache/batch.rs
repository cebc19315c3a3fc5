//! Coalescing of single-id remote lookups into batched upstream fetches.
//!
//! Batch lifecycle: `Collecting` from the first arrival until the delay
//! window expires or the size threshold is hit, then `Flushing` while the
//! upstream round trip runs, then `Done` once every waiter is resolved. At
//! most one batch is collecting at a time; flushing batches may overlap.
//!
//! Waiters are keyed by id, not by batch. An id that is already waiting, in
//! a collecting or a flushing batch, only gains another waiter.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use agora_core::Event;
use moka::future::Cache;
use parking_lot::Mutex;
use tokio::sync::oneshot;
use tracing::{debug, warn};

use super::{CacheCounters, Entry, RemoteFetcher};

/// How a pending lookup resolved.
#[derive(Debug, Clone)]
pub(crate) enum Resolution {
    Found(Arc<Event>),
    Missing,
    /// Upstream failed; not negative-cached.
    Failed(String),
}

/// Where a batch is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BatchStatus {
    Collecting,
    Flushing,
    Done,
}

#[derive(Debug)]
struct OpenBatch {
    generation: u64,
    ids: Vec<String>,
}

#[derive(Debug, Default)]
struct State {
    waiters: HashMap<String, Vec<oneshot::Sender<Resolution>>>,
    open: Option<OpenBatch>,
    flushing: BTreeSet<u64>,
    next_generation: u64,
}

pub(crate) struct Batcher {
    state: Mutex<State>,
    fetcher: Arc<dyn RemoteFetcher>,
    hot: Cache<String, Entry>,
    counters: Arc<CacheCounters>,
    delay: Duration,
    max_size: usize,
    upstream_timeout: Duration,
}

impl Batcher {
    pub(crate) fn new(
        fetcher: Arc<dyn RemoteFetcher>,
        hot: Cache<String, Entry>,
        counters: Arc<CacheCounters>,
        delay: Duration,
        max_size: usize,
        upstream_timeout: Duration,
    ) -> Self {
        Self {
            state: Mutex::new(State::default()),
            fetcher,
            hot,
            counters,
            delay,
            max_size: max_size.max(1),
            upstream_timeout,
        }
    }

    /// Register interest in `id` and return the receiver its resolution
    /// will be delivered on.
    pub(crate) fn enqueue(self: &Arc<Self>, id: &str) -> oneshot::Receiver<Resolution> {
        let (sender, receiver) = oneshot::channel();

        let (generation, opened, full) = {
            let mut state = self.state.lock();
            if let Some(waiters) = state.waiters.get_mut(id) {
                waiters.push(sender);
                return receiver;
            }
            state.waiters.insert(id.to_string(), vec![sender]);

            let next = state.next_generation;
            let batch = state.open.get_or_insert_with(|| OpenBatch {
                generation: next,
                ids: Vec::new(),
            });
            batch.ids.push(id.to_string());
            let generation = batch.generation;
            let full = batch.ids.len() >= self.max_size;
            let opened = generation == next;
            if opened {
                state.next_generation += 1;
            }
            (generation, opened, full)
        };

        if full {
            tokio::spawn(Arc::clone(self).flush(generation));
        } else if opened {
            let this = Arc::clone(self);
            tokio::spawn(async move {
                tokio::time::sleep(this.delay).await;
                this.flush(generation).await;
            });
        }
        receiver
    }

    /// Close batch `generation` and resolve its waiters.
    ///
    /// Only the first call for a collecting batch does anything; a timer
    /// firing after a size-triggered flush returns `false`.
    pub(crate) async fn flush(self: Arc<Self>, generation: u64) -> bool {
        let ids = {
            let mut state = self.state.lock();
            if state.open.as_ref().map(|b| b.generation) != Some(generation) {
                return false;
            }
            let Some(batch) = state.open.take() else {
                return false;
            };
            state.flushing.insert(generation);
            batch.ids
        };

        debug!(generation, ids = ids.len(), "Flushing fetch batch");
        self.counters.batch_flushed(ids.len());

        let resolutions = self.resolve(&ids).await;

        for (id, resolution) in &resolutions {
            match resolution {
                Resolution::Found(event) => {
                    self.hot.insert(id.clone(), Entry::Found(Arc::clone(event))).await;
                }
                Resolution::Missing => self.hot.insert(id.clone(), Entry::Missing).await,
                Resolution::Failed(_) => {}
            }
        }

        let mut state = self.state.lock();
        for (id, resolution) in resolutions {
            for waiter in state.waiters.remove(&id).unwrap_or_default() {
                // A cancelled caller has dropped its receiver.
                let _ = waiter.send(resolution.clone());
            }
        }
        state.flushing.remove(&generation);
        true
    }

    /// One upstream round trip for `ids`; every id gets a resolution.
    async fn resolve(&self, ids: &[String]) -> Vec<(String, Resolution)> {
        let requested: HashSet<&str> = ids.iter().map(String::as_str).collect();
        let fetched = tokio::time::timeout(self.upstream_timeout, self.fetcher.fetch_ids(ids)).await;

        let mut found: HashMap<String, Arc<Event>> = HashMap::new();
        match fetched {
            Ok(Ok(events)) => {
                for event in events {
                    if requested.contains(event.id.as_str()) {
                        found.entry(event.id.clone()).or_insert_with(|| Arc::new(event));
                    } else {
                        debug!(id = %event.id, "Ignoring unrequested event from upstream");
                    }
                }
            }
            Ok(Err(e)) => {
                warn!("Upstream fetch of {} ids failed: {}", ids.len(), e);
                return failed(ids, e.to_string());
            }
            Err(_) => {
                warn!("Upstream fetch of {} ids timed out", ids.len());
                return failed(ids, format!("timed out after {:?}", self.upstream_timeout));
            }
        }

        ids.iter()
            .map(|id| {
                let resolution = match found.remove(id) {
                    Some(event) => Resolution::Found(event),
                    None => Resolution::Missing,
                };
                (id.clone(), resolution)
            })
            .collect()
    }

    /// Lifecycle position of batch `generation`.
    pub fn status(&self, generation: u64) -> BatchStatus {
        let state = self.state.lock();
        if state.open.as_ref().is_some_and(|b| b.generation == generation) {
            BatchStatus::Collecting
        } else if state.flushing.contains(&generation) {
            BatchStatus::Flushing
        } else {
            BatchStatus::Done
        }
    }

    /// Generation of the batch currently collecting, if any.
    pub fn open_generation(&self) -> Option<u64> {
        self.state.lock().open.as_ref().map(|b| b.generation)
    }
}

fn failed(ids: &[String], reason: String) -> Vec<(String, Resolution)> {
    ids.iter()
        .map(|id| (id.clone(), Resolution::Failed(reason.clone())))
        .collect()
}
