//! Deduplicating recompute queue.
//!
//! A key stays in the scheduled set from the moment it is queued until its
//! recount finishes, so a burst of changes to one author costs one recount.
//! The set is bounded and evicts least-recently-scheduled keys; an evicted
//! key may be queued a second time, which only costs a redundant recount.

use std::num::NonZeroUsize;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use lru::LruCache;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::StatKey;
use super::recount::{recount_author, recount_event};
use crate::store::EventStore;

/// Bounded queue of pending recounts served by a single worker task.
pub struct RecomputeQueue {
    sender: Mutex<Option<mpsc::Sender<StatKey>>>,
    scheduled: Arc<Mutex<LruCache<StatKey, ()>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
    completed: Arc<AtomicU64>,
}

impl RecomputeQueue {
    /// Spawn the worker. Must be called inside a Tokio runtime.
    pub fn start(store: EventStore, capacity: usize, depth: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity).unwrap_or(NonZeroUsize::MIN);
        let scheduled = Arc::new(Mutex::new(LruCache::new(capacity)));
        let completed = Arc::new(AtomicU64::new(0));
        let (sender, receiver) = mpsc::channel(depth.max(1));

        let worker = tokio::spawn(run_worker(
            store,
            receiver,
            Arc::clone(&scheduled),
            Arc::clone(&completed),
        ));

        Self {
            sender: Mutex::new(Some(sender)),
            scheduled,
            worker: Mutex::new(Some(worker)),
            completed,
        }
    }

    /// Queue a recount for `key`.
    ///
    /// Returns `true` if the key is queued (now or already). Returns `false`
    /// if the queue is full or draining; the request is then dropped.
    pub fn schedule(&self, key: StatKey) -> bool {
        let Some(sender) = self.sender.lock().clone() else {
            return false;
        };

        {
            let mut scheduled = self.scheduled.lock();
            if scheduled.get(&key).is_some() {
                return true;
            }
            scheduled.put(key.clone(), ());
        }

        match sender.try_send(key) {
            Ok(()) => true,
            Err(TrySendError::Full(key)) => {
                self.scheduled.lock().pop(&key);
                metrics::counter!("stats_recompute_dropped_total").increment(1);
                debug!(key = ?key, "Recompute queue full, dropping request");
                false
            }
            Err(TrySendError::Closed(key)) => {
                self.scheduled.lock().pop(&key);
                false
            }
        }
    }

    /// Number of keys queued or being recounted.
    pub fn pending(&self) -> usize {
        self.scheduled.lock().len()
    }

    /// Number of recounts completed since start.
    pub fn completed(&self) -> u64 {
        self.completed.load(Ordering::Relaxed)
    }

    /// Stop accepting work, finish everything already queued, then return.
    pub async fn drain(&self) {
        self.sender.lock().take();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            if let Err(e) = worker.await {
                warn!("Recompute worker ended abnormally: {}", e);
            }
        }
    }
}

async fn run_worker(
    store: EventStore,
    mut receiver: mpsc::Receiver<StatKey>,
    scheduled: Arc<Mutex<LruCache<StatKey, ()>>>,
    completed: Arc<AtomicU64>,
) {
    while let Some(key) = receiver.recv().await {
        let result = match key.clone() {
            StatKey::Author(pubkey) => store
                .run(None, move |conn| recount_author(conn, &pubkey))
                .await
                .map(drop),
            StatKey::Event(id) => store
                .run(None, move |conn| recount_event(conn, &id))
                .await
                .map(drop),
        };
        scheduled.lock().pop(&key);

        match result {
            Ok(()) => {
                completed.fetch_add(1, Ordering::Relaxed);
                metrics::counter!("stats_recompute_total").increment(1);
            }
            Err(e) => warn!(key = ?key, "Stats recompute failed: {}", e),
        }
    }
    info!(
        "Recompute worker drained ({} recounts)",
        completed.load(Ordering::Relaxed)
    );
}
