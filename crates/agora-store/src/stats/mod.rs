//! Incremental statistics engine.
//!
//! Each newly stored event yields a set of counter diffs
//! ([`diff::StatsDiff`]) that are written as atomic `col = col + delta`
//! upserts. Counters are never read back and re-written by application code.
//! Authors whose stats change are queued for a full recount to heal drift.

pub mod diff;
mod queue;
mod recount;

use agora_core::Event;
use rusqlite::params_from_iter;
use serde::Serialize;
use tracing::warn;

pub use diff::StatsDiff;
pub use queue::RecomputeQueue;

use crate::error::Result;
use crate::sql::placeholders;
use crate::store::{EventStore, InsertOutcome, insert_event};

/// Derived counters for one author.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct AuthorStats {
    pub pubkey: String,
    pub followers_count: i64,
    pub following_count: i64,
    pub notes_count: i64,
    pub search: String,
    pub nip05: Option<String>,
    pub nip05_domain: Option<String>,
    pub nip05_last_verified_at: Option<i64>,
}

/// Derived counters for one event.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct EventStats {
    pub event_id: String,
    pub replies_count: i64,
    pub reposts_count: i64,
    pub reactions_count: i64,
    pub quotes_count: i64,
    /// Millisatoshis.
    pub zaps_amount: i64,
}

/// A stats row that can be recounted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatKey {
    Author(String),
    Event(String),
}

/// Configuration for the stats engine.
#[derive(Debug, Clone)]
pub struct StatsConfig {
    /// Maximum keys tracked as scheduled for recount.
    pub debounce_capacity: usize,
    /// Bound of the recount channel.
    pub queue_depth: usize,
}

impl Default for StatsConfig {
    fn default() -> Self {
        Self {
            debounce_capacity: 1000,
            queue_depth: 1000,
        }
    }
}

/// Stores events and keeps their derived counters in step.
pub struct StatsEngine {
    store: EventStore,
    queue: RecomputeQueue,
}

impl StatsEngine {
    /// Create the engine and spawn its recount worker.
    pub fn start(store: EventStore, config: StatsConfig) -> Self {
        let queue = RecomputeQueue::start(
            store.clone(),
            config.debounce_capacity,
            config.queue_depth,
        );
        Self { store, queue }
    }

    pub fn store(&self) -> &EventStore {
        &self.store
    }

    pub fn queue(&self) -> &RecomputeQueue {
        &self.queue
    }

    /// Insert `event` and apply its stats diff exactly once.
    ///
    /// The diff is computed before the insert and applied only when the
    /// outcome is [`InsertOutcome::Inserted`]. A failure while applying the
    /// diff does not fail the ingest; every affected key is queued for a
    /// recount instead.
    pub async fn ingest(&self, event: &Event) -> Result<InsertOutcome> {
        event.validate_now()?;
        let event = event.clone();
        let (outcome, diff, apply_error) = self
            .store
            .run(None, move |conn| {
                let diff = diff::compute(conn, &event)?;
                let outcome = insert_event(conn, &event)?;
                let apply_error = if outcome == InsertOutcome::Inserted && !diff.is_empty() {
                    diff::apply(conn, &diff).err()
                } else {
                    None
                };
                Ok((outcome, diff, apply_error))
            })
            .await?;

        if outcome != InsertOutcome::Inserted || diff.is_empty() {
            return Ok(outcome);
        }

        match apply_error {
            Some(e) => {
                warn!("Failed to apply stats diff, scheduling recount: {}", e);
                for key in diff.affected_keys() {
                    self.queue.schedule(key);
                }
            }
            None => {
                metrics::counter!("stats_diffs_applied_total").increment(1);
                for key in diff.affected_keys() {
                    if matches!(key, StatKey::Author(_)) {
                        self.queue.schedule(key);
                    }
                }
            }
        }
        Ok(outcome)
    }

    /// Recount an author's counters now, bypassing the queue.
    pub async fn recompute_author(&self, pubkey: &str) -> Result<AuthorStats> {
        let pubkey = pubkey.to_string();
        self.store
            .run(None, move |conn| recount::recount_author(conn, &pubkey))
            .await
    }

    /// Recount an event's counters now, bypassing the queue.
    pub async fn recompute_event(&self, id: &str) -> Result<EventStats> {
        let id = id.to_string();
        self.store
            .run(None, move |conn| recount::recount_event(conn, &id))
            .await
    }

    /// Finish queued recounts. Call once on shutdown.
    pub async fn drain(&self) {
        self.queue.drain().await;
    }
}

// ═══════════════════════════════════════════════════════════════════════════
// Batched reads
// ═══════════════════════════════════════════════════════════════════════════

impl EventStore {
    /// Stats rows for the given authors. Authors without a row are omitted.
    pub async fn author_stats(&self, pubkeys: &[String]) -> Result<Vec<AuthorStats>> {
        if pubkeys.is_empty() {
            return Ok(Vec::new());
        }
        let pubkeys = pubkeys.to_vec();
        self.run(None, move |conn| {
            let sql = format!(
                "SELECT pubkey, followers_count, following_count, notes_count, search,
                        nip05, nip05_domain, nip05_last_verified_at
                 FROM author_stats WHERE pubkey IN ({})",
                placeholders(pubkeys.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(pubkeys.iter()), |row| {
                    Ok(AuthorStats {
                        pubkey: row.get(0)?,
                        followers_count: row.get(1)?,
                        following_count: row.get(2)?,
                        notes_count: row.get(3)?,
                        search: row.get(4)?,
                        nip05: row.get(5)?,
                        nip05_domain: row.get(6)?,
                        nip05_last_verified_at: row.get(7)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }

    /// Stats rows for the given events. Events without a row are omitted.
    pub async fn event_stats(&self, ids: &[String]) -> Result<Vec<EventStats>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let ids = ids.to_vec();
        self.run(None, move |conn| {
            let sql = format!(
                "SELECT event_id, replies_count, reposts_count, reactions_count,
                        quotes_count, zaps_amount
                 FROM event_stats WHERE event_id IN ({})",
                placeholders(ids.len())
            );
            let mut stmt = conn.prepare(&sql)?;
            let rows = stmt
                .query_map(params_from_iter(ids.iter()), |row| {
                    Ok(EventStats {
                        event_id: row.get(0)?,
                        replies_count: row.get(1)?,
                        reposts_count: row.get(2)?,
                        reactions_count: row.get(3)?,
                        quotes_count: row.get(4)?,
                        zaps_amount: row.get(5)?,
                    })
                })?
                .collect::<rusqlite::Result<Vec<_>>>()?;
            Ok(rows)
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use agora_core::kind;
    use agora_core::testing::{BASE_TIME, EventFixture, pubkey};

    fn engine() -> StatsEngine {
        StatsEngine::start(EventStore::open_in_memory().unwrap(), StatsConfig::default())
    }

    async fn author(engine: &StatsEngine, pk: &str) -> AuthorStats {
        engine
            .store()
            .author_stats(&[pk.to_string()])
            .await
            .unwrap()
            .pop()
            .unwrap_or_default()
    }

    async fn event(engine: &StatsEngine, id: &str) -> EventStats {
        engine
            .store()
            .event_stats(&[id.to_string()])
            .await
            .unwrap()
            .pop()
            .unwrap_or_default()
    }

    fn follow_list(author: u8, created_at: u64, follows: &[u8]) -> Event {
        follows
            .iter()
            .fold(
                EventFixture::new(kind::FOLLOW_LIST)
                    .author(pubkey(author))
                    .created_at(created_at),
                |fixture, n| fixture.tag(&["p", &pubkey(*n)]),
            )
            .build()
    }

    #[tokio::test]
    async fn test_redelivery_applies_diff_once() {
        let engine = engine();
        let note = EventFixture::new(kind::TEXT_NOTE).build();

        assert_eq!(engine.ingest(&note).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(engine.ingest(&note).await.unwrap(), InsertOutcome::Duplicate);
        assert_eq!(author(&engine, &pubkey(1)).await.notes_count, 1);
    }

    #[tokio::test]
    async fn test_replies_reactions_reposts_quotes() {
        let engine = engine();
        let original = EventFixture::new(kind::TEXT_NOTE).author(pubkey(2)).build();
        engine.ingest(&original).await.unwrap();

        let reply = EventFixture::new(kind::TEXT_NOTE)
            .tag(&["e", &original.id, "", "reply"])
            .build();
        let quote = EventFixture::new(kind::TEXT_NOTE).tag(&["q", &original.id]).build();
        let reaction = EventFixture::new(kind::REACTION)
            .content("+")
            .tag(&["e", &original.id])
            .build();
        let repost = EventFixture::new(kind::REPOST)
            .tag(&["e", &original.id])
            .tag(&["p", &pubkey(2)])
            .build();
        for e in [&reply, &quote, &reaction, &repost] {
            engine.ingest(e).await.unwrap();
        }

        let stats = event(&engine, &original.id).await;
        assert_eq!(stats.replies_count, 1);
        assert_eq!(stats.quotes_count, 1);
        assert_eq!(stats.reactions_count, 1);
        assert_eq!(stats.reposts_count, 1);
        assert_eq!(author(&engine, &pubkey(1)).await.notes_count, 2);

        let recounted = engine.recompute_event(&original.id).await.unwrap();
        assert_eq!(recounted, stats);
    }

    #[tokio::test]
    async fn test_deleting_repost_gives_back_count() {
        let engine = engine();
        let original = EventFixture::new(kind::TEXT_NOTE).author(pubkey(2)).build();
        let repost = EventFixture::new(kind::REPOST)
            .tag(&["e", &original.id])
            .tag(&["p", &pubkey(2)])
            .build();
        engine.ingest(&original).await.unwrap();
        engine.ingest(&repost).await.unwrap();

        let deletion = EventFixture::new(kind::DELETION).tag(&["e", &repost.id]).build();
        engine.ingest(&deletion).await.unwrap();
        assert_eq!(event(&engine, &original.id).await.reposts_count, 0);

        // Re-delivering the deletion finds the repost already masked.
        let again = EventFixture::new(kind::DELETION).tag(&["e", &repost.id]).build();
        engine.ingest(&again).await.unwrap();
        assert_eq!(event(&engine, &original.id).await.reposts_count, 0);
    }

    #[tokio::test]
    async fn test_deleting_unresolvable_repost_is_ignored() {
        let engine = engine();
        let original = EventFixture::new(kind::TEXT_NOTE).author(pubkey(2)).build();
        // Wrong `p`: the chain does not resolve to the original's author.
        let repost = EventFixture::new(kind::REPOST)
            .tag(&["e", &original.id])
            .tag(&["p", &pubkey(3)])
            .build();
        engine.ingest(&original).await.unwrap();
        engine.ingest(&repost).await.unwrap();

        let deletion = EventFixture::new(kind::DELETION).tag(&["e", &repost.id]).build();
        engine.ingest(&deletion).await.unwrap();
        assert_eq!(event(&engine, &original.id).await.reposts_count, 1);
    }

    #[tokio::test]
    async fn test_follow_list_diffs_against_previous_version() {
        let engine = engine();
        engine.ingest(&follow_list(1, BASE_TIME, &[2, 3])).await.unwrap();
        engine.ingest(&follow_list(1, BASE_TIME + 10, &[3, 4, 4])).await.unwrap();

        assert_eq!(author(&engine, &pubkey(2)).await.followers_count, 0);
        assert_eq!(author(&engine, &pubkey(3)).await.followers_count, 1);
        assert_eq!(author(&engine, &pubkey(4)).await.followers_count, 1);
        assert_eq!(author(&engine, &pubkey(1)).await.following_count, 2);
    }

    #[tokio::test]
    async fn test_out_of_order_follow_list_changes_nothing() {
        let engine = engine();
        engine.ingest(&follow_list(1, BASE_TIME + 10, &[2])).await.unwrap();
        let stale = follow_list(1, BASE_TIME, &[3, 4, 5]);
        assert_eq!(engine.ingest(&stale).await.unwrap(), InsertOutcome::Superseded);

        assert_eq!(author(&engine, &pubkey(1)).await.following_count, 1);
        assert_eq!(author(&engine, &pubkey(3)).await.followers_count, 0);
        assert_eq!(author(&engine, &pubkey(2)).await.followers_count, 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_ingest_keeps_counters_exact() {
        let engine = Arc::new(engine());
        let original = EventFixture::new(kind::TEXT_NOTE).author(pubkey(2)).build();
        engine.ingest(&original).await.unwrap();

        let mut events = Vec::new();
        for n in 0..20u8 {
            events.push(
                EventFixture::new(kind::REACTION)
                    .author(pubkey(10 + n))
                    .tag(&["e", &original.id])
                    .build(),
            );
            events.push(
                EventFixture::new(kind::TEXT_NOTE)
                    .author(pubkey(3))
                    .tag(&["e", &original.id, "", "reply"])
                    .build(),
            );
            events.push(follow_list(40 + n, BASE_TIME, &[2]));
        }
        let repeated = EventFixture::new(kind::REACTION)
            .author(pubkey(99))
            .tag(&["e", &original.id])
            .build();
        events.extend(std::iter::repeat_n(repeated, 10));

        let tasks: Vec<_> = events
            .into_iter()
            .map(|event| {
                let engine = engine.clone();
                tokio::spawn(async move { engine.ingest(&event).await })
            })
            .collect();
        let mut inserted = 0;
        for task in tasks {
            if task.await.unwrap().unwrap() == InsertOutcome::Inserted {
                inserted += 1;
            }
        }
        assert_eq!(inserted, 61);

        let stats = event(&engine, &original.id).await;
        assert_eq!(stats.reactions_count, 21);
        assert_eq!(stats.replies_count, 20);
        assert_eq!(author(&engine, &pubkey(3)).await.notes_count, 20);
        assert_eq!(author(&engine, &pubkey(2)).await.followers_count, 20);
        assert_eq!(author(&engine, &pubkey(40)).await.following_count, 1);

        assert_eq!(engine.recompute_event(&original.id).await.unwrap(), stats);
    }

    #[tokio::test]
    async fn test_counters_independent_of_delivery_order() {
        let original = EventFixture::new(kind::TEXT_NOTE).author(pubkey(2)).build();
        let reactions: Vec<Event> = (0..3)
            .map(|_| EventFixture::new(kind::REACTION).tag(&["e", &original.id]).build())
            .collect();
        let lists = [follow_list(5, BASE_TIME, &[2]), follow_list(5, BASE_TIME + 1, &[2, 3])];

        let forward = engine();
        for e in reactions.iter().chain(lists.iter()) {
            forward.ingest(e).await.unwrap();
        }
        let backward = engine();
        for e in reactions.iter().rev().chain(lists.iter().rev()) {
            backward.ingest(e).await.unwrap();
        }

        for engine in [&forward, &backward] {
            assert_eq!(event(engine, &original.id).await.reactions_count, 3);
            assert_eq!(author(engine, &pubkey(5)).await.following_count, 2);
            assert_eq!(author(engine, &pubkey(3)).await.followers_count, 1);
        }
    }

    #[tokio::test]
    async fn test_zap_receipt_adds_amount() {
        let engine = engine();
        let request = r#"{"kind":9734,"tags":[["amount","5000"]]}"#;
        for _ in 0..2 {
            let receipt = EventFixture::new(kind::ZAP_RECEIPT)
                .tag(&["e", &"a".repeat(64)])
                .tag(&["description", request])
                .build();
            engine.ingest(&receipt).await.unwrap();
        }
        assert_eq!(event(&engine, &"a".repeat(64)).await.zaps_amount, 10_000);
    }

    #[tokio::test]
    async fn test_profile_updates_search_metadata() {
        let engine = engine();
        let profile = EventFixture::new(kind::METADATA)
            .content(r#"{"name":"jo","nip05":"jo@example.com"}"#)
            .build();
        engine.ingest(&profile).await.unwrap();

        let stats = author(&engine, &pubkey(1)).await;
        assert_eq!(stats.search, "jo");
        assert_eq!(stats.nip05_domain.as_deref(), Some("example.com"));
    }

    #[tokio::test]
    async fn test_recompute_matches_diffs() {
        let engine = engine();
        engine.ingest(&follow_list(1, BASE_TIME, &[2, 3])).await.unwrap();
        engine.ingest(&follow_list(4, BASE_TIME, &[2])).await.unwrap();
        engine.ingest(&EventFixture::new(kind::TEXT_NOTE).author(pubkey(2)).build()).await.unwrap();

        let incremental = author(&engine, &pubkey(2)).await;
        let recounted = engine.recompute_author(&pubkey(2)).await.unwrap();
        assert_eq!(recounted.followers_count, incremental.followers_count);
        assert_eq!(recounted.notes_count, incremental.notes_count);
        assert_eq!(recounted.followers_count, 2);
    }

    #[tokio::test]
    async fn test_queue_dedupes_until_recount_finishes() {
        let store = EventStore::open_in_memory().unwrap();
        let queue = RecomputeQueue::start(store, 16, 16);

        assert!(queue.schedule(StatKey::Author(pubkey(1))));
        assert!(queue.schedule(StatKey::Author(pubkey(1))));
        assert!(queue.schedule(StatKey::Event("a".repeat(64))));
        assert_eq!(queue.pending(), 2);

        queue.drain().await;
        assert_eq!(queue.completed(), 2);
        assert_eq!(queue.pending(), 0);
        assert!(!queue.schedule(StatKey::Author(pubkey(1))));
    }

    #[tokio::test]
    async fn test_full_queue_drops_and_reports() {
        let store = EventStore::open_in_memory().unwrap();
        let queue = RecomputeQueue::start(store, 16, 1);

        assert!(queue.schedule(StatKey::Author(pubkey(1))));
        assert!(!queue.schedule(StatKey::Author(pubkey(2))));
        assert_eq!(queue.pending(), 1);

        queue.drain().await;
        assert_eq!(queue.completed(), 1);
    }

    #[tokio::test]
    async fn test_drain_finishes_scheduled_author_recounts() {
        let engine = engine();
        engine.ingest(&EventFixture::new(kind::TEXT_NOTE).build()).await.unwrap();
        engine.drain().await;
        assert_eq!(engine.queue().completed(), 1);
        assert_eq!(author(&engine, &pubkey(1)).await.notes_count, 1);
    }
}
