//! Batch hydration of events into presentation-ready views.
//!
//! Hydration runs in two passes. The gather pass collects every referenced
//! id or pubkey across the whole batch and issues one store query per
//! relation; the assemble pass resolves each event's relations from the
//! combined pool. Nested repost/quote targets get their author and stats but
//! never their own repost/quote.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use agora_core::event::is_lower_hex;
use agora_core::{Event, Filter, kind, tags};
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::Result;
use crate::stats::diff::reaction_target;
use crate::stats::{AuthorStats, EventStats};
use crate::store::{EventStore, QueryOptions};

/// What the requesting viewer has done to an event.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ViewerRelationship {
    pub reacted: bool,
    pub reposted: bool,
}

/// An event plus its transient, per-request relations.
///
/// Never stored; the wrapped [`Event`] is shared, not copied.
#[derive(Debug, Clone)]
pub struct HydratedEvent {
    pub event: Arc<Event>,
    /// The author's kind-0 profile.
    pub author: Option<Arc<Event>>,
    /// The admin-signed user record for the author.
    pub user: Option<Arc<Event>>,
    pub author_stats: Option<AuthorStats>,
    pub event_stats: Option<EventStats>,
    /// Reposted event (kind 6 only).
    pub repost: Option<Box<HydratedEvent>>,
    /// Quoted event (`q` tag).
    pub quote: Option<Box<HydratedEvent>>,
    /// Present when a viewer was given.
    pub viewer: Option<ViewerRelationship>,
}

/// Hydrates event batches against the store.
#[derive(Clone)]
pub struct Hydrator {
    store: EventStore,
    admin_pubkey: Option<String>,
}

/// Everything fetched during the gather pass.
#[derive(Default)]
struct Pool {
    events: HashMap<String, Arc<Event>>,
    profiles: HashMap<String, Arc<Event>>,
    users: HashMap<String, Arc<Event>>,
    author_stats: HashMap<String, AuthorStats>,
    event_stats: HashMap<String, EventStats>,
    reacted: BTreeSet<String>,
    reposted: BTreeSet<String>,
}

impl Hydrator {
    pub fn new(store: EventStore, admin_pubkey: Option<String>) -> Self {
        Self {
            store,
            admin_pubkey,
        }
    }

    /// Hydrate `events`, in order.
    ///
    /// Missing relations are left empty; only store failures are errors.
    pub async fn hydrate(
        &self,
        events: &[Event],
        viewer: Option<&str>,
        signal: Option<CancellationToken>,
    ) -> Result<Vec<HydratedEvent>> {
        if events.is_empty() {
            return Ok(Vec::new());
        }
        let originals: Vec<Arc<Event>> = events.iter().cloned().map(Arc::new).collect();
        let pool = self.gather(&originals, viewer, signal).await?;

        Ok(originals
            .iter()
            .map(|event| assemble(&pool, event, viewer.is_some(), true))
            .collect())
    }

    async fn gather(
        &self,
        originals: &[Arc<Event>],
        viewer: Option<&str>,
        signal: Option<CancellationToken>,
    ) -> Result<Pool> {
        let options = || {
            let mut options = QueryOptions::new();
            options.signal = signal.clone();
            options
        };
        let mut pool = Pool::default();
        for event in originals {
            pool.events.insert(event.id.clone(), Arc::clone(event));
        }

        // Repost targets, falling back to the copy embedded in the repost.
        let repost_ids = missing(&pool, originals.iter().filter_map(|e| repost_target(e)));
        for event in self.fetch_ids(&repost_ids, options()).await? {
            pool.events.insert(event.id.clone(), Arc::new(event));
        }
        for repost in originals.iter().filter(|e| e.kind == kind::REPOST) {
            if let Some(embedded) = embedded_repost(repost) {
                pool.events
                    .entry(embedded.id.clone())
                    .or_insert_with(|| Arc::new(embedded));
            }
        }

        let quote_ids = missing(&pool, originals.iter().filter_map(|e| quote_target(e)));
        for event in self.fetch_ids(&quote_ids, options()).await? {
            pool.events.insert(event.id.clone(), Arc::new(event));
        }

        // Everything below covers originals and their targets alike.
        let pubkeys: Vec<String> = hex_only(pool.events.values().map(|e| e.pubkey.as_str()));
        let ids: Vec<String> = pool.events.keys().cloned().collect();

        if !pubkeys.is_empty() {
            let filter = Filter::new()
                .kind(kind::METADATA)
                .authors(pubkeys.iter().cloned());
            for profile in self.store.query(&[filter], options()).await? {
                pool.profiles.insert(profile.pubkey.clone(), Arc::new(profile));
            }
        }

        if let Some(admin) = self.admin_pubkey.as_deref().filter(|_| !pubkeys.is_empty()) {
            let filter = Filter::new()
                .kind(kind::USER_RECORD)
                .authors([admin])
                .tag("d", pubkeys.iter().cloned());
            for record in self.store.query(&[filter], options()).await? {
                if let Some(d) = record.d_tag().map(str::to_string) {
                    pool.users.insert(d, Arc::new(record));
                }
            }
        }

        if let Some(viewer) = viewer.filter(|v| is_hex_key(v)) {
            let original_ids = hex_only(originals.iter().map(|e| e.id.as_str()));
            if !original_ids.is_empty() {
                let filter = Filter::new()
                    .kinds([kind::REPOST, kind::REACTION])
                    .authors([viewer])
                    .tag("e", original_ids);
                for event in self.store.query(&[filter], options()).await? {
                    match event.kind {
                        kind::REACTION => {
                            if let Some(target) = reaction_target(&event.tags) {
                                pool.reacted.insert(target.to_string());
                            }
                        }
                        _ => {
                            if let Some(target) = event.tag_value("e") {
                                pool.reposted.insert(target.to_string());
                            }
                        }
                    }
                }
            }
        }

        for stats in self.store.author_stats(&pubkeys).await? {
            pool.author_stats.insert(stats.pubkey.clone(), stats);
        }
        for stats in self.store.event_stats(&ids).await? {
            pool.event_stats.insert(stats.event_id.clone(), stats);
        }

        trace!(
            originals = originals.len(),
            pooled = pool.events.len(),
            profiles = pool.profiles.len(),
            "Gathered hydration pool"
        );
        Ok(pool)
    }

    async fn fetch_ids(&self, ids: &[String], options: QueryOptions) -> Result<Vec<Event>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        self.store
            .query(&[Filter::new().ids(ids.iter().cloned())], options)
            .await
    }
}

fn assemble(pool: &Pool, event: &Arc<Event>, with_viewer: bool, top_level: bool) -> HydratedEvent {
    let nested = |target: Option<&str>| {
        target
            .filter(|_| top_level)
            .and_then(|id| pool.events.get(id))
            .filter(|target| target.id != event.id)
            .map(|target| Box::new(assemble(pool, target, false, false)))
    };

    HydratedEvent {
        author: pool.profiles.get(&event.pubkey).cloned(),
        user: pool.users.get(&event.pubkey).cloned(),
        author_stats: pool.author_stats.get(&event.pubkey).cloned(),
        event_stats: pool.event_stats.get(&event.id).cloned(),
        repost: nested(repost_target(event)),
        quote: nested(quote_target(event)),
        viewer: with_viewer.then(|| ViewerRelationship {
            reacted: pool.reacted.contains(&event.id),
            reposted: pool.reposted.contains(&event.id),
        }),
        event: Arc::clone(event),
    }
}

fn repost_target(event: &Event) -> Option<&str> {
    (event.kind == kind::REPOST)
        .then(|| event.tag_value("e"))
        .flatten()
}

fn quote_target(event: &Event) -> Option<&str> {
    (event.kind == kind::TEXT_NOTE)
        .then(|| tags::quote_target(&event.tags))
        .flatten()
}

/// The original note a kind-6 repost may carry as its content, accepted
/// only if it is the event the `e` tag names.
fn embedded_repost(repost: &Event) -> Option<Event> {
    let target = repost_target(repost)?;
    let embedded = Event::from_json(&repost.content).ok()?;
    (embedded.id == target && embedded.validate_now().is_ok()).then_some(embedded)
}

fn missing<'a>(pool: &Pool, ids: impl Iterator<Item = &'a str>) -> Vec<String> {
    hex_only(ids.filter(|id| !pool.events.contains_key(*id)))
}

fn is_hex_key(value: &str) -> bool {
    value.len() == 64 && is_lower_hex(value)
}

/// Distinct well-formed 64-hex keys; anything else cannot be stored anyway.
fn hex_only<'a>(values: impl Iterator<Item = &'a str>) -> Vec<String> {
    values
        .filter(|v| is_hex_key(v))
        .collect::<BTreeSet<_>>()
        .into_iter()
        .map(str::to_string)
        .collect()
}
