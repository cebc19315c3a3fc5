//! SQLite-backed event store.
//!
//! The store owns the canonical event rows. It answers NIP-01 filter queries
//! newest-first, keeps only the current version of replaceable events, and
//! masks events referenced by their author's deletion requests.
//!
//! All SQL runs on the blocking thread pool behind a single connection mutex.
//! Every call is bounded by the configured query timeout and an optional
//! caller cancellation token; an abandoned call that has not yet reached the
//! connection is skipped entirely.

use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use agora_core::event::validate_hex;
use agora_core::{Event, Filter, KindClass, kind, tags};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::error::{Error, Result};
use crate::schema;
use crate::sql::{self, Clause, placeholders};

/// Configuration for the event store.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Path to the SQLite database file.
    pub path: PathBuf,
    /// Upper bound for any single store operation.
    pub query_timeout: Duration,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("./data/agora.db"),
            query_timeout: Duration::from_secs(5),
        }
    }
}

/// Result of inserting one event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InsertOutcome {
    /// Newly stored and visible.
    Inserted,
    /// The id was already stored; nothing changed.
    Duplicate,
    /// A replaceable event that lost to a newer stored version and was pruned.
    Superseded,
    /// Stored, but its author had already requested its deletion.
    Masked,
    /// Never stored (ephemeral kinds).
    Rejected,
}

/// Per-query bounds and cancellation.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Overall result limit across all filters.
    pub limit: Option<usize>,
    /// Lower `created_at` bound applied on top of every filter's own.
    pub since: Option<u64>,
    /// Upper `created_at` bound applied on top of every filter's own.
    pub until: Option<u64>,
    pub signal: Option<CancellationToken>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }
}

/// Handle to the event store. Cheap to clone.
#[derive(Clone)]
pub struct EventStore {
    conn: Arc<Mutex<Connection>>,
    query_timeout: Duration,
}

impl EventStore {
    /// Open or create the store at the configured path.
    pub fn open(config: &StoreConfig) -> Result<Self> {
        if let Some(parent) = config.path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(&config.path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(config.query_timeout)?;

        let store = Self::from_connection(conn, config.query_timeout)?;
        tracing::info!("Opened event store at {}", config.path.display());
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::from_connection(conn, StoreConfig::default().query_timeout)
    }

    fn from_connection(mut conn: Connection, query_timeout: Duration) -> Result<Self> {
        schema::init_schema(&mut conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            query_timeout,
        })
    }

    /// The per-operation timeout.
    pub fn query_timeout(&self) -> Duration {
        self.query_timeout
    }

    /// Run `task` against the connection on the blocking pool.
    ///
    /// Resolves with `Timeout` or `Cancelled` without waiting for the task;
    /// a task that has not yet acquired the connection is then skipped.
    pub(crate) async fn run<T, F>(&self, signal: Option<&CancellationToken>, task: F) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Connection) -> Result<T> + Send + 'static,
    {
        if signal.is_some_and(CancellationToken::is_cancelled) {
            return Err(Error::Cancelled);
        }

        let abandoned = Arc::new(AtomicBool::new(false));
        let handle = {
            let conn = Arc::clone(&self.conn);
            let abandoned = Arc::clone(&abandoned);
            tokio::task::spawn_blocking(move || {
                let mut conn = conn.lock();
                if abandoned.load(Ordering::Acquire) {
                    return Err(Error::Cancelled);
                }
                task(&mut conn)
            })
        };

        let work = tokio::time::timeout(self.query_timeout, handle);
        let outcome = match signal {
            Some(token) => tokio::select! {
                biased;
                _ = token.cancelled() => {
                    abandoned.store(true, Ordering::Release);
                    return Err(Error::Cancelled);
                }
                outcome = work => outcome,
            },
            None => work.await,
        };

        match outcome {
            Ok(Ok(result)) => result,
            Ok(Err(join_error)) => Err(Error::Internal(format!(
                "store task failed: {}",
                join_error
            ))),
            Err(_) => {
                abandoned.store(true, Ordering::Release);
                metrics::counter!("store_query_timeouts_total").increment(1);
                Err(Error::Timeout(self.query_timeout))
            }
        }
    }

    /// Store an event.
    ///
    /// Idempotent: re-inserting a stored id returns [`InsertOutcome::Duplicate`]
    /// and changes nothing.
    pub async fn insert(&self, event: &Event) -> Result<InsertOutcome> {
        event.validate_now()?;
        let event = event.clone();
        self.run(None, move |conn| insert_event(conn, &event)).await
    }

    /// Query events matching any of `filters`, newest first, ties by id.
    pub async fn query(&self, filters: &[Filter], options: QueryOptions) -> Result<Vec<Event>> {
        let filters = live_filters(filters)?;
        if filters.is_empty() {
            return Ok(Vec::new());
        }
        let QueryOptions {
            limit,
            since,
            until,
            signal,
        } = options;
        self.run(signal.as_ref(), move |conn| {
            query_events(conn, &filters, limit, since, until)
        })
        .await
    }

    /// Count distinct events matching any of `filters`.
    ///
    /// Per-filter limits do not bound the count.
    pub async fn count(&self, filters: &[Filter], options: QueryOptions) -> Result<u64> {
        let filters = live_filters(filters)?;
        if filters.is_empty() {
            return Ok(0);
        }
        let QueryOptions {
            since,
            until,
            signal,
            ..
        } = options;
        self.run(signal.as_ref(), move |conn| {
            let refs: Vec<&Filter> = filters.iter().collect();
            let clause = sql::count_events(&refs, since, until);
            let count: i64 =
                conn.query_row(&clause.sql, params_from_iter(clause.params.iter()), |row| {
                    row.get(0)
                })?;
            Ok(count.max(0) as u64)
        })
        .await
    }

    /// Direct lookup of visible events by id.
    pub async fn get_many(&self, ids: &[String], signal: Option<CancellationToken>) -> Result<Vec<Event>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let mut options = QueryOptions::new();
        options.signal = signal;
        self.query(&[Filter::new().ids(ids.iter().cloned())], options)
            .await
    }

    /// Look up a single visible event by id.
    pub async fn get(&self, id: &str) -> Result<Option<Event>> {
        Ok(self
            .get_many(&[id.to_string()], None)
            .await?
            .into_iter()
            .next())
    }

    /// Current version of a replaceable event for `(kind, pubkey)`.
    pub async fn replaceable(&self, kind: u16, pubkey: &str) -> Result<Option<Event>> {
        let filter = Filter::new().kind(kind).authors([pubkey]).limit(1);
        Ok(self
            .query(&[filter], QueryOptions::new())
            .await?
            .into_iter()
            .next())
    }

    // ═══════════════════════════════════════════════════════════════════════
    // Local users
    // ═══════════════════════════════════════════════════════════════════════

    /// Register a pubkey as a local user of this instance.
    pub async fn add_local_user(&self, pubkey: &str) -> Result<bool> {
        validate_hex(pubkey, 64, "pubkey")?;
        let pubkey = pubkey.to_string();
        let now = unix_now();
        self.run(None, move |conn| {
            let added = conn.execute(
                "INSERT OR IGNORE INTO users (pubkey, added_at) VALUES (?1, ?2)",
                params![pubkey, now],
            )?;
            Ok(added > 0)
        })
        .await
    }

    /// True if `pubkey` is a registered local user.
    pub async fn is_local_user(&self, pubkey: &str) -> Result<bool> {
        let pubkey = pubkey.to_string();
        self.run(None, move |conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(SELECT 1 FROM users WHERE pubkey = ?1)",
                [pubkey],
                |row| row.get(0),
            )?)
        })
        .await
    }

    /// True if any local user's current follow list contains `pubkey`.
    pub async fn is_locally_followed(&self, pubkey: &str) -> Result<bool> {
        let pubkey = pubkey.to_string();
        self.run(None, move |conn| {
            Ok(conn.query_row(
                "SELECT EXISTS(
                    SELECT 1 FROM events e
                    JOIN users u ON u.pubkey = e.pubkey
                    JOIN event_tags t ON t.event_id = e.id
                    WHERE e.kind = ?1 AND e.deleted = 0
                      AND t.name = 'p' AND t.value = ?2
                )",
                params![kind::FOLLOW_LIST, pubkey],
                |row| row.get(0),
            )?)
        })
        .await
    }
}

/// Validate and drop filters that can never match.
fn live_filters(filters: &[Filter]) -> Result<Vec<Filter>> {
    for filter in filters {
        filter.validate()?;
    }
    Ok(filters.iter().filter(|f| !f.is_void()).cloned().collect())
}

/// Sort newest first, equal timestamps by ascending id.
pub fn sort_newest_first(events: &mut [Event]) {
    events.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| a.id.cmp(&b.id)));
}

pub(crate) fn unix_now() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

// ═══════════════════════════════════════════════════════════════════════════
// Synchronous SQL (runs under the connection lock)
// ═══════════════════════════════════════════════════════════════════════════

/// Tags indexed for `#x` filters: single-letter names only.
fn is_indexed_tag(name: &str) -> bool {
    name.len() == 1 && name.as_bytes()[0].is_ascii_alphabetic()
}

/// Insert one event in a single transaction.
pub(crate) fn insert_event(conn: &mut Connection, event: &Event) -> Result<InsertOutcome> {
    let class = event.class();
    if class == KindClass::Ephemeral {
        trace!(id = %event.id, kind = event.kind, "Rejected ephemeral event");
        return Ok(InsertOutcome::Rejected);
    }

    let tx = conn.transaction()?;
    let inserted = tx.execute(
        "INSERT OR IGNORE INTO events (id, pubkey, created_at, kind, tags, content, sig, d_tag)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            event.id,
            event.pubkey,
            event.created_at as i64,
            event.kind,
            serde_json::to_string(&event.tags)?,
            event.content,
            event.sig,
            event.d_tag(),
        ],
    )?;
    if inserted == 0 {
        metrics::counter!("store_events_duplicate_total").increment(1);
        return Ok(InsertOutcome::Duplicate);
    }

    {
        let mut stmt = tx.prepare_cached(
            "INSERT OR IGNORE INTO event_tags (event_id, name, value) VALUES (?1, ?2, ?3)",
        )?;
        for tag in &event.tags {
            if let [name, value, ..] = tag.as_slice() {
                if is_indexed_tag(name) {
                    stmt.execute(params![event.id, name, value])?;
                }
            }
        }
    }

    let mut outcome = InsertOutcome::Inserted;

    if event.kind == kind::DELETION {
        mask_deleted_targets(&tx, event)?;
    } else if deletion_recorded(&tx, event)? {
        tx.execute("UPDATE events SET deleted = 1 WHERE id = ?1", [&event.id])?;
        outcome = InsertOutcome::Masked;
    }

    if class.is_replaceable()
        && !prune_superseded(&tx, event)?
        && outcome == InsertOutcome::Inserted
    {
        outcome = InsertOutcome::Superseded;
    }

    tx.commit()?;

    match outcome {
        InsertOutcome::Inserted => {
            metrics::counter!("store_events_inserted_total").increment(1);
            debug!(id = %event.id, kind = event.kind, "Stored event");
        }
        other => debug!(id = %event.id, kind = event.kind, outcome = ?other, "Stored event not visible"),
    }
    Ok(outcome)
}

/// Mask the `e`-referenced events that share the deletion's author.
fn mask_deleted_targets(conn: &Connection, deletion: &Event) -> Result<()> {
    let targets = tags::value_set(&deletion.tags, "e");
    if targets.is_empty() {
        return Ok(());
    }
    let sql = format!(
        "UPDATE events SET deleted = 1 WHERE pubkey = ? AND kind != {} AND id IN ({})",
        kind::DELETION,
        placeholders(targets.len())
    );
    let masked = conn.execute(
        &sql,
        params_from_iter(std::iter::once(deletion.pubkey.as_str()).chain(targets)),
    )?;
    debug!(id = %deletion.id, masked, "Applied deletion");
    Ok(())
}

/// True if the event's author already requested its deletion.
fn deletion_recorded(conn: &Connection, event: &Event) -> Result<bool> {
    Ok(conn.query_row(
        "SELECT EXISTS(
            SELECT 1 FROM event_tags t JOIN events d ON d.id = t.event_id
            WHERE t.name = 'e' AND t.value = ?1 AND d.kind = ?2 AND d.pubkey = ?3
        )",
        params![event.id, kind::DELETION, event.pubkey],
        |row| row.get(0),
    )?)
}

/// Keep only the newest version of a replaceable event.
///
/// Newest is the highest visible `created_at`; equal timestamps keep the
/// lowest id. Masked versions never win. Returns `false` only if another
/// visible version outranks `event`.
fn prune_superseded(conn: &Connection, event: &Event) -> Result<bool> {
    let d_tag = event.d_tag();
    let winner: Option<String> = conn
        .query_row(
            "SELECT id FROM events WHERE kind = ?1 AND pubkey = ?2 AND d_tag IS ?3 AND deleted = 0
             ORDER BY created_at DESC, id ASC LIMIT 1",
            params![event.kind, event.pubkey, d_tag],
            |row| row.get(0),
        )
        .optional()?;
    let Some(winner) = winner else {
        return Ok(true);
    };

    // Masked versions stay behind so re-deliveries dedupe against them.
    conn.execute(
        "DELETE FROM event_tags WHERE event_id IN (
            SELECT id FROM events
            WHERE kind = ?1 AND pubkey = ?2 AND d_tag IS ?3 AND deleted = 0 AND id != ?4
        )",
        params![event.kind, event.pubkey, d_tag, winner],
    )?;
    let pruned = conn.execute(
        "DELETE FROM events
         WHERE kind = ?1 AND pubkey = ?2 AND d_tag IS ?3 AND deleted = 0 AND id != ?4",
        params![event.kind, event.pubkey, d_tag, winner],
    )?;
    if pruned > 0 {
        trace!(kind = event.kind, pubkey = %event.pubkey, pruned, "Pruned superseded versions");
    }
    Ok(winner == event.id)
}

fn query_events(
    conn: &Connection,
    filters: &[Filter],
    limit: Option<usize>,
    since: Option<u64>,
    until: Option<u64>,
) -> Result<Vec<Event>> {
    let mut seen = HashSet::new();
    let mut events = Vec::new();
    for filter in filters {
        let per_filter = match (filter.limit, limit) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        };
        let clause = sql::select_events(filter, since, until, per_filter);
        for event in load_events(conn, &clause)? {
            if seen.insert(event.id.clone()) {
                events.push(event);
            }
        }
    }
    sort_newest_first(&mut events);
    if let Some(limit) = limit {
        events.truncate(limit);
    }
    Ok(events)
}

/// Raw event row, decoded after the statement is finished.
struct EventRow {
    id: String,
    pubkey: String,
    created_at: i64,
    kind: i64,
    tags: String,
    content: String,
    sig: String,
}

impl EventRow {
    fn read(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            id: row.get(0)?,
            pubkey: row.get(1)?,
            created_at: row.get(2)?,
            kind: row.get(3)?,
            tags: row.get(4)?,
            content: row.get(5)?,
            sig: row.get(6)?,
        })
    }

    fn into_event(self) -> Result<Event> {
        Ok(Event {
            id: self.id,
            pubkey: self.pubkey,
            created_at: self.created_at.max(0) as u64,
            kind: self.kind as u16,
            tags: serde_json::from_str(&self.tags)?,
            content: self.content,
            sig: self.sig,
        })
    }
}

/// Run a select built by [`crate::sql`] and decode the rows.
pub(crate) fn load_events(conn: &Connection, clause: &Clause) -> Result<Vec<Event>> {
    let mut stmt = conn.prepare(&clause.sql)?;
    let rows = stmt
        .query_map(params_from_iter(clause.params.iter()), EventRow::read)?
        .collect::<rusqlite::Result<Vec<_>>>()?;
    rows.into_iter().map(EventRow::into_event).collect()
}

/// Events with the given `kind` that carry `#name = value`, visible only.
pub(crate) fn load_tagged(conn: &Connection, kind: u16, name: &str, value: &str) -> Result<Vec<Event>> {
    let filter = Filter::new().kind(kind).tag(name, [value]);
    load_events(conn, &sql::select_events(&filter, None, None, None))
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::testing::{BASE_TIME, EventFixture, pubkey};

    fn note(author: u8, created_at: u64) -> Event {
        EventFixture::new(kind::TEXT_NOTE)
            .author(pubkey(author))
            .created_at(created_at)
            .build()
    }

    #[tokio::test]
    async fn test_insert_is_idempotent() {
        let store = EventStore::open_in_memory().unwrap();
        let event = note(1, BASE_TIME);

        assert_eq!(store.insert(&event).await.unwrap(), InsertOutcome::Inserted);
        let first = store.query(&[Filter::new()], QueryOptions::new()).await.unwrap();
        assert_eq!(store.insert(&event).await.unwrap(), InsertOutcome::Duplicate);
        let second = store.query(&[Filter::new()], QueryOptions::new()).await.unwrap();

        assert_eq!(first, second);
        assert_eq!(first, vec![event]);
    }

    #[tokio::test]
    async fn test_query_orders_newest_first_ties_by_id() {
        let store = EventStore::open_in_memory().unwrap();
        let old = note(1, BASE_TIME);
        let tie_a = note(1, BASE_TIME + 10);
        let tie_b = note(1, BASE_TIME + 10);
        for event in [&tie_b, &old, &tie_a] {
            store.insert(event).await.unwrap();
        }

        let events = store.query(&[Filter::new()], QueryOptions::new()).await.unwrap();
        let ids: Vec<&str> = events.iter().map(|e| e.id.as_str()).collect();
        assert_eq!(ids, vec![tie_a.id.as_str(), tie_b.id.as_str(), old.id.as_str()]);
    }

    #[tokio::test]
    async fn test_query_results_match_some_filter() {
        let store = EventStore::open_in_memory().unwrap();
        let target = note(2, BASE_TIME);
        let reply = EventFixture::new(kind::TEXT_NOTE)
            .tag(&["e", &target.id, "", "reply"])
            .tag(&["t", "rust"])
            .build();
        let reaction = EventFixture::new(kind::REACTION)
            .tag(&["e", &target.id])
            .build();
        for event in [&target, &reply, &reaction] {
            store.insert(event).await.unwrap();
        }

        let filters = [
            Filter::new().kind(kind::TEXT_NOTE).tag("e", [target.id.clone()]),
            Filter::new().kind(kind::REACTION).authors([pubkey(9)]),
        ];
        let events = store.query(&filters, QueryOptions::new()).await.unwrap();
        assert_eq!(events, vec![reply.clone()]);
        assert!(events.iter().all(|e| agora_core::filter::matches_any(&filters, e)));

        let tagged = store
            .query(&[Filter::new().tag("t", ["rust"])], QueryOptions::new())
            .await
            .unwrap();
        assert_eq!(tagged, vec![reply]);
    }

    #[tokio::test]
    async fn test_overall_limit_and_bounds() {
        let store = EventStore::open_in_memory().unwrap();
        for offset in 0..5 {
            store.insert(&note(1, BASE_TIME + offset)).await.unwrap();
        }

        let limited = store
            .query(&[Filter::new(), Filter::new().kind(1)], QueryOptions::new().limit(2))
            .await
            .unwrap();
        assert_eq!(limited.len(), 2);
        assert_eq!(limited[0].created_at, BASE_TIME + 4);

        let bounded = store
            .query(
                &[Filter::new()],
                QueryOptions::new().since(BASE_TIME + 1).until(BASE_TIME + 3),
            )
            .await
            .unwrap();
        assert_eq!(bounded.len(), 3);

        let count = store
            .count(&[Filter::new().kind(1).limit(1)], QueryOptions::new())
            .await
            .unwrap();
        assert_eq!(count, 5);
    }

    #[tokio::test]
    async fn test_out_of_range_bounds_and_limit() {
        let store = EventStore::open_in_memory().unwrap();
        let event = note(1, BASE_TIME);
        store.insert(&event).await.unwrap();

        let future = Filter::new().since(u64::MAX);
        assert!(!future.matches(&event));
        let found = store.query(&[future], QueryOptions::new()).await.unwrap();
        assert!(found.is_empty());

        let open = Filter::new().until(u64::MAX);
        assert!(open.matches(&event));
        let found = store.query(&[open], QueryOptions::new()).await.unwrap();
        assert_eq!(found, vec![event.clone()]);

        let found = store
            .query(&[Filter::new().limit(usize::MAX)], QueryOptions::new())
            .await
            .unwrap();
        assert_eq!(found, vec![event.clone()]);
        let found = store
            .query(&[Filter::new()], QueryOptions::new().limit(usize::MAX).since(u64::MAX))
            .await
            .unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_filter_is_rejected() {
        let store = EventStore::open_in_memory().unwrap();
        let err = store
            .query(&[Filter::new().ids(["nothex"])], QueryOptions::new())
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[tokio::test]
    async fn test_replaceable_keeps_newest() {
        let store = EventStore::open_in_memory().unwrap();
        let older = EventFixture::new(kind::METADATA).created_at(BASE_TIME).build();
        let newer = EventFixture::new(kind::METADATA).created_at(BASE_TIME + 5).build();

        assert_eq!(store.insert(&newer).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert(&older).await.unwrap(), InsertOutcome::Superseded);

        let current = store.replaceable(kind::METADATA, &pubkey(1)).await.unwrap();
        assert_eq!(current, Some(newer));
        let all = store
            .count(&[Filter::new().kind(kind::METADATA)], QueryOptions::new())
            .await
            .unwrap();
        assert_eq!(all, 1);
    }

    #[tokio::test]
    async fn test_replaceable_tie_keeps_lowest_id() {
        let store = EventStore::open_in_memory().unwrap();
        let low = EventFixture::new(kind::FOLLOW_LIST).build();
        let high = EventFixture::new(kind::FOLLOW_LIST).build();
        assert!(low.id < high.id);

        assert_eq!(store.insert(&high).await.unwrap(), InsertOutcome::Inserted);
        assert_eq!(store.insert(&low).await.unwrap(), InsertOutcome::Inserted);
        let current = store.replaceable(kind::FOLLOW_LIST, &pubkey(1)).await.unwrap();
        assert_eq!(current, Some(low));
    }

    #[tokio::test]
    async fn test_masked_version_does_not_supersede_visible_one() {
        let store = EventStore::open_in_memory().unwrap();
        let older = EventFixture::new(kind::METADATA).created_at(BASE_TIME).build();
        let newer = EventFixture::new(kind::METADATA).created_at(BASE_TIME + 5).build();
        let deletion = EventFixture::new(kind::DELETION)
            .created_at(BASE_TIME + 6)
            .tag(&["e", &newer.id])
            .build();

        assert_eq!(store.insert(&newer).await.unwrap(), InsertOutcome::Inserted);
        store.insert(&deletion).await.unwrap();
        assert_eq!(store.insert(&older).await.unwrap(), InsertOutcome::Inserted);

        let current = store.replaceable(kind::METADATA, &pubkey(1)).await.unwrap();
        assert_eq!(current, Some(older.clone()));
        assert_eq!(store.insert(&newer).await.unwrap(), InsertOutcome::Duplicate);

        // A version arriving after its own deletion stays masked and leaves
        // the visible one in place.
        let late = EventFixture::new(kind::METADATA).created_at(BASE_TIME + 9).build();
        let late_deletion = EventFixture::new(kind::DELETION).tag(&["e", &late.id]).build();
        store.insert(&late_deletion).await.unwrap();
        assert_eq!(store.insert(&late).await.unwrap(), InsertOutcome::Masked);
        let current = store.replaceable(kind::METADATA, &pubkey(1)).await.unwrap();
        assert_eq!(current, Some(older));
    }

    #[tokio::test]
    async fn test_parameterized_versions_are_keyed_by_d_tag() {
        let store = EventStore::open_in_memory().unwrap();
        let a = EventFixture::new(kind::USER_RECORD).tag(&["d", "alice"]).build();
        let b = EventFixture::new(kind::USER_RECORD).tag(&["d", "bob"]).build();
        let a2 = EventFixture::new(kind::USER_RECORD)
            .tag(&["d", "alice"])
            .created_at(BASE_TIME + 1)
            .build();
        for event in [&a, &b, &a2] {
            store.insert(event).await.unwrap();
        }

        let events = store
            .query(&[Filter::new().kind(kind::USER_RECORD)], QueryOptions::new())
            .await
            .unwrap();
        assert_eq!(events, vec![a2, b]);
    }

    #[tokio::test]
    async fn test_ephemeral_is_rejected() {
        let store = EventStore::open_in_memory().unwrap();
        let event = EventFixture::new(20001).build();
        assert_eq!(store.insert(&event).await.unwrap(), InsertOutcome::Rejected);
        assert_eq!(store.get(&event.id).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_deletion_masks_own_events_only() {
        let store = EventStore::open_in_memory().unwrap();
        let mine = note(1, BASE_TIME);
        let theirs = note(2, BASE_TIME);
        store.insert(&mine).await.unwrap();
        store.insert(&theirs).await.unwrap();

        let deletion = EventFixture::new(kind::DELETION)
            .tag(&["e", &mine.id])
            .tag(&["e", &theirs.id])
            .build();
        store.insert(&deletion).await.unwrap();

        assert_eq!(store.get(&mine.id).await.unwrap(), None);
        assert_eq!(store.get(&theirs.id).await.unwrap(), Some(theirs));
    }

    #[tokio::test]
    async fn test_event_after_its_deletion_is_masked() {
        let store = EventStore::open_in_memory().unwrap();
        let late = note(1, BASE_TIME);
        let deletion = EventFixture::new(kind::DELETION).tag(&["e", &late.id]).build();
        store.insert(&deletion).await.unwrap();

        assert_eq!(store.insert(&late).await.unwrap(), InsertOutcome::Masked);
        assert_eq!(store.get(&late.id).await.unwrap(), None);
        assert_eq!(store.insert(&late).await.unwrap(), InsertOutcome::Duplicate);
    }

    #[tokio::test]
    async fn test_cancelled_signal() {
        let store = EventStore::open_in_memory().unwrap();
        let token = CancellationToken::new();
        token.cancel();
        let err = store
            .query(&[Filter::new()], QueryOptions::new().signal(token))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Cancelled));
    }

    #[tokio::test]
    async fn test_slow_task_times_out() {
        let mut store = EventStore::open_in_memory().unwrap();
        store.query_timeout = Duration::from_millis(20);
        let err = store
            .run(None, |_conn| {
                std::thread::sleep(Duration::from_millis(200));
                Ok(())
            })
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Timeout(_)));
    }

    #[tokio::test]
    async fn test_local_users_and_follows() {
        let store = EventStore::open_in_memory().unwrap();
        let local = pubkey(1);
        let followed = pubkey(2);
        let stranger = pubkey(3);

        assert!(store.add_local_user(&local).await.unwrap());
        assert!(!store.add_local_user(&local).await.unwrap());
        assert!(store.is_local_user(&local).await.unwrap());
        assert!(!store.is_local_user(&stranger).await.unwrap());

        let follows = EventFixture::new(kind::FOLLOW_LIST)
            .author(local)
            .tag(&["p", &followed])
            .build();
        store.insert(&follows).await.unwrap();

        assert!(store.is_locally_followed(&followed).await.unwrap());
        assert!(!store.is_locally_followed(&stranger).await.unwrap());
    }

    #[tokio::test]
    async fn test_open_on_disk_persists() {
        let dir = tempfile::tempdir().unwrap();
        let config = StoreConfig {
            path: dir.path().join("nested/agora.db"),
            ..Default::default()
        };
        let event = note(1, BASE_TIME);
        {
            let store = EventStore::open(&config).unwrap();
            store.insert(&event).await.unwrap();
        }
        let store = EventStore::open(&config).unwrap();
        assert_eq!(store.get(&event.id).await.unwrap(), Some(event));
    }
}
