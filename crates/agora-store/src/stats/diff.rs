//! Counter diffs derived from one incoming event.
//!
//! Diffs are computed against the store *before* the event is inserted, since
//! inserting may prune the previous follow list or mask a deleted repost.
//! They are applied only if the insert actually stored a new visible event.

use std::collections::{BTreeMap, BTreeSet};

use agora_core::{Event, kind, tags};
use rusqlite::{Connection, OptionalExtension, params, params_from_iter};
use rusqlite::types::Value;
use serde::Deserialize;

use super::StatKey;
use crate::error::Result;
use crate::sql::placeholders;

/// Additive columns of `author_stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthorColumn {
    Followers,
    Notes,
}

/// Additive columns of `event_stats`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventColumn {
    Replies,
    Reposts,
    Reactions,
    Quotes,
    Zaps,
}

impl EventColumn {
    const ALL: [EventColumn; 5] = [
        Self::Replies,
        Self::Reposts,
        Self::Reactions,
        Self::Quotes,
        Self::Zaps,
    ];

    fn index(self) -> usize {
        self as usize
    }
}

/// Searchable profile fields taken from a kind-0 event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProfileMeta {
    pub search: String,
    pub nip05: Option<String>,
    pub nip05_domain: Option<String>,
}

/// Every stats change one event causes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StatsDiff {
    pub authors: Vec<(String, AuthorColumn, i64)>,
    pub events: Vec<(String, EventColumn, i64)>,
    /// `following_count` is overwritten, never added to.
    pub following: Option<(String, i64)>,
    pub profile: Option<(String, ProfileMeta)>,
}

impl StatsDiff {
    pub fn is_empty(&self) -> bool {
        self.authors.is_empty()
            && self.events.is_empty()
            && self.following.is_none()
            && self.profile.is_none()
    }

    fn author(&mut self, pubkey: &str, column: AuthorColumn, delta: i64) {
        self.authors.push((pubkey.to_string(), column, delta));
    }

    fn event(&mut self, id: &str, column: EventColumn, delta: i64) {
        self.events.push((id.to_string(), column, delta));
    }

    /// Keys whose stats this diff touches.
    pub fn affected_keys(&self) -> BTreeSet<StatKey> {
        let authors = self
            .authors
            .iter()
            .map(|(pubkey, ..)| pubkey)
            .chain(self.following.iter().map(|(pubkey, _)| pubkey))
            .map(|pubkey| StatKey::Author(pubkey.clone()));
        let events = self.events.iter().map(|(id, ..)| StatKey::Event(id.clone()));
        authors.chain(events).collect()
    }
}

/// Compute the diff for `event` against the current store contents.
pub(crate) fn compute(conn: &Connection, event: &Event) -> Result<StatsDiff> {
    let mut diff = StatsDiff::default();
    match event.kind {
        kind::METADATA => {
            diff.profile = profile_meta(&event.content).map(|meta| (event.pubkey.clone(), meta));
        }
        kind::TEXT_NOTE => {
            diff.author(&event.pubkey, AuthorColumn::Notes, 1);
            if let Some(parent) = tags::reply_target(&event.tags) {
                diff.event(parent, EventColumn::Replies, 1);
            }
            if let Some(quoted) = tags::quote_target(&event.tags) {
                diff.event(quoted, EventColumn::Quotes, 1);
            }
        }
        kind::FOLLOW_LIST => follow_list_diff(conn, event, &mut diff)?,
        kind::DELETION => deletion_diff(conn, event, &mut diff)?,
        kind::REPOST => {
            if let Some(target) = event.tag_value("e") {
                diff.event(target, EventColumn::Reposts, 1);
            }
        }
        kind::REACTION => {
            if let Some(target) = reaction_target(&event.tags) {
                diff.event(target, EventColumn::Reactions, 1);
            }
        }
        kind::ZAP_RECEIPT => {
            if let (Some(target), Some(amount)) = (event.tag_value("e"), zap_amount(event)) {
                if amount > 0 {
                    diff.event(target, EventColumn::Zaps, amount);
                }
            }
        }
        _ => {}
    }
    Ok(diff)
}

/// Reactions target the last `e` tag (NIP-25).
pub(crate) fn reaction_target(tags: &[Vec<String>]) -> Option<&str> {
    tags.iter()
        .filter(|tag| tag.first().map(String::as_str) == Some("e"))
        .filter_map(|tag| tag.get(1))
        .map(String::as_str)
        .last()
}

/// Millisatoshi amount of a zap receipt, read from the zap request embedded
/// in its `description` tag.
pub(crate) fn zap_amount(receipt: &Event) -> Option<i64> {
    let request: serde_json::Value = serde_json::from_str(receipt.tag_value("description")?).ok()?;
    request
        .get("tags")?
        .as_array()?
        .iter()
        .filter_map(|tag| tag.as_array())
        .find(|tag| tag.first().and_then(|v| v.as_str()) == Some("amount"))
        .and_then(|tag| tag.get(1)?.as_str()?.parse::<i64>().ok())
}

fn follow_list_diff(conn: &Connection, event: &Event, diff: &mut StatsDiff) -> Result<()> {
    let previous: Option<(String, i64, String)> = conn
        .query_row(
            "SELECT id, created_at, tags FROM events WHERE kind = ?1 AND pubkey = ?2
             ORDER BY created_at DESC, id ASC LIMIT 1",
            params![kind::FOLLOW_LIST, event.pubkey],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )
        .optional()?;

    let old_targets: BTreeSet<String> = match &previous {
        Some((id, created_at, tags_json)) => {
            let created_at = (*created_at).max(0) as u64;
            // Same id is a re-delivery; an older or tie-losing version never
            // becomes current.
            if *id == event.id
                || created_at > event.created_at
                || (created_at == event.created_at && *id < event.id)
            {
                return Ok(());
            }
            let old_tags: Vec<Vec<String>> = serde_json::from_str(tags_json)?;
            tags::value_set(&old_tags, "p")
                .into_iter()
                .map(str::to_string)
                .collect()
        }
        None => BTreeSet::new(),
    };
    let new_targets: BTreeSet<String> = tags::value_set(&event.tags, "p")
        .into_iter()
        .map(str::to_string)
        .collect();

    for added in new_targets.difference(&old_targets) {
        diff.author(added, AuthorColumn::Followers, 1);
    }
    for removed in old_targets.difference(&new_targets) {
        diff.author(removed, AuthorColumn::Followers, -1);
    }
    diff.following = Some((event.pubkey.clone(), new_targets.len() as i64));
    Ok(())
}

/// A deleted repost gives back its `+1`, once the repost chain resolves to
/// the original note by the reposted author.
fn deletion_diff(conn: &Connection, deletion: &Event, diff: &mut StatsDiff) -> Result<()> {
    for target in tags::value_set(&deletion.tags, "e") {
        let repost: Option<String> = conn
            .query_row(
                "SELECT tags FROM events WHERE id = ?1 AND pubkey = ?2 AND kind = ?3 AND deleted = 0",
                params![target, deletion.pubkey, kind::REPOST],
                |row| row.get(0),
            )
            .optional()?;
        let Some(repost_tags) = repost else {
            continue;
        };
        let repost_tags: Vec<Vec<String>> = serde_json::from_str(&repost_tags)?;
        let (Some(original), Some(original_author)) = (
            tags::first_value(&repost_tags, "e"),
            tags::first_value(&repost_tags, "p"),
        ) else {
            continue;
        };
        let resolved: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM events WHERE id = ?1 AND pubkey = ?2 AND kind = ?3)",
            params![original, original_author, kind::TEXT_NOTE],
            |row| row.get(0),
        )?;
        if resolved {
            diff.event(original, EventColumn::Reposts, -1);
        }
    }
    Ok(())
}

#[derive(Deserialize)]
struct ProfileContent {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    display_name: Option<String>,
    #[serde(default)]
    nip05: Option<String>,
}

/// Parse the searchable fields of a kind-0 profile. Unparseable content
/// leaves the stored metadata untouched.
pub(crate) fn profile_meta(content: &str) -> Option<ProfileMeta> {
    let profile: ProfileContent = serde_json::from_str(content).ok()?;
    let search = [profile.name, profile.display_name]
        .into_iter()
        .flatten()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect::<Vec<_>>()
        .join(" ");
    let nip05 = profile
        .nip05
        .map(|s| s.trim().to_lowercase())
        .filter(|s| s.contains('@'));
    let nip05_domain = nip05
        .as_deref()
        .and_then(|s| s.rsplit_once('@'))
        .map(|(_, domain)| domain.to_string());
    Some(ProfileMeta {
        search,
        nip05,
        nip05_domain,
    })
}

/// Apply a diff: one multi-row additive upsert per table, in one transaction.
pub(crate) fn apply(conn: &mut Connection, diff: &StatsDiff) -> Result<()> {
    let mut authors: BTreeMap<&str, [i64; 2]> = BTreeMap::new();
    for (pubkey, column, delta) in &diff.authors {
        let row = authors.entry(pubkey.as_str()).or_default();
        match column {
            AuthorColumn::Followers => row[0] += delta,
            AuthorColumn::Notes => row[1] += delta,
        }
    }
    let mut events: BTreeMap<&str, [i64; 5]> = BTreeMap::new();
    for (id, column, delta) in &diff.events {
        events.entry(id.as_str()).or_default()[column.index()] += delta;
    }

    let tx = conn.transaction()?;

    if !authors.is_empty() {
        let sql = format!(
            "INSERT INTO author_stats (pubkey, followers_count, notes_count)
             VALUES {}
             ON CONFLICT(pubkey) DO UPDATE SET
                followers_count = followers_count + excluded.followers_count,
                notes_count = notes_count + excluded.notes_count",
            value_rows(authors.len(), 3)
        );
        let params = authors.iter().flat_map(|(pubkey, row)| {
            std::iter::once(Value::Text(pubkey.to_string()))
                .chain(row.iter().map(|delta| Value::Integer(*delta)))
        });
        tx.execute(&sql, params_from_iter(params))?;
    }

    if !events.is_empty() {
        let sql = format!(
            "INSERT INTO event_stats
                (event_id, replies_count, reposts_count, reactions_count, quotes_count, zaps_amount)
             VALUES {}
             ON CONFLICT(event_id) DO UPDATE SET
                replies_count = replies_count + excluded.replies_count,
                reposts_count = reposts_count + excluded.reposts_count,
                reactions_count = reactions_count + excluded.reactions_count,
                quotes_count = quotes_count + excluded.quotes_count,
                zaps_amount = zaps_amount + excluded.zaps_amount",
            value_rows(events.len(), 1 + EventColumn::ALL.len())
        );
        let params = events.iter().flat_map(|(id, row)| {
            std::iter::once(Value::Text(id.to_string()))
                .chain(row.iter().map(|delta| Value::Integer(*delta)))
        });
        tx.execute(&sql, params_from_iter(params))?;
    }

    if let Some((pubkey, following)) = &diff.following {
        tx.execute(
            "INSERT INTO author_stats (pubkey, following_count) VALUES (?1, ?2)
             ON CONFLICT(pubkey) DO UPDATE SET following_count = excluded.following_count",
            params![pubkey, following],
        )?;
    }

    if let Some((pubkey, meta)) = &diff.profile {
        tx.execute(
            "INSERT INTO author_stats (pubkey, search, nip05, nip05_domain) VALUES (?1, ?2, ?3, ?4)
             ON CONFLICT(pubkey) DO UPDATE SET
                search = excluded.search,
                nip05_last_verified_at = CASE WHEN nip05 IS excluded.nip05
                    THEN nip05_last_verified_at ELSE NULL END,
                nip05 = excluded.nip05,
                nip05_domain = excluded.nip05_domain",
            params![pubkey, meta.search, meta.nip05, meta.nip05_domain],
        )?;
    }

    tx.commit()?;
    Ok(())
}

/// `(?, ?), (?, ?)` for `rows` rows of `width` columns.
fn value_rows(rows: usize, width: usize) -> String {
    vec![format!("({})", placeholders(width)); rows].join(", ")
}
