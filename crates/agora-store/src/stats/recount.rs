//! Full recounts straight from the event rows.
//!
//! A recount overwrites the stored counters, healing any drift left by a
//! failed diff or by deletions (which only give back reposts).

use agora_core::{Event, kind, tags};
use rusqlite::{Connection, params};

use super::diff::{reaction_target, zap_amount};
use super::{AuthorStats, EventStats};
use crate::error::Result;
use crate::store::load_tagged;

/// Recount and overwrite one author's counters.
pub(crate) fn recount_author(conn: &Connection, pubkey: &str) -> Result<AuthorStats> {
    let followers: i64 = conn.query_row(
        "SELECT COUNT(DISTINCT e.pubkey) FROM events e
         JOIN event_tags t ON t.event_id = e.id
         WHERE e.kind = ?1 AND e.deleted = 0 AND t.name = 'p' AND t.value = ?2",
        params![kind::FOLLOW_LIST, pubkey],
        |row| row.get(0),
    )?;
    let following: i64 = conn.query_row(
        "SELECT COUNT(DISTINCT t.value) FROM events e
         JOIN event_tags t ON t.event_id = e.id
         WHERE e.kind = ?1 AND e.pubkey = ?2 AND e.deleted = 0 AND t.name = 'p'",
        params![kind::FOLLOW_LIST, pubkey],
        |row| row.get(0),
    )?;
    let notes: i64 = conn.query_row(
        "SELECT COUNT(*) FROM events WHERE kind = ?1 AND pubkey = ?2 AND deleted = 0",
        params![kind::TEXT_NOTE, pubkey],
        |row| row.get(0),
    )?;

    conn.execute(
        "INSERT INTO author_stats (pubkey, followers_count, following_count, notes_count)
         VALUES (?1, ?2, ?3, ?4)
         ON CONFLICT(pubkey) DO UPDATE SET
            followers_count = excluded.followers_count,
            following_count = excluded.following_count,
            notes_count = excluded.notes_count",
        params![pubkey, followers, following, notes],
    )?;

    Ok(AuthorStats {
        pubkey: pubkey.to_string(),
        followers_count: followers,
        following_count: following,
        notes_count: notes,
        ..Default::default()
    })
}

/// Recount and overwrite one event's counters.
pub(crate) fn recount_event(conn: &Connection, id: &str) -> Result<EventStats> {
    let replies = count_targeting(&load_tagged(conn, kind::TEXT_NOTE, "e", id)?, id, |e| {
        tags::reply_target(&e.tags)
    });
    let quotes = count_targeting(&load_tagged(conn, kind::TEXT_NOTE, "q", id)?, id, |e| {
        tags::quote_target(&e.tags)
    });
    let reposts = count_targeting(&load_tagged(conn, kind::REPOST, "e", id)?, id, |e| {
        e.tag_value("e")
    });
    let reactions = count_targeting(&load_tagged(conn, kind::REACTION, "e", id)?, id, |e| {
        reaction_target(&e.tags)
    });
    let zaps: i64 = load_tagged(conn, kind::ZAP_RECEIPT, "e", id)?
        .iter()
        .filter(|e| e.tag_value("e") == Some(id))
        .filter_map(zap_amount)
        .filter(|amount| *amount > 0)
        .sum();

    conn.execute(
        "INSERT INTO event_stats
            (event_id, replies_count, reposts_count, reactions_count, quotes_count, zaps_amount)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6)
         ON CONFLICT(event_id) DO UPDATE SET
            replies_count = excluded.replies_count,
            reposts_count = excluded.reposts_count,
            reactions_count = excluded.reactions_count,
            quotes_count = excluded.quotes_count,
            zaps_amount = excluded.zaps_amount",
        params![id, replies, reposts, reactions, quotes, zaps],
    )?;

    Ok(EventStats {
        event_id: id.to_string(),
        replies_count: replies,
        reposts_count: reposts,
        reactions_count: reactions,
        quotes_count: quotes,
        zaps_amount: zaps,
    })
}

/// Events whose relation target (per `target`) is `id`. Tag membership alone
/// over-counts: a reply also tags its root, a reaction its thread.
fn count_targeting(events: &[Event], id: &str, target: impl Fn(&Event) -> Option<&str>) -> i64 {
    events.iter().filter(|e| target(e) == Some(id)).count() as i64
}
