//! Hashtag usage tracking for trending computation.
//!
//! Each `t` tag use is recorded once per (tag, author, day). Trending tags are
//! ranked by how many distinct accounts used them in a time window.

use std::path::Path;

use agora_core::Event;
use chrono::{DateTime, NaiveTime};
use parking_lot::Mutex;
use rusqlite::{Connection, params};
use serde::Serialize;

use crate::{Result, db};

/// Default number of `t` tags per event that are tracked.
pub const DEFAULT_TAG_LIMIT: usize = 5;

/// One row of the trending list.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TrendingTag {
    pub tag: String,
    /// Distinct accounts that used the tag in the window.
    pub accounts: u64,
    /// Distinct (account, day) uses in the window.
    pub uses: u64,
}

/// SQLite-backed hashtag usage counters.
pub struct TrendTracker {
    conn: Mutex<Connection>,
    tag_limit: usize,
}

impl TrendTracker {
    pub fn open(path: &Path, tag_limit: usize) -> Result<Self> {
        Self::with_connection(db::open(path)?, tag_limit)
    }

    pub fn open_in_memory(tag_limit: usize) -> Result<Self> {
        Self::with_connection(db::open_in_memory()?, tag_limit)
    }

    fn with_connection(conn: Connection, tag_limit: usize) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS tag_usages (
                tag TEXT NOT NULL,
                pubkey TEXT NOT NULL,
                bucket INTEGER NOT NULL,
                PRIMARY KEY (tag, pubkey, bucket)
            );
            CREATE INDEX IF NOT EXISTS idx_tag_usages_bucket ON tag_usages(bucket);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
            tag_limit,
        })
    }

    /// Record the hashtags of `event`.
    ///
    /// Only the first `tag_limit` `t` tags count. Returns the number of new
    /// (tag, author, day) rows.
    pub fn add_tag_usages(&self, event: &Event) -> Result<usize> {
        let tags = hashtags(event, self.tag_limit);
        if tags.is_empty() {
            return Ok(0);
        }

        let bucket = day_bucket(event.created_at);
        let mut conn = self.conn.lock();
        let tx = conn.transaction()?;
        let mut added = 0;
        {
            let mut stmt = tx.prepare_cached(
                "INSERT OR IGNORE INTO tag_usages (tag, pubkey, bucket) VALUES (?1, ?2, ?3)",
            )?;
            for tag in &tags {
                added += stmt.execute(params![tag, event.pubkey, bucket])?;
            }
        }
        tx.commit()?;

        tracing::trace!(id = %event.id, ?tags, "Tracked hashtags");
        Ok(added)
    }

    /// Tags ranked by distinct accounts between `since` and `until` (unix
    /// seconds, both inclusive at day granularity).
    pub fn trending_tags(&self, since: u64, until: u64, limit: usize) -> Result<Vec<TrendingTag>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT tag, COUNT(DISTINCT pubkey) AS accounts, COUNT(*) AS uses
             FROM tag_usages
             WHERE bucket >= ?1 AND bucket <= ?2
             GROUP BY tag
             ORDER BY accounts DESC, uses DESC, tag ASC
             LIMIT ?3",
        )?;
        let rows = stmt
            .query_map(
                params![day_bucket(since), day_bucket(until), limit as i64],
                |row| {
                    Ok(TrendingTag {
                        tag: row.get(0)?,
                        accounts: row.get::<_, i64>(1)? as u64,
                        uses: row.get::<_, i64>(2)? as u64,
                    })
                },
            )?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(rows)
    }
}

/// First `limit` distinct `t` tag values, trimmed and lowercased.
fn hashtags(event: &Event, limit: usize) -> Vec<String> {
    let mut tags: Vec<String> = Vec::new();
    for tag in event
        .tags
        .iter()
        .filter(|tag| tag.first().map(String::as_str) == Some("t"))
        .take(limit)
    {
        let Some(value) = tag.get(1) else { continue };
        let value = value.trim().to_lowercase();
        if !value.is_empty() && !tags.contains(&value) {
            tags.push(value);
        }
    }
    tags
}

/// Start of the UTC day containing `timestamp`.
fn day_bucket(timestamp: u64) -> i64 {
    DateTime::from_timestamp(timestamp as i64, 0)
        .map(|dt| dt.date_naive().and_time(NaiveTime::MIN).and_utc().timestamp())
        .unwrap_or(0)
}
