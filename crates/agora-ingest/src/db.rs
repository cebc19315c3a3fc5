//! SQLite connections for the ingest-side bookkeeping tables.
//!
//! The relay directory and the trend tracker live in their own database file
//! next to the event store, so heavy firehose bookkeeping never contends with
//! the event store's connection.

use std::path::Path;

use rusqlite::Connection;

use crate::Result;

/// Open (creating if needed) a WAL-mode database at `path`.
pub fn open(path: &Path) -> Result<Connection> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent)?;
    }

    let conn = Connection::open(path)?;
    conn.execute_batch(
        "PRAGMA journal_mode=WAL;
         PRAGMA synchronous=NORMAL;
         PRAGMA busy_timeout=5000;",
    )?;
    Ok(conn)
}

pub fn open_in_memory() -> Result<Connection> {
    Ok(Connection::open_in_memory()?)
}
