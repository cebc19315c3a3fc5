//! SQLite schema for the event store and derived stats.
//!
//! Migrations are strictly additive: the store is the long-lived source of
//! truth, so a newer binary must open any older database without losing rows.

use rusqlite::{Connection, Result};

/// Current schema version. Increment when adding a migration.
pub const SCHEMA_VERSION: i32 = 3;

/// Initialize the database schema.
///
/// Creates the version table if needed and runs every pending migration in
/// order. A fresh database walks through all of them.
pub fn init_schema(conn: &mut Connection) -> Result<()> {
    let current_version = get_schema_version(conn)?;
    if current_version < SCHEMA_VERSION {
        migrate(conn, current_version, SCHEMA_VERSION)?;
    }
    Ok(())
}

/// Get the current schema version (0 if not initialized).
pub fn get_schema_version(conn: &Connection) -> Result<i32> {
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_version (
            version INTEGER NOT NULL
        )",
        [],
    )?;

    let version: Option<i32> = conn
        .query_row("SELECT version FROM schema_version LIMIT 1", [], |row| {
            row.get(0)
        })
        .ok();

    Ok(version.unwrap_or(0))
}

fn set_schema_version(conn: &Connection, version: i32) -> Result<()> {
    conn.execute("DELETE FROM schema_version", [])?;
    conn.execute("INSERT INTO schema_version (version) VALUES (?)", [version])?;
    Ok(())
}

/// Run migrations `from -> to`, each in its own transaction.
fn migrate(conn: &mut Connection, from: i32, to: i32) -> Result<()> {
    for version in from..to {
        let tx = conn.transaction()?;
        match version {
            0 => create_base_tables(&tx)?,
            1 => migrate_v1_to_v2(&tx)?,
            2 => migrate_v2_to_v3(&tx)?,
            _ => {}
        }
        set_schema_version(&tx, version + 1)?;
        tx.commit()?;
        tracing::info!("Migrated event store schema to v{}", version + 1);
    }
    Ok(())
}

/// v1: events, single-letter tag index, author/event stats.
fn create_base_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        -- Canonical event rows. Never updated except for the deletion mask.
        CREATE TABLE IF NOT EXISTS events (
            id TEXT PRIMARY KEY,
            pubkey TEXT NOT NULL,
            created_at INTEGER NOT NULL,
            kind INTEGER NOT NULL,
            tags TEXT NOT NULL,
            content TEXT NOT NULL,
            sig TEXT NOT NULL,
            d_tag TEXT,
            deleted INTEGER NOT NULL DEFAULT 0
        );

        -- One row per (event, single-letter tag, value)
        CREATE TABLE IF NOT EXISTS event_tags (
            event_id TEXT NOT NULL,
            name TEXT NOT NULL,
            value TEXT NOT NULL,
            PRIMARY KEY (event_id, name, value)
        );

        CREATE TABLE IF NOT EXISTS author_stats (
            pubkey TEXT PRIMARY KEY,
            followers_count INTEGER NOT NULL DEFAULT 0,
            following_count INTEGER NOT NULL DEFAULT 0,
            notes_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE TABLE IF NOT EXISTS event_stats (
            event_id TEXT PRIMARY KEY,
            replies_count INTEGER NOT NULL DEFAULT 0,
            reposts_count INTEGER NOT NULL DEFAULT 0,
            reactions_count INTEGER NOT NULL DEFAULT 0
        );

        CREATE INDEX IF NOT EXISTS idx_events_created_at ON events(created_at DESC, id);
        CREATE INDEX IF NOT EXISTS idx_events_kind_created ON events(kind, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_events_pubkey_kind ON events(pubkey, kind, created_at DESC);
        CREATE INDEX IF NOT EXISTS idx_event_tags_lookup ON event_tags(name, value);
        "#,
    )
}

/// v2: quote/zap counters and the local user registry.
fn migrate_v1_to_v2(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        ALTER TABLE event_stats ADD COLUMN quotes_count INTEGER NOT NULL DEFAULT 0;
        ALTER TABLE event_stats ADD COLUMN zaps_amount INTEGER NOT NULL DEFAULT 0;

        CREATE TABLE IF NOT EXISTS users (
            pubkey TEXT PRIMARY KEY,
            added_at INTEGER NOT NULL
        );
        "#,
    )
}

/// v3: author search and NIP-05 metadata.
fn migrate_v2_to_v3(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        ALTER TABLE author_stats ADD COLUMN search TEXT NOT NULL DEFAULT '';
        ALTER TABLE author_stats ADD COLUMN nip05 TEXT;
        ALTER TABLE author_stats ADD COLUMN nip05_domain TEXT;
        ALTER TABLE author_stats ADD COLUMN nip05_last_verified_at INTEGER;

        CREATE INDEX IF NOT EXISTS idx_author_stats_nip05_domain ON author_stats(nip05_domain);
        "#,
    )
}
