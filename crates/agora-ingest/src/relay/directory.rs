//! Relay discovery bookkeeping.
//!
//! Every relay address the gateway learns about (configuration, relay hints
//! inside tags, NIP-65 relay lists) is recorded once, in canonical form, with
//! the time it was first seen and how it was found.

use std::path::Path;

use agora_core::{Event, kind, tags};
use parking_lot::Mutex;
use rusqlite::{Connection, OptionalExtension, params};

use super::url::{NormalizeResult, normalize_relay_url};
use crate::{Result, db};

/// Relay tier classification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RelayTier {
    /// Configured upstream relay.
    Seed,
    /// Learned from events.
    #[default]
    Discovered,
}

impl RelayTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Seed => "seed",
            Self::Discovered => "discovered",
        }
    }
}

impl std::str::FromStr for RelayTier {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "seed" => Ok(Self::Seed),
            "discovered" => Ok(Self::Discovered),
            _ => Err(()),
        }
    }
}

/// Where an address was first found.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoverySource {
    Config,
    /// Third element of a `p`, `e` or `a` tag.
    Hint,
    /// `r` tag of a kind 10002 relay list.
    RelayList,
}

impl DiscoverySource {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Config => "config",
            Self::Hint => "hint",
            Self::RelayList => "relay_list",
        }
    }
}

/// Persistent registry of known relay addresses.
pub struct RelayDirectory {
    conn: Mutex<Connection>,
}

impl RelayDirectory {
    /// Open or create the directory in the database at `path`.
    pub fn open(path: &Path) -> Result<Self> {
        Self::with_connection(db::open(path)?)
    }

    /// Open an in-memory directory (for testing).
    pub fn open_in_memory() -> Result<Self> {
        Self::with_connection(db::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> Result<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS relays (
                url TEXT PRIMARY KEY,
                first_seen_at INTEGER NOT NULL,
                tier TEXT NOT NULL DEFAULT 'discovered',
                source TEXT NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_relays_tier ON relays(tier);",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Record a relay address.
    ///
    /// Invalid and blocked addresses are skipped. Returns true if the address
    /// was not known before. A configured relay that was previously only
    /// discovered is promoted to [`RelayTier::Seed`].
    pub fn register(&self, url: &str, tier: RelayTier, source: DiscoverySource) -> Result<bool> {
        let normalized = match normalize_relay_url(url) {
            NormalizeResult::Ok(url) => url,
            NormalizeResult::Invalid(reason) => {
                tracing::debug!("Skipping relay URL '{}': {}", url, reason);
                return Ok(false);
            }
            NormalizeResult::Blocked(reason) => {
                tracing::debug!("Blocked relay URL '{}': {}", url, reason);
                return Ok(false);
            }
        };

        let conn = self.conn.lock();
        let inserted = conn.execute(
            "INSERT OR IGNORE INTO relays (url, first_seen_at, tier, source)
             VALUES (?1, ?2, ?3, ?4)",
            params![normalized, chrono::Utc::now().timestamp(), tier.as_str(), source.as_str()],
        )?;

        if inserted == 0 && tier == RelayTier::Seed {
            conn.execute(
                "UPDATE relays SET tier = ?1 WHERE url = ?2",
                params![tier.as_str(), normalized],
            )?;
        }

        Ok(inserted > 0)
    }

    /// Register the configured upstream relays.
    pub fn register_seed_relays(&self, urls: &[String]) -> Result<()> {
        for url in urls {
            self.register(url, RelayTier::Seed, DiscoverySource::Config)?;
        }
        Ok(())
    }

    /// Record every relay address mentioned by `event`.
    ///
    /// Returns the number of addresses seen for the first time.
    pub fn record_event(&self, event: &Event) -> Result<usize> {
        let mut discovered = 0;

        for hint in tags::relay_hints(&event.tags) {
            if self.register(hint, RelayTier::Discovered, DiscoverySource::Hint)? {
                discovered += 1;
            }
        }

        if event.kind == kind::RELAY_LIST {
            for (url, _) in tags::relay_list_entries(&event.tags) {
                if self.register(url, RelayTier::Discovered, DiscoverySource::RelayList)? {
                    discovered += 1;
                }
            }
        }

        if discovered > 0 {
            tracing::debug!(id = %event.id, discovered, "Discovered relays");
        }
        Ok(discovered)
    }

    /// Known relay addresses, optionally restricted to one tier, oldest first.
    pub fn known(&self, tier: Option<RelayTier>) -> Result<Vec<String>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT url FROM relays
             WHERE ?1 IS NULL OR tier = ?1
             ORDER BY first_seen_at ASC, url ASC",
        )?;
        let urls = stmt
            .query_map([tier.map(|t| t.as_str())], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(urls)
    }

    /// Tier of a known address.
    pub fn tier(&self, url: &str) -> Result<Option<RelayTier>> {
        let Some(normalized) = normalize_relay_url(url).ok() else {
            return Ok(None);
        };
        let conn = self.conn.lock();
        let tier: Option<String> = conn
            .query_row("SELECT tier FROM relays WHERE url = ?1", [normalized], |row| {
                row.get(0)
            })
            .optional()?;
        Ok(tier.and_then(|t| t.parse().ok()))
    }

    pub fn len(&self) -> Result<usize> {
        let conn = self.conn.lock();
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM relays", [], |row| row.get(0))?;
        Ok(count as usize)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}
