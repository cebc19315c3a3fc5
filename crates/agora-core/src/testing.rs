//! Event fixtures for tests.
//!
//! Fixture events carry well-formed but meaningless ids and signatures. Ids
//! come from a process-wide counter, so fixtures built later sort after
//! earlier ones.

use std::sync::atomic::{AtomicU64, Ordering};

use crate::event::Event;

static NEXT_ID: AtomicU64 = AtomicU64::new(1);

/// Base timestamp for fixtures (2023-11-14).
pub const BASE_TIME: u64 = 1_700_000_000;

/// A deterministic 64-hex pubkey derived from `n`.
pub fn pubkey(n: u8) -> String {
    format!("{:02x}", n).repeat(32)
}

/// Builder for fixture events.
#[derive(Debug, Clone)]
pub struct EventFixture {
    event: Event,
}

impl EventFixture {
    pub fn new(kind: u16) -> Self {
        let n = NEXT_ID.fetch_add(1, Ordering::Relaxed);
        Self {
            event: Event {
                id: format!("{:064x}", n),
                pubkey: pubkey(1),
                created_at: BASE_TIME,
                kind,
                tags: Vec::new(),
                content: String::new(),
                sig: "f".repeat(128),
            },
        }
    }

    pub fn id(mut self, id: impl Into<String>) -> Self {
        self.event.id = id.into();
        self
    }

    pub fn author(mut self, pubkey: impl Into<String>) -> Self {
        self.event.pubkey = pubkey.into();
        self
    }

    pub fn created_at(mut self, created_at: u64) -> Self {
        self.event.created_at = created_at;
        self
    }

    pub fn content(mut self, content: impl Into<String>) -> Self {
        self.event.content = content.into();
        self
    }

    pub fn tag(mut self, tag: &[&str]) -> Self {
        self.event
            .tags
            .push(tag.iter().map(|s| s.to_string()).collect());
        self
    }

    pub fn build(self) -> Event {
        self.event
    }
}
