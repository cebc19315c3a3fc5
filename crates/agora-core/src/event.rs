//! The immutable, content-addressed event record.
//!
//! Events arrive pre-signed from relays or from the external signer. This
//! module only checks their structure (hex lengths, timestamp window); id and
//! signature verification happen before events reach the core.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::tags;
use crate::{MAX_FUTURE_DRIFT_SECS, NOSTR_GENESIS_TIMESTAMP};

/// Event kinds the gateway attaches meaning to.
pub mod kind {
    /// Profile metadata (replaceable).
    pub const METADATA: u16 = 0;
    /// Short text note.
    pub const TEXT_NOTE: u16 = 1;
    /// Follow list (replaceable).
    pub const FOLLOW_LIST: u16 = 3;
    /// Deletion request.
    pub const DELETION: u16 = 5;
    /// Repost of a text note.
    pub const REPOST: u16 = 6;
    /// Reaction.
    pub const REACTION: u16 = 7;
    /// Zap receipt.
    pub const ZAP_RECEIPT: u16 = 9735;
    /// Relay list metadata (replaceable).
    pub const RELAY_LIST: u16 = 10002;
    /// Admin-signed local user record (parameterized replaceable, `d` = pubkey).
    pub const USER_RECORD: u16 = 30361;
}

/// Storage class of an event kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KindClass {
    /// Every event is kept.
    Regular,
    /// Only the newest event per `(kind, author)` is current.
    Replaceable,
    /// Never stored.
    Ephemeral,
    /// Only the newest event per `(kind, author, d)` is current.
    Parameterized,
}

impl KindClass {
    /// Classify a kind number.
    pub fn of(kind: u16) -> Self {
        match kind {
            0 | 3 | 10000..=19999 => Self::Replaceable,
            20000..=29999 => Self::Ephemeral,
            30000..=39999 => Self::Parameterized,
            _ => Self::Regular,
        }
    }

    /// True for both replaceable classes ("latest wins").
    pub fn is_replaceable(self) -> bool {
        matches!(self, Self::Replaceable | Self::Parameterized)
    }
}

/// A signed protocol event.
///
/// Two events with the same `id` are byte-identical; the id is the primary
/// key everywhere in the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub id: String,
    pub pubkey: String,
    pub created_at: u64,
    pub kind: u16,
    pub tags: Vec<Vec<String>>,
    pub content: String,
    pub sig: String,
}

impl Event {
    /// Parse an event from its JSON representation.
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Serialize to JSON.
    pub fn to_json(&self) -> String {
        // Serializing a plain struct of strings and integers cannot fail.
        serde_json::to_string(self).unwrap_or_default()
    }

    /// Storage class of this event's kind.
    pub fn class(&self) -> KindClass {
        KindClass::of(self.kind)
    }

    /// The `d` tag value that distinguishes parameterized replaceable events.
    ///
    /// Missing `d` tags are treated as the empty string.
    pub fn d_tag(&self) -> Option<&str> {
        match self.class() {
            KindClass::Parameterized => Some(tags::first_value(&self.tags, "d").unwrap_or("")),
            _ => None,
        }
    }

    /// First value of the first tag with the given name.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        tags::first_value(&self.tags, name)
    }

    /// Check the structural validity of the event.
    ///
    /// `now` is the current unix time, passed in so callers (and tests) control
    /// the future-drift window.
    pub fn validate(&self, now: u64) -> Result<()> {
        validate_hex(&self.id, 64, "id")?;
        validate_hex(&self.pubkey, 64, "pubkey")?;
        validate_hex(&self.sig, 128, "sig")?;

        if self.created_at < NOSTR_GENESIS_TIMESTAMP {
            return Err(Error::InvalidTimestamp {
                created_at: self.created_at,
                reason: "before protocol genesis",
            });
        }
        if self.created_at > now + MAX_FUTURE_DRIFT_SECS {
            return Err(Error::InvalidTimestamp {
                created_at: self.created_at,
                reason: "too far in the future",
            });
        }

        if self.tags.iter().any(|tag| tag.is_empty()) {
            return Err(Error::field("tags", "empty tag"));
        }

        Ok(())
    }

    /// Validate against the wall clock.
    pub fn validate_now(&self) -> Result<()> {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        self.validate(now)
    }
}

/// Check that `value` is exactly `len` lowercase hex characters.
pub fn validate_hex(value: &str, len: usize, field: &'static str) -> Result<()> {
    if value.len() != len {
        return Err(Error::field(
            field,
            format!("expected {} hex characters, got {}", len, value.len()),
        ));
    }
    if !is_lower_hex(value) {
        return Err(Error::field(field, "not lowercase hex"));
    }
    Ok(())
}

/// True if every character is `0-9` or `a-f`.
pub fn is_lower_hex(value: &str) -> bool {
    value.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f'))
}

#[cfg(test)]
mod tests {
    use super::*;

    const NOW: u64 = 1_700_000_000;

    fn sample() -> Event {
        Event {
            id: "a".repeat(64),
            pubkey: "b".repeat(64),
            created_at: NOW - 10,
            kind: kind::TEXT_NOTE,
            tags: vec![vec!["t".into(), "rust".into()]],
            content: "hello".into(),
            sig: "c".repeat(128),
        }
    }

    #[test]
    fn test_kind_classes() {
        assert_eq!(KindClass::of(0), KindClass::Replaceable);
        assert_eq!(KindClass::of(1), KindClass::Regular);
        assert_eq!(KindClass::of(3), KindClass::Replaceable);
        assert_eq!(KindClass::of(10002), KindClass::Replaceable);
        assert_eq!(KindClass::of(20001), KindClass::Ephemeral);
        assert_eq!(KindClass::of(30361), KindClass::Parameterized);
        assert_eq!(KindClass::of(40000), KindClass::Regular);
        assert!(KindClass::Parameterized.is_replaceable());
        assert!(!KindClass::Regular.is_replaceable());
    }

    #[test]
    fn test_validate_accepts_well_formed_event() {
        assert!(sample().validate(NOW).is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_hex() {
        let mut event = sample();
        event.pubkey = "B".repeat(64);
        let err = event.validate(NOW).unwrap_err();
        assert!(err.to_string().contains("pubkey"));

        let mut event = sample();
        event.id = "a".repeat(63);
        assert!(event.validate(NOW).is_err());
    }

    #[test]
    fn test_validate_rejects_timestamps_outside_window() {
        let mut event = sample();
        event.created_at = NOSTR_GENESIS_TIMESTAMP - 1;
        assert!(matches!(
            event.validate(NOW),
            Err(Error::InvalidTimestamp { .. })
        ));

        event.created_at = NOW + MAX_FUTURE_DRIFT_SECS + 1;
        assert!(event.validate(NOW).is_err());

        event.created_at = NOW + MAX_FUTURE_DRIFT_SECS;
        assert!(event.validate(NOW).is_ok());
    }

    #[test]
    fn test_d_tag_only_for_parameterized_kinds() {
        let mut event = sample();
        assert_eq!(event.d_tag(), None);

        event.kind = kind::USER_RECORD;
        assert_eq!(event.d_tag(), Some(""));

        event.tags.push(vec!["d".into(), "abc".into()]);
        assert_eq!(event.d_tag(), Some("abc"));
    }

    #[test]
    fn test_json_shape() {
        let event = sample();
        let json = event.to_json();
        assert!(json.contains("\"created_at\":1699999990"));
        assert_eq!(Event::from_json(&json).unwrap(), event);
    }
}
