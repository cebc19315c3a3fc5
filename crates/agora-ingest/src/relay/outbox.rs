//! Outbox-model relay selection (NIP-65).
//!
//! An author's relay list names the relays their followers read from. Content
//! by that author is published to the write-capable subset of that list
//! rather than broadcast to every known relay.

use agora_core::{Event, kind, tags};
use agora_core::tags::RelayMarker;

use super::url::{canonicalize, normalize_relay_url};

/// Default number of outbox relays an event is published to.
pub const DEFAULT_OUTBOX_MAX_RELAYS: usize = 4;

/// Write-capable relays from a relay-list event, canonical and deduplicated.
///
/// Entries marked `read` (or with an unknown marker) are skipped, as are
/// non-public addresses and `local_relay` itself. At most `cap` relays are
/// returned, in list order.
pub fn outbox_relays(relay_list: &Event, local_relay: Option<&str>, cap: usize) -> Vec<String> {
    if relay_list.kind != kind::RELAY_LIST {
        return Vec::new();
    }

    let local = local_relay.and_then(canonicalize);
    let mut selected: Vec<String> = Vec::new();

    for (url, marker) in tags::relay_list_entries(&relay_list.tags) {
        if selected.len() >= cap {
            break;
        }
        if !matches!(marker, RelayMarker::Both | RelayMarker::Write) {
            continue;
        }
        // The local relay may be a public address, so compare before filtering.
        if local.is_some() && canonicalize(url) == local {
            continue;
        }
        let Some(url) = normalize_relay_url(url).ok() else {
            continue;
        };
        if !selected.contains(&url) {
            selected.push(url);
        }
    }

    selected
}

/// The relay set queries are broadcast to: the configured upstream relays
/// followed by the write relays of the admin's own relay list.
///
/// Configured relays are trusted as given (only canonicalized); relays from
/// the admin list must be public.
pub fn write_set(configured: &[String], admin_list: Option<&Event>, local_relay: Option<&str>) -> Vec<String> {
    let local = local_relay.and_then(canonicalize);
    let mut set: Vec<String> = Vec::new();

    let mut push = |url: String| {
        if Some(&url) != local.as_ref() && !set.contains(&url) {
            set.push(url);
        }
    };

    for url in configured {
        match canonicalize(url) {
            Some(url) => push(url),
            None => tracing::warn!("Ignoring malformed upstream relay '{}'", url),
        }
    }

    if let Some(list) = admin_list {
        for url in outbox_relays(list, local_relay, usize::MAX) {
            push(url);
        }
    }

    set
}

#[cfg(test)]
mod tests {
    use super::*;
    use agora_core::testing::EventFixture;

    fn relay_list(entries: &[(&str, Option<&str>)]) -> Event {
        entries
            .iter()
            .fold(EventFixture::new(kind::RELAY_LIST), |fixture, (url, marker)| match marker {
                Some(marker) => fixture.tag(&["r", url, marker]),
                None => fixture.tag(&["r", url]),
            })
            .build()
    }

    #[test]
    fn test_write_and_unmarked_only() {
        let list = relay_list(&[
            ("wss://r1.example.com", Some("write")),
            ("wss://r2.example.com", Some("read")),
            ("wss://r3.example.com", Some("write")),
        ]);

        assert_eq!(
            outbox_relays(&list, None, DEFAULT_OUTBOX_MAX_RELAYS),
            vec!["wss://r1.example.com".to_string(), "wss://r3.example.com".to_string()]
        );
    }

    #[test]
    fn test_excludes_local_relay() {
        let list = relay_list(&[
            ("wss://r1.example.com", Some("write")),
            ("wss://agora.example.com/", None),
            ("wss://r3.example.com", None),
        ]);

        assert_eq!(
            outbox_relays(&list, Some("wss://agora.example.com"), DEFAULT_OUTBOX_MAX_RELAYS),
            vec!["wss://r1.example.com".to_string(), "wss://r3.example.com".to_string()]
        );
    }

    #[test]
    fn test_cap_and_dedupe() {
        let list = relay_list(&[
            ("wss://a.example.com", None),
            ("wss://A.example.com/", None),
            ("wss://b.example.com", None),
            ("wss://c.example.com", None),
            ("wss://d.example.com", None),
            ("wss://e.example.com", None),
        ]);

        let selected = outbox_relays(&list, None, 3);
        assert_eq!(
            selected,
            vec![
                "wss://a.example.com".to_string(),
                "wss://b.example.com".to_string(),
                "wss://c.example.com".to_string(),
            ]
        );
    }

    #[test]
    fn test_skips_unknown_markers_and_private_hosts() {
        let list = relay_list(&[
            ("wss://odd.example.com", Some("paid")),
            ("ws://127.0.0.1:7777", None),
            ("wss://ok.example.com", None),
        ]);

        assert_eq!(outbox_relays(&list, None, 4), vec!["wss://ok.example.com".to_string()]);
    }

    #[test]
    fn test_wrong_kind_yields_nothing() {
        let note = EventFixture::new(kind::TEXT_NOTE)
            .tag(&["r", "wss://r1.example.com"])
            .build();
        assert!(outbox_relays(&note, None, 4).is_empty());
    }

    #[test]
    fn test_write_set_merges_configured_and_admin() {
        let admin = relay_list(&[
            ("wss://upstream.example.com/", None),
            ("wss://admin-write.example.com", Some("write")),
            ("wss://admin-read.example.com", Some("read")),
        ]);
        let configured = vec![
            "wss://upstream.example.com".to_string(),
            "ws://localhost:7777".to_string(),
        ];

        let set = write_set(&configured, Some(&admin), Some("ws://localhost:7777/"));
        assert_eq!(
            set,
            vec![
                "wss://upstream.example.com".to_string(),
                "wss://admin-write.example.com".to_string(),
            ]
        );
    }
}
