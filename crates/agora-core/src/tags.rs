//! Helpers for reading event tags.
//!
//! Tags are ordered sequences of strings: `["e", <id>, <relay hint>, <marker>]`.

use std::collections::BTreeSet;

/// First value of the first tag named `name`.
pub fn first_value<'a>(tags: &'a [Vec<String>], name: &str) -> Option<&'a str> {
    tags.iter()
        .find(|tag| tag.first().map(String::as_str) == Some(name))
        .and_then(|tag| tag.get(1))
        .map(String::as_str)
}

/// All distinct values of tags named `name`.
pub fn value_set<'a>(tags: &'a [Vec<String>], name: &str) -> BTreeSet<&'a str> {
    tags.iter()
        .filter(|tag| tag.first().map(String::as_str) == Some(name))
        .filter_map(|tag| tag.get(1))
        .map(String::as_str)
        .collect()
}

/// Find the `e` tag a text note replies to (NIP-10).
///
/// Prefers a tag marked `reply`, then one marked `root`. Events without
/// markers use the deprecated positional scheme, where the last `e` tag is
/// the reply target. `mention`-marked tags never count.
pub fn find_reply_tag(tags: &[Vec<String>]) -> Option<&Vec<String>> {
    let e_tags = || {
        tags.iter()
            .filter(|tag| tag.first().map(String::as_str) == Some("e") && tag.len() >= 2)
    };
    fn marker(tag: &[String]) -> &str {
        tag.get(3).map(String::as_str).unwrap_or("")
    }

    e_tags()
        .find(|tag| marker(tag) == "reply")
        .or_else(|| e_tags().find(|tag| marker(tag) == "root"))
        .or_else(|| e_tags().filter(|tag| marker(tag).is_empty()).last())
}

/// Id of the event this note replies to, if any.
pub fn reply_target(tags: &[Vec<String>]) -> Option<&str> {
    find_reply_tag(tags).and_then(|tag| tag.get(1)).map(String::as_str)
}

/// Id of the event this note quotes (`q` tag), if any.
pub fn quote_target(tags: &[Vec<String>]) -> Option<&str> {
    first_value(tags, "q")
}

/// Relay hints carried in the third position of `p`, `e` and `a` tags.
pub fn relay_hints(tags: &[Vec<String>]) -> impl Iterator<Item = &str> {
    tags.iter()
        .filter(|tag| matches!(tag.first().map(String::as_str), Some("p" | "e" | "a")))
        .filter_map(|tag| tag.get(2))
        .map(String::as_str)
        .filter(|hint| !hint.is_empty())
}

/// Marker on a relay-list `r` tag (NIP-65).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayMarker {
    /// No marker: read and write.
    Both,
    Read,
    Write,
    /// Anything else. Treated as restrictive.
    Other,
}

/// Parse the `r` tags of a relay-list event into `(url, marker)` pairs.
pub fn relay_list_entries(tags: &[Vec<String>]) -> Vec<(&str, RelayMarker)> {
    tags.iter()
        .filter(|tag| tag.first().map(String::as_str) == Some("r"))
        .filter_map(|tag| {
            let url = tag.get(1)?.as_str();
            let marker = match tag.get(2).map(String::as_str) {
                None | Some("") => RelayMarker::Both,
                Some("read") => RelayMarker::Read,
                Some("write") => RelayMarker::Write,
                Some(_) => RelayMarker::Other,
            };
            Some((url, marker))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tags(raw: &[&[&str]]) -> Vec<Vec<String>> {
        raw.iter()
            .map(|tag| tag.iter().map(|s| s.to_string()).collect())
            .collect()
    }

    #[test]
    fn test_first_value_and_set() {
        let t = tags(&[&["p", "a"], &["p", "b"], &["p", "a"], &["e", "x"]]);
        assert_eq!(first_value(&t, "p"), Some("a"));
        assert_eq!(first_value(&t, "q"), None);
        assert_eq!(value_set(&t, "p").len(), 2);
    }

    #[test]
    fn test_reply_prefers_reply_marker() {
        let t = tags(&[
            &["e", "root", "", "root"],
            &["e", "parent", "", "reply"],
            &["e", "other", "", "mention"],
        ]);
        assert_eq!(reply_target(&t), Some("parent"));
    }

    #[test]
    fn test_reply_falls_back_to_root_marker() {
        let t = tags(&[&["e", "root", "wss://r.example.com", "root"]]);
        assert_eq!(reply_target(&t), Some("root"));
    }

    #[test]
    fn test_reply_positional_uses_last_e_tag() {
        let t = tags(&[&["e", "first"], &["p", "someone"], &["e", "last"]]);
        assert_eq!(reply_target(&t), Some("last"));
    }

    #[test]
    fn test_mentions_are_not_replies() {
        let t = tags(&[&["e", "mentioned", "", "mention"]]);
        assert_eq!(reply_target(&t), None);
    }

    #[test]
    fn test_relay_hints() {
        let t = tags(&[
            &["p", "pk", "wss://a.example.com"],
            &["e", "id", ""],
            &["t", "tag", "wss://ignored.example.com"],
            &["a", "30023:pk:d", "wss://b.example.com"],
        ]);
        let hints: Vec<&str> = relay_hints(&t).collect();
        assert_eq!(hints, vec!["wss://a.example.com", "wss://b.example.com"]);
    }

    #[test]
    fn test_relay_list_markers() {
        let t = tags(&[
            &["r", "wss://both.example.com"],
            &["r", "wss://read.example.com", "read"],
            &["r", "wss://write.example.com", "write"],
            &["r", "wss://odd.example.com", "paid"],
        ]);
        let entries = relay_list_entries(&t);
        assert_eq!(entries[0].1, RelayMarker::Both);
        assert_eq!(entries[1].1, RelayMarker::Read);
        assert_eq!(entries[2].1, RelayMarker::Write);
        assert_eq!(entries[3].1, RelayMarker::Other);
    }
}
