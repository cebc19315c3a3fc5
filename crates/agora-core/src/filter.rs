//! Declarative query descriptors.
//!
//! A [`Filter`] is the NIP-01 `REQ` filter: every present field must match
//! (AND), while a list of filters matches an event if any one filter does (OR).
//! Tag constraints test membership against *all* values of that tag name.

use std::collections::{BTreeMap, BTreeSet};

use serde::de::{Deserializer, MapAccess, Visitor};
use serde::ser::{SerializeMap, Serializer};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::event::{Event, validate_hex};

/// A query descriptor over event fields and tags.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Filter {
    pub ids: Option<BTreeSet<String>>,
    pub authors: Option<BTreeSet<String>>,
    pub kinds: Option<BTreeSet<u16>>,
    /// Tag constraints keyed by single-letter tag name (without the `#`).
    pub tags: BTreeMap<String, BTreeSet<String>>,
    pub since: Option<u64>,
    pub until: Option<u64>,
    pub limit: Option<usize>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ids<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.ids = Some(ids.into_iter().map(Into::into).collect());
        self
    }

    pub fn authors<I, S>(mut self, authors: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.authors = Some(authors.into_iter().map(Into::into).collect());
        self
    }

    pub fn kinds<I: IntoIterator<Item = u16>>(mut self, kinds: I) -> Self {
        self.kinds = Some(kinds.into_iter().collect());
        self
    }

    pub fn kind(self, kind: u16) -> Self {
        self.kinds([kind])
    }

    /// Add a tag constraint, e.g. `tag("p", [pubkey])` for `#p`.
    pub fn tag<I, S>(mut self, name: &str, values: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.tags
            .entry(name.to_string())
            .or_default()
            .extend(values.into_iter().map(Into::into));
        self
    }

    pub fn since(mut self, since: u64) -> Self {
        self.since = Some(since);
        self
    }

    pub fn until(mut self, until: u64) -> Self {
        self.until = Some(until);
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// True when the filter can never match (an explicitly empty set, a
    /// zero limit, or an inverted time range).
    pub fn is_void(&self) -> bool {
        self.ids.as_ref().is_some_and(BTreeSet::is_empty)
            || self.authors.as_ref().is_some_and(BTreeSet::is_empty)
            || self.kinds.as_ref().is_some_and(BTreeSet::is_empty)
            || self.tags.values().any(BTreeSet::is_empty)
            || self.limit == Some(0)
            || matches!((self.since, self.until), (Some(s), Some(u)) if s > u)
    }

    /// Reject malformed filters before they reach the store.
    pub fn validate(&self) -> Result<()> {
        for id in self.ids.iter().flatten() {
            validate_hex(id, 64, "ids")?;
        }
        for author in self.authors.iter().flatten() {
            validate_hex(author, 64, "authors")?;
        }
        for name in self.tags.keys() {
            let mut chars = name.chars();
            match (chars.next(), chars.next()) {
                (Some(c), None) if c.is_ascii_alphabetic() => {}
                _ => {
                    return Err(Error::field(
                        "tags",
                        format!("tag filter '#{}' is not a single letter", name),
                    ));
                }
            }
        }
        if let (Some(since), Some(until)) = (self.since, self.until)
            && since > until
        {
            return Err(Error::field(
                "since",
                format!("since {} is after until {}", since, until),
            ));
        }
        Ok(())
    }

    /// Evaluate the filter against an event in memory.
    ///
    /// `limit` is a result-set bound, not a per-event predicate, and is ignored.
    pub fn matches(&self, event: &Event) -> bool {
        if self.ids.as_ref().is_some_and(|ids| !ids.contains(&event.id)) {
            return false;
        }
        if self
            .authors
            .as_ref()
            .is_some_and(|authors| !authors.contains(&event.pubkey))
        {
            return false;
        }
        if self
            .kinds
            .as_ref()
            .is_some_and(|kinds| !kinds.contains(&event.kind))
        {
            return false;
        }
        if self.since.is_some_and(|since| event.created_at < since) {
            return false;
        }
        if self.until.is_some_and(|until| event.created_at > until) {
            return false;
        }
        self.tags.iter().all(|(name, values)| {
            event.tags.iter().any(|tag| {
                tag.first() == Some(name) && tag.get(1).is_some_and(|value| values.contains(value))
            })
        })
    }
}

/// True if any filter in the list matches the event.
pub fn matches_any(filters: &[Filter], event: &Event) -> bool {
    filters.iter().any(|filter| filter.matches(event))
}

// ═══════════════════════════════════════════════════════════════════════════
// NIP-01 JSON shape
// ═══════════════════════════════════════════════════════════════════════════

impl Serialize for Filter {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(None)?;
        if let Some(ids) = &self.ids {
            map.serialize_entry("ids", ids)?;
        }
        if let Some(authors) = &self.authors {
            map.serialize_entry("authors", authors)?;
        }
        if let Some(kinds) = &self.kinds {
            map.serialize_entry("kinds", kinds)?;
        }
        for (name, values) in &self.tags {
            map.serialize_entry(&format!("#{}", name), values)?;
        }
        if let Some(since) = self.since {
            map.serialize_entry("since", &since)?;
        }
        if let Some(until) = self.until {
            map.serialize_entry("until", &until)?;
        }
        if let Some(limit) = self.limit {
            map.serialize_entry("limit", &limit)?;
        }
        map.end()
    }
}

impl<'de> Deserialize<'de> for Filter {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        struct FilterVisitor;

        impl<'de> Visitor<'de> for FilterVisitor {
            type Value = Filter;

            fn expecting(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
                f.write_str("a NIP-01 filter object")
            }

            fn visit_map<A: MapAccess<'de>>(self, mut access: A) -> std::result::Result<Filter, A::Error> {
                let mut filter = Filter::default();
                while let Some(key) = access.next_key::<String>()? {
                    match key.as_str() {
                        "ids" => filter.ids = Some(access.next_value()?),
                        "authors" => filter.authors = Some(access.next_value()?),
                        "kinds" => filter.kinds = Some(access.next_value()?),
                        "since" => filter.since = access.next_value()?,
                        "until" => filter.until = access.next_value()?,
                        "limit" => filter.limit = access.next_value()?,
                        tag if tag.starts_with('#') => {
                            let values: BTreeSet<String> = access.next_value()?;
                            filter.tags.insert(tag[1..].to_string(), values);
                        }
                        _ => {
                            let _: serde_json::Value = access.next_value()?;
                        }
                    }
                }
                Ok(filter)
            }
        }

        deserializer.deserialize_map(FilterVisitor)
    }
}
