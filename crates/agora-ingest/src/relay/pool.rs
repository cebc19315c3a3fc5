//! Relay pool: query fan-out and outbox publish routing.
//!
//! Queries go to the write set (configured upstream relays plus the admin's
//! own relay list) and are merged by event id. Publishes go to the author's
//! own outbox relays. A relay that errors or times out is skipped; an
//! operation only fails, softly, when every targeted relay failed.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use agora_core::filter::matches_any;
use agora_core::{Event, Filter, kind};
use agora_store::{EventStore, RemoteFetcher, sort_newest_first};
use async_trait::async_trait;
use futures::future::join_all;
use metrics::counter;

use super::outbox::{DEFAULT_OUTBOX_MAX_RELAYS, outbox_relays, write_set};
use super::transport::{PublishReport, RelayTransport};
use crate::{Error, Result};

/// Configuration for the relay pool.
#[derive(Debug, Clone)]
pub struct PoolConfig {
    /// Upstream relays queried for every fetch.
    pub upstream_relays: Vec<String>,
    /// This gateway's own relay address; never queried or published to.
    pub local_relay: Option<String>,
    /// Pubkey whose relay list extends the write set.
    pub admin_pubkey: Option<String>,
    /// Maximum number of outbox relays per publish.
    pub outbox_max_relays: usize,
    /// Per-relay timeout for queries and publishes.
    pub relay_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            upstream_relays: Vec::new(),
            local_relay: None,
            admin_pubkey: None,
            outbox_max_relays: DEFAULT_OUTBOX_MAX_RELAYS,
            relay_timeout: Duration::from_secs(5),
        }
    }
}

/// Routes queries and publishes across upstream relays.
pub struct RelayPool {
    transport: Arc<dyn RelayTransport>,
    store: EventStore,
    config: PoolConfig,
}

impl RelayPool {
    pub fn new(transport: Arc<dyn RelayTransport>, store: EventStore, config: PoolConfig) -> Self {
        Self {
            transport,
            store,
            config,
        }
    }

    pub fn transport(&self) -> &Arc<dyn RelayTransport> {
        &self.transport
    }

    /// Current query targets.
    pub async fn write_set(&self) -> Result<Vec<String>> {
        let admin_list = match &self.config.admin_pubkey {
            Some(admin) => self.store.replaceable(kind::RELAY_LIST, admin).await?,
            None => None,
        };
        Ok(write_set(
            &self.config.upstream_relays,
            admin_list.as_ref(),
            self.config.local_relay.as_deref(),
        ))
    }

    /// Outbox relays for events by `pubkey`, from their stored relay list.
    pub async fn outbox_for(&self, pubkey: &str) -> Result<Vec<String>> {
        let list = self.store.replaceable(kind::RELAY_LIST, pubkey).await?;
        Ok(list
            .map(|list| {
                outbox_relays(
                    &list,
                    self.config.local_relay.as_deref(),
                    self.config.outbox_max_relays,
                )
            })
            .unwrap_or_default())
    }

    /// Broadcast `filters` to the write set and merge the answers.
    ///
    /// Results are deduplicated by id, re-checked against `filters` and
    /// returned newest first.
    pub async fn query(&self, filters: &[Filter]) -> Result<Vec<Event>> {
        for filter in filters {
            filter.validate()?;
        }

        let targets = self.write_set().await?;
        if targets.is_empty() {
            return Err(Error::UpstreamUnavailable("no upstream relays configured".to_string()));
        }

        let timeout = self.config.relay_timeout;
        let answers = join_all(targets.iter().map(|relay| async move {
            let answer = tokio::time::timeout(timeout, self.transport.fetch(relay, filters, timeout)).await;
            (relay, answer)
        }))
        .await;

        let mut seen = HashSet::new();
        let mut merged = Vec::new();
        let mut failures = 0;

        for (relay, answer) in answers {
            let events = match answer {
                Ok(Ok(events)) => events,
                Ok(Err(e)) => {
                    relay_failed("query", relay, &e.to_string());
                    failures += 1;
                    continue;
                }
                Err(_) => {
                    relay_failed("query", relay, "timed out");
                    failures += 1;
                    continue;
                }
            };

            for event in events {
                if event.validate_now().is_err() || !matches_any(filters, &event) {
                    tracing::debug!(id = %event.id, relay = %relay, "Discarding unrequested or malformed event");
                    continue;
                }
                if seen.insert(event.id.clone()) {
                    merged.push(event);
                }
            }
        }

        if failures == targets.len() {
            return Err(Error::UpstreamUnavailable(format!("all {} relays failed the query", failures)));
        }

        sort_newest_first(&mut merged);
        apply_limits(filters, &mut merged);
        Ok(merged)
    }

    /// Publish a pre-signed event to its author's outbox relays.
    pub async fn publish(&self, event: &Event) -> Result<PublishReport> {
        event.validate_now()?;

        let targets = self.outbox_for(&event.pubkey).await?;
        if targets.is_empty() {
            return Err(Error::UpstreamUnavailable(format!(
                "no outbox relays known for {}",
                event.pubkey
            )));
        }

        let report = match tokio::time::timeout(
            self.config.relay_timeout,
            self.transport.publish(&targets, event),
        )
        .await
        {
            Ok(Ok(report)) => report,
            Ok(Err(e)) => {
                for relay in &targets {
                    relay_failed("publish", relay, &e.to_string());
                }
                return Err(Error::UpstreamUnavailable(e.to_string()));
            }
            Err(_) => {
                for relay in &targets {
                    relay_failed("publish", relay, "timed out");
                }
                return Err(Error::UpstreamUnavailable("publish timed out".to_string()));
            }
        };

        for (relay, reason) in &report.failed {
            relay_failed("publish", relay, reason);
        }

        if report.accepted.is_empty() {
            return Err(Error::UpstreamUnavailable(format!(
                "all {} outbox relays rejected {}",
                targets.len(),
                event.id
            )));
        }

        tracing::debug!(
            id = %event.id,
            accepted = report.accepted.len(),
            failed = report.failed.len(),
            "Published event"
        );
        Ok(report)
    }
}

/// Keep the newest `limit` events of each filter. `events` must already be
/// sorted newest first; an event survives if any filter still had room.
fn apply_limits(filters: &[Filter], events: &mut Vec<Event>) {
    let mut taken = vec![0usize; filters.len()];
    events.retain(|event| {
        let mut keep = false;
        for (filter, taken) in filters.iter().zip(taken.iter_mut()) {
            if filter.matches(event) {
                keep |= filter.limit.is_none_or(|limit| *taken < limit);
                *taken += 1;
            }
        }
        keep
    });
}

fn relay_failed(operation: &'static str, relay: &str, reason: &str) {
    tracing::warn!(relay = %relay, "Relay {} failed: {}", operation, reason);
    counter!("pool_relay_failures_total", "operation" => operation).increment(1);
}

#[async_trait]
impl RemoteFetcher for RelayPool {
    async fn fetch_ids(&self, ids: &[String]) -> agora_store::Result<Vec<Event>> {
        let filter = Filter::new().ids(ids.iter().cloned()).limit(ids.len());
        Ok(self.query(&[filter]).await?)
    }
}
