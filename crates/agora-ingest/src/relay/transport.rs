//! Wire transport to upstream relays.
//!
//! The pool never touches websockets directly. [`RelayTransport`] is the
//! seam: [`NostrTransport`] implements it on nostr-sdk's `Client`, and tests
//! substitute a scripted in-memory transport.

use std::collections::HashSet;
use std::time::Duration;

use agora_core::{Event, Filter};
use async_trait::async_trait;
use nostr_sdk::prelude::{Client, ClientOptions, JsonUtil, RelayPoolNotification, RelayPoolOptions};
use tokio::sync::{RwLock, broadcast, mpsc};

use crate::{Error, Result};

/// Outcome of publishing one event to a set of relays.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishReport {
    /// Relays that acknowledged the event.
    pub accepted: Vec<String>,
    /// Relays that rejected the event or could not be reached, with the reason.
    pub failed: Vec<(String, String)>,
}

impl PublishReport {
    pub fn is_empty(&self) -> bool {
        self.accepted.is_empty() && self.failed.is_empty()
    }
}

/// Subscribe, query and publish over the upstream relay protocol.
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Fetch stored events matching `filters` from a single relay.
    async fn fetch(&self, relay: &str, filters: &[Filter], timeout: Duration) -> Result<Vec<Event>>;

    /// Publish `event` to every relay in `relays`.
    async fn publish(&self, relays: &[String], event: &Event) -> Result<PublishReport>;

    /// Open a live subscription; events arrive tagged with the relay they came from.
    async fn subscribe(&self, relays: &[String], filters: &[Filter]) -> Result<mpsc::Receiver<(String, Event)>>;

    /// Close all relay connections.
    async fn disconnect(&self);
}

/// Configuration for [`NostrTransport`].
#[derive(Debug, Clone)]
pub struct TransportConfig {
    /// Size of nostr-sdk's notification broadcast channel.
    pub notification_channel_size: usize,
    /// Buffer of the subscription channel handed to the firehose.
    pub subscription_buffer: usize,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            notification_channel_size: 16384,
            subscription_buffer: 4096,
        }
    }
}

/// [`RelayTransport`] over a nostr-sdk client.
///
/// Relays are added and connected lazily the first time an operation names
/// them; nostr-sdk keeps them connected and reconnects on drop.
pub struct NostrTransport {
    client: Client,
    known_relays: RwLock<HashSet<String>>,
    config: TransportConfig,
}

impl NostrTransport {
    pub fn new(config: TransportConfig) -> Self {
        let pool_opts =
            RelayPoolOptions::default().notification_channel_size(config.notification_channel_size);
        let client = Client::builder()
            .opts(ClientOptions::new().pool(pool_opts))
            .build();

        Self {
            client,
            known_relays: RwLock::new(HashSet::new()),
            config,
        }
    }

    /// Add and connect `url` unless it is already part of the client.
    async fn ensure_relay(&self, url: &str) -> Result<()> {
        if self.known_relays.read().await.contains(url) {
            return Ok(());
        }

        let mut known = self.known_relays.write().await;
        if known.contains(url) {
            return Ok(());
        }
        self.client.add_relay(url).await?;
        self.client.connect_relay(url).await?;
        known.insert(url.to_string());
        tracing::debug!("Connected relay: {}", url);
        Ok(())
    }

    /// Connect every relay in `relays`, returning the ones that succeeded.
    async fn ensure_relays(&self, relays: &[String]) -> (Vec<String>, Vec<(String, String)>) {
        let mut ready = Vec::with_capacity(relays.len());
        let mut failed = Vec::new();
        for url in relays {
            match self.ensure_relay(url).await {
                Ok(()) => ready.push(url.clone()),
                Err(e) => {
                    tracing::warn!("Failed to add relay {}: {}", url, e);
                    failed.push((url.clone(), e.to_string()));
                }
            }
        }
        (ready, failed)
    }
}

#[async_trait]
impl RelayTransport for NostrTransport {
    async fn fetch(&self, relay: &str, filters: &[Filter], timeout: Duration) -> Result<Vec<Event>> {
        self.ensure_relay(relay).await?;

        let mut events = Vec::new();
        for filter in filters {
            let fetched = self
                .client
                .fetch_events_from([relay], to_wire_filter(filter)?, timeout)
                .await?;
            for event in fetched {
                events.push(from_wire_event(&event)?);
            }
        }
        Ok(events)
    }

    async fn publish(&self, relays: &[String], event: &Event) -> Result<PublishReport> {
        let (ready, mut failed) = self.ensure_relays(relays).await;
        if ready.is_empty() {
            return Ok(PublishReport {
                accepted: Vec::new(),
                failed,
            });
        }

        let wire = to_wire_event(event)?;
        let output = self.client.send_event_to(ready, &wire).await?;

        let accepted = output.success.iter().map(|url| url.to_string()).collect();
        failed.extend(
            output
                .failed
                .iter()
                .map(|(url, reason)| (url.to_string(), reason.clone())),
        );

        Ok(PublishReport { accepted, failed })
    }

    async fn subscribe(&self, relays: &[String], filters: &[Filter]) -> Result<mpsc::Receiver<(String, Event)>> {
        let (ready, _) = self.ensure_relays(relays).await;
        if ready.is_empty() {
            return Err(Error::UpstreamUnavailable("no relay could be connected".to_string()));
        }

        // Take the receiver before subscribing so nothing is missed.
        let mut notifications = self.client.notifications();
        for filter in filters {
            let output = self
                .client
                .subscribe_to(ready.clone(), to_wire_filter(filter)?, None)
                .await?;
            tracing::info!("Subscribed with ID: {:?}", output.val);
        }

        let (tx, rx) = mpsc::channel(self.config.subscription_buffer);
        tokio::spawn(async move {
            loop {
                match notifications.recv().await {
                    Ok(RelayPoolNotification::Event { relay_url, event, .. }) => {
                        let event = match from_wire_event(&event) {
                            Ok(event) => event,
                            Err(e) => {
                                tracing::debug!("Dropping malformed event from {}: {}", relay_url, e);
                                continue;
                            }
                        };
                        if tx.send((relay_url.to_string(), event)).await.is_err() {
                            break;
                        }
                    }
                    Ok(_) => {}
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("Subscription lagged, skipped {} notifications", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            tracing::debug!("Subscription forwarder stopped");
        });

        Ok(rx)
    }

    async fn disconnect(&self) {
        self.client.disconnect().await;
    }
}

fn to_wire_filter(filter: &Filter) -> Result<nostr_sdk::Filter> {
    let json = serde_json::to_string(filter).map_err(|e| Error::Conversion(e.to_string()))?;
    nostr_sdk::Filter::from_json(json).map_err(|e| Error::Conversion(e.to_string()))
}

fn to_wire_event(event: &Event) -> Result<nostr_sdk::Event> {
    nostr_sdk::Event::from_json(event.to_json()).map_err(|e| Error::Conversion(e.to_string()))
}

fn from_wire_event(event: &nostr_sdk::Event) -> Result<Event> {
    Ok(Event::from_json(&event.as_json())?)
}

#[cfg(test)]
pub(crate) mod mock {
    //! Scripted in-memory transport.

    use std::collections::HashMap;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use agora_core::filter::matches_any;
    use parking_lot::Mutex;

    use super::*;

    #[derive(Default)]
    pub struct MockTransport {
        events: Mutex<HashMap<String, Vec<Event>>>,
        failing: Mutex<HashSet<String>>,
        published: Mutex<Vec<(String, String)>>,
        subscriber: Mutex<Option<mpsc::Sender<(String, Event)>>>,
        fetches: AtomicUsize,
    }

    impl MockTransport {
        pub fn new() -> Self {
            Self::default()
        }

        /// Events `relay` will answer fetches with.
        pub fn serve(&self, relay: &str, events: Vec<Event>) {
            self.events.lock().entry(relay.to_string()).or_default().extend(events);
        }

        pub fn fail(&self, relay: &str) {
            self.failing.lock().insert(relay.to_string());
        }

        /// Relays that accepted the event with `id`, in publish order.
        pub fn published_to(&self, id: &str) -> Vec<String> {
            self.published
                .lock()
                .iter()
                .filter(|(_, published)| published == id)
                .map(|(relay, _)| relay.clone())
                .collect()
        }

        pub fn fetch_count(&self) -> usize {
            self.fetches.load(Ordering::SeqCst)
        }

        /// Deliver an event on the open subscription.
        pub async fn push(&self, relay: &str, event: Event) {
            let sender = self.subscriber.lock().clone();
            if let Some(sender) = sender {
                let _ = sender.send((relay.to_string(), event)).await;
            }
        }

        /// Close the open subscription.
        pub fn close(&self) {
            self.subscriber.lock().take();
        }
    }

    #[async_trait]
    impl RelayTransport for MockTransport {
        async fn fetch(&self, relay: &str, filters: &[Filter], _timeout: Duration) -> Result<Vec<Event>> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            if self.failing.lock().contains(relay) {
                return Err(Error::UpstreamUnavailable(format!("{relay} is down")));
            }
            Ok(self
                .events
                .lock()
                .get(relay)
                .map(|events| {
                    events
                        .iter()
                        .filter(|event| matches_any(filters, event))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default())
        }

        async fn publish(&self, relays: &[String], event: &Event) -> Result<PublishReport> {
            let failing = self.failing.lock().clone();
            let mut report = PublishReport::default();
            for relay in relays {
                if failing.contains(relay) {
                    report.failed.push((relay.clone(), "connection refused".to_string()));
                } else {
                    self.published.lock().push((relay.clone(), event.id.clone()));
                    report.accepted.push(relay.clone());
                }
            }
            Ok(report)
        }

        async fn subscribe(&self, _relays: &[String], _filters: &[Filter]) -> Result<mpsc::Receiver<(String, Event)>> {
            let (tx, rx) = mpsc::channel(64);
            *self.subscriber.lock() = Some(tx);
            Ok(rx)
        }

        async fn disconnect(&self) {
            self.close();
        }
    }
}
