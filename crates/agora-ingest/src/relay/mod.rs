//! Upstream relay plumbing.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                          RelayPool                              │
//! ├─────────────────────────────────────────────────────────────────┤
//! │  query   → write set (upstream + admin relay list), merged      │
//! │  publish → author's outbox relays (NIP-65), capped              │
//! │  RemoteFetcher for the coalescing cache                         │
//! └──────────────────────────────┬──────────────────────────────────┘
//!                                │ RelayTransport
//!                    ┌───────────┴───────────┐
//!                    │  NostrTransport       │  nostr-sdk Client
//!                    └───────────────────────┘
//! ```
//!
//! The [`RelayDirectory`] records every relay address seen in events, for
//! discovery.

pub mod directory;
pub mod outbox;
pub mod pool;
pub mod transport;
pub mod url;

pub use directory::{DiscoverySource, RelayDirectory, RelayTier};
pub use pool::{PoolConfig, RelayPool};
pub use transport::{NostrTransport, PublishReport, RelayTransport, TransportConfig};
