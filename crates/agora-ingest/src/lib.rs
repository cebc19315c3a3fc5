//! Relay routing and firehose ingestion for the Agora gateway.
//!
//! This crate provides:
//! - Relay URL normalization and the relay discovery directory
//! - [`RelayPool`]: query fan-out over the write set and outbox-model publish
//!   routing, on top of the [`RelayTransport`] seam (nostr-sdk in production)
//! - [`Firehose`]: hashtag trends, relay discovery and selective persistence
//!   for the upstream subscription
//! - [`GatewayConfig`]: the daemon's named options
//! - [`Gateway`]: every component constructed in startup order, with an
//!   explicit shutdown

pub mod config;
mod db;
mod error;
pub mod gateway;
pub mod pipeline;
pub mod relay;

pub use config::GatewayConfig;
pub use error::{Error, Result};
pub use gateway::{Gateway, ShutdownSummary};
pub use pipeline::{Disposition, Firehose, FirehoseStats, TrendTracker};
pub use relay::{NostrTransport, PoolConfig, PublishReport, RelayDirectory, RelayPool, RelayTransport};
