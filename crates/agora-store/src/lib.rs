//! Storage and derived views for the Agora gateway.
//!
//! This crate provides:
//! - [`EventStore`]: SQLite event storage with NIP-01 filter queries,
//!   replaceable-event pruning and deletion masking
//! - [`StatsEngine`]: incremental author/event counters with a deduplicating
//!   recompute queue
//! - [`Hydrator`]: batched attachment of profiles, reposts, quotes, stats and
//!   viewer relationships
//! - [`EventCache`]: hot cache → store → coalesced upstream lookup
//!
//! Components are constructed explicitly and passed by handle; nothing here
//! is a process-wide singleton.

pub mod cache;
mod error;
pub mod hydrate;
pub mod schema;
mod sql;
pub mod stats;
pub mod store;

pub use cache::{BatchStatus, CacheConfig, CacheStats, EventCache, RemoteFetcher};
pub use error::{Error, Result};
pub use hydrate::{HydratedEvent, Hydrator, ViewerRelationship};
pub use stats::{AuthorStats, EventStats, StatKey, StatsConfig, StatsEngine};
pub use store::{EventStore, InsertOutcome, QueryOptions, StoreConfig, sort_newest_first};
