//! Core types, validation, and shared utilities for the Agora gateway.
//!
//! This crate provides:
//! - The immutable [`Event`] record and its kind classes
//! - [`Filter`] query descriptors with in-memory matching
//! - Tag helpers (reply/quote targets, relay hints)
//! - Structural validation of events and filters
//! - Prometheus metrics helpers
//! - Shared error types
//!
//! Cryptographic verification of ids and signatures is not done here; it is
//! the job of the signer/verifier that sits in front of the core.

mod error;
pub mod event;
pub mod filter;
pub mod metrics;
pub mod tags;
#[cfg(any(test, feature = "testing"))]
pub mod testing;

// ═══════════════════════════════════════════════════════════════════════════
// Constants
// ═══════════════════════════════════════════════════════════════════════════

/// Nostr genesis date: November 7, 2020.
/// Events with `created_at` before this date are considered bogus.
pub const NOSTR_GENESIS_TIMESTAMP: u64 = 1604707200; // 2020-11-07 00:00:00 UTC

/// How far into the future an event's `created_at` may be before it is rejected.
pub const MAX_FUTURE_DRIFT_SECS: u64 = 15 * 60;

pub use error::{Error, Result};
pub use event::{Event, KindClass, kind};
pub use filter::Filter;
