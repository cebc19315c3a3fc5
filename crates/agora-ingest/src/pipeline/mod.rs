//! Ingestion pipeline.
//!
//! ```text
//! [RelayTransport::subscribe] → [Firehose] ─┬→ TrendTracker   (hashtags)
//!                                           ├→ RelayDirectory (discovery)
//!                                           └→ StatsEngine    (local graph only)
//! ```

mod firehose;
pub mod trends;

pub use firehose::{Disposition, Firehose, FirehoseStats};
pub use trends::{TrendTracker, TrendingTag};
