//! Prometheus metrics helpers for the Agora gateway.
//!
//! # Usage
//!
//! ```rust,ignore
//! use agora_core::metrics::{init_metrics, start_metrics_server};
//!
//! let handle = init_metrics();
//! start_metrics_server(9090, handle).await?;
//!
//! metrics::counter!("store_events_inserted_total").increment(1);
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: component name (`store_`, `stats_`, `cache_`, `pool_`, `firehose_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: sparingly, low cardinality only

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// Returns `None` if a recorder is already installed (e.g. in tests).
pub fn init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server on `0.0.0.0:port`.
///
/// Binds synchronously so address errors surface to the caller, then serves
/// `/metrics` from a background task.
pub async fn start_metrics_server(
    port: u16,
    handle: PrometheusHandle,
) -> Result<(), std::io::Error> {
    let app = Router::new().route(
        "/metrics",
        get(move || {
            let handle = handle.clone();
            async move { handle.render() }
        }),
    );

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!("Metrics server listening on http://{}/metrics", addr);

    tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!("Metrics server stopped: {}", e);
        }
    });

    Ok(())
}

/// Register descriptions for the metrics recorded across the gateway.
fn register_common_metrics() {
    // =========================================================================
    // Event Store
    // =========================================================================

    describe_counter!(
        "store_events_inserted_total",
        "Events newly written to the event store"
    );
    describe_counter!(
        "store_events_duplicate_total",
        "Inserts skipped because the event id was already stored"
    );
    describe_counter!(
        "store_query_timeouts_total",
        "Store operations that exceeded their timeout"
    );

    // =========================================================================
    // Stats Engine
    // =========================================================================

    describe_counter!(
        "stats_diffs_applied_total",
        "Counter diffs applied to author/event stats"
    );
    describe_counter!(
        "stats_recompute_total",
        "Full stats recomputes completed"
    );
    describe_counter!(
        "stats_recompute_dropped_total",
        "Recompute requests dropped because the queue was full"
    );

    // =========================================================================
    // Cache
    // =========================================================================

    describe_counter!("cache_hits_total", "Event lookups resolved, labelled by tier");
    describe_counter!(
        "cache_batches_flushed_total",
        "Coalesced upstream fetch batches flushed"
    );

    // =========================================================================
    // Relay pool / firehose
    // =========================================================================

    describe_counter!(
        "pool_relay_failures_total",
        "Per-relay failures during queries and publishes"
    );
    describe_counter!(
        "firehose_events_total",
        "Events processed by the firehose, labelled by disposition"
    );
    describe_gauge!("firehose_running", "1 while the firehose loop is running");
    describe_gauge!("gateway_running", "1 while the gateway daemon is running");
}
