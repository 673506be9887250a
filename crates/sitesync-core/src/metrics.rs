//! Prometheus metrics helpers for the sitesync daemon.
//!
//! # Usage
//!
//! ```rust,ignore
//! use sitesync_core::metrics::{init_metrics, start_metrics_server};
//!
//! #[tokio::main]
//! async fn main() {
//!     let handle = init_metrics();
//!     start_metrics_server(9090, handle).await.unwrap();
//!
//!     use metrics::counter;
//!     counter!("watch_cycles_total").increment(1);
//! }
//! ```
//!
//! # Metric Naming Conventions
//!
//! - Prefix: loop or component (`watch_`, `relay_`, `queue_`, `render_`)
//! - Suffix: unit or type (`_total`, `_seconds`)
//! - Labels: only low-cardinality outcomes, never relay URLs or domains

use axum::{Router, routing::get};
use metrics::{describe_counter, describe_gauge, describe_histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::net::SocketAddr;

/// Initialize the Prometheus metrics recorder.
///
/// # Panics
///
/// Panics if called more than once (the recorder can only be installed once).
pub fn init_metrics() -> PrometheusHandle {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("Failed to install Prometheus recorder");

    register_common_metrics();

    handle
}

/// Like [`init_metrics`] but returns `None` if a recorder is already installed.
pub fn try_init_metrics() -> Option<PrometheusHandle> {
    let handle = PrometheusBuilder::new().install_recorder().ok()?;
    register_common_metrics();
    Some(handle)
}

/// Start the Prometheus metrics HTTP server on `port`, serving `/metrics`.
///
/// The listener is bound before returning so bind errors surface to the
/// caller; serving happens on a background task.
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

/// Register descriptions for the metrics emitted by the watcher and scheduler.
fn register_common_metrics() {
    // =========================================================================
    // Change Watcher
    // =========================================================================

    describe_counter!("watch_cycles_total", "Completed watch cycles");
    describe_counter!("watch_cycle_errors_total", "Watch cycles aborted by an error");
    describe_histogram!("watch_cycle_duration_seconds", "Wall-clock time of a watch cycle");
    describe_counter!(
        "watch_site_events_total",
        "Site configuration events received from the registry relays"
    );
    describe_counter!(
        "watch_full_rebuilds_marked_total",
        "Times a domain's updated watermark was bumped (label: reason)"
    );
    describe_counter!(
        "watch_events_skipped_total",
        "Fetched events dropped before queueing (label: reason)"
    );
    describe_gauge!("watch_authors", "Contributors tracked in the author index");
    describe_gauge!("watch_sites_indexed", "Deployed sites with an indexed snapshot");

    // =========================================================================
    // Relay Fetch Engine
    // =========================================================================

    describe_counter!(
        "relay_scans_total",
        "Per-relay scans by outcome (label: outcome)"
    );
    describe_counter!("relay_events_fetched_total", "Events returned by relay scans");
    describe_counter!("relay_pages_total", "Paginated relay queries issued");
    describe_gauge!("relay_targets", "Relays in the current fan-out plan");
    describe_counter!(
        "relay_outbox_lookups_total",
        "Authors resolved through outbox discovery (label: source)"
    );

    // =========================================================================
    // Event queue and rendering
    // =========================================================================

    describe_counter!("queue_enqueued_total", "Incremental items appended to the queue");
    describe_counter!("queue_deleted_total", "Queue rows removed after rendering");
    describe_counter!(
        "render_total",
        "Render attempts (labels: kind=incremental|full, outcome=ok|error)"
    );
    describe_histogram!("render_duration_seconds", "Time spent in render+publish");
    describe_counter!("render_idle_total", "Scheduler iterations with no work");
}

// =============================================================================
// Metric Recording Helpers
// =============================================================================

/// Increment a counter.
pub fn increment(name: &'static str, value: u64) {
    metrics::counter!(name).increment(value);
}

/// Increment a counter carrying a single label.
pub fn increment_labeled(name: &'static str, key: &'static str, label: &'static str, value: u64) {
    metrics::counter!(name, key => label).increment(value);
}

/// Set a gauge value.
pub fn set_gauge(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}

/// Record a duration into a histogram, in seconds.
pub fn record_duration(name: &'static str, duration: std::time::Duration) {
    metrics::histogram!(name).record(duration.as_secs_f64());
}

/// Count one render attempt by scope and outcome.
pub fn increment_render(kind: &'static str, outcome: &'static str) {
    metrics::counter!("render_total", "kind" => kind, "outcome" => outcome).increment(1);
}
