//! Prometheus surface.
//!
//! Installs the global recorder once at startup, registers help text for
//! every series the pipeline emits (the increment sites live in `stats.rs`
//! and `events.rs`), and serves the exposition format on `/metrics`.

use axum::{routing::get, Extension, Router};
use metrics::{describe_counter, describe_gauge, gauge};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    pub fn init(cache_ttl_secs: u64) -> Self {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .expect("prometheus: install recorder");

        describe_series();
        // Static gauge; the cache TTL is fixed for the process lifetime.
        gauge!("cap_response_cache_ttl_secs").set(cache_ttl_secs as f64);

        Self { handle }
    }

    /// Router serving `/metrics`; merged into the API router in `main`.
    pub fn router(&self) -> Router {
        Router::new()
            .route("/metrics", get(render))
            .layer(Extension(self.handle.clone()))
    }
}

async fn render(Extension(handle): Extension<PrometheusHandle>) -> String {
    handle.render()
}

/// One-time registration so every series shows up on `/metrics` with help
/// text even before its first increment.
fn describe_series() {
    describe_counter!(
        "cap_parser_requests_total",
        "HTTP fetches attempted by the CAP parser."
    );
    describe_counter!(
        "cap_parser_successes_total",
        "Fetches that produced a canonical alert."
    );
    describe_counter!(
        "cap_parser_failures_total",
        "Fetches that failed or were dropped."
    );
    describe_counter!(
        "cap_parser_cache_hits_total",
        "Detail fetches served from the response cache."
    );
    describe_counter!(
        "cap_parser_html_fallbacks_total",
        "404 responses routed through the HTML fallback."
    );
    describe_counter!(
        "cap_parser_parse_failures_total",
        "Documents dropped as undecodable XML."
    );
    describe_counter!(
        "cap_scheduler_cycles_total",
        "Fetch cycles run, labeled by outcome."
    );
    describe_counter!("cap_alerts_new_total", "Alerts observed for the first time.");
    describe_counter!(
        "cap_alerts_updated_total",
        "Alerts rewritten after republication."
    );
    describe_counter!(
        "cap_alerts_expired_total",
        "Active bits flipped off by the writer or the janitor."
    );
    describe_counter!(
        "cap_alerts_cleaned_total",
        "Alerts purged past the retention horizon."
    );
    describe_counter!(
        "bus_events_total",
        "Lifecycle events published on the bus, labeled by topic."
    );
    describe_gauge!(
        "cap_response_cache_ttl_secs",
        "TTL of the per-identifier detail response cache."
    );
}
