//! # CAP Relay — Binary Entrypoint
//! Boots the pipeline: store, parser, scheduler, event bus, and the Axum
//! HTTP server. Everything is constructed here with explicit dependencies;
//! there are no module-level singletons.
//!
//! ## Endpoints
//! - `GET /health` — liveness check
//! - `GET /cap-alerts/*` — active list, by-id, by-point, by-severity, stats
//! - `POST /cap-alerts/refresh` — synchronous fetch cycle
//! - `GET|POST|PUT|DELETE /cap-sources[...]` — source CRUD + seed
//! - `GET /ws` — live lifecycle event stream
//! - `GET /metrics` — Prometheus exposition

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing_subscriber::EnvFilter;

use cap_relay::api::{self, ApiState};
use cap_relay::config::AppConfig;
use cap_relay::events::EventBus;
use cap_relay::ingest::parser::{CapParser, ParserCfg};
use cap_relay::ingest::scheduler::{Scheduler, SchedulerCfg};
use cap_relay::metrics::Metrics;
use cap_relay::stats::{ParserStats, SchedulerStats};
use cap_relay::store::Store;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cfg = AppConfig::from_env();
    tracing::info!(db = %cfg.db_uri, port = cfg.http_port, "starting cap-relay");

    let store = Arc::new(Store::open(&cfg.db_uri).await?);
    let metrics = Metrics::init(cfg.cache_ttl_secs);
    let bus = EventBus::new(cfg.event_buffer);
    let parser_stats = Arc::new(ParserStats::default());
    let scheduler_stats = Arc::new(SchedulerStats::default());

    let parser = Arc::new(CapParser::new(
        ParserCfg {
            max_items: cfg.max_items_per_cycle,
            detail_spacing: Duration::from_millis(cfg.detail_spacing_ms),
            cache_ttl: Duration::from_secs(cfg.cache_ttl_secs),
        },
        Arc::clone(&parser_stats),
    )?);

    let scheduler = Arc::new(Scheduler::new(
        Arc::clone(&store),
        parser,
        bus.clone(),
        Arc::clone(&scheduler_stats),
        SchedulerCfg {
            janitor_interval: Duration::from_secs(cfg.janitor_interval_secs),
            retention: chrono::Duration::days(cfg.retention_days),
        },
    ));
    scheduler.start().await?;

    let state = Arc::new(ApiState {
        store,
        scheduler: Arc::clone(&scheduler),
        bus,
        parser_stats,
        scheduler_stats,
    });
    let app = api::router(state).merge(metrics.router());

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", cfg.http_port))
        .await
        .with_context(|| format!("binding port {}", cfg.http_port))?;
    tracing::info!(port = cfg.http_port, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server")?;

    // Let in-flight cycles drain before exiting.
    scheduler.stop().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "ctrl-c handler failed");
    }
}
