//! HTTP API Layer
//!
//! Read-side surface over the alert store plus source CRUD and the live
//! event stream. Every JSON response uses the same envelope:
//! `{ success, message?, count?, alerts?|alert?|sources?|source?|stats?, error? }`.

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Extension, Path, Query, WebSocketUpgrade,
    },
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast;
use tower_http::cors::CorsLayer;

use crate::events::{BusEvent, EventBus, Topic};
use crate::ingest::scheduler::Scheduler;
use crate::model::{Alert, NewSource, Severity, Source, SourceUpdate};
use crate::stats::{ParserStats, SchedulerStats};
use crate::store::Store;

/// Shared handler state, injected via `Extension`.
pub struct ApiState {
    pub store: Arc<Store>,
    pub scheduler: Arc<Scheduler>,
    pub bus: EventBus,
    pub parser_stats: Arc<ParserStats>,
    pub scheduler_stats: Arc<SchedulerStats>,
}

#[derive(Serialize, Default)]
struct Envelope {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    count: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    alerts: Option<Vec<Alert>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    alert: Option<Alert>,
    #[serde(skip_serializing_if = "Option::is_none")]
    sources: Option<Vec<Source>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    source: Option<Source>,
    #[serde(skip_serializing_if = "Option::is_none")]
    stats: Option<serde_json::Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

type Reply = (StatusCode, Json<Envelope>);

fn ok(envelope: Envelope) -> Reply {
    (
        StatusCode::OK,
        Json(Envelope {
            success: true,
            ..envelope
        }),
    )
}

fn bad_request(msg: impl Into<String>) -> Reply {
    (
        StatusCode::BAD_REQUEST,
        Json(Envelope {
            error: Some(msg.into()),
            ..Default::default()
        }),
    )
}

fn not_found(msg: impl Into<String>) -> Reply {
    (
        StatusCode::NOT_FOUND,
        Json(Envelope {
            error: Some(msg.into()),
            ..Default::default()
        }),
    )
}

fn server_error(e: anyhow::Error) -> Reply {
    tracing::error!(error = %format!("{e:#}"), "request failed");
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(Envelope {
            error: Some(format!("{e:#}")),
            ..Default::default()
        }),
    )
}

/// Build the Router. Layers go last so the router keeps its unit state.
pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/ws", get(ws_upgrade))
        .route("/cap-alerts/active", get(list_active))
        .route("/cap-alerts/stats", get(stats))
        .route("/cap-alerts/fetch", get(fetch_source))
        .route("/cap-alerts/refresh", post(refresh))
        .route("/cap-alerts/area/:lat/:lng", get(by_area))
        .route("/cap-alerts/severity/:level", get(by_severity))
        .route("/cap-alerts/:id", get(get_alert))
        .route("/cap-sources", get(list_sources).post(create_source))
        .route(
            "/cap-sources/:id",
            get(get_source).put(update_source).delete(delete_source),
        )
        .route("/cap-sources/seed", post(seed_sources))
        .layer(CorsLayer::very_permissive())
        .layer(Extension(state))
}

// ---- alerts ----

async fn list_active(Extension(state): Extension<Arc<ApiState>>) -> Reply {
    match state.store.find_active().await {
        Ok(alerts) => ok(Envelope {
            count: Some(alerts.len()),
            alerts: Some(alerts),
            ..Default::default()
        }),
        Err(e) => server_error(e),
    }
}

async fn get_alert(
    Extension(state): Extension<Arc<ApiState>>,
    Path(id): Path<String>,
) -> Reply {
    match state.store.find_by_identifier(&id).await {
        Ok(Some(alert)) => ok(Envelope {
            alert: Some(alert),
            ..Default::default()
        }),
        Ok(None) => not_found(format!("no alert with identifier '{id}'")),
        Err(e) => server_error(e),
    }
}

async fn by_area(
    Extension(state): Extension<Arc<ApiState>>,
    Path((lat, lng)): Path<(String, String)>,
) -> Reply {
    let (Ok(lat), Ok(lng)) = (lat.parse::<f64>(), lng.parse::<f64>()) else {
        return bad_request("lat and lng must be numbers");
    };
    if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
        return bad_request("lat must be in [-90, 90] and lng in [-180, 180]");
    }
    match state.store.find_by_point(lng, lat).await {
        Ok(alerts) => ok(Envelope {
            count: Some(alerts.len()),
            alerts: Some(alerts),
            ..Default::default()
        }),
        Err(e) => server_error(e),
    }
}

async fn by_severity(
    Extension(state): Extension<Arc<ApiState>>,
    Path(level): Path<String>,
) -> Reply {
    let Some(severity) = Severity::parse(&level) else {
        return bad_request(format!(
            "unknown severity '{level}' (expected Extreme, Severe, Moderate, Minor or Unknown)"
        ));
    };
    match state.store.find_by_severity(severity).await {
        Ok(alerts) => ok(Envelope {
            count: Some(alerts.len()),
            alerts: Some(alerts),
            ..Default::default()
        }),
        Err(e) => server_error(e),
    }
}

async fn stats(Extension(state): Extension<Arc<ApiState>>) -> Reply {
    match state.store.count_stats().await {
        Ok(counts) => ok(Envelope {
            stats: Some(json!({
                "alerts": counts,
                "parser": state.parser_stats.snapshot(),
                "scheduler": state.scheduler_stats.snapshot(),
            })),
            ..Default::default()
        }),
        Err(e) => server_error(e),
    }
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct FetchParams {
    source_id: Option<i64>,
}

async fn fetch_source(
    Extension(state): Extension<Arc<ApiState>>,
    Query(params): Query<FetchParams>,
) -> Reply {
    run_refresh(&state, params.source_id).await
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
struct RefreshBody {
    source_id: Option<i64>,
}

async fn refresh(
    Extension(state): Extension<Arc<ApiState>>,
    body: Option<Json<RefreshBody>>,
) -> Reply {
    let source_id = body.and_then(|Json(b)| b.source_id);
    run_refresh(&state, source_id).await
}

/// Shared by `GET /cap-alerts/fetch` and `POST /cap-alerts/refresh`: run the
/// scheduler's own cycle path synchronously and echo the outcomes.
async fn run_refresh(state: &ApiState, source_id: Option<i64>) -> Reply {
    if let Some(id) = source_id {
        match state.store.get_source(id).await {
            Ok(Some(_)) => {}
            Ok(None) => return not_found(format!("no source with id {id}")),
            Err(e) => return server_error(e),
        }
    }
    match state.scheduler.refresh(source_id).await {
        Ok(outcomes) => {
            let cycles = match serde_json::to_value(&outcomes) {
                Ok(v) => v,
                Err(e) => return server_error(e.into()),
            };
            ok(Envelope {
                message: Some(format!("ran {} fetch cycle(s)", outcomes.len())),
                count: Some(outcomes.len()),
                stats: Some(json!({
                    "cycles": cycles,
                    "scheduler": state.scheduler_stats.snapshot(),
                })),
                ..Default::default()
            })
        }
        Err(e) => server_error(e),
    }
}

// ---- sources ----

async fn list_sources(Extension(state): Extension<Arc<ApiState>>) -> Reply {
    match state.store.list_sources().await {
        Ok(sources) => ok(Envelope {
            count: Some(sources.len()),
            sources: Some(sources),
            ..Default::default()
        }),
        Err(e) => server_error(e),
    }
}

async fn get_source(
    Extension(state): Extension<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Reply {
    match state.store.get_source(id).await {
        Ok(Some(source)) => ok(Envelope {
            source: Some(source),
            ..Default::default()
        }),
        Ok(None) => not_found(format!("no source with id {id}")),
        Err(e) => server_error(e),
    }
}

async fn create_source(
    Extension(state): Extension<Arc<ApiState>>,
    Json(new): Json<NewSource>,
) -> Reply {
    match state.store.create_source(new).await {
        Ok(source) => {
            state.bus.publish_source(Topic::SourceNew, &source);
            state.scheduler.update_source(source.id).await;
            ok(Envelope {
                source: Some(source),
                ..Default::default()
            })
        }
        // Conflicts (duplicate name, second default) are caller errors.
        Err(e) => bad_request(format!("{e:#}")),
    }
}

async fn update_source(
    Extension(state): Extension<Arc<ApiState>>,
    Path(id): Path<i64>,
    Json(patch): Json<SourceUpdate>,
) -> Reply {
    match state.store.update_source(id, patch).await {
        Ok(Some(source)) => {
            state.bus.publish_source(Topic::SourceUpdate, &source);
            state.scheduler.update_source(id).await;
            ok(Envelope {
                source: Some(source),
                ..Default::default()
            })
        }
        Ok(None) => not_found(format!("no source with id {id}")),
        Err(e) => bad_request(format!("{e:#}")),
    }
}

async fn delete_source(
    Extension(state): Extension<Arc<ApiState>>,
    Path(id): Path<i64>,
) -> Reply {
    match state.store.delete_source(id).await {
        Ok(Some(source)) => {
            state.scheduler.remove_source_interval(id);
            state.bus.publish_source(Topic::SourceDelete, &source);
            ok(Envelope {
                message: Some(format!("source '{}' deleted; its alerts are kept", source.name)),
                source: Some(source),
                ..Default::default()
            })
        }
        Ok(None) => not_found(format!("no source with id {id}")),
        Err(e) => bad_request(format!("{e:#}")),
    }
}

async fn seed_sources(Extension(state): Extension<Arc<ApiState>>) -> Reply {
    match state.store.seed_default_sources().await {
        Ok(created) => {
            for source in &created {
                state.bus.publish_source(Topic::SourceNew, source);
                state.scheduler.update_source(source.id).await;
            }
            let message = if created.is_empty() {
                "sources already present; nothing seeded".to_string()
            } else {
                format!("seeded {} default source(s)", created.len())
            };
            ok(Envelope {
                message: Some(message),
                count: Some(created.len()),
                sources: Some(created),
                ..Default::default()
            })
        }
        Err(e) => server_error(e),
    }
}

// ---- event stream ----

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    Extension(state): Extension<Arc<ApiState>>,
) -> impl IntoResponse {
    let rx = state.bus.subscribe();
    ws.on_upgrade(move |socket| ws_stream(socket, rx))
}

/// Forward bus events as JSON text frames. A lagging client silently loses
/// the oldest events (the bus buffer is bounded) but keeps receiving.
async fn ws_stream(mut socket: WebSocket, mut rx: broadcast::Receiver<BusEvent>) {
    loop {
        match rx.recv().await {
            Ok(event) => {
                let Ok(text) = serde_json::to_string(&event) else {
                    continue;
                };
                if socket.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            Err(broadcast::error::RecvError::Lagged(missed)) => {
                tracing::debug!(missed, "event subscriber lagged");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}
