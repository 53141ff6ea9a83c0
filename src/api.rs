// src/api.rs
//! Thin admin surface over the pipeline's exposed operations: manual
//! refresh, recall queries, the per-recall remedy feed, and failed-alert
//! inspection. Route handling stays glue; everything interesting lives in
//! the pipeline.

use std::collections::HashMap;
use std::sync::Arc;

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use chrono::DateTime;
use tower_http::cors::CorsLayer;

use crate::alerts::{Alert, AlertStatus, AlertStore};
use crate::ingest::types::{RecallKey, Source};
use crate::ingest::{Pipeline, RefreshSummary, SourceHealth};
use crate::store::{Recall, RecallStore, RemedyUpdate};

#[derive(Clone)]
pub struct AppState {
    pub pipeline: Arc<Pipeline>,
    pub store: Arc<RecallStore>,
    pub alerts: Arc<AlertStore>,
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "OK" }))
        .route("/admin/refresh", post(admin_refresh))
        .route("/admin/fetch-all", post(admin_fetch_all))
        .route("/admin/sources", get(admin_sources))
        .route("/admin/alerts", get(admin_alerts))
        .route("/recalls", get(list_recalls))
        .route(
            "/recalls/{source}/{external_id}/remedy-updates",
            get(remedy_updates),
        )
        .layer(CorsLayer::very_permissive())
        .with_state(state)
}

async fn admin_refresh(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Result<Json<RefreshSummary>, (StatusCode, String)> {
    let use_cache = q
        .get("use_cache")
        .map(|v| matches!(v.as_str(), "1" | "true"))
        .unwrap_or(true);
    let policy = if use_cache {
        crate::ingest::types::CachePolicy::LiveThenCache
    } else {
        crate::ingest::types::CachePolicy::LiveOnly
    };
    state
        .pipeline
        .run_refresh(policy)
        .await
        .map(Json)
        .map_err(|e| (StatusCode::CONFLICT, format!("{e:#}")))
}

async fn admin_fetch_all(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Json<Vec<Recall>> {
    let use_cache = q
        .get("use_cache")
        .map(|v| matches!(v.as_str(), "1" | "true"))
        .unwrap_or(true);
    Json(state.pipeline.fetch_all(use_cache).await)
}

async fn admin_sources(
    State(state): State<AppState>,
) -> Json<HashMap<String, SourceHealth>> {
    let out = state
        .pipeline
        .health_snapshot()
        .into_iter()
        .map(|(source, health)| (source.to_string(), health))
        .collect();
    Json(out)
}

async fn admin_alerts(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Alert>>, (StatusCode, String)> {
    let status = match q.get("status").map(String::as_str) {
        None | Some("pending") => AlertStatus::Pending,
        Some("sent") => AlertStatus::Sent,
        Some("failed") => AlertStatus::Failed,
        Some(other) => {
            return Err((
                StatusCode::BAD_REQUEST,
                format!("unknown alert status '{other}'"),
            ))
        }
    };
    Ok(Json(state.alerts.by_status(status)))
}

async fn list_recalls(
    State(state): State<AppState>,
    Query(q): Query<HashMap<String, String>>,
) -> Result<Json<Vec<Recall>>, (StatusCode, String)> {
    match q.get("since") {
        None => Ok(Json(state.store.all())),
        Some(raw) => {
            let since = DateTime::parse_from_rfc3339(raw)
                .map_err(|e| {
                    (
                        StatusCode::BAD_REQUEST,
                        format!("invalid 'since' timestamp: {e}"),
                    )
                })?
                .with_timezone(&chrono::Utc);
            Ok(Json(state.store.inserted_since(since)))
        }
    }
}

async fn remedy_updates(
    State(state): State<AppState>,
    Path((source, external_id)): Path<(String, String)>,
) -> Result<Json<Vec<RemedyUpdate>>, (StatusCode, String)> {
    let Some(source) = Source::parse(&source) else {
        return Err((StatusCode::BAD_REQUEST, format!("unknown source '{source}'")));
    };
    let key = RecallKey::new(source, external_id);
    match state.store.get(&key) {
        Some(recall) => Ok(Json(recall.remedy_updates)),
        None => Err((StatusCode::NOT_FOUND, format!("no recall {key}"))),
    }
}
