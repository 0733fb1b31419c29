//! HTTP request handlers.

use super::AppState;

use axum::{
    extract::State,
    http::{header, StatusCode},
    response::{IntoResponse, Json},
};
use serde::Serialize;
use std::collections::BTreeMap;

pub async fn handle_metrics(State(state): State<AppState>) -> impl IntoResponse {
    match state.exporter.encode() {
        Ok(body) => ([(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)], body).into_response(),
        Err(e) => {
            tracing::error!("Failed to encode metrics: {}", e);
            (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
        }
    }
}

/// One active target as listed by `/api/targets`.
#[derive(Debug, Serialize)]
pub struct TargetInfo {
    pub target: String,
    pub interval_ms: u64,
    pub count: i64,
    pub namespace: Option<String>,
    pub labels: BTreeMap<String, String>,
    pub alive: bool,
}

pub async fn handle_get_targets(State(state): State<AppState>) -> impl IntoResponse {
    let mut targets = Vec::new();
    for identity in state.registry.snapshot().await {
        // Withdrawn between snapshot and lookup.
        let Some(handle) = state.registry.get(&identity).await else {
            continue;
        };
        let config = handle.config();
        targets.push(TargetInfo {
            target: identity,
            interval_ms: config.interval.as_millis() as u64,
            count: config.count,
            namespace: config.namespace.clone(),
            labels: config.labels.clone(),
            alive: handle.is_alive(),
        });
    }
    Json(targets)
}
