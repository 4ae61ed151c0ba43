use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::get;
use axum::{Json, Router};
use dbsentinel_core::StatusRecord;
use dbsentinel_storage::StateStore;
use serde::{Deserialize, Serialize};
use tracing::error;

const DEFAULT_HISTORY_LIMIT: usize = 50;
const MAX_HISTORY_LIMIT: usize = 1000;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn StateStore>,
}

/// Read-only view of the audit log.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/api/v1/healthz", get(healthz))
        .route("/api/v1/status", get(latest_status))
        .route("/api/v1/history", get(history))
        .with_state(state)
}

#[derive(Debug, Serialize)]
struct HealthzResponse {
    status: &'static str,
}

async fn healthz() -> Json<HealthzResponse> {
    Json(HealthzResponse { status: "ok" })
}

async fn latest_status(State(state): State<AppState>) -> Result<Json<StatusRecord>, StatusCode> {
    state
        .store
        .latest()
        .await
        .map_err(internal)?
        .map(Json)
        .ok_or(StatusCode::NOT_FOUND)
}

#[derive(Debug, Deserialize)]
struct HistoryParams {
    limit: Option<usize>,
}

async fn history(
    State(state): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Result<Json<Vec<StatusRecord>>, StatusCode> {
    let limit = params
        .limit
        .unwrap_or(DEFAULT_HISTORY_LIMIT)
        .min(MAX_HISTORY_LIMIT);
    let records = state.store.history(limit).await.map_err(internal)?;
    Ok(Json(records))
}

fn internal(e: anyhow::Error) -> StatusCode {
    error!(error = %format!("{e:#}"), "status query failed");
    StatusCode::INTERNAL_SERVER_ERROR
}
