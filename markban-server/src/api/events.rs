use axum::{
    extract::{Path, Query, State},
    response::Json,
};
use serde::Deserialize;

use super::{check_segments, storage_error, ApiError};
use crate::state::AppState;

#[derive(Deserialize)]
pub struct HistoryQuery {
    limit: Option<usize>,
}

pub async fn status(State(state): State<AppState>) -> Json<serde_json::Value> {
    let port = state.live_port.lock().map(|p| *p).unwrap_or_default();
    Json(serde_json::json!({
        "status": "running",
        "port": port,
        "bind_address": state.bind_address,
        "workspace": state.store.root(),
        "clients": state.broadcaster.client_count(),
    }))
}

pub async fn history(
    State(state): State<AppState>,
    Path(project): Path<String>,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<serde_json::Value>, ApiError> {
    check_segments("markban.api.history", &[&project])?;
    state
        .store
        .get_project(&project)
        .await
        .map_err(|e| storage_error("markban.api.history", e))?;
    let entries = state.history.entries(&project, query.limit).await;
    Ok(Json(serde_json::json!({ "entries": entries })))
}
