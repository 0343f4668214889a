use crate::AppState;
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use claudish_core::error::ProxyError;
use serde::Deserialize;
use serde_json::json;

#[derive(Debug, Default, Deserialize)]
pub struct LogQuery {
    pub limit: Option<usize>,
    pub offset: Option<usize>,
    pub filter: Option<String>,
    pub since: Option<i64>,
}

pub async fn query_logs(
    State(state): State<AppState>,
    Query(query): Query<LogQuery>,
) -> impl IntoResponse {
    let core = state.controller.core();
    let limit = query.limit.unwrap_or(100).clamp(1, 1000);
    let entries = core.logs.query(
        limit,
        query.offset.unwrap_or(0),
        query.filter.as_deref(),
        query.since,
    );
    axum::Json(json!({"entries": entries, "total": core.logs.len()}))
}

pub async fn clear_logs(State(state): State<AppState>) -> impl IntoResponse {
    state.controller.core().logs.clear();
    axum::Json(json!({"success": true}))
}

#[derive(Debug, Default, Deserialize)]
pub struct TrafficQuery {
    pub limit: Option<usize>,
}

pub async fn query_traffic(
    State(state): State<AppState>,
    Query(query): Query<TrafficQuery>,
) -> impl IntoResponse {
    let core = state.controller.core();
    let limit = query.limit.unwrap_or(100).clamp(1, 500);
    axum::Json(json!({
        "entries": core.traffic.recent(limit),
        "total": core.traffic.len(),
    }))
}

pub async fn clear_traffic(State(state): State<AppState>) -> impl IntoResponse {
    state.controller.core().traffic.clear();
    axum::Json(json!({"success": true}))
}

#[derive(Debug, Deserialize)]
pub struct DebugBody {
    pub enabled: bool,
}

pub async fn set_debug(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<DebugBody>,
) -> Result<impl IntoResponse, ProxyError> {
    let core = state.controller.core();
    let path = core
        .logs
        .set_debug_file(body.enabled)
        .map_err(|e| ProxyError::Internal(format!("debug log file: {e}")))?;
    Ok(axum::Json(json!({
        "success": true,
        "enabled": body.enabled,
        "file": path.map(|p| p.display().to_string()),
    })))
}
