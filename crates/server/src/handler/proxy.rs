use crate::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use claudish_core::error::ProxyError;
use serde::Deserialize;
use serde_json::json;
use std::collections::HashMap;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnableBody {
    #[serde(default)]
    pub api_keys: HashMap<String, String>,
}

pub async fn enable(
    State(state): State<AppState>,
    body: Option<axum::Json<EnableBody>>,
) -> Result<impl IntoResponse, ProxyError> {
    let api_keys = body.map(|b| b.0.api_keys).unwrap_or_default();
    let port = state.controller.enable(api_keys).await?;
    Ok(axum::Json(json!({
        "success": true,
        "dispatcherPort": port,
        "pacUrl": "/proxy.pac",
    })))
}

pub async fn disable(State(state): State<AppState>) -> Result<impl IntoResponse, ProxyError> {
    state.controller.disable().await?;
    Ok(axum::Json(json!({"success": true})))
}
