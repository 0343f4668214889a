use crate::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use claudish_core::config::intercept_hosts;
use claudish_core::error::ProxyError;
use serde_json::json;

pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let core = state.controller.core();
    let routing = core.config.snapshot();
    axum::Json(json!({
        "enabled": state.controller.is_enabled().await,
        "dispatcherPort": state.controller.dispatcher_port().await,
        "uptime": state.start_time.elapsed().as_secs(),
        "routing": {
            "enabled": routing.enabled,
            "mappings": routing.model_map.len(),
        },
        "currentModel": core.tracker.current_model(),
        "trafficEntries": core.traffic.len(),
        "logEntries": core.logs.len(),
        "debugLogging": core.logs.debug_enabled(),
        "usage": core.usage.totals(),
        "interceptHosts": intercept_hosts(),
    }))
}

pub async fn get_config(State(state): State<AppState>) -> impl IntoResponse {
    let settings = state.controller.core().config.settings();
    // API keys never leave the process; report only which are present.
    let configured: Vec<&str> = settings.api_keys.keys().map(String::as_str).collect();
    axum::Json(json!({
        "pingIntervalSecs": settings.ping_interval_secs,
        "handshakeTimeoutSecs": settings.handshake_timeout_secs,
        "apiKeyProviders": configured,
    }))
}

pub async fn update_config(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<serde_json::Value>,
) -> Result<impl IntoResponse, ProxyError> {
    let core = state.controller.core();
    let mut settings = (*core.config.settings()).clone();

    if let Some(interval) = body.get("pingIntervalSecs") {
        settings.ping_interval_secs = interval
            .as_u64()
            .filter(|v| *v > 0)
            .ok_or_else(|| ProxyError::BadRequest("pingIntervalSecs must be a positive integer".to_string()))?;
    }
    if let Some(timeout) = body.get("handshakeTimeoutSecs") {
        settings.handshake_timeout_secs = timeout
            .as_u64()
            .filter(|v| *v > 0)
            .ok_or_else(|| ProxyError::BadRequest("handshakeTimeoutSecs must be a positive integer".to_string()))?;
    }
    if let Some(keys) = body.get("apiKeys") {
        let keys: std::collections::HashMap<String, String> =
            serde_json::from_value(keys.clone())
                .map_err(|e| ProxyError::BadRequest(format!("apiKeys: {e}")))?;
        settings.api_keys.extend(keys);
    }

    core.config.replace_settings(settings);
    Ok(axum::Json(json!({"success": true})))
}
