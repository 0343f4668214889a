use crate::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use claudish_core::config::RoutingConfig;
use claudish_core::error::ProxyError;
use serde_json::json;

pub async fn get_routing(State(state): State<AppState>) -> impl IntoResponse {
    let routing = state.controller.core().config.snapshot();
    axum::Json(json!({
        "enabled": routing.enabled,
        "modelMap": routing.model_map,
    }))
}

pub async fn update_routing(
    State(state): State<AppState>,
    axum::Json(body): axum::Json<RoutingConfig>,
) -> Result<impl IntoResponse, ProxyError> {
    // Reject targets no adapter recognizes before they go live.
    for (source, target) in &body.model_map {
        if claudish_provider::resolve(target).is_none() {
            return Err(ProxyError::BadRequest(format!(
                "unknown routing target {target} for {source}"
            )));
        }
    }

    let core = state.controller.core();
    core.config.replace(body);
    let routing = core.config.snapshot();
    core.logs.info(
        "routing",
        format!(
            "routing updated: enabled={}, {} mappings",
            routing.enabled,
            routing.model_map.len()
        ),
    );
    Ok(axum::Json(json!({"success": true})))
}
