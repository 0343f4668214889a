use crate::AppState;
use axum::extract::State;
use axum::response::IntoResponse;
use claudish_core::error::ProxyError;
use serde_json::json;

pub async fn list_models(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(json!({"models": state.catalog.list()}))
}

pub async fn refresh_models(
    State(state): State<AppState>,
) -> Result<impl IntoResponse, ProxyError> {
    let core = state.controller.core();
    let fetched = state.catalog.refresh(&core.http).await?;
    core.logs
        .info("models", format!("catalog refreshed, {fetched} remote models"));
    Ok(axum::Json(json!({"success": true, "fetched": fetched})))
}

/// Conversation → model bindings observed by the tracker, plus which
/// conversations carry injected history.
pub async fn conversation_map(State(state): State<AppState>) -> impl IntoResponse {
    let core = state.controller.core();
    axum::Json(json!({
        "currentModel": core.tracker.current_model(),
        "conversationModels": core.tracker.conversation_map(),
        "injectedConversations": core.convstore.conversation_ids(),
    }))
}
