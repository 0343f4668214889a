use crate::AppState;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use claudish_core::config::intercept_hosts;
use claudish_core::pac;
use serde_json::json;

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    axum::Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime": state.start_time.elapsed().as_secs(),
    }))
}

/// The PAC document. While the proxy is disabled every host resolves
/// DIRECT, so publishing the URL early is harmless.
pub async fn pac(State(state): State<AppState>) -> impl IntoResponse {
    let document = match state.controller.dispatcher_port().await {
        Some(port) => pac::render(port, &intercept_hosts()),
        None => pac::render_direct_only(),
    };
    ([(header::CONTENT_TYPE, pac::PAC_CONTENT_TYPE)], document)
}
