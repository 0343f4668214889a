use crate::AppState;
use axum::extract::State;
use axum::http::header;
use axum::response::IntoResponse;
use serde_json::json;

pub async fn ca_pem(State(state): State<AppState>) -> impl IntoResponse {
    let core = state.controller.core();
    (
        [(header::CONTENT_TYPE, "application/x-pem-file")],
        core.certs.ca_cert_pem().to_string(),
    )
}

pub async fn status(State(state): State<AppState>) -> impl IntoResponse {
    let core = state.controller.core();
    axum::Json(json!({
        "fingerprint": core.certs.get_ca_fingerprint(),
        "notAfter": core.certs.ca_not_after(),
        "leafCacheSize": core.certs.leaf_cache_len(),
    }))
}
