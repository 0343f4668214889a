//! Bearer-token gate for the control API.
//!
//! The token is random per process and written to the bridge-token file
//! so a GUI or script can drive the proxy without any interactive auth.

use crate::AppState;
use axum::{extract::State, http::Request, middleware::Next, response::Response};
use claudish_core::error::ProxyError;
use claudish_core::paths::{self, Paths};
use serde::Serialize;

/// Generate the per-process control token.
pub fn generate_token() -> String {
    let bytes: [u8; 32] = rand::random();
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

#[derive(Serialize)]
struct BridgeToken<'a> {
    port: u16,
    token: &'a str,
    pid: u32,
    start_time: i64,
}

/// Persist the bridge-token file a controlling process reads.
pub fn write_bridge_token(paths: &Paths, port: u16, token: &str) -> Result<(), ProxyError> {
    paths::ensure_private_dir(&paths.proxy_dir())?;
    let body = serde_json::to_vec_pretty(&BridgeToken {
        port,
        token,
        pid: std::process::id(),
        start_time: chrono::Utc::now().timestamp_millis(),
    })
    .map_err(|e| ProxyError::Internal(e.to_string()))?;
    paths::write_atomic(&paths.bridge_token(), &body, 0o600)
}

pub async fn auth_middleware(
    State(state): State<AppState>,
    request: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, ProxyError> {
    let token = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    match token {
        Some(t) if t == state.token.as_str() => Ok(next.run(request).await),
        Some(_) => Err(ProxyError::Auth("invalid bearer token".to_string())),
        None => Err(ProxyError::Auth("missing bearer token".to_string())),
    }
}
