use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;

/// Unified error type for all proxy operations.
#[derive(Debug, thiserror::Error)]
pub enum ProxyError {
    #[error("configuration error: {0}")]
    Config(String),

    #[error("unauthorized: {0}")]
    Auth(String),

    #[error("certificate error: {0}")]
    Cert(String),

    #[error("tunnel protocol error: {0}")]
    Tunnel(String),

    #[error("upstream error (status {status}): {body}")]
    Upstream { status: u16, body: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("translation error: {0}")]
    Translation(String),

    #[error("oauth error: {0}")]
    OAuth(String),

    #[error("bad request: {0}")]
    BadRequest(String),

    #[error("proxy is already running")]
    ProxyAlreadyRunning,

    #[error("proxy is not running")]
    ProxyNotRunning,

    #[error("proxy is disabled")]
    ProxyDisabled,

    #[error("internal error: {0}")]
    Internal(String),
}

impl ProxyError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::Internal(_) | Self::Cert(_) | Self::Translation(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
            Self::Auth(_) => StatusCode::UNAUTHORIZED,
            Self::OAuth(_) => StatusCode::UNAUTHORIZED,
            Self::Upstream { status, .. } => {
                StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
            }
            Self::Network(_) | Self::Tunnel(_) => StatusCode::BAD_GATEWAY,
            Self::BadRequest(_) | Self::ProxyAlreadyRunning | Self::ProxyNotRunning => {
                StatusCode::BAD_REQUEST
            }
            Self::ProxyDisabled => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Stable machine-readable code surfaced in control API error bodies.
    pub fn error_code(&self) -> &str {
        match self {
            Self::Config(_) => "CONFIG_ERROR",
            Self::Auth(_) => "UNAUTHORIZED",
            Self::Cert(_) => "CERT_ERROR",
            Self::Tunnel(_) => "TUNNEL_ERROR",
            Self::Upstream { .. } => "UPSTREAM_ERROR",
            Self::Network(_) => "NETWORK_ERROR",
            Self::Translation(_) => "TRANSLATION_ERROR",
            Self::OAuth(_) => "OAUTH_ERROR",
            Self::BadRequest(_) => "BAD_REQUEST",
            Self::ProxyAlreadyRunning => "PROXY_ALREADY_RUNNING",
            Self::ProxyNotRunning => "PROXY_NOT_RUNNING",
            Self::ProxyDisabled => "PROXY_DISABLED",
            Self::Internal(_) => "INTERNAL_ERROR",
        }
    }
}

impl IntoResponse for ProxyError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "success": false,
            "error": self.to_string(),
            "code": self.error_code(),
        });
        (
            status,
            [("content-type", "application/json")],
            body.to_string(),
        )
            .into_response()
    }
}

impl From<reqwest::Error> for ProxyError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            Self::Network(format!("request timed out: {e}"))
        } else if e.is_connect() {
            Self::Network(format!("connection failed: {e}"))
        } else {
            Self::Network(e.to_string())
        }
    }
}

impl From<serde_json::Error> for ProxyError {
    fn from(e: serde_json::Error) -> Self {
        Self::Translation(format!("JSON error: {e}"))
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(e: std::io::Error) -> Self {
        Self::Network(e.to_string())
    }
}
