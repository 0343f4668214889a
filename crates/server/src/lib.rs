//! Loopback control API: lifecycle, configuration, observability, and
//! the PAC document.

pub mod auth;
pub mod controller;
pub mod handler;

use axum::http::HeaderValue;
use axum::{Router, middleware as axum_mw};
use claudish_provider::catalog::ModelCatalog;
use controller::ProxyController;
use std::sync::Arc;
use std::time::Instant;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub controller: Arc<ProxyController>,
    pub catalog: Arc<ModelCatalog>,
    pub token: Arc<String>,
    pub start_time: Instant,
}

pub fn build_router(state: AppState) -> Router {
    // Public routes — reachable without the bearer token.
    let public_routes = Router::new()
        .route("/health", axum::routing::get(handler::health::health))
        .route("/proxy.pac", axum::routing::get(handler::health::pac));

    // Gated routes — everything that observes or mutates proxy state.
    let gated_routes = Router::new()
        .route("/status", axum::routing::get(handler::status::status))
        .route(
            "/config",
            axum::routing::get(handler::status::get_config).post(handler::status::update_config),
        )
        .route(
            "/routing",
            axum::routing::get(handler::routing::get_routing)
                .post(handler::routing::update_routing),
        )
        .route("/proxy/enable", axum::routing::post(handler::proxy::enable))
        .route("/proxy/disable", axum::routing::post(handler::proxy::disable))
        .route(
            "/logs",
            axum::routing::get(handler::logs::query_logs).delete(handler::logs::clear_logs),
        )
        .route(
            "/traffic",
            axum::routing::get(handler::logs::query_traffic)
                .delete(handler::logs::clear_traffic),
        )
        .route("/models", axum::routing::get(handler::models::list_models))
        .route(
            "/models/refresh",
            axum::routing::post(handler::models::refresh_models),
        )
        .route(
            "/conversations",
            axum::routing::get(handler::models::conversation_map),
        )
        .route("/debug", axum::routing::post(handler::logs::set_debug))
        .route(
            "/certificates/ca",
            axum::routing::get(handler::certificates::ca_pem),
        )
        .route(
            "/certificates/status",
            axum::routing::get(handler::certificates::status),
        )
        .route("/v1/messages", axum::routing::post(handler::messages::messages))
        .layer(axum_mw::from_fn_with_state(
            state.clone(),
            auth::auth_middleware,
        ));

    // The API binds loopback-only; CORS narrows browser callers the same
    // way.
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::predicate(|origin: &HeaderValue, _| {
            origin
                .to_str()
                .map(|o| o.starts_with("http://127.0.0.1") || o.starts_with("http://localhost"))
                .unwrap_or(false)
        }))
        .allow_methods(tower_http::cors::Any)
        .allow_headers(tower_http::cors::Any);

    Router::new()
        .merge(public_routes)
        .merge(gated_routes)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
