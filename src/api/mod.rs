//! Control API (C12) — HTTP+WS server translating requests into
//! [`TunnelManager`] calls (spec.md §4.12).
//!
//! Grounded on the SchirmForge daemon's `api::create_router`/`AppState`
//! wiring shape (shared `Arc<AppState>`, a router built once and optionally
//! wrapped in an auth middleware layer). That daemon's listener code reaches
//! for `axum_server`/`hyper_util`/`anyhow` for its Unix-socket and TLS
//! listener modes; none of those are in this crate's dependency set, so
//! `main.rs` only implements its plain TCP+HTTP path (`axum::serve` over a
//! `tokio::net::TcpListener`) — see DESIGN.md.

pub mod auth;
pub mod handlers;
pub mod ws;

use std::sync::Arc;
use std::time::Instant;

use axum::middleware;
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post, put};
use axum::{Json, Router};
use serde_json::json;
use tower_http::cors::{Any, CorsLayer};

use crate::tunnel::{ManagerError, TunnelManager};

pub struct AppState {
    pub manager: TunnelManager,
    pub port: u16,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(manager: TunnelManager, port: u16) -> Arc<Self> {
        Arc::new(Self { manager, port, started_at: Instant::now() })
    }
}

/// Wraps [`ManagerError`] for handlers that surface it directly as a JSON
/// error body (spec.md §7: 400/401/404/500 with `{error: message}`).
pub struct ApiError(pub ManagerError);

impl From<ManagerError> for ApiError {
    fn from(e: ManagerError) -> Self {
        ApiError(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = axum::http::StatusCode::from_u16(self.0.status_code()).unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(json!({ "error": self.0.to_string() }))).into_response()
    }
}

/// Plain validation error, for request bodies that fail to parse into
/// something the Manager accepts.
pub struct ValidationError(pub String);

impl IntoResponse for ValidationError {
    fn into_response(self) -> Response {
        (axum::http::StatusCode::BAD_REQUEST, Json(json!({ "error": self.0 }))).into_response()
    }
}

/// Builds the full router, permissive CORS applied, auth middleware layered
/// on top only when `state.manager.api_auth_enabled()`.
pub fn create_router(state: Arc<AppState>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let router = Router::new()
        .route("/ping", get(handlers::ping))
        .route("/status", get(handlers::status))
        .route("/tunnels", get(handlers::tunnels))
        .route("/servers", get(handlers::list_servers))
        .route("/servers/add", post(handlers::add_server))
        .route("/servers/:id", put(handlers::update_server))
        .route("/servers/:id", delete(handlers::delete_server))
        .route("/servers/delete/:id", post(handlers::delete_server))
        .route("/connect/:id", post(handlers::connect))
        .route("/disconnect/:id", post(handlers::disconnect))
        .route("/disconnect-all", post(handlers::disconnect_all))
        .route("/scan", post(handlers::trigger_scan))
        .route("/scan/progress", get(handlers::scan_progress))
        .route("/logs", get(handlers::logs))
        .route("/export", get(handlers::export))
        .route("/import", post(handlers::import))
        .route("/stats/:id", get(handlers::stats))
        .route("/profiles", get(handlers::list_profiles))
        .route("/profiles/add", post(handlers::add_profile))
        .route("/profiles/connect/:id", post(handlers::connect_profile))
        .route("/profiles/:id", delete(handlers::delete_profile))
        .route("/help", get(handlers::help))
        .route("/ws/events", get(ws::upgrade))
        .layer(cors)
        .with_state(state.clone());

    if state.manager.api_auth_enabled() {
        router.layer(middleware::from_fn_with_state(state, auth::auth_middleware))
    } else {
        router
    }
}
