//! Bearer/query-token auth middleware (spec.md §4.12): `/ping` and the
//! initial WS handshake at `/ws/events` are always exempt; everything else
//! fails 401 unless the stored token matches.
//!
//! Grounded on the SchirmForge daemon's `auth::auth_middleware` shape
//! (an `axum::middleware::from_fn_with_state` layer consulting a shared
//! token), adapted to read the token from the Manager rather than a
//! dedicated `AuthState`.

use std::sync::Arc;

use axum::extract::{Query, Request, State};
use axum::http::StatusCode;
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Deserialize;
use serde_json::json;

use super::AppState;

#[derive(Deserialize)]
struct TokenQuery {
    token: Option<String>,
}

const EXEMPT_PATHS: &[&str] = &["/ping", "/ws/events"];

pub async fn auth_middleware(State(state): State<Arc<AppState>>, request: Request, next: Next) -> Response {
    let path = request.uri().path();
    if EXEMPT_PATHS.contains(&path) {
        return next.run(request).await;
    }

    let Some(expected) = state.manager.api_token() else {
        return next.run(request).await;
    };

    let header_token = request
        .headers()
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));

    let query_token = Query::<TokenQuery>::try_from_uri(request.uri()).ok().and_then(|q| q.0.token);

    let presented = header_token.map(|s| s.to_string()).or(query_token);

    match presented {
        Some(token) if constant_time_eq(token.as_bytes(), expected.as_bytes()) => next.run(request).await,
        _ => unauthorized(),
    }
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    use subtle::ConstantTimeEq;
    a.len() == b.len() && a.ct_eq(b).into()
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, Json(json!({ "error": "unauthorized" }))).into_response()
}
