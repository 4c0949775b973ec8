//! Request handlers for every Control API endpoint (spec.md §4.12).

use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;

use super::{ApiError, AppState, ValidationError};
use crate::stats::Period;
use crate::tunnel::manager::{NewServer, NewServerAuth, ServerPatch};

pub async fn ping(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(json!({
        "pong": true,
        "port": state.port,
        "uptime": state.started_at.elapsed().as_secs(),
    }))
}

pub async fn status(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let servers = state.manager.list_servers().await;
    let tunnels = state.manager.list_tunnels().await;
    Json(json!({
        "uptime": state.manager.uptime_secs(),
        "serverCount": servers.len(),
        "tunnelCount": tunnels.len(),
        "apiAuthEnabled": state.manager.api_auth_enabled(),
    }))
}

pub async fn tunnels(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.list_tunnels().await)
}

pub async fn list_servers(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.list_servers().await)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewServerRequest {
    pub name: String,
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
    pub username: String,
    pub password: Option<String>,
    pub key_path: Option<String>,
    pub key_passphrase: Option<String>,
    #[serde(default = "default_socks_port")]
    pub socks_port: u16,
    pub proxy_username: Option<String>,
    pub proxy_password: Option<String>,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default)]
    pub connect_on_startup: bool,
    #[serde(default = "default_true")]
    pub notifications_enabled: bool,
}

fn default_ssh_port() -> u16 {
    22
}
fn default_socks_port() -> u16 {
    1080
}
fn default_true() -> bool {
    true
}

impl NewServerRequest {
    fn into_new_server(self) -> Result<NewServer, ValidationError> {
        let auth = if let Some(password) = self.password {
            NewServerAuth::Password(password)
        } else if let Some(key_path) = self.key_path {
            NewServerAuth::Key { key_path, passphrase: self.key_passphrase }
        } else {
            return Err(ValidationError("either password or keyPath must be provided".into()));
        };

        Ok(NewServer {
            name: self.name,
            host: self.host,
            ssh_port: self.ssh_port,
            username: self.username,
            auth,
            socks_port: self.socks_port,
            proxy_username: self.proxy_username,
            proxy_password: self.proxy_password,
            auto_reconnect: self.auto_reconnect,
            connect_on_startup: self.connect_on_startup,
            notifications_enabled: self.notifications_enabled,
        })
    }
}

pub async fn add_server(State(state): State<Arc<AppState>>, Json(req): Json<NewServerRequest>) -> Response {
    let new_server = match req.into_new_server() {
        Ok(s) => s,
        Err(e) => return e.into_response(),
    };
    match state.manager.add_server(new_server).await {
        Ok(id) => Json(json!({ "id": id })).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

#[derive(Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ServerPatchRequest {
    pub name: Option<String>,
    pub host: Option<String>,
    pub ssh_port: Option<u16>,
    pub username: Option<String>,
    pub socks_port: Option<u16>,
    #[serde(default)]
    pub proxy_username: Option<Option<String>>,
    #[serde(default)]
    pub proxy_password: Option<Option<String>>,
    pub auto_reconnect: Option<bool>,
    pub connect_on_startup: Option<bool>,
    pub notifications_enabled: Option<bool>,
    pub is_enabled: Option<bool>,
    pub password: Option<String>,
    pub key_path: Option<String>,
    pub key_passphrase: Option<String>,
}

impl From<ServerPatchRequest> for ServerPatch {
    fn from(req: ServerPatchRequest) -> Self {
        ServerPatch {
            name: req.name,
            host: req.host,
            ssh_port: req.ssh_port,
            username: req.username,
            socks_port: req.socks_port,
            proxy_username: req.proxy_username,
            proxy_password: req.proxy_password,
            auto_reconnect: req.auto_reconnect,
            connect_on_startup: req.connect_on_startup,
            notifications_enabled: req.notifications_enabled,
            is_enabled: req.is_enabled,
            new_password: req.password,
            new_key: req.key_path.map(|p| (p, req.key_passphrase)),
        }
    }
}

pub async fn update_server(State(state): State<Arc<AppState>>, Path(id): Path<String>, Json(req): Json<ServerPatchRequest>) -> Response {
    match state.manager.update_server(&id, req.into()).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

pub async fn delete_server(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.manager.delete_server(&id).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

pub async fn connect(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.manager.connect(&id).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

pub async fn disconnect(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.manager.disconnect(&id).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

pub async fn disconnect_all(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.manager.disconnect_all().await;
    Json(json!({ "ok": true }))
}

pub async fn trigger_scan(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.manager.trigger_scan().await;
    Json(json!({ "started": true }))
}

pub async fn scan_progress(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.scan_progress())
}

#[derive(Deserialize)]
pub struct LogsQuery {
    limit: Option<usize>,
}

pub async fn logs(State(state): State<Arc<AppState>>, Query(query): Query<LogsQuery>) -> impl IntoResponse {
    let limit = query.limit.unwrap_or(100);
    Json(state.manager.logs(limit))
}

#[derive(Deserialize)]
pub struct ExportQuery {
    #[serde(default, rename = "includeKeys")]
    include_keys: bool,
}

pub async fn export(State(state): State<Arc<AppState>>, Query(query): Query<ExportQuery>) -> impl IntoResponse {
    Json(state.manager.export(query.include_keys).await)
}

#[derive(Deserialize)]
#[serde(untagged)]
pub enum ImportBody {
    Wrapped { servers: Vec<serde_json::Value> },
    Bare(Vec<serde_json::Value>),
}

pub async fn import(State(state): State<Arc<AppState>>, Json(body): Json<ImportBody>) -> Response {
    let servers = match body {
        ImportBody::Wrapped { servers } => servers,
        ImportBody::Bare(servers) => servers,
    };
    match state.manager.import(servers).await {
        Ok(count) => Json(json!({ "imported": count })).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

#[derive(Deserialize)]
pub struct StatsQuery {
    period: Option<String>,
}

pub async fn stats(State(state): State<Arc<AppState>>, Path(id): Path<String>, Query(query): Query<StatsQuery>) -> Response {
    let period = query
        .period
        .as_deref()
        .and_then(Period::parse)
        .unwrap_or(Period::OneHour);

    match state.manager.query_stats(&id, period).await {
        Ok(result) => Json(result).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

pub async fn list_profiles(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.manager.list_profiles().await)
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AddProfileRequest {
    pub server_id: String,
    pub display_name: String,
    pub socks_port_override: Option<u16>,
}

pub async fn add_profile(State(state): State<Arc<AppState>>, Json(req): Json<AddProfileRequest>) -> Response {
    match state.manager.add_profile(&req.server_id, &req.display_name, req.socks_port_override).await {
        Ok(id) => Json(json!({ "id": id })).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

pub async fn connect_profile(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.manager.connect_profile(&id).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

pub async fn delete_profile(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.manager.delete_profile(&id).await {
        Ok(()) => Json(json!({ "ok": true })).into_response(),
        Err(e) => ApiError(e).into_response(),
    }
}

pub async fn help() -> impl IntoResponse {
    Json(json!({
        "endpoints": [
            "GET /ping", "GET /status", "GET /tunnels", "GET /servers",
            "POST /servers/add", "PUT /servers/{id}", "POST /servers/delete/{id}", "DELETE /servers/{id}",
            "POST /connect/{id}", "POST /disconnect/{id}", "POST /disconnect-all",
            "POST /scan", "GET /scan/progress", "GET /logs?limit=N",
            "GET /export?includeKeys=bool", "POST /import",
            "GET /stats/{id}?period=1h|24h|7d",
            "GET /profiles", "POST /profiles/add", "POST /profiles/connect/{id}", "DELETE /profiles/{id}",
            "GET /ws/events",
        ],
    }))
}
