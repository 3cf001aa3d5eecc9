//! Admin HTTP surface, mounted under `/api/v1`.

use std::sync::Arc;
use std::time::Instant;

use axum::extract::{Path, State};
use axum::routing::{get, post};
use axum::{Json, Router};
use composer_registry::DownstreamServerSpec;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::composer::Composer;
use crate::error::{ComposerError, ComposerResult};
use crate::kit::Kit;

#[derive(Clone)]
pub struct AppState {
    pub composer: Arc<Composer>,
    pub started_at: Instant,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/health/live", get(live))
        .route("/health/ready", get(ready))
        .route("/health/startup", get(startup))
        .route("/kits", get(list_kits))
        .route("/kits/{name}", get(get_kit))
        .route("/kits/{name}/enable", post(enable_kit))
        .route("/kits/{name}/disable", post(disable_kit))
        .route("/kits/{name}/servers/{server}/enable", post(enable_server))
        .route("/kits/{name}/servers/{server}/disable", post(disable_server))
        .route("/kits/{name}/tools/{tool}/enable", post(enable_tool))
        .route("/kits/{name}/tools/{tool}/disable", post(disable_tool))
        .route("/kits/{name}/mcp", get(list_assigned_servers))
        .route(
            "/kits/{name}/mcp/{server}/assign",
            post(assign_server),
        )
        .route(
            "/kits/{name}/mcp/{server}/unassign",
            post(unassign_server),
        )
        .route("/gateways", get(list_gateways).post(add_gateway))
        .route("/gateways/{name}", get(get_gateway).delete(remove_gateway))
        .route("/mcp", get(list_servers).post(add_server))
        .route("/mcp/available", get(list_available_servers))
        .route("/mcp/{name}", get(get_server).delete(remove_server))
        .route("/mcp/{name}/status", get(get_server_status))
        .route("/mcp/{name}/dependencies", get(get_server_dependencies))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "healthy" }))
}

async fn live() -> Json<serde_json::Value> {
    Json(json!({ "status": "alive" }))
}

async fn ready(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ComposerError> {
    if !state.composer.registry().is_initialized() {
        return Err(ComposerError::ServiceUnavailable(
            "downstream registry not initialized".to_string(),
        ));
    }
    Ok(Json(json!({
        "status": "ready",
        "downstream_servers": state.composer.registry().list_available_servers().len(),
        "active_gateways": state.composer.list_gateway_names().len(),
    })))
}

async fn startup(State(state): State<AppState>) -> Result<Json<serde_json::Value>, ComposerError> {
    if !state.composer.registry().is_initialized() {
        return Err(ComposerError::ServiceUnavailable(
            "downstream registry not initialized".to_string(),
        ));
    }
    let uptime = state.started_at.elapsed();
    if uptime.as_secs_f64() < 1.0 {
        return Err(ComposerError::ServiceUnavailable(
            "application startup in progress".to_string(),
        ));
    }
    Ok(Json(json!({
        "status": "started",
        "startup_duration_secs": uptime.as_secs_f64(),
    })))
}

async fn list_kits(State(state): State<AppState>) -> Json<Vec<Kit>> {
    Json(state.composer.list_kits())
}

async fn get_kit(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ComposerResult<Json<Kit>> {
    Ok(Json(state.composer.get_kit(&name)?))
}

async fn enable_kit(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ComposerResult<Json<Kit>> {
    state.composer.enable_kit(&name)?;
    Ok(Json(state.composer.get_kit(&name)?))
}

async fn disable_kit(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ComposerResult<Json<Kit>> {
    state.composer.disable_kit(&name)?;
    Ok(Json(state.composer.get_kit(&name)?))
}

async fn enable_server(
    State(state): State<AppState>,
    Path((name, server)): Path<(String, String)>,
) -> ComposerResult<Json<Kit>> {
    state.composer.enable_server(&name, &server)?;
    Ok(Json(state.composer.get_kit(&name)?))
}

async fn disable_server(
    State(state): State<AppState>,
    Path((name, server)): Path<(String, String)>,
) -> ComposerResult<Json<Kit>> {
    state.composer.disable_server(&name, &server)?;
    Ok(Json(state.composer.get_kit(&name)?))
}

async fn enable_tool(
    State(state): State<AppState>,
    Path((name, tool)): Path<(String, String)>,
) -> ComposerResult<Json<Kit>> {
    state.composer.enable_tool(&name, &tool)?;
    Ok(Json(state.composer.get_kit(&name)?))
}

async fn disable_tool(
    State(state): State<AppState>,
    Path((name, tool)): Path<(String, String)>,
) -> ComposerResult<Json<Kit>> {
    state.composer.disable_tool(&name, &tool)?;
    Ok(Json(state.composer.get_kit(&name)?))
}

async fn list_assigned_servers(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ComposerResult<Json<Vec<String>>> {
    Ok(Json(state.composer.get_kit(&name)?.assigned_servers))
}

#[derive(Deserialize)]
struct AssignQuery {
    #[serde(default)]
    auto_enable: Option<bool>,
}

async fn assign_server(
    State(state): State<AppState>,
    Path((name, server)): Path<(String, String)>,
    body: Option<Json<AssignQuery>>,
) -> ComposerResult<Json<Kit>> {
    let auto_enable = body.and_then(|b| b.auto_enable).unwrap_or(true);
    state
        .composer
        .assign_server_to_kit(&name, &server, auto_enable)
        .await?;
    Ok(Json(state.composer.get_kit(&name)?))
}

async fn unassign_server(
    State(state): State<AppState>,
    Path((name, server)): Path<(String, String)>,
) -> ComposerResult<Json<Kit>> {
    state.composer.unassign_server_from_kit(&name, &server).await?;
    Ok(Json(state.composer.get_kit(&name)?))
}

#[derive(Serialize)]
struct GatewayResponse {
    name: String,
    sse_path: String,
    messages_path: String,
    gateway_endpoint: String,
    server_kit: Kit,
}

fn gateway_response(composer: &Composer, name: &str) -> ComposerResult<GatewayResponse> {
    let (sse_path, messages_path, gateway_endpoint) = composer.gateway_info(name)?;
    Ok(GatewayResponse {
        name: name.to_string(),
        sse_path,
        messages_path,
        gateway_endpoint,
        server_kit: composer.get_kit(name)?,
    })
}

async fn list_gateways(State(state): State<AppState>) -> Json<Vec<GatewayResponse>> {
    let names = state.composer.list_gateway_names();
    let gateways = names
        .into_iter()
        .filter_map(|n| gateway_response(&state.composer, &n).ok())
        .collect();
    Json(gateways)
}

async fn get_gateway(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ComposerResult<Json<GatewayResponse>> {
    Ok(Json(gateway_response(&state.composer, &name)?))
}

#[derive(Deserialize)]
struct AddGatewayRequest {
    name: String,
    #[serde(default = "default_true")]
    default_enabled: bool,
}

fn default_true() -> bool {
    true
}

async fn add_gateway(
    State(state): State<AppState>,
    Json(req): Json<AddGatewayRequest>,
) -> ComposerResult<Json<GatewayResponse>> {
    state.composer.create_kit(&req.name, req.default_enabled)?;
    state.composer.add_gateway(&req.name)?;
    Ok(Json(gateway_response(&state.composer, &req.name)?))
}

async fn remove_gateway(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ComposerResult<Json<serde_json::Value>> {
    state.composer.remove_gateway(&name)?;
    Ok(Json(json!({ "removed": name })))
}

async fn list_servers(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.composer.registry().list_available_servers())
}

#[derive(Deserialize)]
struct AddServerRequest {
    name: String,
    command: Option<String>,
    #[serde(default)]
    args: Vec<String>,
    #[serde(default)]
    env: std::collections::HashMap<String, String>,
    url: Option<String>,
}

async fn add_server(
    State(state): State<AppState>,
    Json(req): Json<AddServerRequest>,
) -> ComposerResult<Json<serde_json::Value>> {
    let spec = match (req.command, req.url) {
        (Some(command), _) => DownstreamServerSpec::stdio(req.name.clone(), command, req.args, req.env),
        (None, Some(url)) => DownstreamServerSpec::sse(req.name.clone(), url),
        (None, None) => {
            return Err(ComposerError::ValidationError(
                "server entry needs either 'command' or 'url'".to_string(),
            ))
        }
    };
    state.composer.create_mcp_server(spec).await?;
    Ok(Json(json!({ "added": req.name })))
}

async fn list_available_servers(State(state): State<AppState>) -> Json<Vec<String>> {
    Json(state.composer.registry().list_available_servers())
}

#[derive(Serialize)]
struct ServerInfo {
    name: String,
    status: String,
    tools_count: usize,
    assigned_to_kits: Vec<String>,
}

async fn get_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ComposerResult<Json<ServerInfo>> {
    let registry = state.composer.registry();
    if composer_registry::ServerStatus::NotFound == registry.get_server_status(&name) {
        return Err(ComposerError::NotFound(format!("server '{name}'")));
    }
    let kits: Vec<(String, Vec<String>)> = state
        .composer
        .list_kits()
        .into_iter()
        .map(|k| (k.name, k.assigned_servers))
        .collect();
    let borrowed: Vec<(&str, &[String])> =
        kits.iter().map(|(n, s)| (n.as_str(), s.as_slice())).collect();
    Ok(Json(ServerInfo {
        name: name.clone(),
        status: registry.get_server_status(&name).as_str().to_string(),
        tools_count: registry.get_server_tools_count(&name).unwrap_or(0),
        assigned_to_kits: registry.check_dependencies(&name, &borrowed),
    }))
}

async fn get_server_status(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ComposerResult<Json<serde_json::Value>> {
    let status = state.composer.registry().get_server_status(&name);
    if status == composer_registry::ServerStatus::NotFound {
        return Err(ComposerError::NotFound(format!("server '{name}'")));
    }
    Ok(Json(json!({ "name": name, "status": status.as_str() })))
}

#[derive(Serialize)]
struct DependencyInfo {
    server_name: String,
    dependent_kits: Vec<String>,
    can_be_removed: bool,
}

async fn get_server_dependencies(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ComposerResult<Json<DependencyInfo>> {
    let registry = state.composer.registry();
    if composer_registry::ServerStatus::NotFound == registry.get_server_status(&name) {
        return Err(ComposerError::NotFound(format!("server '{name}'")));
    }
    let kits: Vec<(String, Vec<String>)> = state
        .composer
        .list_kits()
        .into_iter()
        .map(|k| (k.name, k.assigned_servers))
        .collect();
    let borrowed: Vec<(&str, &[String])> =
        kits.iter().map(|(n, s)| (n.as_str(), s.as_slice())).collect();
    let dependent_kits = registry.check_dependencies(&name, &borrowed);
    Ok(Json(DependencyInfo {
        can_be_removed: dependent_kits.is_empty(),
        server_name: name,
        dependent_kits,
    }))
}

async fn remove_server(
    State(state): State<AppState>,
    Path(name): Path<String>,
) -> ComposerResult<Json<serde_json::Value>> {
    state.composer.delete_mcp_server(&name).await?;
    Ok(Json(json!({ "removed": name })))
}
