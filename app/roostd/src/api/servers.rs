//! Server lifecycle, power, command, and log routes.

use std::time::Duration;

use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::Json;
use roost_server::PowerAction;
use serde::Deserialize;
use serde_json::json;
use uuid::Uuid;

use super::{server_or_404, ApiResult, AppState};

pub(super) async fn system_info(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "kernel_version": std::env::consts::OS,
        "architecture": std::env::consts::ARCH,
        "cpu_count": std::thread::available_parallelism().map(|n| n.get()).unwrap_or(1),
        "servers": state.manager.all().len(),
    }))
}

pub(super) async fn list(State(state): State<AppState>) -> Json<serde_json::Value> {
    let servers: Vec<serde_json::Value> = state
        .manager
        .all()
        .into_iter()
        .map(|s| {
            json!({
                "uuid": s.id().to_string(),
                "state": s.state(),
                "utilization": s.proc(),
            })
        })
        .collect();
    Json(json!(servers))
}

#[derive(Deserialize)]
pub(super) struct CreateRequest {
    uuid: Uuid,
    #[serde(default)]
    start_on_completion: bool,
}

pub(super) async fn create(
    State(state): State<AppState>,
    Json(body): Json<CreateRequest>,
) -> ApiResult<StatusCode> {
    state
        .manager
        .create_server(body.uuid, body.start_on_completion)
        .await?;
    Ok(StatusCode::ACCEPTED)
}

pub(super) async fn view(
    State(state): State<AppState>,
    Path(server): Path<Uuid>,
) -> ApiResult<Json<serde_json::Value>> {
    let server = server_or_404(&state, server)?;
    let configuration = server.config();
    Ok(Json(json!({
        "uuid": server.id().to_string(),
        "state": server.state(),
        "is_suspended": server.is_suspended(),
        "is_installing": server.is_installing(),
        "is_transferring": server.is_transferring(),
        "utilization": server.proc(),
        "configuration": &*configuration,
    })))
}

#[derive(Deserialize)]
pub(super) struct DeleteQuery {
    #[serde(default)]
    with_backups: bool,
}

pub(super) async fn remove(
    State(state): State<AppState>,
    Path(server): Path<Uuid>,
    Query(query): Query<DeleteQuery>,
) -> ApiResult<StatusCode> {
    state.manager.delete_server(server, query.with_backups).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub(super) struct PowerRequest {
    action: PowerAction,
    /// Seconds to wait for the power lock and, for stop, for the process to
    /// actually exit. Omitted or zero rejects on contention and returns as
    /// soon as the stop signal is sent.
    #[serde(default)]
    wait_seconds: u64,
}

pub(super) async fn power(
    State(state): State<AppState>,
    Path(server): Path<Uuid>,
    Json(body): Json<PowerRequest>,
) -> ApiResult<StatusCode> {
    let server = server_or_404(&state, server)?;
    let wait = (body.wait_seconds > 0).then(|| Duration::from_secs(body.wait_seconds));
    server.handle_power_action(body.action, wait).await?;
    Ok(StatusCode::ACCEPTED)
}

#[derive(Deserialize)]
pub(super) struct CommandsRequest {
    commands: Vec<String>,
}

pub(super) async fn commands(
    State(state): State<AppState>,
    Path(server): Path<Uuid>,
    Json(body): Json<CommandsRequest>,
) -> ApiResult<StatusCode> {
    let server = server_or_404(&state, server)?;
    for command in &body.commands {
        server.send_command(command).await?;
    }
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
pub(super) struct LogsQuery {
    #[serde(default = "default_log_lines")]
    size: usize,
}

fn default_log_lines() -> usize {
    100
}

pub(super) async fn logs(
    State(state): State<AppState>,
    Path(server): Path<Uuid>,
    Query(query): Query<LogsQuery>,
) -> ApiResult<Json<serde_json::Value>> {
    let server = server_or_404(&state, server)?;
    let (process_state, lines) = server.logs(query.size);
    Ok(Json(json!({
        "state": process_state,
        "line_count": lines.len(),
        "lines": lines,
    })))
}
