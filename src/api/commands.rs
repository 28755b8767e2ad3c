use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use super::{bad_request, ok_status, AppState};
use crate::command::CommandResult;

#[derive(Debug, Deserialize)]
pub struct CommandQueueRequest {
    #[serde(default)]
    pub command: String,
    pub working_directory: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CommandQueueResponse {
    pub command_id: String,
    pub status: String,
    pub exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CommandPollResponse {
    pub has_pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cmd_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub command: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub working_directory: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CommandStatusResponse {
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct CommandStatusQuery {
    #[serde(default)]
    pub command_id: String,
}

pub async fn queue(
    State(state): State<Arc<AppState>>,
    Json(request): Json<CommandQueueRequest>,
) -> Response {
    if request.command.is_empty() {
        return bad_request("Command is required");
    }

    let result = state
        .commands
        .queue_command(
            &request.command,
            request.working_directory,
            request.session_id,
            CancellationToken::new(),
        )
        .await;

    match result {
        Some(result) => (
            StatusCode::OK,
            Json(CommandQueueResponse {
                command_id: result.command_id,
                status: "completed".to_string(),
                exit_code: result.exit_code,
                stdout: result.stdout,
                stderr: result.stderr,
            }),
        )
            .into_response(),
        None => StatusCode::GATEWAY_TIMEOUT.into_response(),
    }
}

pub async fn poll(State(state): State<Arc<AppState>>) -> Response {
    match state.commands.poll_pending_command() {
        Some(item) => Json(CommandPollResponse {
            has_pending: true,
            cmd_id: Some(item.id),
            command: Some(item.payload.command),
            working_directory: item.payload.working_directory,
        })
        .into_response(),
        None => Json(CommandPollResponse {
            has_pending: false,
            cmd_id: None,
            command: None,
            working_directory: None,
        })
        .into_response(),
    }
}

pub async fn result(
    State(state): State<Arc<AppState>>,
    Json(result): Json<CommandResult>,
) -> Response {
    if result.command_id.is_empty() {
        return bad_request("command_id is required");
    }

    state.commands.submit_result(result);
    ok_status()
}

pub async fn status(
    State(state): State<Arc<AppState>>,
    Query(query): Query<CommandStatusQuery>,
) -> Response {
    if let Some(result) = state.commands.command_status(&query.command_id) {
        return Json(CommandStatusResponse {
            status: "completed".to_string(),
            exit_code: Some(result.exit_code),
            stdout: result.stdout,
            stderr: result.stderr,
        })
        .into_response();
    }

    if let Some(status) = state.commands.pending_status(&query.command_id) {
        return Json(CommandStatusResponse {
            status: status.to_string(),
            exit_code: None,
            stdout: None,
            stderr: None,
        })
        .into_response();
    }

    (
        StatusCode::NOT_FOUND,
        Json(CommandStatusResponse {
            status: "not_found".to_string(),
            exit_code: None,
            stdout: None,
            stderr: None,
        }),
    )
        .into_response()
}
