use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use super::{bad_request, ok_status, AppState};
use crate::fsops::{FileEntry, FileOpResult};

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub path: String,
}

#[derive(Debug, Deserialize)]
pub struct ReadQuery {
    #[serde(default)]
    pub path: String,
    pub max_size: Option<usize>,
}

#[derive(Debug, Serialize)]
pub struct DirectoryListResponse {
    pub path: String,
    pub entries: Vec<FileEntry>,
}

#[derive(Debug, Serialize)]
pub struct FileReadResponse {
    pub path: String,
    pub content: String,
    pub truncated: bool,
    pub total_size: usize,
}

#[derive(Debug, Deserialize)]
pub struct FileWriteRequest {
    #[serde(default)]
    pub path: String,
    pub content: Option<String>,
    pub session_id: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct FileWriteResponse {
    pub status: String,
    pub path: String,
    pub bytes_written: usize,
}

#[derive(Debug, Serialize)]
pub struct FileOpPollResponse {
    pub has_pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub op_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operation: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct BundleRequest {
    #[serde(default)]
    pub source_path: String,
    pub output_name: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct BundleResponse {
    pub status: String,
    pub archive_path: String,
    pub size: u64,
}

pub async fn list(State(state): State<Arc<AppState>>, Query(query): Query<ListQuery>) -> Response {
    let result = state
        .files
        .list_directory(&query.path, CancellationToken::new())
        .await;

    match result {
        None => StatusCode::GATEWAY_TIMEOUT.into_response(),
        Some(result) if result.error.is_some() => StatusCode::INTERNAL_SERVER_ERROR.into_response(),
        Some(result) => Json(DirectoryListResponse {
            path: query.path,
            entries: result.entries.unwrap_or_default(),
        })
        .into_response(),
    }
}

pub async fn read(State(state): State<Arc<AppState>>, Query(query): Query<ReadQuery>) -> Response {
    let result = state
        .files
        .read_file(&query.path, query.max_size, CancellationToken::new())
        .await;

    match result {
        Some(content) => Json(FileReadResponse {
            path: query.path,
            content: content.content,
            truncated: content.truncated,
            total_size: content.total_size,
        })
        .into_response(),
        None => StatusCode::GATEWAY_TIMEOUT.into_response(),
    }
}

pub async fn write(
    State(state): State<Arc<AppState>>,
    Json(request): Json<FileWriteRequest>,
) -> Response {
    let Some(content) = request.content else {
        return bad_request("path and content are required");
    };
    if request.path.is_empty() {
        return bad_request("path and content are required");
    }

    let success = state
        .files
        .write_file(
            &request.path,
            &content,
            request.session_id.as_deref(),
            CancellationToken::new(),
        )
        .await;

    if !success {
        return StatusCode::GATEWAY_TIMEOUT.into_response();
    }

    Json(FileWriteResponse {
        status: "ok".to_string(),
        path: request.path,
        bytes_written: content.len(),
    })
    .into_response()
}

pub async fn poll(State(state): State<Arc<AppState>>) -> Response {
    match state.files.poll_pending_operation() {
        Some(item) => Json(FileOpPollResponse {
            has_pending: true,
            op_id: Some(item.id),
            operation: Some(item.payload.operation.to_string()),
            path: Some(item.payload.path),
            content: item.payload.content,
        })
        .into_response(),
        None => Json(FileOpPollResponse {
            has_pending: false,
            op_id: None,
            operation: None,
            path: None,
            content: None,
        })
        .into_response(),
    }
}

pub async fn result(
    State(state): State<Arc<AppState>>,
    Json(result): Json<FileOpResult>,
) -> Response {
    if result.op_id.is_empty() {
        return bad_request("op_id is required");
    }

    state.files.submit_result(result);
    ok_status()
}

pub async fn bundle(
    State(state): State<Arc<AppState>>,
    Json(request): Json<BundleRequest>,
) -> Response {
    if request.source_path.is_empty() {
        return bad_request("source_path is required");
    }

    match state
        .files
        .create_bundle(&request.source_path, request.output_name.as_deref())
    {
        Ok((archive_path, size)) => Json(BundleResponse {
            status: "ok".to_string(),
            archive_path: archive_path.display().to_string(),
            size,
        })
        .into_response(),
        Err(err) => {
            warn!(source = %request.source_path, error = %err, "bundle request failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}
