use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use super::{bad_request, ok_status, AppState, ErrorResponse};

#[derive(Debug, Deserialize)]
pub struct ApprovalPollQuery {
    #[serde(default)]
    pub session_id: String,
}

#[derive(Debug, Serialize)]
pub struct ApprovalPollResponse {
    pub has_pending: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub approval_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tool_input: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct ApprovalRespondRequest {
    #[serde(default)]
    pub approval_id: String,
    #[serde(default)]
    pub approved: bool,
}

pub async fn poll(
    State(state): State<Arc<AppState>>,
    Query(query): Query<ApprovalPollQuery>,
) -> Response {
    if query.session_id.is_empty() {
        return bad_request("session_id is required");
    }

    match state.approvals.poll_pending(&query.session_id) {
        Some(item) => Json(ApprovalPollResponse {
            has_pending: true,
            approval_id: Some(item.id),
            tool_name: Some(item.payload.tool_name),
            tool_input: Some(item.payload.tool_input),
        })
        .into_response(),
        None => Json(ApprovalPollResponse {
            has_pending: false,
            approval_id: None,
            tool_name: None,
            tool_input: None,
        })
        .into_response(),
    }
}

pub async fn respond(
    State(state): State<Arc<AppState>>,
    Json(request): Json<ApprovalRespondRequest>,
) -> Response {
    if request.approval_id.is_empty() {
        return bad_request("approval_id is required");
    }

    if !state
        .approvals
        .submit_response(&request.approval_id, request.approved)
    {
        return (
            StatusCode::NOT_FOUND,
            Json(ErrorResponse {
                error: "Approval request not found".to_string(),
            }),
        )
            .into_response();
    }

    ok_status()
}
