//! HTTP surface consumed by callers, the polling executor, and the approval
//! UI. JSON bodies, snake_case fields, shared-secret `X-API-Key` header on
//! every route.

pub mod approvals;
pub mod commands;
pub mod files;

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Serialize;
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::approval::ApprovalGate;
use crate::command::CommandBroker;
use crate::config::ServerConfig;
use crate::fsops::FileOpBroker;

/// Shared handler state: one broker instance per domain, constructed once at
/// startup.
pub struct AppState {
    pub config: ServerConfig,
    pub commands: CommandBroker,
    pub files: FileOpBroker,
    pub approvals: Arc<ApprovalGate>,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub status: String,
}

pub(crate) fn bad_request(message: &str) -> Response {
    (
        StatusCode::BAD_REQUEST,
        Json(ErrorResponse {
            error: message.to_string(),
        }),
    )
        .into_response()
}

pub(crate) fn ok_status() -> Response {
    (
        StatusCode::OK,
        Json(StatusResponse {
            status: "ok".to_string(),
        }),
    )
        .into_response()
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(root))
        .route("/cmd/queue", post(commands::queue))
        .route("/cmd/poll", get(commands::poll))
        .route("/cmd/result", post(commands::result))
        .route("/cmd/status", get(commands::status))
        .route("/fs/list", get(files::list))
        .route("/fs/read", get(files::read))
        .route("/fs/write", post(files::write))
        .route("/fs/poll", get(files::poll))
        .route("/fs/result", post(files::result))
        .route("/fs/bundle", post(files::bundle))
        .route("/approval/poll", get(approvals::poll))
        .route("/approval/respond", post(approvals::respond))
        .layer(middleware::from_fn_with_state(state.clone(), require_api_key))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Every route sits behind the shared secret; the legacy client sends it on
/// each poll.
async fn require_api_key(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let provided = request
        .headers()
        .get("x-api-key")
        .and_then(|value| value.to_str().ok());

    if provided != Some(state.config.api_key.as_str()) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    next.run(request).await
}

async fn root() -> Response {
    Json(json!({
        "status": "ok",
        "service": "backhaul",
        "version": env!("CARGO_PKG_VERSION"),
    }))
    .into_response()
}
