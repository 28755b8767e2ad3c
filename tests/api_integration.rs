//! End-to-end tests over the HTTP surface: a real listener on an ephemeral
//! port, driven with reqwest the way the agent-side caller and the legacy
//! poller would.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};
use reqwest::StatusCode;
use serde_json::{json, Value};
use tempfile::TempDir;

use backhaul::api::{self, AppState};
use backhaul::approval::ApprovalGate;
use backhaul::broker::Broker;
use backhaul::command::CommandBroker;
use backhaul::config::ServerConfig;
use backhaul::fsops::FileOpBroker;

const KEY: &str = "test-key";

struct TestServer {
    base: String,
    client: reqwest::Client,
    _tmp: TempDir,
}

impl TestServer {
    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base)
    }
}

async fn spawn_server(timeout: Duration) -> TestServer {
    let tmp = TempDir::new().unwrap();

    let config = ServerConfig {
        api_key: KEY.to_string(),
        command_timeout_secs: timeout.as_secs().max(1),
        transfer_root: tmp.path().to_path_buf(),
        ..ServerConfig::default()
    };

    let approvals = Arc::new(ApprovalGate::new());
    let commands = CommandBroker::new(Broker::new("cmd"), approvals.clone(), timeout);
    let files = FileOpBroker::new(
        Broker::new("op"),
        approvals.clone(),
        timeout,
        timeout,
        50_000,
        tmp.path().to_path_buf(),
    );
    let state = Arc::new(AppState {
        config,
        commands,
        files,
        approvals,
    });

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, api::router(state)).await.unwrap();
    });

    let mut headers = HeaderMap::new();
    headers.insert("X-API-Key", HeaderValue::from_static(KEY));
    let client = reqwest::Client::builder()
        .default_headers(headers)
        .build()
        .unwrap();

    TestServer {
        base: format!("http://{addr}"),
        client,
        _tmp: tmp,
    }
}

// ---------------------------------------------------------------------------
// Auth and validation
// ---------------------------------------------------------------------------

#[tokio::test]
async fn requests_without_api_key_are_unauthorized() {
    let server = spawn_server(Duration::from_secs(2)).await;

    let response = reqwest::Client::new()
        .get(server.url("/cmd/poll"))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

    let response = reqwest::Client::new()
        .get(server.url("/cmd/poll"))
        .header("X-API-Key", "wrong")
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn empty_command_is_a_bad_request() {
    let server = spawn_server(Duration::from_secs(2)).await;

    let response = server
        .client
        .post(server.url("/cmd/queue"))
        .json(&json!({ "command": "" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["error"], "Command is required");
}

#[tokio::test]
async fn result_without_command_id_is_a_bad_request() {
    let server = spawn_server(Duration::from_secs(2)).await;

    let response = server
        .client
        .post(server.url("/cmd/result"))
        .json(&json!({ "exit_code": 0 }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

// ---------------------------------------------------------------------------
// Command flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn command_queue_poll_result_flow() {
    let server = spawn_server(Duration::from_secs(5)).await;

    let queue = {
        let client = server.client.clone();
        let url = server.url("/cmd/queue");
        tokio::spawn(async move {
            client
                .post(url)
                .json(&json!({ "command": "dir", "working_directory": "C:\\" }))
                .send()
                .await
                .unwrap()
        })
    };

    // Act as the legacy poller.
    let pending = poll_until_pending(&server, "/cmd/poll").await;
    assert_eq!(pending["command"], "dir");
    assert_eq!(pending["working_directory"], "C:\\");
    let cmd_id = pending["cmd_id"].as_str().unwrap().to_string();

    let response = server
        .client
        .post(server.url("/cmd/result"))
        .json(&json!({ "command_id": cmd_id, "exit_code": 0, "stdout": "file1.txt" }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = queue.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "completed");
    assert_eq!(body["exit_code"], 0);
    assert_eq!(body["stdout"], "file1.txt");

    // The result stays visible through /cmd/status.
    let response = server
        .client
        .get(server.url("/cmd/status"))
        .query(&[("command_id", cmd_id.as_str())])
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "completed");
    assert_eq!(body["stdout"], "file1.txt");
}

#[tokio::test]
async fn command_status_for_unknown_id_is_not_found() {
    let server = spawn_server(Duration::from_secs(2)).await;

    let response = server
        .client
        .get(server.url("/cmd/status"))
        .query(&[("command_id", "cmd-000000000042")])
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "not_found");
}

#[tokio::test]
async fn command_timeout_is_a_gateway_timeout() {
    let server = spawn_server(Duration::from_millis(200)).await;

    let response = server
        .client
        .post(server.url("/cmd/queue"))
        .json(&json!({ "command": "dir" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::GATEWAY_TIMEOUT);
}

// ---------------------------------------------------------------------------
// File operation flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn read_truncation_over_http() {
    let server = spawn_server(Duration::from_secs(5)).await;

    let read = {
        let client = server.client.clone();
        let url = server.url("/fs/read");
        tokio::spawn(async move {
            client
                .get(url)
                .query(&[("path", "C:\\README.TXT"), ("max_size", "5")])
                .send()
                .await
                .unwrap()
        })
    };

    let pending = poll_until_pending(&server, "/fs/poll").await;
    assert_eq!(pending["operation"], "read");
    let op_id = pending["op_id"].as_str().unwrap().to_string();

    server
        .client
        .post(server.url("/fs/result"))
        .json(&json!({ "op_id": op_id, "content": "Hello, World!" }))
        .send()
        .await
        .unwrap();

    let response = read.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["content"], "Hello");
    assert_eq!(body["truncated"], true);
    assert_eq!(body["total_size"], 13);
}

#[tokio::test]
async fn write_flow_reports_bytes_written() {
    let server = spawn_server(Duration::from_secs(5)).await;

    let write = {
        let client = server.client.clone();
        let url = server.url("/fs/write");
        tokio::spawn(async move {
            client
                .post(url)
                .json(&json!({ "path": "C:\\OUT.TXT", "content": "hello" }))
                .send()
                .await
                .unwrap()
        })
    };

    let pending = poll_until_pending(&server, "/fs/poll").await;
    assert_eq!(pending["operation"], "write");
    assert_eq!(pending["content"], "hello");
    let op_id = pending["op_id"].as_str().unwrap().to_string();

    server
        .client
        .post(server.url("/fs/result"))
        .json(&json!({ "op_id": op_id }))
        .send()
        .await
        .unwrap();

    let response = write.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["bytes_written"], 5);
}

#[tokio::test]
async fn write_without_content_is_a_bad_request() {
    let server = spawn_server(Duration::from_secs(2)).await;

    let response = server
        .client
        .post(server.url("/fs/write"))
        .json(&json!({ "path": "C:\\OUT.TXT" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn bundle_endpoint_archives_directory() {
    let server = spawn_server(Duration::from_secs(2)).await;

    let source = server._tmp.path().join("payload");
    std::fs::create_dir_all(&source).unwrap();
    std::fs::write(source.join("app.exe"), vec![0u8; 32]).unwrap();

    let response = server
        .client
        .post(server.url("/fs/bundle"))
        .json(&json!({ "source_path": "payload", "output_name": "payload.tar.gz" }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert!(body["size"].as_u64().unwrap() > 0);
    assert!(body["archive_path"]
        .as_str()
        .unwrap()
        .ends_with("payload.tar.gz"));
}

// ---------------------------------------------------------------------------
// Approval flow
// ---------------------------------------------------------------------------

#[tokio::test]
async fn gated_command_rejected_through_the_approval_endpoints() {
    let server = spawn_server(Duration::from_secs(5)).await;

    let queue = {
        let client = server.client.clone();
        let url = server.url("/cmd/queue");
        tokio::spawn(async move {
            client
                .post(url)
                .json(&json!({ "command": "format c:", "session_id": "session1" }))
                .send()
                .await
                .unwrap()
        })
    };

    // The approval UI polls for the session's pending question.
    let approval = {
        let mut found = None;
        for _ in 0..200 {
            let body: Value = server
                .client
                .get(server.url("/approval/poll"))
                .query(&[("session_id", "session1")])
                .send()
                .await
                .unwrap()
                .json()
                .await
                .unwrap();
            if body["has_pending"] == true {
                found = Some(body);
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        found.expect("no pending approval appeared")
    };
    assert_eq!(approval["tool_name"], "Bash");
    assert_eq!(approval["tool_input"], "format c:");

    // While the approval is open the command must not be pollable.
    let body: Value = server
        .client
        .get(server.url("/cmd/poll"))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(body["has_pending"], false);

    let response = server
        .client
        .post(server.url("/approval/respond"))
        .json(&json!({
            "approval_id": approval["approval_id"],
            "approved": false,
        }))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let response = queue.await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["exit_code"], -1);
    assert_eq!(body["stderr"], "Command rejected by user");
}

#[tokio::test]
async fn approval_poll_requires_session_id() {
    let server = spawn_server(Duration::from_secs(2)).await;

    let response = server
        .client
        .get(server.url("/approval/poll"))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn responding_to_unknown_approval_is_not_found() {
    let server = spawn_server(Duration::from_secs(2)).await;

    let response = server
        .client
        .post(server.url("/approval/respond"))
        .json(&json!({ "approval_id": "appr-000000000042", "approved": true }))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::NOT_FOUND);
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Poll the given endpoint until `has_pending` flips true, acting as the
/// legacy client's poll loop.
async fn poll_until_pending(server: &TestServer, path: &str) -> Value {
    for _ in 0..200 {
        let body: Value = server
            .client
            .get(server.url(path))
            .send()
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        if body["has_pending"] == true {
            return body;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("no pending item appeared on {path}");
}
