// ABOUTME: Integration tests for the sandbox lifecycle against a mocked gateway
// ABOUTME: Covers create, ready-wait, workspace readiness and chat dispatch over HTTP

use serde_json::json;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use superagent_core::GatewayConfig;
use superagent_sandbox::{
    ensure_sandbox_available, wait_for_workspace_ready, ChatMessageRequest, GatewaySandboxAgent,
    HttpSandboxGateway, SandboxAgent, SandboxError, SandboxGateway, SandboxState, StartBudget,
};
use wiremock::matchers::{body_partial_json, header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn gateway_config(server: &MockServer) -> GatewayConfig {
    GatewayConfig {
        base_url: server.uri(),
        token: "gw-secret".to_string(),
        create_timeout: Duration::from_secs(5),
        status_timeout: Duration::from_secs(5),
        proxy_timeout: Duration::from_secs(5),
    }
}

fn status_body(status: &str) -> serde_json::Value {
    json!({"code": 1000, "message": "ok", "data": {"sandbox_id": "sb-1", "status": status}})
}

/// Test complete sandbox lifecycle: missing → create → running → workspace ready → chat
#[tokio::test]
async fn test_sandbox_lifecycle_over_http() {
    let server = MockServer::start().await;

    // First lookup: the sandbox does not exist yet
    Mock::given(method("GET"))
        .and(path("/api/v1/sandboxes/sb-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 4004})))
        .up_to_n_times(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/sandboxes/sb-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(status_body("Running")))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/sandboxes"))
        .and(header("token", "gw-secret"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 1000,
            "data": {"sandbox_id": "sb-1"}
        })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api/v1/sandboxes/sb-1/proxy/api/v1/workspace/status"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 1000,
            "data": {"status": 2}
        })))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/sandboxes/sb-1/proxy/api/v1/messages/chat"))
        .and(body_partial_json(json!({"type": "chat", "prompt": "write tests"})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"code": 1000})))
        .expect(1)
        .mount(&server)
        .await;

    let gateway: Arc<dyn SandboxGateway> =
        Arc::new(HttpSandboxGateway::new(&gateway_config(&server)).unwrap());
    let agent = GatewaySandboxAgent::new(gateway.clone());

    let sandbox_id = ensure_sandbox_available(
        gateway.as_ref(),
        "sb-1",
        "proj-1",
        "/workspace",
        StartBudget::default(),
    )
    .await
    .unwrap();
    assert_eq!(sandbox_id, "sb-1");

    let info = gateway.get_status("sb-1").await.unwrap();
    assert_eq!(info.status, SandboxState::Running);

    wait_for_workspace_ready(&agent, "sb-1", Duration::from_secs(5), Duration::from_millis(10))
        .await
        .unwrap();

    let response = agent
        .send_chat("sb-1", &ChatMessageRequest::new("user-1", "task-1", "write tests"))
        .await
        .unwrap();
    assert!(response.success);
}

/// Gateway rejections surface with the gateway's own code
#[tokio::test]
async fn test_create_rejection_is_reported() {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/api/v1/sandboxes/sb-9"))
        .respond_with(ResponseTemplate::new(404))
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/api/v1/sandboxes"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "code": 2000,
            "message": "no capacity"
        })))
        .mount(&server)
        .await;

    let gateway = HttpSandboxGateway::new(&gateway_config(&server)).unwrap();
    let err = ensure_sandbox_available(
        &gateway,
        "sb-9",
        "proj-1",
        "/workspace",
        StartBudget::default(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, SandboxError::CreateFailed { .. }));
    assert_eq!(err.code(), 2000);
}
