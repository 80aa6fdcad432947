// ABOUTME: Agent protocol client that proxies every call through the sandbox gateway
// ABOUTME: Failed responses become SandboxError::Operation; no retries happen here

use async_trait::async_trait;
use reqwest::Method;
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{
    AgentResponse, ChatMessageRequest, InitAgentRequest, InterruptRequest, SandboxAgent,
    WorkspaceStatus,
};
use crate::error::{Result, SandboxError};
use crate::gateway::SandboxGateway;

const CHAT_PATH: &str = "api/v1/messages/chat";
const WORKSPACE_STATUS_PATH: &str = "api/v1/workspace/status";

pub struct GatewaySandboxAgent {
    gateway: Arc<dyn SandboxGateway>,
}

impl GatewaySandboxAgent {
    pub fn new(gateway: Arc<dyn SandboxGateway>) -> Self {
        Self { gateway }
    }

    async fn post_message<T: Serialize + Sync>(
        &self,
        operation: &str,
        sandbox_id: &str,
        request: &T,
    ) -> Result<AgentResponse> {
        let body = serde_json::to_value(request)
            .map_err(|e| SandboxError::InvalidResponse(format!("encode {}: {}", operation, e)))?;

        let response: AgentResponse = self
            .gateway
            .proxy(sandbox_id, Method::POST, CHAT_PATH, Some(body))
            .await?
            .into();

        if !response.success {
            warn!(
                sandbox_id = %sandbox_id,
                operation = %operation,
                code = response.code,
                message = %response.message,
                "Agent rejected request"
            );
        }
        response.into_result(operation)
    }
}

#[async_trait]
impl SandboxAgent for GatewaySandboxAgent {
    async fn init_agent(
        &self,
        sandbox_id: &str,
        request: &InitAgentRequest,
    ) -> Result<AgentResponse> {
        info!(sandbox_id = %sandbox_id, topic_id = %request.topic_id, "Initializing agent");
        self.post_message("init_agent", sandbox_id, request).await
    }

    async fn send_chat(
        &self,
        sandbox_id: &str,
        request: &ChatMessageRequest,
    ) -> Result<AgentResponse> {
        info!(
            sandbox_id = %sandbox_id,
            task_id = %request.task_id,
            message_id = %request.message_id,
            "Sending chat message to agent"
        );
        self.post_message("send_chat", sandbox_id, request).await
    }

    async fn send_interrupt(
        &self,
        sandbox_id: &str,
        request: &InterruptRequest,
    ) -> Result<AgentResponse> {
        info!(sandbox_id = %sandbox_id, task_id = %request.task_id, "Sending interrupt to agent");
        self.post_message("send_interrupt", sandbox_id, request).await
    }

    async fn get_workspace_status(&self, sandbox_id: &str) -> Result<WorkspaceStatus> {
        let response: AgentResponse = self
            .gateway
            .proxy(sandbox_id, Method::GET, WORKSPACE_STATUS_PATH, None)
            .await?
            .into();
        let response = response.into_result("get_workspace_status")?;

        let code = response
            .data
            .get("status")
            .and_then(|v| v.as_i64())
            .ok_or_else(|| {
                SandboxError::InvalidResponse("workspace status missing from response".to_string())
            })?;

        debug!(sandbox_id = %sandbox_id, status = code, "Workspace status retrieved");
        WorkspaceStatus::from_code(code).ok_or_else(|| {
            SandboxError::InvalidResponse(format!("unknown workspace status {}", code))
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{GatewayResponse, SandboxStatusInfo};
    use mockall::mock;
    use mockall::predicate::eq;
    use serde_json::{json, Value as JsonValue};

    mock! {
        Gateway {}

        #[async_trait]
        impl SandboxGateway for Gateway {
            async fn create_sandbox(
                &self,
                project_id: &str,
                requested_sandbox_id: &str,
                work_dir: &str,
            ) -> Result<String>;
            async fn get_status(&self, sandbox_id: &str) -> Result<SandboxStatusInfo>;
            async fn get_batch_status(&self, sandbox_ids: &[String]) -> Result<Vec<SandboxStatusInfo>>;
            async fn proxy(
                &self,
                sandbox_id: &str,
                method: Method,
                path: &str,
                body: Option<JsonValue>,
            ) -> Result<GatewayResponse>;
        }
    }

    fn ok(data: JsonValue) -> Result<GatewayResponse> {
        Ok(GatewayResponse {
            code: 1000,
            message: "ok".to_string(),
            data,
        })
    }

    #[tokio::test]
    async fn test_send_chat_posts_chat_payload() {
        let mut gateway = MockGateway::new();
        gateway
            .expect_proxy()
            .withf(|sandbox_id, method, path, body| {
                let body = body.as_ref().unwrap();
                sandbox_id == "sb-1"
                    && *method == Method::POST
                    && path == "api/v1/messages/chat"
                    && body["type"] == "chat"
                    && body["prompt"] == "hello"
            })
            .times(1)
            .returning(|_, _, _, _| ok(json!({"accepted": true})));

        let agent = GatewaySandboxAgent::new(Arc::new(gateway));
        let request = ChatMessageRequest::new("user-1", "task-1", "hello");
        let response = agent.send_chat("sb-1", &request).await.unwrap();
        assert!(response.success);
        assert_eq!(response.data["accepted"], true);
    }

    #[tokio::test]
    async fn test_rejected_interrupt_is_operation_error() {
        let mut gateway = MockGateway::new();
        gateway.expect_proxy().times(1).returning(|_, _, _, _| {
            Ok(GatewayResponse {
                code: 2000,
                message: "no running task".to_string(),
                data: JsonValue::Null,
            })
        });

        let agent = GatewaySandboxAgent::new(Arc::new(gateway));
        let err = agent
            .send_interrupt("sb-1", &InterruptRequest::new("user-1", "task-1", "stop"))
            .await
            .unwrap_err();
        assert!(matches!(err, SandboxError::Operation { code: 2000, .. }));
    }

    #[tokio::test]
    async fn test_workspace_status_is_decoded() {
        let mut gateway = MockGateway::new();
        gateway
            .expect_proxy()
            .with(
                eq("sb-1"),
                eq(Method::GET),
                eq("api/v1/workspace/status"),
                eq(None::<JsonValue>),
            )
            .returning(|_, _, _, _| ok(json!({"status": 1})));

        let agent = GatewaySandboxAgent::new(Arc::new(gateway));
        assert_eq!(
            agent.get_workspace_status("sb-1").await.unwrap(),
            WorkspaceStatus::Initializing
        );
    }
}
