// ABOUTME: Agent protocol spoken with the runtime inside a sandbox
// ABOUTME: Init, chat, interrupt and workspace status calls routed through the gateway proxy

pub mod http;
pub mod requests;

pub use http::GatewaySandboxAgent;
pub use requests::{
    CallbackTarget, ChatMessageRequest, InitAgentRequest, InterruptRequest, Mention,
};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{Result, SandboxError};
use crate::gateway::GatewayResponse;

/// Normalized answer from the agent runtime
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AgentResponse {
    pub success: bool,
    pub code: i64,
    pub message: String,
    pub data: JsonValue,
}

impl AgentResponse {
    /// Turn an unsuccessful response into `SandboxError::Operation`
    pub fn into_result(self, operation: &str) -> Result<Self> {
        if self.success {
            Ok(self)
        } else {
            Err(SandboxError::Operation {
                operation: operation.to_string(),
                code: self.code,
                message: self.message,
            })
        }
    }
}

impl From<GatewayResponse> for AgentResponse {
    fn from(response: GatewayResponse) -> Self {
        Self {
            success: response.is_success(),
            code: response.code,
            message: response.message,
            data: response.data,
        }
    }
}

/// Workspace state inside a sandbox
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkspaceStatus {
    Uninitialized,
    Initializing,
    Ready,
    Error,
}

impl WorkspaceStatus {
    pub fn from_code(code: i64) -> Option<Self> {
        match code {
            0 => Some(Self::Uninitialized),
            1 => Some(Self::Initializing),
            2 => Some(Self::Ready),
            -1 => Some(Self::Error),
            _ => None,
        }
    }

    pub fn code(&self) -> i64 {
        match self {
            Self::Uninitialized => 0,
            Self::Initializing => 1,
            Self::Ready => 2,
            Self::Error => -1,
        }
    }
}

#[async_trait]
pub trait SandboxAgent: Send + Sync {
    async fn init_agent(&self, sandbox_id: &str, request: &InitAgentRequest)
        -> Result<AgentResponse>;

    async fn send_chat(&self, sandbox_id: &str, request: &ChatMessageRequest)
        -> Result<AgentResponse>;

    /// Best effort; the sandbox may already be finishing the task
    async fn send_interrupt(
        &self,
        sandbox_id: &str,
        request: &InterruptRequest,
    ) -> Result<AgentResponse>;

    async fn get_workspace_status(&self, sandbox_id: &str) -> Result<WorkspaceStatus>;
}
