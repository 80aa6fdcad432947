// ABOUTME: Clients for the remote sandbox gateway and the agent runtime inside each sandbox
// ABOUTME: Includes deadline-bounded readiness waits and sandbox provisioning

pub mod agent;
pub mod error;
pub mod gateway;
pub mod readiness;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use agent::{
    AgentResponse, CallbackTarget, ChatMessageRequest, GatewaySandboxAgent, InitAgentRequest,
    InterruptRequest, Mention, SandboxAgent, WorkspaceStatus,
};
pub use error::{Result, SandboxError};
pub use gateway::{
    GatewayResponse, HttpSandboxGateway, SandboxGateway, SandboxState, SandboxStatusInfo,
};
pub use readiness::{ensure_sandbox_available, wait_for_workspace_ready, wait_ready, StartBudget};

// Re-export so callers can build proxy requests without depending on reqwest
pub use reqwest::Method;
