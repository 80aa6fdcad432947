// ABOUTME: Sandbox gateway abstraction for provisioning sandboxes and polling their status
// ABOUTME: Defines the gateway response envelope and the sandbox status model

pub mod http;

pub use http::HttpSandboxGateway;

use async_trait::async_trait;
use reqwest::Method;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::error::{Result, CODE_NOT_FOUND, CODE_SUCCESS};

/// Lifecycle state reported by the gateway
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SandboxState {
    /// Provisioning in progress
    Pending,
    /// Ready to accept agent protocol calls
    Running,
    /// The container stopped
    Exited,
    /// Provisioning failed permanently
    Error,
    /// The gateway does not know this sandbox (yet)
    NotFound,
    Unknown,
}

impl SandboxState {
    pub fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "running" | "ready" => Self::Running,
            "pending" | "creating" | "starting" => Self::Pending,
            "exited" | "stopped" => Self::Exited,
            "error" | "failed" => Self::Error,
            "not_found" | "notfound" => Self::NotFound,
            _ => Self::Unknown,
        }
    }

    pub fn is_ready(&self) -> bool {
        matches!(self, Self::Running)
    }

    /// Terminal failure; waiting longer will not help
    pub fn is_failed(&self) -> bool {
        matches!(self, Self::Exited | Self::Error)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SandboxStatusInfo {
    pub sandbox_id: String,
    pub status: SandboxState,
    pub exists: bool,
}

impl SandboxStatusInfo {
    pub fn new(sandbox_id: impl Into<String>, status: SandboxState) -> Self {
        Self {
            sandbox_id: sandbox_id.into(),
            exists: status != SandboxState::NotFound,
            status,
        }
    }
}

/// `{code, message, data}` envelope shared by the gateway and proxied sandbox calls
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayResponse {
    pub code: i64,
    #[serde(default)]
    pub message: String,
    #[serde(default)]
    pub data: JsonValue,
}

impl GatewayResponse {
    pub fn is_success(&self) -> bool {
        self.code == CODE_SUCCESS
    }

    pub fn is_not_found(&self) -> bool {
        self.code == CODE_NOT_FOUND
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            code: CODE_NOT_FOUND,
            message: message.into(),
            data: JsonValue::Null,
        }
    }

    /// String field from the `data` object
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data.get(key).and_then(JsonValue::as_str)
    }
}

/// Remote sandbox provisioning API
#[async_trait]
pub trait SandboxGateway: Send + Sync {
    /// Create (or look up) a sandbox. Returns the id the gateway assigned.
    async fn create_sandbox(
        &self,
        project_id: &str,
        requested_sandbox_id: &str,
        work_dir: &str,
    ) -> Result<String>;

    /// Current status of a sandbox; an unknown sandbox is `NotFound`, not an error
    async fn get_status(&self, sandbox_id: &str) -> Result<SandboxStatusInfo>;

    /// Status of several sandboxes in one call
    async fn get_batch_status(&self, sandbox_ids: &[String]) -> Result<Vec<SandboxStatusInfo>>;

    /// Forward a request to an API served inside the sandbox
    async fn proxy(
        &self,
        sandbox_id: &str,
        method: Method,
        path: &str,
        body: Option<JsonValue>,
    ) -> Result<GatewayResponse>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_states() {
        assert_eq!(SandboxState::parse("Running"), SandboxState::Running);
        assert_eq!(SandboxState::parse("READY"), SandboxState::Running);
        assert_eq!(SandboxState::parse("Pending"), SandboxState::Pending);
        assert_eq!(SandboxState::parse("Exited"), SandboxState::Exited);
        assert_eq!(SandboxState::parse("error"), SandboxState::Error);
        assert_eq!(SandboxState::parse("NOT_FOUND"), SandboxState::NotFound);
        assert_eq!(SandboxState::parse("weird"), SandboxState::Unknown);
    }

    #[test]
    fn test_not_found_does_not_exist() {
        let info = SandboxStatusInfo::new("sb-1", SandboxState::NotFound);
        assert!(!info.exists);
        assert!(SandboxStatusInfo::new("sb-1", SandboxState::Pending).exists);
    }

    #[test]
    fn test_envelope_defaults() {
        let response: GatewayResponse = serde_json::from_value(json!({"code": 1000})).unwrap();
        assert!(response.is_success());
        assert_eq!(response.message, "");
        assert_eq!(response.data, JsonValue::Null);
    }
}
