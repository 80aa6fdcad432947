// ABOUTME: Scripted gateway and recording agent doubles for sandbox-driven tests
// ABOUTME: Shared with dependent packages through the test-utils feature

use async_trait::async_trait;
use reqwest::Method;
use serde_json::Value as JsonValue;
use std::collections::VecDeque;
use std::sync::Mutex;

use crate::agent::{
    AgentResponse, ChatMessageRequest, InitAgentRequest, InterruptRequest, SandboxAgent,
    WorkspaceStatus,
};
use crate::error::{Result, SandboxError, CODE_SUCCESS};
use crate::gateway::{GatewayResponse, SandboxGateway, SandboxState, SandboxStatusInfo};

/// Gateway double that answers status polls from a script.
///
/// Once the script runs out the last state repeats. Sandboxes created through it
/// keep the requested id unless `returned_id` is set.
pub struct ScriptedGateway {
    states: Mutex<VecDeque<SandboxState>>,
    last: Mutex<SandboxState>,
    status_calls: Mutex<u32>,
    created: Mutex<Vec<String>>,
    returned_id: Option<String>,
    batch: Mutex<Vec<SandboxStatusInfo>>,
}

impl ScriptedGateway {
    pub fn new(states: impl IntoIterator<Item = SandboxState>) -> Self {
        Self {
            states: Mutex::new(states.into_iter().collect()),
            last: Mutex::new(SandboxState::NotFound),
            status_calls: Mutex::new(0),
            created: Mutex::new(Vec::new()),
            returned_id: None,
            batch: Mutex::new(Vec::new()),
        }
    }

    /// Make `create_sandbox` answer with a different id than requested
    pub fn returning_id(mut self, id: impl Into<String>) -> Self {
        self.returned_id = Some(id.into());
        self
    }

    pub fn with_batch_status(self, statuses: Vec<SandboxStatusInfo>) -> Self {
        *self.batch.lock().unwrap() = statuses;
        self
    }

    pub fn status_calls(&self) -> u32 {
        *self.status_calls.lock().unwrap()
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl SandboxGateway for ScriptedGateway {
    async fn create_sandbox(
        &self,
        _project_id: &str,
        requested_sandbox_id: &str,
        _work_dir: &str,
    ) -> Result<String> {
        self.created
            .lock()
            .unwrap()
            .push(requested_sandbox_id.to_string());
        Ok(self
            .returned_id
            .clone()
            .unwrap_or_else(|| requested_sandbox_id.to_string()))
    }

    async fn get_status(&self, sandbox_id: &str) -> Result<SandboxStatusInfo> {
        *self.status_calls.lock().unwrap() += 1;
        let next = self.states.lock().unwrap().pop_front();
        let state = match next {
            Some(state) => {
                *self.last.lock().unwrap() = state;
                state
            }
            None => *self.last.lock().unwrap(),
        };
        Ok(SandboxStatusInfo::new(sandbox_id, state))
    }

    async fn get_batch_status(&self, sandbox_ids: &[String]) -> Result<Vec<SandboxStatusInfo>> {
        let batch = self.batch.lock().unwrap();
        Ok(sandbox_ids
            .iter()
            .map(|id| {
                batch
                    .iter()
                    .find(|s| &s.sandbox_id == id)
                    .cloned()
                    .unwrap_or_else(|| SandboxStatusInfo::new(id.as_str(), SandboxState::NotFound))
            })
            .collect())
    }

    async fn proxy(
        &self,
        _sandbox_id: &str,
        _method: Method,
        _path: &str,
        _body: Option<JsonValue>,
    ) -> Result<GatewayResponse> {
        Ok(GatewayResponse {
            code: CODE_SUCCESS,
            message: "ok".to_string(),
            data: JsonValue::Null,
        })
    }
}

/// Agent double that records every call and reports a fixed workspace status
pub struct RecordingAgent {
    pub workspace: Mutex<VecDeque<WorkspaceStatus>>,
    pub inits: Mutex<Vec<(String, InitAgentRequest)>>,
    pub chats: Mutex<Vec<(String, ChatMessageRequest)>>,
    pub interrupts: Mutex<Vec<(String, InterruptRequest)>>,
    /// When set, `send_chat` fails with this message
    pub chat_failure: Option<String>,
}

impl RecordingAgent {
    pub fn ready() -> Self {
        Self::with_workspace([WorkspaceStatus::Ready])
    }

    pub fn with_workspace(statuses: impl IntoIterator<Item = WorkspaceStatus>) -> Self {
        Self {
            workspace: Mutex::new(statuses.into_iter().collect()),
            inits: Mutex::new(Vec::new()),
            chats: Mutex::new(Vec::new()),
            interrupts: Mutex::new(Vec::new()),
            chat_failure: None,
        }
    }

    pub fn failing_chat(mut self, message: impl Into<String>) -> Self {
        self.chat_failure = Some(message.into());
        self
    }

    pub fn chat_count(&self) -> usize {
        self.chats.lock().unwrap().len()
    }

    pub fn init_count(&self) -> usize {
        self.inits.lock().unwrap().len()
    }

    pub fn interrupt_count(&self) -> usize {
        self.interrupts.lock().unwrap().len()
    }

    fn accepted() -> AgentResponse {
        AgentResponse {
            success: true,
            code: CODE_SUCCESS,
            message: "ok".to_string(),
            data: JsonValue::Null,
        }
    }
}

#[async_trait]
impl SandboxAgent for RecordingAgent {
    async fn init_agent(
        &self,
        sandbox_id: &str,
        request: &InitAgentRequest,
    ) -> Result<AgentResponse> {
        self.inits
            .lock()
            .unwrap()
            .push((sandbox_id.to_string(), request.clone()));
        Ok(Self::accepted())
    }

    async fn send_chat(
        &self,
        sandbox_id: &str,
        request: &ChatMessageRequest,
    ) -> Result<AgentResponse> {
        self.chats
            .lock()
            .unwrap()
            .push((sandbox_id.to_string(), request.clone()));
        match &self.chat_failure {
            Some(message) => Err(SandboxError::Operation {
                operation: "send_chat".to_string(),
                code: 2000,
                message: message.clone(),
            }),
            None => Ok(Self::accepted()),
        }
    }

    async fn send_interrupt(
        &self,
        sandbox_id: &str,
        request: &InterruptRequest,
    ) -> Result<AgentResponse> {
        self.interrupts
            .lock()
            .unwrap()
            .push((sandbox_id.to_string(), request.clone()));
        Ok(Self::accepted())
    }

    async fn get_workspace_status(&self, _sandbox_id: &str) -> Result<WorkspaceStatus> {
        let mut statuses = self.workspace.lock().unwrap();
        let status = if statuses.len() > 1 {
            statuses.pop_front()
        } else {
            statuses.front().copied()
        };
        Ok(status.unwrap_or(WorkspaceStatus::Ready))
    }
}
