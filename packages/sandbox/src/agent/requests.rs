// ABOUTME: Request payloads for the in-sandbox agent protocol
// ABOUTME: Init, chat and interrupt messages share the chat endpoint and differ by `type`

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use superagent_core::constants::DEFAULT_TASK_MODE;

/// A file or directory reference already resolved to something the sandbox can fetch
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Mention {
    #[serde(rename = "type")]
    pub mention_type: String,
    pub file_path: String,
    #[serde(default)]
    pub metadata: JsonValue,
}

/// Bootstrap payload sent once to a fresh sandbox
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InitAgentRequest {
    pub message_id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub user_id: String,
    pub organization_code: String,
    pub project_id: String,
    pub topic_id: String,
    pub work_dir: String,
    pub task_mode: String,
    pub agent_mode: String,
    /// Opaque credentials from the credential service
    pub upload_config: JsonValue,
    pub message_subscription_config: CallbackTarget,
    pub sts_token_refresh: CallbackTarget,
    #[serde(default)]
    pub metadata: JsonValue,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CallbackTarget {
    pub method: String,
    pub url: String,
}

impl CallbackTarget {
    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: "POST".to_string(),
            url: url.into(),
        }
    }
}

impl InitAgentRequest {
    pub fn new(
        user_id: impl Into<String>,
        organization_code: impl Into<String>,
        project_id: impl Into<String>,
        topic_id: impl Into<String>,
    ) -> Self {
        Self {
            message_id: fresh_message_id(),
            message_type: "init".to_string(),
            user_id: user_id.into(),
            organization_code: organization_code.into(),
            project_id: project_id.into(),
            topic_id: topic_id.into(),
            work_dir: String::new(),
            task_mode: DEFAULT_TASK_MODE.to_string(),
            agent_mode: "general".to_string(),
            upload_config: JsonValue::Null,
            message_subscription_config: CallbackTarget::post(""),
            sts_token_refresh: CallbackTarget::post(""),
            metadata: JsonValue::Null,
        }
    }

    pub fn with_callbacks(mut self, message_url: &str, credential_refresh_url: &str) -> Self {
        self.message_subscription_config = CallbackTarget::post(message_url);
        self.sts_token_refresh = CallbackTarget::post(credential_refresh_url);
        self
    }

    pub fn with_upload_config(mut self, upload_config: JsonValue) -> Self {
        self.upload_config = upload_config;
        self
    }

    pub fn with_work_dir(mut self, work_dir: impl Into<String>) -> Self {
        self.work_dir = work_dir.into();
        self
    }

    pub fn with_task_mode(mut self, task_mode: impl Into<String>) -> Self {
        self.task_mode = task_mode.into();
        self
    }
}

/// A user prompt pushed to the agent
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatMessageRequest {
    pub message_id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub user_id: String,
    pub task_id: String,
    pub prompt: String,
    pub task_mode: String,
    pub agent_mode: String,
    #[serde(default)]
    pub attachments: Vec<JsonValue>,
    #[serde(default)]
    pub mentions: Vec<Mention>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model_id: Option<String>,
    #[serde(default)]
    pub dynamic_config: JsonValue,
}

impl ChatMessageRequest {
    /// Every call gets a fresh message id
    pub fn new(
        user_id: impl Into<String>,
        task_id: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            message_id: fresh_message_id(),
            message_type: "chat".to_string(),
            user_id: user_id.into(),
            task_id: task_id.into(),
            prompt: prompt.into(),
            task_mode: DEFAULT_TASK_MODE.to_string(),
            agent_mode: "general".to_string(),
            attachments: Vec::new(),
            mentions: Vec::new(),
            model_id: None,
            dynamic_config: JsonValue::Null,
        }
    }

    pub fn with_task_mode(mut self, task_mode: impl Into<String>) -> Self {
        let task_mode = task_mode.into();
        if !task_mode.is_empty() {
            self.task_mode = task_mode;
        }
        self
    }

    pub fn with_attachments(mut self, attachments: Vec<JsonValue>) -> Self {
        self.attachments = attachments;
        self
    }

    pub fn with_mentions(mut self, mentions: Vec<Mention>) -> Self {
        self.mentions = mentions;
        self
    }

    pub fn with_model_id(mut self, model_id: Option<String>) -> Self {
        self.model_id = model_id;
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InterruptRequest {
    pub message_id: String,
    #[serde(rename = "type")]
    pub message_type: String,
    pub user_id: String,
    pub task_id: String,
    pub remark: String,
}

impl InterruptRequest {
    pub fn new(
        user_id: impl Into<String>,
        task_id: impl Into<String>,
        remark: impl Into<String>,
    ) -> Self {
        Self {
            message_id: fresh_message_id(),
            message_type: "interrupt".to_string(),
            user_id: user_id.into(),
            task_id: task_id.into(),
            remark: remark.into(),
        }
    }
}

fn fresh_message_id() -> String {
    uuid::Uuid::new_v4().simple().to_string()
}
