// ABOUTME: Task request and instruction types
// ABOUTME: Instructions arrive as wire strings and are dispatched by exhaustive match

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// What the caller wants done with the topic's task
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Instruction {
    /// Regular chat turn
    #[default]
    Normal,
    /// Stop the running task
    Interrupted { reason: String },
    /// Switch the topic's task mode, then continue like a chat turn
    SwitchMode { task_mode: String },
}

impl Instruction {
    /// Parse a wire value. Unknown values fall back to `Normal`.
    pub fn parse(raw: &str, task_mode: Option<&str>) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "interrupted" | "interrupt" => Self::Interrupted {
                reason: String::new(),
            },
            "follow_up" | "switch_mode" => match task_mode {
                Some(mode) if !mode.is_empty() => Self::SwitchMode {
                    task_mode: mode.to_string(),
                },
                _ => Self::Normal,
            },
            _ => Self::Normal,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::Interrupted { .. } => "interrupted",
            Self::SwitchMode { .. } => "switch_mode",
        }
    }
}

/// A request to run (or interrupt) a task on a topic
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub user_id: String,
    pub organization_code: String,
    pub prompt: String,
    #[serde(default)]
    pub attachments: Vec<JsonValue>,
    /// File ids the user mentioned; resolved to sandbox-readable references before dispatch
    #[serde(default)]
    pub mentioned_file_ids: Vec<String>,
    #[serde(default)]
    pub model_id: Option<String>,
    #[serde(default)]
    pub instruction: Instruction,
}

impl TaskRequest {
    pub fn chat(
        user_id: impl Into<String>,
        organization_code: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            user_id: user_id.into(),
            organization_code: organization_code.into(),
            prompt: prompt.into(),
            attachments: Vec::new(),
            mentioned_file_ids: Vec::new(),
            model_id: None,
            instruction: Instruction::Normal,
        }
    }

    pub fn with_instruction(mut self, instruction: Instruction) -> Self {
        self.instruction = instruction;
        self
    }
}
