// ABOUTME: Persistent entities for projects, topics, tasks, task messages and token usage
// ABOUTME: Status enums use snake_case strings both in JSON and in the database

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{Result, StorageError};

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Waiting,
    Running,
    Finished,
    Error,
    Suspended,
    Stopped,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::Running => "running",
            Self::Finished => "finished",
            Self::Error => "error",
            Self::Suspended => "suspended",
            Self::Stopped => "stopped",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "waiting" => Ok(Self::Waiting),
            "running" => Ok(Self::Running),
            "finished" => Ok(Self::Finished),
            "error" => Ok(Self::Error),
            "suspended" => Ok(Self::Suspended),
            "stopped" => Ok(Self::Stopped),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }

    /// Terminal statuses end a task; the next turn gets a new task
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::Finished | Self::Error | Self::Suspended | Self::Stopped
        )
    }

    /// Whether a task in this status may move to `next`.
    ///
    /// WAITING may move anywhere else. RUNNING may be refreshed or finish.
    /// Terminal statuses never change again.
    pub fn can_transition_to(&self, next: TaskStatus) -> bool {
        match self {
            Self::Waiting => next != Self::Waiting,
            Self::Running => next == Self::Running || next.is_terminal(),
            Self::Finished | Self::Error | Self::Suspended | Self::Stopped => false,
        }
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Ingestion bookkeeping for a stored task message
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingStatus {
    Pending,
    Processing,
    Processed,
    Failed,
}

impl ProcessingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(Self::Pending),
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SenderType {
    User,
    Assistant,
}

impl SenderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
        }
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(s: &str) -> Result<Self> {
        match s {
            "user" => Ok(Self::User),
            "assistant" => Ok(Self::Assistant),
            _ => Err(StorageError::InvalidStatus(s.to_string())),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub user_id: String,
    pub organization_code: String,
    pub name: String,
    pub current_topic_id: Option<String>,
    pub current_topic_status: Option<TaskStatus>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct NewProject {
    pub user_id: String,
    pub organization_code: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Topic {
    pub id: String,
    pub project_id: String,
    pub workspace_id: String,
    pub user_id: String,
    pub organization_code: String,
    pub name: String,
    /// Weak reference; the gateway decides whether this sandbox exists
    pub sandbox_id: Option<String>,
    pub current_task_id: Option<String>,
    pub current_task_status: Option<TaskStatus>,
    pub task_mode: String,
    pub work_dir: String,
    pub created_at: DateTime<Utc>,
    /// Staleness marker and optimistic-concurrency token
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, Default)]
pub struct NewTopic {
    pub project_id: String,
    pub workspace_id: String,
    pub user_id: String,
    pub organization_code: String,
    pub name: String,
    pub sandbox_id: Option<String>,
    pub task_mode: Option<String>,
    pub work_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub topic_id: String,
    pub project_id: String,
    pub user_id: String,
    pub organization_code: String,
    pub sandbox_id: Option<String>,
    /// Id assigned by the sandbox task engine, empty until acknowledged
    pub external_task_id: String,
    pub prompt: String,
    pub attachments: JsonValue,
    pub task_mode: String,
    pub work_dir: String,
    pub status: TaskStatus,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewTask {
    pub topic_id: String,
    pub project_id: String,
    pub user_id: String,
    pub organization_code: String,
    pub sandbox_id: Option<String>,
    pub prompt: String,
    pub attachments: JsonValue,
    pub task_mode: String,
    pub work_dir: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskMessage {
    pub id: String,
    pub message_id: String,
    pub topic_id: String,
    pub task_id: String,
    pub seq_id: i64,
    pub sender_type: SenderType,
    pub sender_uid: String,
    pub receiver_uid: String,
    pub message_type: String,
    pub status: String,
    pub content: String,
    pub steps: Option<JsonValue>,
    pub tool: Option<JsonValue>,
    pub attachments: JsonValue,
    pub event: String,
    pub show_in_ui: bool,
    pub processing_status: ProcessingStatus,
    pub error_message: Option<String>,
    pub retry_count: i32,
    pub raw_data: Option<JsonValue>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TokenUsageRecord {
    pub id: String,
    pub topic_id: String,
    pub task_id: String,
    pub sandbox_id: String,
    pub organization_code: String,
    pub user_id: String,
    pub task_status: String,
    pub usage_type: String,
    pub total_input_tokens: i64,
    pub total_output_tokens: i64,
    pub total_tokens: i64,
    pub model_id: String,
    pub model_name: String,
    pub cached_tokens: i64,
    pub cache_write_tokens: i64,
    pub reasoning_tokens: i64,
    pub usage_details: Option<JsonValue>,
    pub created_at: Option<DateTime<Utc>>,
}
