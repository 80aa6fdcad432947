use superagent_sandbox::SandboxError;
use superagent_storage::StorageError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum TaskError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Sandbox error: {0}")]
    Sandbox(#[from] SandboxError),

    #[error("Illegal operation: {0}")]
    IllegalOperation(String),

    #[error("Topic not found: {0}")]
    TopicNotFound(String),

    #[error("Task not found: {0}")]
    TaskNotFound(String),

    #[error("Collaborator error: {0}")]
    Collaborator(String),
}

pub type Result<T> = std::result::Result<T, TaskError>;
