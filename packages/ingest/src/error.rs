use superagent_storage::StorageError;
use superagent_tasks::TaskError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum IngestError {
    #[error("Storage error: {0}")]
    Storage(#[from] StorageError),

    #[error("Task error: {0}")]
    Task(#[from] TaskError),

    #[error("Lock error: {0}")]
    Lock(String),

    #[error("Invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("No topic for sandbox: {0}")]
    TopicNotFound(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Ingestion queue is closed")]
    QueueClosed,
}

impl From<sqlx::Error> for IngestError {
    fn from(err: sqlx::Error) -> Self {
        Self::Storage(StorageError::Database(err))
    }
}

pub type Result<T> = std::result::Result<T, IngestError>;
