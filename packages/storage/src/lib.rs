// ABOUTME: Durable state store for projects, topics, tasks, task messages and token usage
// ABOUTME: SQLite via sqlx with embedded migrations; one TaskStorage handle shared by all services

pub mod messages;
pub mod models;
pub mod projects;
pub mod tasks;
pub mod token_usage;
pub mod topics;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use models::{
    NewProject, NewTask, NewTopic, ProcessingStatus, Project, SenderType, Task, TaskMessage,
    TaskStatus, TokenUsageRecord, Topic,
};

use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;
use std::time::Duration;
use thiserror::Error;
use tracing::info;

#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
    #[error("Record not found: {0}")]
    NotFound(String),
    #[error("Write conflict: {0}")]
    Conflict(String),
    #[error("Invalid status: {0}")]
    InvalidStatus(String),
    #[error("Invalid timestamp: {0}")]
    InvalidTimestamp(String),
    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Open a connection pool, creating the database file when missing
pub async fn connect(database_url: &str) -> Result<SqlitePool> {
    let options = SqliteConnectOptions::from_str(database_url)?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .busy_timeout(Duration::from_secs(5))
        .foreign_keys(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(8)
        .connect_with(options)
        .await?;

    info!(database_url = %database_url, "Connected to task database");
    Ok(pool)
}

/// Apply the embedded schema migrations
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

/// Handle to every table the orchestrator owns
#[derive(Clone)]
pub struct TaskStorage {
    pool: SqlitePool,
}

impl TaskStorage {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

/// Fixed-width UTC timestamp so text comparison matches time order
pub fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|_| StorageError::InvalidTimestamp(raw.to_string()))
}

pub(crate) fn parse_optional_timestamp(raw: Option<String>) -> Result<Option<DateTime<Utc>>> {
    raw.as_deref().map(parse_timestamp).transpose()
}

pub(crate) fn parse_optional_json(raw: Option<String>) -> Option<serde_json::Value> {
    raw.and_then(|s| serde_json::from_str(&s).ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let earlier = Utc.with_ymd_and_hms(2026, 1, 1, 10, 0, 0).unwrap();
        let later = earlier + chrono::Duration::milliseconds(1500);

        let a = format_timestamp(earlier);
        let b = format_timestamp(later);

        assert_eq!(a, "2026-01-01T10:00:00.000000Z");
        assert!(a < b);
        assert_eq!(parse_timestamp(&b).unwrap(), later);
    }

    #[test]
    fn test_invalid_timestamp() {
        assert!(matches!(
            parse_timestamp("yesterday"),
            Err(StorageError::InvalidTimestamp(_))
        ));
    }

    #[tokio::test]
    async fn test_migrations_create_tables() {
        let pool = test_utils::memory_pool().await;

        let tables: Vec<String> =
            sqlx::query_scalar("SELECT name FROM sqlite_master WHERE type = 'table'")
                .fetch_all(&pool)
                .await
                .unwrap();

        for table in [
            "projects",
            "topics",
            "tasks",
            "task_messages",
            "token_usage_records",
            "sandbox_locks",
            "dead_letters",
        ] {
            assert!(tables.iter().any(|t| t == table), "missing table {}", table);
        }
    }
}
