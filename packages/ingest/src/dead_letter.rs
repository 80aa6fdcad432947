// ABOUTME: Durable record of messages the consumer acknowledged without processing
// ABOUTME: SQLite sink for deployments, in-memory sink for tests

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use std::sync::Mutex;

use superagent_core::generate_id;
use superagent_storage::{format_timestamp, parse_timestamp};

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeadLetterReason {
    LockUnavailable,
    ProcessingFailed,
    InvalidEnvelope,
}

impl DeadLetterReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LockUnavailable => "lock_unavailable",
            Self::ProcessingFailed => "processing_failed",
            Self::InvalidEnvelope => "invalid_envelope",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "lock_unavailable" => Some(Self::LockUnavailable),
            "processing_failed" => Some(Self::ProcessingFailed),
            "invalid_envelope" => Some(Self::InvalidEnvelope),
            _ => None,
        }
    }
}

impl std::fmt::Display for DeadLetterReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: String,
    pub sandbox_id: Option<String>,
    pub message_id: Option<String>,
    pub reason: DeadLetterReason,
    pub error: String,
    pub payload: JsonValue,
    pub created_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn new(
        reason: DeadLetterReason,
        error: impl Into<String>,
        sandbox_id: Option<String>,
        message_id: Option<String>,
        payload: JsonValue,
    ) -> Self {
        Self {
            id: generate_id("dl"),
            sandbox_id,
            message_id,
            reason,
            error: error.into(),
            payload,
            created_at: Utc::now(),
        }
    }
}

#[async_trait]
pub trait DeadLetterSink: Send + Sync {
    async fn record(&self, letter: DeadLetter) -> Result<()>;
}

pub struct SqliteDeadLetterSink {
    pool: SqlitePool,
}

impl SqliteDeadLetterSink {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Most recent dead letters, newest first
    pub async fn list_recent(&self, limit: u32) -> Result<Vec<DeadLetter>> {
        let rows = sqlx::query(
            r#"
            SELECT id, sandbox_id, message_id, reason, error, payload, created_at
            FROM dead_letters
            ORDER BY created_at DESC
            LIMIT ?1
            "#,
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_dead_letter).collect()
    }
}

#[async_trait]
impl DeadLetterSink for SqliteDeadLetterSink {
    async fn record(&self, letter: DeadLetter) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letters (id, sandbox_id, message_id, reason, error, payload, created_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
        )
        .bind(&letter.id)
        .bind(&letter.sandbox_id)
        .bind(&letter.message_id)
        .bind(letter.reason.as_str())
        .bind(&letter.error)
        .bind(serde_json::to_string(&letter.payload)?)
        .bind(format_timestamp(letter.created_at))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

fn row_to_dead_letter(row: SqliteRow) -> Result<DeadLetter> {
    let reason: String = row.get("reason");
    Ok(DeadLetter {
        id: row.get("id"),
        sandbox_id: row.get("sandbox_id"),
        message_id: row.get("message_id"),
        // Rows are only written through `record`, so the reason is always known
        reason: DeadLetterReason::parse(&reason).unwrap_or(DeadLetterReason::ProcessingFailed),
        error: row.get("error"),
        payload: serde_json::from_str(&row.get::<String, _>("payload"))?,
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
    })
}

#[derive(Default)]
pub struct MemoryDeadLetterSink {
    letters: Mutex<Vec<DeadLetter>>,
}

impl MemoryDeadLetterSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn letters(&self) -> Vec<DeadLetter> {
        self.letters
            .lock()
            .map(|letters| letters.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl DeadLetterSink for MemoryDeadLetterSink {
    async fn record(&self, letter: DeadLetter) -> Result<()> {
        if let Ok(mut letters) = self.letters.lock() {
            letters.push(letter);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use superagent_storage::test_utils::memory_pool;

    #[tokio::test]
    async fn test_sqlite_sink_round_trip() {
        let sink = SqliteDeadLetterSink::new(memory_pool().await);
        sink.record(DeadLetter::new(
            DeadLetterReason::LockUnavailable,
            "lock busy after 4 attempts",
            Some("sb-1".to_string()),
            Some("m-1".to_string()),
            json!({"payload": {"message_id": "m-1"}}),
        ))
        .await
        .unwrap();

        let letters = sink.list_recent(10).await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].reason, DeadLetterReason::LockUnavailable);
        assert_eq!(letters[0].sandbox_id.as_deref(), Some("sb-1"));
        assert_eq!(letters[0].payload["payload"]["message_id"], "m-1");
    }
}
