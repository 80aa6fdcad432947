// ABOUTME: Task message persistence with (seq_id, topic_id) idempotency
// ABOUTME: Tracks per-message processing status and retry counts for ingestion replays

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::models::{ProcessingStatus, SenderType, TaskMessage};
use crate::{format_timestamp, parse_optional_json, parse_timestamp};
use crate::{Result, StorageError, TaskStorage};

const MESSAGE_COLUMNS: &str = r#"
    id, message_id, topic_id, task_id, seq_id, sender_type, sender_uid, receiver_uid,
    message_type, status, content, steps, tool, attachments, event, show_in_ui,
    processing_status, error_message, retry_count, raw_data, created_at, updated_at
"#;

/// Rounds a generated sequence id may lose to a concurrent writer before giving up
const NEXT_SEQ_ATTEMPTS: usize = 5;

/// JSON columns of a message, serialized once per insert
struct EncodedMessage {
    id: String,
    steps: Option<String>,
    tool: Option<String>,
    attachments: String,
    raw_data: Option<String>,
}

impl EncodedMessage {
    fn new(message: &TaskMessage) -> Result<Self> {
        Ok(Self {
            id: if message.id.is_empty() {
                superagent_core::generate_id("msg")
            } else {
                message.id.clone()
            },
            steps: message.steps.as_ref().map(serde_json::to_string).transpose()?,
            tool: message.tool.as_ref().map(serde_json::to_string).transpose()?,
            attachments: serde_json::to_string(&message.attachments)?,
            raw_data: message
                .raw_data
                .as_ref()
                .map(serde_json::to_string)
                .transpose()?,
        })
    }
}

impl TaskStorage {
    // ========================================================================
    // TASK MESSAGE OPERATIONS
    // ========================================================================

    /// Insert a message unless one with the same (seq_id, topic_id) already exists.
    /// Returns `true` when a new row was written.
    pub async fn insert_message_if_absent(&self, message: &TaskMessage) -> Result<bool> {
        let row = EncodedMessage::new(message)?;

        let result = sqlx::query(&format!(
            r#"
            INSERT INTO task_messages ({})
            VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                ?15, ?16, ?17, ?18, ?19, ?20, ?21, ?22
            )
            ON CONFLICT(seq_id, topic_id) DO NOTHING
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(&row.id)
        .bind(&message.message_id)
        .bind(&message.topic_id)
        .bind(&message.task_id)
        .bind(message.seq_id)
        .bind(message.sender_type.as_str())
        .bind(&message.sender_uid)
        .bind(&message.receiver_uid)
        .bind(&message.message_type)
        .bind(&message.status)
        .bind(&message.content)
        .bind(&row.steps)
        .bind(&row.tool)
        .bind(&row.attachments)
        .bind(&message.event)
        .bind(message.show_in_ui)
        .bind(message.processing_status.as_str())
        .bind(&message.error_message)
        .bind(message.retry_count)
        .bind(&row.raw_data)
        .bind(format_timestamp(message.created_at))
        .bind(format_timestamp(message.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// Insert a message at the topic's next free sequence id, ignoring `message.seq_id`.
    ///
    /// The sequence id is computed inside the INSERT itself, so concurrent writers cannot
    /// pick the same one. Returns the assigned sequence id, or `None` when the topic already
    /// holds a message with this `message_id`.
    pub async fn insert_message_with_next_seq(&self, message: &TaskMessage) -> Result<Option<i64>> {
        let row = EncodedMessage::new(message)?;

        for _ in 0..NEXT_SEQ_ATTEMPTS {
            // SQLite needs the WHERE on INSERT ... SELECT to parse the upsert clause
            let seq_id: Option<i64> = sqlx::query_scalar(&format!(
                r#"
                INSERT INTO task_messages ({})
                SELECT
                    ?1, ?2, ?3, ?4,
                    (SELECT COALESCE(MAX(seq_id), 0) + 1 FROM task_messages WHERE topic_id = ?3),
                    ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14,
                    ?15, ?16, ?17, ?18, ?19, ?20, ?21
                WHERE NOT EXISTS (
                    SELECT 1 FROM task_messages WHERE topic_id = ?3 AND message_id = ?2
                )
                ON CONFLICT(seq_id, topic_id) DO NOTHING
                RETURNING seq_id
                "#,
                MESSAGE_COLUMNS
            ))
            .bind(&row.id)
            .bind(&message.message_id)
            .bind(&message.topic_id)
            .bind(&message.task_id)
            .bind(message.sender_type.as_str())
            .bind(&message.sender_uid)
            .bind(&message.receiver_uid)
            .bind(&message.message_type)
            .bind(&message.status)
            .bind(&message.content)
            .bind(&row.steps)
            .bind(&row.tool)
            .bind(&row.attachments)
            .bind(&message.event)
            .bind(message.show_in_ui)
            .bind(message.processing_status.as_str())
            .bind(&message.error_message)
            .bind(message.retry_count)
            .bind(&row.raw_data)
            .bind(format_timestamp(message.created_at))
            .bind(format_timestamp(message.updated_at))
            .fetch_optional(&self.pool)
            .await?;

            if let Some(seq_id) = seq_id {
                return Ok(Some(seq_id));
            }

            if self
                .find_message_by_message_id(&message.topic_id, &message.message_id)
                .await?
                .is_some()
            {
                return Ok(None);
            }
        }

        Err(StorageError::Conflict(format!(
            "no free sequence id for topic {} after {} attempts",
            message.topic_id, NEXT_SEQ_ATTEMPTS
        )))
    }

    pub async fn find_message_by_seq(
        &self,
        topic_id: &str,
        seq_id: i64,
    ) -> Result<Option<TaskMessage>> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM task_messages WHERE topic_id = ?1 AND seq_id = ?2",
            MESSAGE_COLUMNS
        ))
        .bind(topic_id)
        .bind(seq_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_message).transpose()
    }

    pub async fn find_message_by_message_id(
        &self,
        topic_id: &str,
        message_id: &str,
    ) -> Result<Option<TaskMessage>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM task_messages
            WHERE topic_id = ?1 AND message_id = ?2
            ORDER BY seq_id ASC
            LIMIT 1
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(topic_id)
        .bind(message_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_message).transpose()
    }

    pub async fn update_processing_status(
        &self,
        id: &str,
        status: ProcessingStatus,
        error_message: Option<&str>,
        retry_count: Option<i32>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE task_messages
            SET processing_status = ?1,
                error_message = COALESCE(?2, error_message),
                retry_count = COALESCE(?3, retry_count),
                updated_at = ?4
            WHERE id = ?5
            "#,
        )
        .bind(status.as_str())
        .bind(error_message)
        .bind(retry_count)
        .bind(format_timestamp(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("task message {}", id)));
        }

        Ok(())
    }

    /// FAILED messages that still have retry budget left, oldest first
    pub async fn find_retriable_failed_messages(
        &self,
        max_retries: i32,
        limit: u32,
    ) -> Result<Vec<TaskMessage>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM task_messages
            WHERE processing_status = ?1 AND retry_count < ?2
            ORDER BY updated_at ASC
            LIMIT ?3
            "#,
            MESSAGE_COLUMNS
        ))
        .bind(ProcessingStatus::Failed.as_str())
        .bind(max_retries)
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }

    pub async fn list_messages_for_topic(&self, topic_id: &str) -> Result<Vec<TaskMessage>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM task_messages WHERE topic_id = ?1 ORDER BY seq_id ASC",
            MESSAGE_COLUMNS
        ))
        .bind(topic_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_message).collect()
    }
}

fn row_to_message(row: SqliteRow) -> Result<TaskMessage> {
    Ok(TaskMessage {
        id: row.get("id"),
        message_id: row.get("message_id"),
        topic_id: row.get("topic_id"),
        task_id: row.get("task_id"),
        seq_id: row.get("seq_id"),
        sender_type: SenderType::from_str(&row.get::<String, _>("sender_type"))?,
        sender_uid: row.get("sender_uid"),
        receiver_uid: row.get("receiver_uid"),
        message_type: row.get("message_type"),
        status: row.get("status"),
        content: row.get("content"),
        steps: parse_optional_json(row.get("steps")),
        tool: parse_optional_json(row.get("tool")),
        attachments: serde_json::from_str(&row.get::<String, _>("attachments"))?,
        event: row.get("event"),
        show_in_ui: row.get("show_in_ui"),
        processing_status: ProcessingStatus::from_str(&row.get::<String, _>("processing_status"))?,
        error_message: row.get("error_message"),
        retry_count: row.get("retry_count"),
        raw_data: parse_optional_json(row.get("raw_data")),
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
    })
}
