// ABOUTME: Token usage records written from sandbox summary events
// ABOUTME: One row per (topic, task, sandbox, model); redelivered summaries are ignored

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use tracing::debug;

use crate::models::TokenUsageRecord;
use crate::{format_timestamp, parse_optional_json, parse_timestamp};
use crate::{Result, TaskStorage};

const USAGE_COLUMNS: &str = r#"
    id, topic_id, task_id, sandbox_id, organization_code, user_id, task_status, usage_type,
    total_input_tokens, total_output_tokens, total_tokens, model_id, model_name,
    cached_tokens, cache_write_tokens, reasoning_tokens, usage_details, created_at
"#;

impl TaskStorage {
    // ========================================================================
    // TOKEN USAGE OPERATIONS
    // ========================================================================

    /// Insert a usage record unless its unique key already exists.
    /// Returns `true` when a new row was written.
    pub async fn insert_token_usage_if_absent(&self, record: &TokenUsageRecord) -> Result<bool> {
        let id = if record.id.is_empty() {
            superagent_core::generate_id("usage")
        } else {
            record.id.clone()
        };
        let created_at = record.created_at.unwrap_or_else(Utc::now);
        let details = record
            .usage_details
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;

        let result = sqlx::query(
            r#"
            INSERT INTO token_usage_records (
                id, topic_id, task_id, sandbox_id, organization_code, user_id, task_status,
                usage_type, total_input_tokens, total_output_tokens, total_tokens, model_id,
                model_name, cached_tokens, cache_write_tokens, reasoning_tokens,
                usage_details, created_at
            ) VALUES (
                ?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18
            )
            ON CONFLICT(topic_id, task_id, sandbox_id, model_id) DO NOTHING
            "#,
        )
        .bind(&id)
        .bind(&record.topic_id)
        .bind(&record.task_id)
        .bind(&record.sandbox_id)
        .bind(&record.organization_code)
        .bind(&record.user_id)
        .bind(&record.task_status)
        .bind(&record.usage_type)
        .bind(record.total_input_tokens)
        .bind(record.total_output_tokens)
        .bind(record.total_tokens)
        .bind(&record.model_id)
        .bind(&record.model_name)
        .bind(record.cached_tokens)
        .bind(record.cache_write_tokens)
        .bind(record.reasoning_tokens)
        .bind(&details)
        .bind(format_timestamp(created_at))
        .execute(&self.pool)
        .await?;

        let inserted = result.rows_affected() == 1;
        if !inserted {
            debug!(
                topic_id = %record.topic_id,
                task_id = %record.task_id,
                model_id = %record.model_id,
                "Token usage record already exists, skipping duplicate"
            );
        }
        Ok(inserted)
    }

    pub async fn find_token_usage(
        &self,
        topic_id: &str,
        task_id: &str,
        sandbox_id: &str,
        model_id: &str,
    ) -> Result<Option<TokenUsageRecord>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM token_usage_records
            WHERE topic_id = ?1 AND task_id = ?2 AND sandbox_id = ?3 AND model_id = ?4
            "#,
            USAGE_COLUMNS
        ))
        .bind(topic_id)
        .bind(task_id)
        .bind(sandbox_id)
        .bind(model_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_usage).transpose()
    }

    pub async fn list_token_usage_for_task(&self, task_id: &str) -> Result<Vec<TokenUsageRecord>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM token_usage_records WHERE task_id = ?1 ORDER BY model_id ASC",
            USAGE_COLUMNS
        ))
        .bind(task_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_usage).collect()
    }
}

fn row_to_usage(row: SqliteRow) -> Result<TokenUsageRecord> {
    Ok(TokenUsageRecord {
        id: row.get("id"),
        topic_id: row.get("topic_id"),
        task_id: row.get("task_id"),
        sandbox_id: row.get("sandbox_id"),
        organization_code: row.get("organization_code"),
        user_id: row.get("user_id"),
        task_status: row.get("task_status"),
        usage_type: row.get("usage_type"),
        total_input_tokens: row.get("total_input_tokens"),
        total_output_tokens: row.get("total_output_tokens"),
        total_tokens: row.get("total_tokens"),
        model_id: row.get("model_id"),
        model_name: row.get("model_name"),
        cached_tokens: row.get("cached_tokens"),
        cache_write_tokens: row.get("cache_write_tokens"),
        reasoning_tokens: row.get("reasoning_tokens"),
        usage_details: parse_optional_json(row.get("usage_details")),
        created_at: Some(parse_timestamp(&row.get::<String, _>("created_at"))?),
    })
}
