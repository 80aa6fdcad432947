// ABOUTME: Topic persistence including sandbox lookup and optimistic-concurrency updates
// ABOUTME: Topic status columns are written only through the task status transaction

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::models::{NewTopic, TaskStatus, Topic};
use crate::{format_timestamp, parse_optional_timestamp, parse_timestamp};
use crate::{Result, StorageError, TaskStorage};

const TOPIC_COLUMNS: &str = r#"
    id, project_id, workspace_id, user_id, organization_code, name, sandbox_id,
    current_task_id, current_task_status, task_mode, work_dir,
    created_at, updated_at, deleted_at
"#;

impl TaskStorage {
    // ========================================================================
    // TOPIC OPERATIONS
    // ========================================================================

    pub async fn create_topic(&self, input: NewTopic) -> Result<Topic> {
        let now = Utc::now();
        let topic = Topic {
            id: superagent_core::generate_id("topic"),
            project_id: input.project_id,
            workspace_id: input.workspace_id,
            user_id: input.user_id,
            organization_code: input.organization_code,
            name: input.name,
            sandbox_id: input.sandbox_id,
            current_task_id: None,
            current_task_status: None,
            task_mode: input
                .task_mode
                .unwrap_or_else(|| superagent_core::constants::DEFAULT_TASK_MODE.to_string()),
            work_dir: input.work_dir,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO topics (
                id, project_id, workspace_id, user_id, organization_code, name,
                sandbox_id, task_mode, work_dir, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)
            "#,
        )
        .bind(&topic.id)
        .bind(&topic.project_id)
        .bind(&topic.workspace_id)
        .bind(&topic.user_id)
        .bind(&topic.organization_code)
        .bind(&topic.name)
        .bind(&topic.sandbox_id)
        .bind(&topic.task_mode)
        .bind(&topic.work_dir)
        .bind(format_timestamp(topic.created_at))
        .bind(format_timestamp(topic.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(topic)
    }

    pub async fn get_topic(&self, id: &str) -> Result<Topic> {
        let row = sqlx::query(&format!(
            "SELECT {} FROM topics WHERE id = ?1 AND deleted_at IS NULL",
            TOPIC_COLUMNS
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_topic(row),
            None => Err(StorageError::NotFound(format!("topic {}", id))),
        }
    }

    /// Most recently touched live topic bound to a sandbox
    pub async fn get_topic_by_sandbox_id(&self, sandbox_id: &str) -> Result<Option<Topic>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM topics
            WHERE sandbox_id = ?1 AND deleted_at IS NULL
            ORDER BY updated_at DESC
            LIMIT 1
            "#,
            TOPIC_COLUMNS
        ))
        .bind(sandbox_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_topic).transpose()
    }

    /// Rebind a topic to a (new) sandbox, optionally moving its work directory
    pub async fn update_topic_sandbox(
        &self,
        id: &str,
        sandbox_id: &str,
        work_dir: Option<&str>,
    ) -> Result<()> {
        let result = sqlx::query(
            r#"
            UPDATE topics
            SET sandbox_id = ?1, work_dir = COALESCE(?2, work_dir), updated_at = ?3
            WHERE id = ?4 AND deleted_at IS NULL
            "#,
        )
        .bind(sandbox_id)
        .bind(work_dir)
        .bind(format_timestamp(Utc::now()))
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("topic {}", id)));
        }

        Ok(())
    }

    /// Write the mutable descriptive fields of `topic` only if nobody touched the row since
    /// `expected_updated_at`. Returns `false` when the row changed underneath the caller.
    pub async fn update_topic_where_updated_at(
        &self,
        topic: &Topic,
        expected_updated_at: DateTime<Utc>,
    ) -> Result<bool> {
        let result = sqlx::query(
            r#"
            UPDATE topics
            SET name = ?1, sandbox_id = ?2, task_mode = ?3, work_dir = ?4, updated_at = ?5
            WHERE id = ?6 AND updated_at = ?7 AND deleted_at IS NULL
            "#,
        )
        .bind(&topic.name)
        .bind(&topic.sandbox_id)
        .bind(&topic.task_mode)
        .bind(&topic.work_dir)
        .bind(format_timestamp(Utc::now()))
        .bind(&topic.id)
        .bind(format_timestamp(expected_updated_at))
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    /// RUNNING topics that have not been touched since `cutoff`, oldest first
    pub async fn get_topics_exceeding_update_time(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Topic>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM topics
            WHERE current_task_status = ?1 AND updated_at < ?2 AND deleted_at IS NULL
            ORDER BY updated_at ASC
            LIMIT ?3
            "#,
            TOPIC_COLUMNS
        ))
        .bind(TaskStatus::Running.as_str())
        .bind(format_timestamp(cutoff))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_topic).collect()
    }
}

fn row_to_topic(row: SqliteRow) -> Result<Topic> {
    Ok(Topic {
        id: row.get("id"),
        project_id: row.get("project_id"),
        workspace_id: row.get("workspace_id"),
        user_id: row.get("user_id"),
        organization_code: row.get("organization_code"),
        name: row.get("name"),
        sandbox_id: row.get("sandbox_id"),
        current_task_id: row.get("current_task_id"),
        current_task_status: row
            .get::<Option<String>, _>("current_task_status")
            .map(|s| TaskStatus::from_str(&s))
            .transpose()?,
        task_mode: row.get("task_mode"),
        work_dir: row.get("work_dir"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
        deleted_at: parse_optional_timestamp(row.get("deleted_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::{memory_storage, seed_topic};

    #[tokio::test]
    async fn test_create_topic_defaults_task_mode() {
        let storage = memory_storage().await;
        let (project, topic) = seed_topic(&storage, None).await;

        let fetched = storage.get_topic(&topic.id).await.unwrap();
        assert_eq!(fetched.project_id, project.id);
        assert_eq!(fetched.task_mode, "chat");
        assert_eq!(fetched.sandbox_id, None);
        assert_eq!(fetched.current_task_status, None);
    }

    #[tokio::test]
    async fn test_get_topic_by_sandbox_id() {
        let storage = memory_storage().await;
        let (_, topic) = seed_topic(&storage, Some("sb-1")).await;

        let found = storage.get_topic_by_sandbox_id("sb-1").await.unwrap();
        assert_eq!(found.map(|t| t.id), Some(topic.id));

        assert!(storage
            .get_topic_by_sandbox_id("sb-unknown")
            .await
            .unwrap()
            .is_none());
    }

    #[tokio::test]
    async fn test_update_topic_sandbox() {
        let storage = memory_storage().await;
        let (_, topic) = seed_topic(&storage, None).await;

        storage
            .update_topic_sandbox(&topic.id, "sb-2", None)
            .await
            .unwrap();

        let fetched = storage.get_topic(&topic.id).await.unwrap();
        assert_eq!(fetched.sandbox_id.as_deref(), Some("sb-2"));
        assert_eq!(fetched.work_dir, topic.work_dir);
    }

    #[tokio::test]
    async fn test_update_where_updated_at_detects_concurrent_change() {
        let storage = memory_storage().await;
        let (_, topic) = seed_topic(&storage, None).await;

        let mut first = topic.clone();
        first.task_mode = "plan".to_string();
        assert!(storage
            .update_topic_where_updated_at(&first, topic.updated_at)
            .await
            .unwrap());

        // A second writer holding the stale token loses
        let mut second = topic.clone();
        second.task_mode = "general".to_string();
        assert!(!storage
            .update_topic_where_updated_at(&second, topic.updated_at)
            .await
            .unwrap());

        let fetched = storage.get_topic(&topic.id).await.unwrap();
        assert_eq!(fetched.task_mode, "plan");
    }
}
