// ABOUTME: Task persistence and the combined task/topic/project status transaction
// ABOUTME: A task's status and its topic's denormalized status are always written together

use chrono::{DateTime, Utc};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, Transaction};

use crate::models::{NewTask, Task, TaskStatus};
use crate::{format_timestamp, parse_timestamp};
use crate::{Result, StorageError, TaskStorage};

const TASK_COLUMNS: &str = r#"
    id, topic_id, project_id, user_id, organization_code, sandbox_id, external_task_id,
    prompt, attachments, task_mode, work_dir, status, error_message, created_at, updated_at
"#;

impl TaskStorage {
    // ========================================================================
    // TASK OPERATIONS
    // ========================================================================

    /// Insert a WAITING task and point its topic and project at it atomically
    pub async fn create_task(&self, input: NewTask) -> Result<Task> {
        let now = Utc::now();
        let task = Task {
            id: superagent_core::generate_id("task"),
            topic_id: input.topic_id,
            project_id: input.project_id,
            user_id: input.user_id,
            organization_code: input.organization_code,
            sandbox_id: input.sandbox_id,
            external_task_id: String::new(),
            prompt: input.prompt,
            attachments: input.attachments,
            task_mode: input.task_mode,
            work_dir: input.work_dir,
            status: TaskStatus::Waiting,
            error_message: None,
            created_at: now,
            updated_at: now,
        };
        let attachments_json = serde_json::to_string(&task.attachments)?;
        let now_str = format_timestamp(now);

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            INSERT INTO tasks (
                id, topic_id, project_id, user_id, organization_code, sandbox_id,
                external_task_id, prompt, attachments, task_mode, work_dir,
                status, error_message, created_at, updated_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, NULL, ?13, ?13)
            "#,
        )
        .bind(&task.id)
        .bind(&task.topic_id)
        .bind(&task.project_id)
        .bind(&task.user_id)
        .bind(&task.organization_code)
        .bind(&task.sandbox_id)
        .bind(&task.external_task_id)
        .bind(&task.prompt)
        .bind(&attachments_json)
        .bind(&task.task_mode)
        .bind(&task.work_dir)
        .bind(task.status.as_str())
        .bind(&now_str)
        .execute(&mut *tx)
        .await?;

        let topic_result = sqlx::query(
            r#"
            UPDATE topics
            SET current_task_id = ?1, current_task_status = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(&task.id)
        .bind(task.status.as_str())
        .bind(&now_str)
        .bind(&task.topic_id)
        .execute(&mut *tx)
        .await?;

        if topic_result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("topic {}", task.topic_id)));
        }

        sqlx::query(
            r#"
            UPDATE projects
            SET current_topic_id = ?1, current_topic_status = ?2, updated_at = ?3
            WHERE id = ?4
            "#,
        )
        .bind(&task.topic_id)
        .bind(task.status.as_str())
        .bind(&now_str)
        .bind(&task.project_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(task)
    }

    pub async fn get_task(&self, id: &str) -> Result<Task> {
        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS))
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => row_to_task(row),
            None => Err(StorageError::NotFound(format!("task {}", id))),
        }
    }

    /// The topic's RUNNING task, newest first if the invariant was ever broken
    pub async fn get_running_task_for_topic(&self, topic_id: &str) -> Result<Option<Task>> {
        let row = sqlx::query(&format!(
            r#"
            SELECT {} FROM tasks
            WHERE topic_id = ?1 AND status = ?2
            ORDER BY created_at DESC
            LIMIT 1
            "#,
            TASK_COLUMNS
        ))
        .bind(topic_id)
        .bind(TaskStatus::Running.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.map(row_to_task).transpose()
    }

    pub async fn get_tasks_by_status(&self, status: TaskStatus, limit: u32) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            "SELECT {} FROM tasks WHERE status = ?1 ORDER BY updated_at ASC LIMIT ?2",
            TASK_COLUMNS
        ))
        .bind(status.as_str())
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_task).collect()
    }

    /// RUNNING tasks whose last update is older than `cutoff`, oldest first
    pub async fn get_tasks_exceeding_update_time(
        &self,
        cutoff: DateTime<Utc>,
        limit: u32,
    ) -> Result<Vec<Task>> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {} FROM tasks
            WHERE status = ?1 AND updated_at < ?2
            ORDER BY updated_at ASC
            LIMIT ?3
            "#,
            TASK_COLUMNS
        ))
        .bind(TaskStatus::Running.as_str())
        .bind(format_timestamp(cutoff))
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(row_to_task).collect()
    }

    pub async fn set_task_external_id(&self, id: &str, external_task_id: &str) -> Result<()> {
        let result =
            sqlx::query("UPDATE tasks SET external_task_id = ?1, updated_at = ?2 WHERE id = ?3")
                .bind(external_task_id)
                .bind(format_timestamp(Utc::now()))
                .bind(id)
                .execute(&self.pool)
                .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("task {}", id)));
        }

        Ok(())
    }

    /// Record a status change for `task` on the task, its topic and its project in one
    /// transaction. `sandbox_id` rebinds both the task and the topic when given; the topic
    /// and project are only touched while they still point at this task and topic.
    ///
    /// The write only applies while the stored status still equals `task.status`. Returns
    /// `None` when another writer moved the task first.
    pub async fn apply_task_status(
        &self,
        task: &Task,
        status: TaskStatus,
        sandbox_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<Option<Task>> {
        let now = Utc::now();
        let now_str = format_timestamp(now);

        let mut tx = self.pool.begin().await?;

        let result = sqlx::query(
            r#"
            UPDATE tasks
            SET status = ?1,
                sandbox_id = COALESCE(?2, sandbox_id),
                error_message = COALESCE(?3, error_message),
                updated_at = ?4
            WHERE id = ?5 AND status = ?6
            "#,
        )
        .bind(status.as_str())
        .bind(sandbox_id)
        .bind(error_message)
        .bind(&now_str)
        .bind(&task.id)
        .bind(task.status.as_str())
        .execute(&mut *tx)
        .await?;

        if result.rows_affected() == 0 {
            let exists = sqlx::query("SELECT 1 FROM tasks WHERE id = ?1")
                .bind(&task.id)
                .fetch_optional(&mut *tx)
                .await?
                .is_some();
            tx.rollback().await?;
            if exists {
                return Ok(None);
            }
            return Err(StorageError::NotFound(format!("task {}", task.id)));
        }

        update_topic_and_project(&mut tx, task, status, sandbox_id, &now_str).await?;

        let row = sqlx::query(&format!("SELECT {} FROM tasks WHERE id = ?1", TASK_COLUMNS))
            .bind(&task.id)
            .fetch_one(&mut *tx)
            .await?;

        tx.commit().await?;

        row_to_task(row).map(Some)
    }
}

async fn update_topic_and_project(
    tx: &mut Transaction<'_, Sqlite>,
    task: &Task,
    status: TaskStatus,
    sandbox_id: Option<&str>,
    now: &str,
) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE topics
        SET current_task_id = ?1,
            current_task_status = ?2,
            sandbox_id = COALESCE(?3, sandbox_id),
            updated_at = ?4
        WHERE id = ?5 AND (current_task_id IS NULL OR current_task_id = ?1)
        "#,
    )
    .bind(&task.id)
    .bind(status.as_str())
    .bind(sandbox_id)
    .bind(now)
    .bind(&task.topic_id)
    .execute(&mut **tx)
    .await?;

    sqlx::query(
        r#"
        UPDATE projects
        SET current_topic_id = ?1, current_topic_status = ?2, updated_at = ?3
        WHERE id = ?4 AND (current_topic_id IS NULL OR current_topic_id = ?1)
        "#,
    )
    .bind(&task.topic_id)
    .bind(status.as_str())
    .bind(now)
    .bind(&task.project_id)
    .execute(&mut **tx)
    .await?;

    Ok(())
}

fn row_to_task(row: SqliteRow) -> Result<Task> {
    Ok(Task {
        id: row.get("id"),
        topic_id: row.get("topic_id"),
        project_id: row.get("project_id"),
        user_id: row.get("user_id"),
        organization_code: row.get("organization_code"),
        sandbox_id: row.get("sandbox_id"),
        external_task_id: row.get("external_task_id"),
        prompt: row.get("prompt"),
        attachments: serde_json::from_str(&row.get::<String, _>("attachments"))?,
        task_mode: row.get("task_mode"),
        work_dir: row.get("work_dir"),
        status: TaskStatus::from_str(&row.get::<String, _>("status"))?,
        error_message: row.get("error_message"),
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Topic;
    use crate::test_utils::{memory_storage, seed_topic};
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn new_task_for(topic: &Topic, prompt: &str) -> NewTask {
        NewTask {
            topic_id: topic.id.clone(),
            project_id: topic.project_id.clone(),
            user_id: topic.user_id.clone(),
            organization_code: topic.organization_code.clone(),
            sandbox_id: topic.sandbox_id.clone(),
            prompt: prompt.to_string(),
            attachments: json!([]),
            task_mode: topic.task_mode.clone(),
            work_dir: topic.work_dir.clone(),
        }
    }

    #[tokio::test]
    async fn test_create_task_updates_topic_and_project() {
        let storage = memory_storage().await;
        let (project, topic) = seed_topic(&storage, Some("sb-1")).await;

        let task = storage
            .create_task(new_task_for(&topic, "hello"))
            .await
            .unwrap();
        assert_eq!(task.status, TaskStatus::Waiting);
        assert_eq!(task.sandbox_id.as_deref(), Some("sb-1"));

        let topic = storage.get_topic(&topic.id).await.unwrap();
        assert_eq!(topic.current_task_id.as_deref(), Some(task.id.as_str()));
        assert_eq!(topic.current_task_status, Some(TaskStatus::Waiting));

        let project = storage.get_project(&project.id).await.unwrap();
        assert_eq!(project.current_topic_id.as_deref(), Some(topic.id.as_str()));
        assert_eq!(project.current_topic_status, Some(TaskStatus::Waiting));
    }

    #[tokio::test]
    async fn test_create_task_for_missing_topic_rolls_back() {
        let storage = memory_storage().await;
        let (_, topic) = seed_topic(&storage, None).await;

        let mut input = new_task_for(&topic, "orphan");
        input.topic_id = "topic_missing".to_string();

        assert!(storage.create_task(input).await.is_err());
        assert!(storage
            .get_tasks_by_status(TaskStatus::Waiting, 10)
            .await
            .unwrap()
            .is_empty());
    }

    #[tokio::test]
    async fn test_apply_task_status_keeps_task_and_topic_in_sync() {
        let storage = memory_storage().await;
        let (project, topic) = seed_topic(&storage, None).await;
        let task = storage.create_task(new_task_for(&topic, "go")).await.unwrap();

        let running = storage
            .apply_task_status(&task, TaskStatus::Running, Some("sb-9"), None)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(running.status, TaskStatus::Running);
        assert_eq!(running.sandbox_id.as_deref(), Some("sb-9"));

        let topic_after = storage.get_topic(&topic.id).await.unwrap();
        assert_eq!(topic_after.current_task_status, Some(TaskStatus::Running));
        assert_eq!(topic_after.sandbox_id.as_deref(), Some("sb-9"));

        let failed = storage
            .apply_task_status(&running, TaskStatus::Error, None, Some("boom"))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(failed.error_message.as_deref(), Some("boom"));
        assert_eq!(failed.sandbox_id.as_deref(), Some("sb-9"));

        let project = storage.get_project(&project.id).await.unwrap();
        assert_eq!(project.current_topic_status, Some(TaskStatus::Error));
    }

    #[tokio::test]
    async fn test_old_task_status_does_not_overwrite_topic() {
        let storage = memory_storage().await;
        let (_, topic) = seed_topic(&storage, None).await;
        let old = storage.create_task(new_task_for(&topic, "one")).await.unwrap();
        let current = storage.create_task(new_task_for(&topic, "two")).await.unwrap();

        storage
            .apply_task_status(&old, TaskStatus::Error, None, Some("stale"))
            .await
            .unwrap();

        let topic = storage.get_topic(&topic.id).await.unwrap();
        assert_eq!(topic.current_task_id.as_deref(), Some(current.id.as_str()));
        assert_eq!(topic.current_task_status, Some(TaskStatus::Waiting));
    }

    #[tokio::test]
    async fn test_status_write_requires_unchanged_stored_status() {
        let storage = memory_storage().await;
        let (_, topic) = seed_topic(&storage, None).await;
        let waiting = storage.create_task(new_task_for(&topic, "go")).await.unwrap();

        storage
            .apply_task_status(&waiting, TaskStatus::Finished, None, None)
            .await
            .unwrap()
            .unwrap();

        // Snapshot still says WAITING, so this writer lost the race
        let lost = storage
            .apply_task_status(&waiting, TaskStatus::Running, None, None)
            .await
            .unwrap();
        assert!(lost.is_none());

        let stored = storage.get_task(&waiting.id).await.unwrap();
        assert_eq!(stored.status, TaskStatus::Finished);
        let topic = storage.get_topic(&topic.id).await.unwrap();
        assert_eq!(topic.current_task_status, Some(TaskStatus::Finished));

        let mut missing = waiting.clone();
        missing.id = "task_missing".to_string();
        assert!(matches!(
            storage
                .apply_task_status(&missing, TaskStatus::Running, None, None)
                .await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_running_task_lookup_and_staleness() {
        let storage = memory_storage().await;
        let (_, topic) = seed_topic(&storage, None).await;
        assert!(storage
            .get_running_task_for_topic(&topic.id)
            .await
            .unwrap()
            .is_none());

        let task = storage.create_task(new_task_for(&topic, "go")).await.unwrap();
        storage
            .apply_task_status(&task, TaskStatus::Running, None, None)
            .await
            .unwrap();

        let running = storage
            .get_running_task_for_topic(&topic.id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(running.id, task.id);

        let past = Utc::now() - chrono::Duration::hours(1);
        assert!(storage
            .get_tasks_exceeding_update_time(past, 10)
            .await
            .unwrap()
            .is_empty());

        let future = Utc::now() + chrono::Duration::seconds(1);
        let stale = storage
            .get_tasks_exceeding_update_time(future, 10)
            .await
            .unwrap();
        assert_eq!(stale.len(), 1);

        let stale_topics = storage
            .get_topics_exceeding_update_time(future, 10)
            .await
            .unwrap();
        assert_eq!(stale_topics.len(), 1);
        assert_eq!(stale_topics[0].id, topic.id);
    }

    #[tokio::test]
    async fn test_set_external_task_id() {
        let storage = memory_storage().await;
        let (_, topic) = seed_topic(&storage, None).await;
        let task = storage.create_task(new_task_for(&topic, "go")).await.unwrap();

        storage
            .set_task_external_id(&task.id, "engine-42")
            .await
            .unwrap();

        let fetched = storage.get_task(&task.id).await.unwrap();
        assert_eq!(fetched.external_task_id, "engine-42");
    }
}
