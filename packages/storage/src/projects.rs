// ABOUTME: Project persistence: creation, lookup and soft deletion
// ABOUTME: Current topic pointers are maintained by the task operations in the same transaction

use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;

use crate::models::{NewProject, Project, TaskStatus};
use crate::{format_timestamp, parse_optional_timestamp, parse_timestamp};
use crate::{Result, StorageError, TaskStorage};

impl TaskStorage {
    // ========================================================================
    // PROJECT OPERATIONS
    // ========================================================================

    pub async fn create_project(&self, input: NewProject) -> Result<Project> {
        let now = Utc::now();
        let project = Project {
            id: superagent_core::generate_id("proj"),
            user_id: input.user_id,
            organization_code: input.organization_code,
            name: input.name,
            current_topic_id: None,
            current_topic_status: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        };

        sqlx::query(
            r#"
            INSERT INTO projects (id, user_id, organization_code, name, created_at, updated_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6)
            "#,
        )
        .bind(&project.id)
        .bind(&project.user_id)
        .bind(&project.organization_code)
        .bind(&project.name)
        .bind(format_timestamp(project.created_at))
        .bind(format_timestamp(project.updated_at))
        .execute(&self.pool)
        .await?;

        Ok(project)
    }

    pub async fn get_project(&self, id: &str) -> Result<Project> {
        let row = sqlx::query(
            r#"
            SELECT id, user_id, organization_code, name, current_topic_id,
                   current_topic_status, created_at, updated_at, deleted_at
            FROM projects
            WHERE id = ?1
            "#,
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(row) => row_to_project(row),
            None => Err(StorageError::NotFound(format!("project {}", id))),
        }
    }

    /// Tombstone a project; referenced rows are never physically removed
    pub async fn soft_delete_project(&self, id: &str) -> Result<()> {
        let now = format_timestamp(Utc::now());
        let result = sqlx::query(
            "UPDATE projects SET deleted_at = ?1, updated_at = ?1 WHERE id = ?2 AND deleted_at IS NULL",
        )
        .bind(&now)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StorageError::NotFound(format!("project {}", id)));
        }

        Ok(())
    }
}

fn row_to_project(row: SqliteRow) -> Result<Project> {
    Ok(Project {
        id: row.get("id"),
        user_id: row.get("user_id"),
        organization_code: row.get("organization_code"),
        name: row.get("name"),
        current_topic_id: row.get("current_topic_id"),
        current_topic_status: row
            .get::<Option<String>, _>("current_topic_status")
            .map(|s| TaskStatus::from_str(&s))
            .transpose()?,
        created_at: parse_timestamp(&row.get::<String, _>("created_at"))?,
        updated_at: parse_timestamp(&row.get::<String, _>("updated_at"))?,
        deleted_at: parse_optional_timestamp(row.get("deleted_at"))?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_utils::memory_storage;

    #[tokio::test]
    async fn test_create_and_get_project() {
        let storage = memory_storage().await;

        let created = storage
            .create_project(NewProject {
                user_id: "user-1".to_string(),
                organization_code: "org-1".to_string(),
                name: "Research".to_string(),
            })
            .await
            .unwrap();
        assert!(created.id.starts_with("proj_"));

        let fetched = storage.get_project(&created.id).await.unwrap();
        assert_eq!(fetched.name, "Research");
        assert_eq!(fetched.current_topic_id, None);
        assert!(fetched.deleted_at.is_none());
    }

    #[tokio::test]
    async fn test_soft_delete_keeps_row() {
        let storage = memory_storage().await;
        let project = storage
            .create_project(NewProject {
                user_id: "user-1".to_string(),
                organization_code: "org-1".to_string(),
                name: "Old".to_string(),
            })
            .await
            .unwrap();

        storage.soft_delete_project(&project.id).await.unwrap();

        let fetched = storage.get_project(&project.id).await.unwrap();
        assert!(fetched.deleted_at.is_some());

        // Deleting twice reports the tombstone as missing
        assert!(matches!(
            storage.soft_delete_project(&project.id).await,
            Err(StorageError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_get_missing_project() {
        let storage = memory_storage().await;
        assert!(matches!(
            storage.get_project("proj_missing").await,
            Err(StorageError::NotFound(_))
        ));
    }
}
