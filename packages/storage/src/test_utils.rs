// ABOUTME: Test fixtures for an in-memory task database
// ABOUTME: Shared with dependent packages through the test-utils feature

use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::str::FromStr;

use crate::{NewProject, NewTopic, Project, TaskStorage, Topic};

/// In-memory database with migrations applied.
///
/// A single connection keeps every query on the same in-memory database.
pub async fn memory_pool() -> SqlitePool {
    let options = SqliteConnectOptions::from_str("sqlite::memory:")
        .expect("Invalid in-memory connection string")
        .create_if_missing(true);

    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect_with(options)
        .await
        .expect("Failed to create in-memory database");

    crate::run_migrations(&pool)
        .await
        .expect("Failed to run migrations");

    pool
}

pub async fn memory_storage() -> TaskStorage {
    TaskStorage::new(memory_pool().await)
}

/// Create a project with one topic, optionally bound to a sandbox
pub async fn seed_topic(storage: &TaskStorage, sandbox_id: Option<&str>) -> (Project, Topic) {
    let project = storage
        .create_project(NewProject {
            user_id: "user-1".to_string(),
            organization_code: "org-1".to_string(),
            name: "Test Project".to_string(),
        })
        .await
        .expect("Failed to create project");

    let topic = storage
        .create_topic(NewTopic {
            project_id: project.id.clone(),
            workspace_id: "ws-1".to_string(),
            user_id: project.user_id.clone(),
            organization_code: project.organization_code.clone(),
            name: "Test Topic".to_string(),
            sandbox_id: sandbox_id.map(str::to_string),
            task_mode: None,
            work_dir: "/workspace/project".to_string(),
        })
        .await
        .expect("Failed to create topic");

    (project, topic)
}

/// Move a row's `updated_at` into the past so staleness queries pick it up.
/// `table` is one of the fixed table names, never user input.
pub async fn backdate(storage: &TaskStorage, table: &str, id: &str, age: chrono::Duration) {
    let past = crate::format_timestamp(chrono::Utc::now() - age);
    sqlx::query(&format!("UPDATE {} SET updated_at = ?1 WHERE id = ?2", table))
        .bind(past)
        .bind(id)
        .execute(storage.pool())
        .await
        .expect("Failed to backdate row");
}
