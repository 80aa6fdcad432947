// ABOUTME: Task state machine over projects, topics and tasks
// ABOUTME: The only writer of task status after creation; every change is one transaction

use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use superagent_core::constants::RECONCILE_TOPIC_PAUSE;
use superagent_core::truncate_error_message;
use superagent_sandbox::{SandboxGateway, SandboxState};
use superagent_storage::{NewTask, StorageError, Task, TaskStatus, TaskStorage, Topic};

use crate::error::{Result, TaskError};
use crate::types::{Instruction, TaskRequest};

/// Compare-and-set attempts before a contended status write gives up
const STATUS_WRITE_ATTEMPTS: usize = 5;

/// Outcome of one stale-topic reconciliation pass
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub refreshed: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct TaskDomainService {
    storage: TaskStorage,
}

impl TaskDomainService {
    pub fn new(storage: TaskStorage) -> Self {
        Self { storage }
    }

    pub fn storage(&self) -> &TaskStorage {
        &self.storage
    }

    pub async fn get_topic(&self, topic_id: &str) -> Result<Topic> {
        self.storage.get_topic(topic_id).await.map_err(|e| match e {
            StorageError::NotFound(_) => TaskError::TopicNotFound(topic_id.to_string()),
            other => TaskError::Storage(other),
        })
    }

    pub async fn get_task(&self, task_id: &str) -> Result<Task> {
        self.storage.get_task(task_id).await.map_err(|e| match e {
            StorageError::NotFound(_) => TaskError::TaskNotFound(task_id.to_string()),
            other => TaskError::Storage(other),
        })
    }

    /// Resolve the task a request acts on.
    ///
    /// `Interrupted` targets the topic's RUNNING task and never creates a row. Every other
    /// instruction creates a new WAITING task bound to the topic's sandbox.
    pub async fn init_topic_task(&self, topic_id: &str, request: &TaskRequest) -> Result<Task> {
        let mut topic = self.get_topic(topic_id).await?;

        match &request.instruction {
            Instruction::Interrupted { .. } => {
                return self
                    .storage
                    .get_running_task_for_topic(topic_id)
                    .await?
                    .ok_or_else(|| {
                        warn!(topic_id = %topic_id, "Interrupt requested but no task is running");
                        TaskError::IllegalOperation(format!(
                            "topic {} has no running task to interrupt",
                            topic_id
                        ))
                    });
            }
            Instruction::SwitchMode { task_mode } => {
                topic = self.switch_task_mode(topic, task_mode).await?;
            }
            Instruction::Normal => {}
        }

        // Keep a single RUNNING task per topic
        if let Some(running) = self.storage.get_running_task_for_topic(topic_id).await? {
            info!(
                topic_id = %topic_id,
                task_id = %running.id,
                "Suspending running task superseded by a new request"
            );
            self.update_task_status(&running, TaskStatus::Suspended, None, None)
                .await?;
        }

        let task = self
            .storage
            .create_task(NewTask {
                topic_id: topic.id.clone(),
                project_id: topic.project_id.clone(),
                user_id: request.user_id.clone(),
                organization_code: request.organization_code.clone(),
                sandbox_id: topic.sandbox_id.clone(),
                prompt: request.prompt.clone(),
                attachments: serde_json::Value::Array(request.attachments.clone()),
                task_mode: topic.task_mode.clone(),
                work_dir: topic.work_dir.clone(),
            })
            .await?;

        info!(
            topic_id = %topic_id,
            task_id = %task.id,
            instruction = request.instruction.as_str(),
            "Created task"
        );
        Ok(task)
    }

    async fn switch_task_mode(&self, mut topic: Topic, task_mode: &str) -> Result<Topic> {
        if topic.task_mode == task_mode {
            return Ok(topic);
        }

        // One retry if someone else touched the topic in between
        for _ in 0..2 {
            let expected = topic.updated_at;
            topic.task_mode = task_mode.to_string();
            if self
                .storage
                .update_topic_where_updated_at(&topic, expected)
                .await?
            {
                debug!(topic_id = %topic.id, task_mode = %task_mode, "Switched topic task mode");
                return self.get_topic(&topic.id).await;
            }
            topic = self.get_topic(&topic.id).await?;
        }

        warn!(topic_id = %topic.id, "Topic kept changing, using requested task mode for this task only");
        topic.task_mode = task_mode.to_string();
        Ok(topic)
    }

    /// Move `task` to `status`, updating its topic and project in the same transaction.
    ///
    /// Returns `false` (and changes nothing) when the transition is not allowed from the
    /// task's current stored status. `ERROR` messages are bounded to 500 characters.
    /// Concurrent writers are serialized by a compare-and-set on the stored status; a loser
    /// re-reads the task and re-validates against what won.
    pub async fn update_task_status(
        &self,
        task: &Task,
        status: TaskStatus,
        sandbox_id: Option<&str>,
        error_message: Option<&str>,
    ) -> Result<bool> {
        let error_message = match (status, error_message) {
            (TaskStatus::Error, Some(message)) => Some(truncate_error_message(message)),
            _ => None,
        };

        for _ in 0..STATUS_WRITE_ATTEMPTS {
            let current = self.get_task(&task.id).await?;

            if !current.status.can_transition_to(status) {
                warn!(
                    task_id = %task.id,
                    from = %current.status,
                    to = %status,
                    "Ignoring disallowed task status transition"
                );
                return Ok(false);
            }

            let Some(updated) = self
                .storage
                .apply_task_status(&current, status, sandbox_id, error_message.as_deref())
                .await?
            else {
                debug!(task_id = %task.id, to = %status, "Task status changed concurrently, re-checking");
                continue;
            };

            info!(
                task_id = %updated.id,
                topic_id = %updated.topic_id,
                from = %current.status,
                to = %status,
                "Task status updated"
            );
            return Ok(true);
        }

        warn!(task_id = %task.id, to = %status, "Task status kept changing, giving up");
        Ok(false)
    }

    /// Force-fail RUNNING tasks that have not been updated within `threshold`
    pub async fn update_stale_running_tasks(&self, threshold: Duration, limit: u32) -> Result<usize> {
        let cutoff = Utc::now() - chrono_duration(threshold);
        let stale = self
            .storage
            .get_tasks_exceeding_update_time(cutoff, limit)
            .await?;

        let mut failed = 0;
        for task in stale {
            let message = format!(
                "Task timed out: no progress for more than {} seconds",
                threshold.as_secs()
            );
            match self
                .update_task_status(&task, TaskStatus::Error, None, Some(&message))
                .await
            {
                Ok(true) => failed += 1,
                Ok(false) => {}
                Err(e) => error!(task_id = %task.id, error = %e, "Failed to expire stale task"),
            }
        }

        if failed > 0 {
            info!(count = failed, "Expired stale running tasks");
        }
        Ok(failed)
    }

    /// Check stale RUNNING topics against the gateway.
    ///
    /// Topics whose sandbox is still running get their task refreshed; the rest are failed.
    pub async fn reconcile_stale_topics(
        &self,
        gateway: &dyn SandboxGateway,
        threshold: Duration,
        limit: u32,
    ) -> Result<ReconcileReport> {
        let cutoff = Utc::now() - chrono_duration(threshold);
        let topics = self
            .storage
            .get_topics_exceeding_update_time(cutoff, limit)
            .await?;

        let mut report = ReconcileReport::default();
        if topics.is_empty() {
            return Ok(report);
        }

        let sandbox_ids: Vec<String> = topics
            .iter()
            .filter_map(|t| t.sandbox_id.clone())
            .filter(|id| !id.is_empty())
            .collect();
        let states: HashMap<String, SandboxState> = gateway
            .get_batch_status(&sandbox_ids)
            .await?
            .into_iter()
            .map(|info| (info.sandbox_id, info.status))
            .collect();

        for (index, topic) in topics.iter().enumerate() {
            if index > 0 {
                tokio::time::sleep(RECONCILE_TOPIC_PAUSE).await;
            }
            report.checked += 1;

            let Some(task_id) = topic.current_task_id.as_deref() else {
                continue;
            };
            let task = match self.get_task(task_id).await {
                Ok(task) => task,
                Err(e) => {
                    warn!(topic_id = %topic.id, error = %e, "Stale topic points at a missing task");
                    continue;
                }
            };

            let state = topic
                .sandbox_id
                .as_ref()
                .and_then(|id| states.get(id).copied())
                .unwrap_or(SandboxState::NotFound);

            let outcome = if state.is_ready() {
                self.update_task_status(&task, TaskStatus::Running, None, None)
                    .await
                    .map(|changed| (changed, true))
            } else {
                let message = format!("Sandbox is no longer running (status: {:?})", state);
                self.update_task_status(&task, TaskStatus::Error, None, Some(&message))
                    .await
                    .map(|changed| (changed, false))
            };

            match outcome {
                Ok((true, true)) => report.refreshed += 1,
                Ok((true, false)) => report.failed += 1,
                Ok((false, _)) => {}
                Err(e) => {
                    error!(topic_id = %topic.id, error = %e, "Failed to reconcile stale topic")
                }
            }
        }

        info!(
            checked = report.checked,
            refreshed = report.refreshed,
            failed = report.failed,
            "Reconciled stale topics"
        );
        Ok(report)
    }
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}
