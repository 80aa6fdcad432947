// ABOUTME: Message ingestion consumer: lock per sandbox, dedup, persist, apply task status
// ABOUTME: Every delivery is acknowledged; failures are recorded in the dead-letter sink

use chrono::Utc;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use superagent_core::constants::sandbox_lock_key;
use superagent_core::{generate_id, IngestConfig, RetryPolicy, Sleeper, TokioSleeper};
use superagent_storage::{
    ProcessingStatus, SenderType, StorageError, Task, TaskMessage, TaskStatus, TaskStorage, Topic,
};
use superagent_tasks::{TaskDomainService, TaskError};

use crate::dead_letter::{DeadLetter, DeadLetterReason, DeadLetterSink};
use crate::envelope::{peek_message_id, peek_sandbox_id, SandboxEnvelope};
use crate::error::{IngestError, Result};
use crate::lock::{acquire_with_retry, DistributedLock, LockLease};
use crate::queue::{IngestQueue, QueueMessage};
use crate::usage::extract_token_usage;

/// What happened to one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IngestOutcome {
    Stored { topic_id: String, seq_id: i64 },
    Duplicate { topic_id: String, seq_id: i64 },
    DeadLettered(DeadLetterReason),
}

/// Result of a replay pass over FAILED messages
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ReplayReport {
    pub attempted: usize,
    pub recovered: usize,
}

pub struct IngestionConsumer {
    service: TaskDomainService,
    lock: Arc<dyn DistributedLock>,
    dead_letters: Arc<dyn DeadLetterSink>,
    sleeper: Arc<dyn Sleeper>,
    lock_ttl: Duration,
    lock_retry: RetryPolicy,
}

impl IngestionConsumer {
    pub fn new(
        service: TaskDomainService,
        lock: Arc<dyn DistributedLock>,
        dead_letters: Arc<dyn DeadLetterSink>,
        config: &IngestConfig,
    ) -> Self {
        Self {
            service,
            lock,
            dead_letters,
            sleeper: Arc::new(TokioSleeper),
            lock_ttl: config.lock_ttl,
            lock_retry: config.lock_retry.clone(),
        }
    }

    pub fn with_sleeper(mut self, sleeper: Arc<dyn Sleeper>) -> Self {
        self.sleeper = sleeper;
        self
    }

    fn storage(&self) -> &TaskStorage {
        self.service.storage()
    }

    /// Spawn `workers` tasks that drain `queue` until it shuts down
    pub fn run(self: Arc<Self>, queue: Arc<IngestQueue>, workers: usize) -> JoinSet<()> {
        let mut set = JoinSet::new();

        for worker in 0..workers.max(1) {
            let consumer = self.clone();
            let queue = queue.clone();
            set.spawn(async move {
                info!(worker, "Ingestion worker started");
                while let Some(message) = queue.recv().await {
                    let outcome = consumer.handle(&message).await;
                    queue.ack(&message);
                    debug!(worker, delivery_id = %message.delivery_id, ?outcome, "Delivery handled");
                }
                info!(worker, "Ingestion worker stopped");
            });
        }

        set
    }

    /// Handle one delivery. Never fails: anything not stored is dead-lettered.
    pub async fn handle(&self, message: &QueueMessage) -> IngestOutcome {
        let envelope = match SandboxEnvelope::parse(message.body.clone()) {
            Ok(envelope) => envelope,
            Err(e) => {
                warn!(delivery_id = %message.delivery_id, error = %e, "Rejecting malformed sandbox message");
                self.dead_letter(
                    DeadLetterReason::InvalidEnvelope,
                    e.to_string(),
                    peek_sandbox_id(&message.body),
                    peek_message_id(&message.body),
                    message.body.clone(),
                )
                .await;
                return IngestOutcome::DeadLettered(DeadLetterReason::InvalidEnvelope);
            }
        };

        let lease = match envelope.sandbox_id() {
            Some(sandbox_id) => match self.lock_sandbox(sandbox_id).await {
                Some(lease) => Some(lease),
                None => {
                    warn!(
                        sandbox_id = %sandbox_id,
                        message_id = %envelope.message_id(),
                        "Sandbox lock unavailable; dropping message"
                    );
                    self.dead_letter_envelope(
                        &envelope,
                        DeadLetterReason::LockUnavailable,
                        "sandbox lock not acquired within retry budget".to_string(),
                    )
                    .await;
                    return IngestOutcome::DeadLettered(DeadLetterReason::LockUnavailable);
                }
            },
            None => {
                warn!(message_id = %envelope.message_id(), "Message has no sandbox id; processing without lock");
                None
            }
        };

        let outcome = match self.process(&envelope).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(
                    sandbox_id = ?envelope.sandbox_id(),
                    message_id = %envelope.message_id(),
                    error = %e,
                    "Failed to process sandbox message"
                );
                self.dead_letter_envelope(&envelope, DeadLetterReason::ProcessingFailed, e.to_string())
                    .await;
                IngestOutcome::DeadLettered(DeadLetterReason::ProcessingFailed)
            }
        };

        if let Some(lease) = lease {
            lease.release().await;
        }
        outcome
    }

    /// Persist one envelope and apply its effects, under the sandbox lock when it names one
    pub async fn process(&self, envelope: &SandboxEnvelope) -> Result<IngestOutcome> {
        let topic = self.resolve_topic(envelope).await?;
        let task = self.resolve_task(&topic, envelope).await?;

        let message = match self.place_message(envelope, &topic, &task).await? {
            Placement::New(message) => message,
            Placement::Redelivered(seq_id) => {
                debug!(topic_id = %topic.id, seq_id, "Duplicate sandbox message ignored");
                return Ok(IngestOutcome::Duplicate {
                    topic_id: topic.id,
                    seq_id,
                });
            }
        };
        let seq_id = message.seq_id;

        if let Err(e) = self.apply_effects(envelope, &topic, &task).await {
            let marked = self
                .storage()
                .update_processing_status(&message.id, ProcessingStatus::Failed, Some(&e.to_string()), None)
                .await;
            if let Err(mark_err) = marked {
                error!(message_id = %message.id, error = %mark_err, "Failed to mark message as failed");
            }
            return Err(e);
        }

        self.storage()
            .update_processing_status(&message.id, ProcessingStatus::Processed, None, None)
            .await?;

        debug!(
            topic_id = %topic.id,
            task_id = %task.id,
            seq_id,
            message_type = %envelope.payload.message_type,
            "Sandbox message stored"
        );
        Ok(IngestOutcome::Stored {
            topic_id: topic.id,
            seq_id,
        })
    }

    /// Re-apply the effects of FAILED messages that still have retry budget
    pub async fn replay_failed_messages(&self, max_retries: i32, limit: u32) -> Result<ReplayReport> {
        let failed = self
            .storage()
            .find_retriable_failed_messages(max_retries, limit)
            .await?;
        let mut report = ReplayReport::default();

        for message in failed {
            report.attempted += 1;
            let retry_count = message.retry_count + 1;

            let Some(raw) = message.raw_data.clone() else {
                self.storage()
                    .update_processing_status(
                        &message.id,
                        ProcessingStatus::Failed,
                        Some("no raw data to replay"),
                        Some(max_retries),
                    )
                    .await?;
                continue;
            };

            let envelope = match SandboxEnvelope::parse(raw) {
                Ok(envelope) => envelope,
                Err(e) => {
                    self.storage()
                        .update_processing_status(
                            &message.id,
                            ProcessingStatus::Failed,
                            Some(&e.to_string()),
                            Some(max_retries),
                        )
                        .await?;
                    continue;
                }
            };

            let lease = match envelope.sandbox_id() {
                Some(sandbox_id) => match self.lock_sandbox(sandbox_id).await {
                    Some(lease) => Some(lease),
                    // Busy sandbox: leave the message for the next pass
                    None => continue,
                },
                None => None,
            };

            let result = self.replay_one(&message, &envelope).await;
            if let Some(lease) = lease {
                lease.release().await;
            }

            match result {
                Ok(()) => {
                    self.storage()
                        .update_processing_status(
                            &message.id,
                            ProcessingStatus::Processed,
                            None,
                            Some(retry_count),
                        )
                        .await?;
                    report.recovered += 1;
                }
                Err(e) => {
                    warn!(message_id = %message.id, retry_count, error = %e, "Replay failed");
                    self.storage()
                        .update_processing_status(
                            &message.id,
                            ProcessingStatus::Failed,
                            Some(&e.to_string()),
                            Some(retry_count),
                        )
                        .await?;
                }
            }
        }

        if report.attempted > 0 {
            info!(
                attempted = report.attempted,
                recovered = report.recovered,
                "Replayed failed sandbox messages"
            );
        }
        Ok(report)
    }

    async fn replay_one(&self, message: &TaskMessage, envelope: &SandboxEnvelope) -> Result<()> {
        let topic = self.service.get_topic(&message.topic_id).await?;
        let task = self.service.get_task(&message.task_id).await?;
        self.apply_effects(envelope, &topic, &task).await
    }

    async fn lock_sandbox(&self, sandbox_id: &str) -> Option<LockLease> {
        acquire_with_retry(
            self.lock.clone(),
            &sandbox_lock_key(sandbox_id),
            self.lock_ttl,
            &self.lock_retry,
            self.sleeper.as_ref(),
        )
        .await
    }

    async fn resolve_topic(&self, envelope: &SandboxEnvelope) -> Result<Topic> {
        if let Some(sandbox_id) = envelope.sandbox_id() {
            return self
                .storage()
                .get_topic_by_sandbox_id(sandbox_id)
                .await?
                .ok_or_else(|| IngestError::TopicNotFound(sandbox_id.to_string()));
        }

        match envelope.topic_id() {
            Some(topic_id) => Ok(self.service.get_topic(topic_id).await?),
            None => Err(IngestError::InvalidEnvelope(
                "message names neither a sandbox nor a topic".to_string(),
            )),
        }
    }

    /// The payload's task when it belongs to this topic, else the topic's current task
    async fn resolve_task(&self, topic: &Topic, envelope: &SandboxEnvelope) -> Result<Task> {
        let task_id = &envelope.payload.task_id;
        match self.storage().get_task(task_id).await {
            Ok(task) if task.topic_id == topic.id => return Ok(task),
            Ok(_) | Err(StorageError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        match topic.current_task_id.as_deref() {
            Some(current) => Ok(self.service.get_task(current).await?),
            None => Err(TaskError::TaskNotFound(task_id.clone()).into()),
        }
    }

    /// Store the envelope as a message of `topic`.
    ///
    /// A producer-supplied sequence id (payload `seq_id`, else a numeric `message_id`) is
    /// used when free. When another message already holds it, or the producer gave none,
    /// the next free id of the topic is assigned atomically on insert. Only a row with the
    /// same `message_id` counts as a redelivery.
    async fn place_message(
        &self,
        envelope: &SandboxEnvelope,
        topic: &Topic,
        task: &Task,
    ) -> Result<Placement> {
        let mut message = build_message(envelope, topic, task, 0);

        if let Some(seq_id) = producer_seq_id(envelope) {
            message.seq_id = seq_id;
            if self.storage().insert_message_if_absent(&message).await? {
                return Ok(Placement::New(message));
            }

            let holder = self.storage().find_message_by_seq(&topic.id, seq_id).await?;
            if holder.is_some_and(|held| held.message_id == message.message_id) {
                return Ok(Placement::Redelivered(seq_id));
            }
            warn!(
                topic_id = %topic.id,
                seq_id,
                message_id = %message.message_id,
                "Sequence id already used by another message; assigning the next free one"
            );
        }

        match self.storage().insert_message_with_next_seq(&message).await? {
            Some(seq_id) => {
                message.seq_id = seq_id;
                Ok(Placement::New(message))
            }
            None => {
                let existing = self
                    .storage()
                    .find_message_by_message_id(&topic.id, &message.message_id)
                    .await?
                    .ok_or_else(|| {
                        StorageError::NotFound(format!("task message {}", message.message_id))
                    })?;
                Ok(Placement::Redelivered(existing.seq_id))
            }
        }
    }

    async fn apply_effects(&self, envelope: &SandboxEnvelope, topic: &Topic, task: &Task) -> Result<()> {
        let sandbox_id = envelope
            .sandbox_id()
            .or(topic.sandbox_id.as_deref())
            .unwrap_or_default();

        for record in extract_token_usage(envelope, topic, task, sandbox_id) {
            let inserted = self.storage().insert_token_usage_if_absent(&record).await?;
            if inserted {
                info!(
                    task_id = %task.id,
                    model_id = %record.model_id,
                    total_tokens = record.total_tokens,
                    "Token usage recorded"
                );
            }
        }

        if let Some(status) = envelope.task_status() {
            let error_message = (status == TaskStatus::Error)
                .then_some(envelope.payload.content.as_str())
                .filter(|content| !content.is_empty());
            self.service
                .update_task_status(task, status, None, error_message)
                .await?;
        }

        Ok(())
    }

    async fn dead_letter_envelope(
        &self,
        envelope: &SandboxEnvelope,
        reason: DeadLetterReason,
        error: String,
    ) {
        self.dead_letter(
            reason,
            error,
            envelope.sandbox_id().map(str::to_string),
            Some(envelope.message_id().to_string()),
            envelope.raw.clone(),
        )
        .await;
    }

    async fn dead_letter(
        &self,
        reason: DeadLetterReason,
        error: String,
        sandbox_id: Option<String>,
        message_id: Option<String>,
        payload: serde_json::Value,
    ) {
        let letter = DeadLetter::new(reason, error, sandbox_id, message_id, payload);
        if let Err(e) = self.dead_letters.record(letter).await {
            error!(reason = %reason, error = %e, "Failed to record dead letter");
        }
    }
}

/// Where a delivery landed in its topic's message sequence
enum Placement {
    New(TaskMessage),
    Redelivered(i64),
}

fn producer_seq_id(envelope: &SandboxEnvelope) -> Option<i64> {
    envelope
        .payload
        .seq_id
        .or_else(|| envelope.message_id().parse::<i64>().ok())
}

fn build_message(envelope: &SandboxEnvelope, topic: &Topic, task: &Task, seq_id: i64) -> TaskMessage {
    let payload = &envelope.payload;
    let receiver_uid = if envelope.metadata.user_id.is_empty() {
        task.user_id.clone()
    } else {
        envelope.metadata.user_id.clone()
    };
    let now = Utc::now();

    TaskMessage {
        id: generate_id("msg"),
        message_id: payload.message_id.clone(),
        topic_id: topic.id.clone(),
        task_id: task.id.clone(),
        seq_id,
        sender_type: SenderType::Assistant,
        sender_uid: envelope.metadata.agent_user_id.clone(),
        receiver_uid,
        message_type: payload.message_type.clone(),
        status: payload.status.clone(),
        content: payload.content.clone(),
        steps: payload.steps.clone(),
        tool: payload.tool.clone(),
        attachments: serde_json::Value::Array(payload.attachments.clone()),
        event: payload.event.clone(),
        show_in_ui: payload.show_in_ui,
        processing_status: ProcessingStatus::Processing,
        error_message: None,
        retry_count: 0,
        raw_data: Some(envelope.raw.clone()),
        created_at: now,
        updated_at: now,
    }
}
