// ABOUTME: Drives a task from request to a running sandbox conversation
// ABOUTME: Creates the task, provisions the sandbox, boots the agent and sends the prompt

use std::sync::Arc;
use tracing::{error, info, warn};

use superagent_core::constants::UPLOAD_CREDENTIAL_EXPIRES;
use superagent_core::{CallbackConfig, Config, ReadinessConfig};
use superagent_sandbox::{
    ensure_sandbox_available, wait_for_workspace_ready, ChatMessageRequest, InitAgentRequest,
    InterruptRequest, SandboxAgent, SandboxGateway, StartBudget, WorkspaceStatus,
};
use superagent_storage::{Task, TaskStatus, Topic};

use crate::collaborators::{
    CredentialProvider, FileResolver, NoopCredentialProvider, NoopFileResolver,
};
use crate::error::{Result, TaskError};
use crate::service::TaskDomainService;
use crate::types::{Instruction, TaskRequest};

const RESUME_PROMPT: &str = "continue";

pub struct TaskDispatcher {
    service: TaskDomainService,
    gateway: Arc<dyn SandboxGateway>,
    agent: Arc<dyn SandboxAgent>,
    files: Arc<dyn FileResolver>,
    credentials: Arc<dyn CredentialProvider>,
    callbacks: CallbackConfig,
    readiness: ReadinessConfig,
    start_budget: StartBudget,
}

impl TaskDispatcher {
    pub fn new(
        service: TaskDomainService,
        gateway: Arc<dyn SandboxGateway>,
        agent: Arc<dyn SandboxAgent>,
        config: &Config,
    ) -> Self {
        Self {
            service,
            gateway,
            agent,
            files: Arc::new(NoopFileResolver),
            credentials: Arc::new(NoopCredentialProvider),
            callbacks: config.callbacks.clone(),
            readiness: config.readiness.clone(),
            start_budget: StartBudget::from(&config.readiness),
        }
    }

    pub fn with_file_resolver(mut self, files: Arc<dyn FileResolver>) -> Self {
        self.files = files;
        self
    }

    pub fn with_credential_provider(mut self, credentials: Arc<dyn CredentialProvider>) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_start_budget(mut self, start_budget: StartBudget) -> Self {
        self.start_budget = start_budget;
        self
    }

    pub fn service(&self) -> &TaskDomainService {
        &self.service
    }

    /// Run a request against a topic.
    ///
    /// Interrupts stop the running task. Everything else gets a new task that ends up
    /// RUNNING in a ready sandbox, or ERROR with the failure text.
    pub async fn run_task(&self, topic_id: &str, request: TaskRequest) -> Result<Task> {
        let task = self.service.init_topic_task(topic_id, &request).await?;

        match &request.instruction {
            Instruction::Interrupted { reason } => {
                self.interrupt(&task, &request.user_id, reason).await?;
                return self.service.get_task(&task.id).await;
            }
            Instruction::Normal | Instruction::SwitchMode { .. } => {}
        }

        match self.start(&task, &request).await {
            Ok(sandbox_id) => {
                info!(task_id = %task.id, sandbox_id = %sandbox_id, "Task dispatched to sandbox");
                self.service.get_task(&task.id).await
            }
            Err(e) => {
                error!(task_id = %task.id, error = %e, "Task dispatch failed");
                if let Err(update_err) = self
                    .service
                    .update_task_status(&task, TaskStatus::Error, None, Some(&e.to_string()))
                    .await
                {
                    error!(task_id = %task.id, error = %update_err, "Failed to record dispatch failure");
                }
                Err(e)
            }
        }
    }

    async fn interrupt(&self, task: &Task, user_id: &str, reason: &str) -> Result<()> {
        if let Some(sandbox_id) = task.sandbox_id.as_deref().filter(|id| !id.is_empty()) {
            let request = InterruptRequest::new(user_id, &task.id, reason);
            // The sandbox may finish on its own first; both outcomes are fine
            if let Err(e) = self.agent.send_interrupt(sandbox_id, &request).await {
                warn!(task_id = %task.id, sandbox_id = %sandbox_id, error = %e, "Interrupt not delivered");
            }
        }

        self.service
            .update_task_status(task, TaskStatus::Suspended, None, None)
            .await?;
        Ok(())
    }

    async fn start(&self, task: &Task, request: &TaskRequest) -> Result<String> {
        let topic = self.service.get_topic(&task.topic_id).await?;

        // A topic without a sandbox gets one named after itself
        let requested_id = topic
            .sandbox_id
            .clone()
            .filter(|id| !id.is_empty())
            .unwrap_or_else(|| topic.id.clone());

        let sandbox_id = ensure_sandbox_available(
            self.gateway.as_ref(),
            &requested_id,
            &topic.project_id,
            &task.work_dir,
            self.start_budget,
        )
        .await?;

        if topic.sandbox_id.as_deref() != Some(sandbox_id.as_str()) {
            self.service
                .storage()
                .update_topic_sandbox(&topic.id, &sandbox_id, None)
                .await?;
        }

        let workspace = self.agent.get_workspace_status(&sandbox_id).await;
        if !matches!(workspace, Ok(WorkspaceStatus::Ready)) {
            self.init_agent(&sandbox_id, &topic, task).await?;
        }

        wait_for_workspace_ready(
            self.agent.as_ref(),
            &sandbox_id,
            self.readiness.timeout,
            self.readiness.poll_interval,
        )
        .await?;

        let mentions = self
            .files
            .resolve_mentions(&request.mentioned_file_ids, &topic.project_id)
            .await?;
        let chat = ChatMessageRequest::new(&request.user_id, &task.id, &request.prompt)
            .with_task_mode(task.task_mode.clone())
            .with_attachments(request.attachments.clone())
            .with_mentions(mentions)
            .with_model_id(request.model_id.clone());

        let response = self.agent.send_chat(&sandbox_id, &chat).await?;
        if let Some(external_id) = response.data.get("task_id").and_then(|v| v.as_str()) {
            self.service
                .storage()
                .set_task_external_id(&task.id, external_id)
                .await?;
        }

        self.service
            .update_task_status(task, TaskStatus::Running, Some(&sandbox_id), None)
            .await?;
        Ok(sandbox_id)
    }

    async fn init_agent(&self, sandbox_id: &str, topic: &Topic, task: &Task) -> Result<()> {
        let upload_config = self
            .credentials
            .upload_credentials(&topic.project_id, UPLOAD_CREDENTIAL_EXPIRES)
            .await?;

        let request = InitAgentRequest::new(
            &task.user_id,
            &task.organization_code,
            &topic.project_id,
            &topic.id,
        )
        .with_callbacks(
            &self.callbacks.message_url,
            &self.callbacks.credential_refresh_url,
        )
        .with_upload_config(upload_config)
        .with_work_dir(task.work_dir.clone())
        .with_task_mode(task.task_mode.clone());

        self.agent.init_agent(sandbox_id, &request).await?;
        Ok(())
    }

    /// Nudge a sandbox to continue the topic's current task, re-initializing the agent first
    /// when the sandbox restarted
    pub async fn resume_sandbox(&self, sandbox_id: &str, is_init: bool) -> Result<()> {
        let topic = self
            .service
            .storage()
            .get_topic_by_sandbox_id(sandbox_id)
            .await?
            .ok_or_else(|| TaskError::TopicNotFound(format!("sandbox {}", sandbox_id)))?;
        let task_id = topic
            .current_task_id
            .clone()
            .ok_or_else(|| TaskError::TaskNotFound(format!("topic {} has no task", topic.id)))?;
        let task = self.service.get_task(&task_id).await?;

        info!(sandbox_id = %sandbox_id, task_id = %task.id, is_init, "Resuming sandbox");

        if is_init {
            self.init_agent(sandbox_id, &topic, &task).await?;
        }

        let chat = ChatMessageRequest::new(&task.user_id, &task.id, RESUME_PROMPT)
            .with_task_mode(task.task_mode.clone());
        self.agent.send_chat(sandbox_id, &chat).await?;

        self.service
            .update_task_status(&task, TaskStatus::Running, Some(sandbox_id), None)
            .await?;
        Ok(())
    }
}
