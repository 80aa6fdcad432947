// ABOUTME: Integration tests for dispatching a task into a freshly provisioned sandbox
// ABOUTME: Uses an in-memory database with scripted gateway and agent doubles

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;

use superagent_core::Config;
use superagent_sandbox::test_utils::{RecordingAgent, ScriptedGateway};
use superagent_sandbox::{Mention, SandboxState, StartBudget, WorkspaceStatus};
use superagent_storage::test_utils::{memory_storage, seed_topic};
use superagent_storage::TaskStatus;
use superagent_tasks::{
    CredentialProvider, FileResolver, TaskDispatcher, TaskDomainService, TaskRequest,
};

struct CdnFiles;

#[async_trait]
impl FileResolver for CdnFiles {
    async fn resolve_mentions(
        &self,
        file_ids: &[String],
        _project_id: &str,
    ) -> superagent_tasks::Result<Vec<Mention>> {
        Ok(file_ids
            .iter()
            .map(|id| Mention {
                mention_type: "file".to_string(),
                file_path: format!("https://cdn.example/{}", id),
                metadata: json!({ "file_id": id }),
            })
            .collect())
    }
}

struct FixedCredentials;

#[async_trait]
impl CredentialProvider for FixedCredentials {
    async fn upload_credentials(
        &self,
        project_id: &str,
        expires: Duration,
    ) -> superagent_tasks::Result<JsonValue> {
        Ok(json!({ "project_id": project_id, "expires": expires.as_secs() }))
    }
}

/// Topic without sandbox → task WAITING → sandbox created → ready after 2 polls → RUNNING
#[tokio::test]
async fn test_dispatch_into_new_sandbox() {
    let storage = memory_storage().await;
    let (project, topic) = seed_topic(&storage, None).await;

    let gateway = Arc::new(ScriptedGateway::new([
        SandboxState::NotFound,
        SandboxState::Pending,
        SandboxState::Running,
    ]));
    let agent = Arc::new(RecordingAgent::with_workspace([
        WorkspaceStatus::Uninitialized,
        WorkspaceStatus::Initializing,
        WorkspaceStatus::Ready,
    ]));

    let mut config = Config::from_lookup(|_| None).unwrap();
    config.readiness.poll_interval = Duration::from_millis(10);

    let dispatcher = TaskDispatcher::new(
        TaskDomainService::new(storage.clone()),
        gateway.clone(),
        agent.clone(),
        &config,
    )
    .with_file_resolver(Arc::new(CdnFiles))
    .with_credential_provider(Arc::new(FixedCredentials))
    .with_start_budget(StartBudget {
        timeout: Duration::from_secs(5),
        poll_interval: Duration::from_millis(10),
    });

    let mut request = TaskRequest::chat("user-1", "org-1", "summarize the repo");
    request.mentioned_file_ids = vec!["file-7".to_string()];

    let task = dispatcher.run_task(&topic.id, request).await.unwrap();

    // The sandbox is named after the topic and was polled twice after creation
    assert_eq!(gateway.created(), vec![topic.id.clone()]);
    assert_eq!(gateway.status_calls(), 3);

    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(task.sandbox_id.as_deref(), Some(topic.id.as_str()));

    let topic_after = storage.get_topic(&topic.id).await.unwrap();
    assert_eq!(topic_after.sandbox_id.as_deref(), Some(topic.id.as_str()));
    assert_eq!(topic_after.current_task_status, Some(TaskStatus::Running));
    let project_after = storage.get_project(&project.id).await.unwrap();
    assert_eq!(project_after.current_topic_status, Some(TaskStatus::Running));

    // A fresh workspace gets the bootstrap payload before the prompt
    let inits = agent.inits.lock().unwrap().clone();
    assert_eq!(inits.len(), 1);
    assert_eq!(inits[0].1.upload_config["expires"], 3600);
    assert!(inits[0]
        .1
        .message_subscription_config
        .url
        .ends_with("/tasks/deliver-message"));

    let chats = agent.chats.lock().unwrap().clone();
    assert_eq!(chats.len(), 1);
    assert_eq!(chats[0].1.prompt, "summarize the repo");
    assert_eq!(chats[0].1.mentions[0].file_path, "https://cdn.example/file-7");
}

/// A sandbox that exits while starting fails the task with the gateway error
#[tokio::test]
async fn test_dispatch_fails_when_sandbox_exits() {
    let storage = memory_storage().await;
    let (_, topic) = seed_topic(&storage, Some("sb-dead")).await;

    let gateway = Arc::new(ScriptedGateway::new([
        SandboxState::Exited,
        SandboxState::Exited,
    ]));
    let agent = Arc::new(RecordingAgent::ready());
    let config = Config::from_lookup(|_| None).unwrap();

    let dispatcher = TaskDispatcher::new(
        TaskDomainService::new(storage.clone()),
        gateway,
        agent.clone(),
        &config,
    )
    .with_start_budget(StartBudget {
        timeout: Duration::from_secs(1),
        poll_interval: Duration::from_millis(10),
    });

    let result = dispatcher
        .run_task(&topic.id, TaskRequest::chat("user-1", "org-1", "hi"))
        .await;
    assert!(result.is_err());
    assert_eq!(agent.chat_count(), 0);

    let topic = storage.get_topic(&topic.id).await.unwrap();
    let task = storage
        .get_task(topic.current_task_id.as_deref().unwrap())
        .await
        .unwrap();
    assert_eq!(task.status, TaskStatus::Error);
    assert!(task.error_message.unwrap().contains("sb-dead"));
}

/// The sandbox start wait follows the configured readiness budget
#[tokio::test]
async fn test_dispatch_start_wait_uses_readiness_config() {
    let storage = memory_storage().await;
    let (_, topic) = seed_topic(&storage, Some("sb-slow")).await;

    let mut states = vec![SandboxState::NotFound];
    states.extend(std::iter::repeat(SandboxState::Pending).take(40));
    states.push(SandboxState::Running);
    let gateway = Arc::new(ScriptedGateway::new(states));
    let agent = Arc::new(RecordingAgent::ready());

    let mut config = Config::from_lookup(|_| None).unwrap();
    config.readiness.poll_interval = Duration::from_millis(10);
    config.readiness.timeout = Duration::from_secs(30);

    let dispatcher = TaskDispatcher::new(
        TaskDomainService::new(storage.clone()),
        gateway.clone(),
        agent.clone(),
        &config,
    );

    let task = dispatcher
        .run_task(&topic.id, TaskRequest::chat("user-1", "org-1", "hi"))
        .await
        .unwrap();

    assert_eq!(task.status, TaskStatus::Running);
    assert_eq!(gateway.status_calls(), 42);
    assert_eq!(agent.chat_count(), 1);
}
