// ABOUTME: Token usage extraction from sandbox summary events
// ABOUTME: Produces one record per model listed in token_usage_details.usages

use serde_json::Value as JsonValue;

use superagent_storage::{Task, TokenUsageRecord, Topic};

use crate::envelope::SandboxEnvelope;

/// Usage records carried by a summary event; empty for any other event
pub fn extract_token_usage(
    envelope: &SandboxEnvelope,
    topic: &Topic,
    task: &Task,
    sandbox_id: &str,
) -> Vec<TokenUsageRecord> {
    if !envelope.is_summary() {
        return Vec::new();
    }
    let Some(details) = envelope.payload.token_usage_details.as_ref() else {
        return Vec::new();
    };
    let usage_type = details
        .get("type")
        .and_then(JsonValue::as_str)
        .unwrap_or("summary")
        .to_string();
    let Some(usages) = details.get("usages").and_then(JsonValue::as_array) else {
        return Vec::new();
    };

    let task_status = envelope
        .task_status()
        .map(|status| status.as_str().to_string())
        .unwrap_or_else(|| envelope.payload.status.clone());

    usages
        .iter()
        .filter_map(|usage| {
            let model_id = usage.get("model_id").and_then(JsonValue::as_str)?;
            if model_id.is_empty() {
                return None;
            }
            Some(TokenUsageRecord {
                topic_id: topic.id.clone(),
                task_id: task.id.clone(),
                sandbox_id: sandbox_id.to_string(),
                organization_code: task.organization_code.clone(),
                user_id: task.user_id.clone(),
                task_status: task_status.clone(),
                usage_type: usage_type.clone(),
                total_input_tokens: int_at(usage, "/input_tokens"),
                total_output_tokens: int_at(usage, "/output_tokens"),
                total_tokens: int_at(usage, "/total_tokens"),
                model_id: model_id.to_string(),
                model_name: usage
                    .get("model_name")
                    .and_then(JsonValue::as_str)
                    .unwrap_or(model_id)
                    .to_string(),
                cached_tokens: int_at(usage, "/input_tokens_details/cached_tokens"),
                cache_write_tokens: int_at(usage, "/input_tokens_details/cache_write_tokens"),
                reasoning_tokens: int_at(usage, "/output_tokens_details/reasoning_tokens"),
                usage_details: Some(usage.clone()),
                ..Default::default()
            })
        })
        .collect()
}

fn int_at(value: &JsonValue, pointer: &str) -> i64 {
    value
        .pointer(pointer)
        .and_then(|v| v.as_i64().or_else(|| v.as_str().and_then(|s| s.parse().ok())))
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use superagent_storage::TaskStatus;

    fn topic() -> Topic {
        Topic {
            id: "topic-1".to_string(),
            project_id: "proj-1".to_string(),
            workspace_id: "ws-1".to_string(),
            user_id: "user-1".to_string(),
            organization_code: "org-1".to_string(),
            name: "Topic".to_string(),
            sandbox_id: Some("sb-1".to_string()),
            current_task_id: Some("task-1".to_string()),
            current_task_status: Some(TaskStatus::Running),
            task_mode: "chat".to_string(),
            work_dir: "/workspace".to_string(),
            created_at: Utc::now(),
            updated_at: Utc::now(),
            deleted_at: None,
        }
    }

    fn task() -> Task {
        Task {
            id: "task-1".to_string(),
            topic_id: "topic-1".to_string(),
            project_id: "proj-1".to_string(),
            user_id: "user-1".to_string(),
            organization_code: "org-1".to_string(),
            sandbox_id: Some("sb-1".to_string()),
            external_task_id: String::new(),
            prompt: "go".to_string(),
            attachments: json!([]),
            task_mode: "chat".to_string(),
            work_dir: "/workspace".to_string(),
            status: TaskStatus::Running,
            error_message: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_one_record_per_model() {
        let envelope = SandboxEnvelope::parse(json!({
            "metadata": {"sandbox_id": "sb-1"},
            "payload": {
                "message_id": "m-9",
                "type": "summary",
                "task_id": "task-1",
                "status": "finished",
                "token_usage_details": {
                    "type": "summary",
                    "usages": [
                        {
                            "model_id": "gpt-4o",
                            "model_name": "GPT-4o",
                            "input_tokens": 1200,
                            "output_tokens": 300,
                            "total_tokens": 1500,
                            "input_tokens_details": {"cached_tokens": 200, "cache_write_tokens": 50},
                            "output_tokens_details": {"reasoning_tokens": 40}
                        },
                        {"model_id": "claude", "input_tokens": "10", "output_tokens": 5, "total_tokens": 15},
                        {"model_name": "no id"}
                    ]
                }
            }
        }))
        .unwrap();

        let records = extract_token_usage(&envelope, &topic(), &task(), "sb-1");
        assert_eq!(records.len(), 2);

        let first = &records[0];
        assert_eq!(first.model_name, "GPT-4o");
        assert_eq!(first.total_tokens, 1500);
        assert_eq!(first.cached_tokens, 200);
        assert_eq!(first.cache_write_tokens, 50);
        assert_eq!(first.reasoning_tokens, 40);
        assert_eq!(first.task_status, "finished");
        assert_eq!(first.usage_type, "summary");

        assert_eq!(records[1].model_name, "claude");
        assert_eq!(records[1].total_input_tokens, 10);
    }

    #[test]
    fn test_non_summary_events_carry_no_usage() {
        let envelope = SandboxEnvelope::parse(json!({
            "payload": {
                "message_id": "m-1",
                "type": "chat",
                "task_id": "task-1",
                "token_usage_details": {"usages": [{"model_id": "gpt-4o"}]}
            }
        }))
        .unwrap();
        assert!(extract_token_usage(&envelope, &topic(), &task(), "sb-1").is_empty());
    }
}
