// ABOUTME: Parsing and validation of progress messages posted by sandboxes
// ABOUTME: Accepts the {metadata, payload} format and the legacy flat format

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value as JsonValue;

use superagent_storage::TaskStatus;

use crate::error::{IngestError, Result};

/// Which wire layout a message arrived in
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnvelopeFormat {
    Structured,
    Legacy,
}

/// Routing information about the sender of a message
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EnvelopeMetadata {
    #[serde(default, deserialize_with = "lenient_string")]
    pub sandbox_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub agent_user_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub user_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub organization_code: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub instruction: String,
    /// Orchestrator topic id, used when the message carries no sandbox id
    #[serde(default, deserialize_with = "lenient_string")]
    pub topic_id: String,
}

/// The progress event itself
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EnvelopePayload {
    #[serde(default, deserialize_with = "lenient_string")]
    pub message_id: String,
    #[serde(rename = "type", default, deserialize_with = "lenient_string")]
    pub message_type: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub task_id: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub status: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub content: String,
    #[serde(default)]
    pub steps: Option<JsonValue>,
    #[serde(default)]
    pub tool: Option<JsonValue>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub event: String,
    #[serde(default, deserialize_with = "lenient_list")]
    pub attachments: Vec<JsonValue>,
    #[serde(default = "default_show_in_ui")]
    pub show_in_ui: bool,
    #[serde(default)]
    pub seq_id: Option<i64>,
    #[serde(default)]
    pub token_usage_details: Option<JsonValue>,
    #[serde(default)]
    pub send_timestamp: Option<i64>,
}

fn default_show_in_ui() -> bool {
    true
}

/// A sandbox message ready for ingestion
#[derive(Debug, Clone)]
pub struct SandboxEnvelope {
    pub format: EnvelopeFormat,
    pub metadata: EnvelopeMetadata,
    pub payload: EnvelopePayload,
    /// The body exactly as received, kept as the message's raw data
    pub raw: JsonValue,
}

impl SandboxEnvelope {
    /// Parse and validate a message body
    pub fn parse(raw: JsonValue) -> Result<Self> {
        if !raw.is_object() {
            return Err(IngestError::InvalidEnvelope(
                "message body must be a JSON object".to_string(),
            ));
        }

        let structured = raw.get("payload").map(JsonValue::is_object).unwrap_or(false);
        let envelope = if structured {
            let metadata = match raw.get("metadata") {
                Some(value) if value.is_object() => serde_json::from_value(value.clone())?,
                _ => EnvelopeMetadata::default(),
            };
            let payload = serde_json::from_value(raw["payload"].clone())?;
            Self {
                format: EnvelopeFormat::Structured,
                metadata,
                payload,
                raw,
            }
        } else {
            // Legacy messages keep routing fields next to the event fields
            Self {
                format: EnvelopeFormat::Legacy,
                metadata: serde_json::from_value(raw.clone())?,
                payload: serde_json::from_value(raw.clone())?,
                raw,
            }
        };

        envelope.validate()?;
        Ok(envelope)
    }

    fn validate(&self) -> Result<()> {
        let required = [
            ("message_id", &self.payload.message_id),
            ("type", &self.payload.message_type),
            ("task_id", &self.payload.task_id),
        ];
        for (field, value) in required {
            if value.trim().is_empty() {
                return Err(IngestError::InvalidEnvelope(format!(
                    "payload is missing {}",
                    field
                )));
            }
        }
        Ok(())
    }

    pub fn sandbox_id(&self) -> Option<&str> {
        non_empty(&self.metadata.sandbox_id)
    }

    pub fn topic_id(&self) -> Option<&str> {
        non_empty(&self.metadata.topic_id)
    }

    pub fn message_id(&self) -> &str {
        &self.payload.message_id
    }

    /// Status carried by the event, when it names a task status
    pub fn task_status(&self) -> Option<TaskStatus> {
        non_empty(&self.payload.status).and_then(|status| TaskStatus::from_str(status).ok())
    }

    /// Whether the event is an end-of-task summary with token usage
    pub fn is_summary(&self) -> bool {
        if self.payload.message_type == "summary" {
            return true;
        }
        self.payload
            .token_usage_details
            .as_ref()
            .and_then(|details| details.get("type"))
            .and_then(JsonValue::as_str)
            == Some("summary")
    }
}

/// Best-effort sandbox id of a body that failed to parse, for dead-letter records
pub fn peek_sandbox_id(raw: &JsonValue) -> Option<String> {
    raw.pointer("/metadata/sandbox_id")
        .or_else(|| raw.get("sandbox_id"))
        .and_then(JsonValue::as_str)
        .map(str::to_string)
}

/// Best-effort message id of a body that failed to parse, for dead-letter records
pub fn peek_message_id(raw: &JsonValue) -> Option<String> {
    raw.pointer("/payload/message_id")
        .or_else(|| raw.get("message_id"))
        .and_then(|value| match value {
            JsonValue::String(s) => Some(s.clone()),
            JsonValue::Number(n) => Some(n.to_string()),
            _ => None,
        })
}

fn non_empty(value: &str) -> Option<&str> {
    let trimmed = value.trim();
    (!trimmed.is_empty()).then_some(trimmed)
}

/// Strings that producers sometimes send as numbers or null
fn lenient_string<'de, D>(deserializer: D) -> std::result::Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Null => String::new(),
        JsonValue::String(s) => s,
        JsonValue::Number(n) => n.to_string(),
        JsonValue::Bool(b) => b.to_string(),
        other => other.to_string(),
    })
}

fn lenient_list<'de, D>(deserializer: D) -> std::result::Result<Vec<JsonValue>, D::Error>
where
    D: Deserializer<'de>,
{
    Ok(match JsonValue::deserialize(deserializer)? {
        JsonValue::Array(items) => items,
        JsonValue::Null => Vec::new(),
        single => vec![single],
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    #[test]
    fn test_parse_structured_envelope() {
        let envelope = SandboxEnvelope::parse(json!({
            "metadata": {"sandbox_id": "sb-1", "user_id": "user-1", "organization_code": "org-1"},
            "payload": {
                "message_id": "m-1",
                "type": "thinking",
                "task_id": "task-1",
                "status": "running",
                "content": "Reading files",
                "seq_id": 4
            }
        }))
        .unwrap();

        assert_eq!(envelope.format, EnvelopeFormat::Structured);
        assert_eq!(envelope.sandbox_id(), Some("sb-1"));
        assert_eq!(envelope.payload.seq_id, Some(4));
        assert_eq!(envelope.task_status(), Some(TaskStatus::Running));
        assert!(envelope.payload.show_in_ui);
        assert!(!envelope.is_summary());
    }

    #[test]
    fn test_parse_legacy_envelope() {
        let envelope = SandboxEnvelope::parse(json!({
            "sandbox_id": "sb-2",
            "message_id": 17,
            "type": "summary",
            "task_id": "task-9",
            "status": "finished",
            "content": null,
            "attachments": null,
            "show_in_ui": false
        }))
        .unwrap();

        assert_eq!(envelope.format, EnvelopeFormat::Legacy);
        assert_eq!(envelope.sandbox_id(), Some("sb-2"));
        assert_eq!(envelope.message_id(), "17");
        assert_eq!(envelope.payload.content, "");
        assert!(envelope.payload.attachments.is_empty());
        assert!(!envelope.payload.show_in_ui);
        assert!(envelope.is_summary());
    }

    #[test]
    fn test_missing_required_fields_are_rejected() {
        let err = SandboxEnvelope::parse(json!({
            "metadata": {"sandbox_id": "sb-1"},
            "payload": {"message_id": "m-1", "task_id": "task-1"}
        }))
        .unwrap_err();
        assert!(matches!(err, IngestError::InvalidEnvelope(ref msg) if msg.contains("type")));

        assert!(SandboxEnvelope::parse(json!(["not", "an", "object"])).is_err());
    }

    #[test]
    fn test_unknown_status_is_not_a_task_status() {
        let envelope = SandboxEnvelope::parse(json!({
            "payload": {"message_id": "m-1", "type": "tool_call", "task_id": "t", "status": "streaming"}
        }))
        .unwrap();
        assert_eq!(envelope.task_status(), None);
        assert_eq!(envelope.sandbox_id(), None);
    }

    #[test]
    fn test_summary_detected_from_usage_details() {
        let envelope = SandboxEnvelope::parse(json!({
            "payload": {
                "message_id": "m-1",
                "type": "chat",
                "task_id": "t",
                "token_usage_details": {"type": "summary", "usages": []}
            }
        }))
        .unwrap();
        assert!(envelope.is_summary());
    }

    #[test]
    fn test_peek_ids_from_unparseable_body() {
        let body = json!({"metadata": {"sandbox_id": "sb-3"}, "payload": {"message_id": 5}});
        assert_eq!(peek_sandbox_id(&body).as_deref(), Some("sb-3"));
        assert_eq!(peek_message_id(&body).as_deref(), Some("5"));
    }
}
