// ABOUTME: Handlers for sandbox callbacks: message delivery, resume and health
// ABOUTME: Delivery only validates and enqueues; ingestion happens on the worker pool

use axum::{body::Bytes, extract::State, Json};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tracing::{error, info};

use superagent_ingest::SandboxEnvelope;

use crate::error::{ApiError, ApiResult};
use crate::AppState;

/// Accept a progress message from a sandbox and queue it for ingestion
pub async fn deliver_message(
    State(state): State<AppState>,
    body: Bytes,
) -> ApiResult<Json<JsonValue>> {
    let body = decode_body(&body)?;
    let envelope = SandboxEnvelope::parse(body.clone())?;

    state.publisher.publish(body).await?;
    info!(
        sandbox_id = ?envelope.sandbox_id(),
        message_id = %envelope.message_id(),
        message_type = %envelope.payload.message_type,
        "Sandbox message queued"
    );

    Ok(Json(json!({
        "success": true,
        "message_id": envelope.message_id(),
    })))
}

#[derive(Debug, Deserialize)]
pub struct ResumeRequest {
    pub sandbox_id: String,
    #[serde(default)]
    pub is_init: bool,
}

/// Resume the current task of a sandbox that restarted
pub async fn resume(State(state): State<AppState>, body: Bytes) -> ApiResult<Json<JsonValue>> {
    let request: ResumeRequest = serde_json::from_slice(&body)
        .map_err(|e| ApiError::BadRequest(format!("invalid resume request: {}", e)))?;
    if request.sandbox_id.trim().is_empty() {
        return Err(ApiError::BadRequest("sandbox_id is required".to_string()));
    }

    info!(sandbox_id = %request.sandbox_id, is_init = request.is_init, "Resuming sandbox");
    let dispatcher = state.dispatcher.clone();
    tokio::spawn(async move {
        if let Err(e) = dispatcher
            .resume_sandbox(&request.sandbox_id, request.is_init)
            .await
        {
            error!(sandbox_id = %request.sandbox_id, error = %e, "Sandbox resume failed");
        }
    });

    Ok(Json(json!({ "success": true })))
}

pub async fn health_check() -> Json<JsonValue> {
    Json(json!({
        "status": "healthy",
        "service": "superagent",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Parse a delivery body, unwrapping `{obfuscated: true, data: "<base64 json>"}`
fn decode_body(raw: &[u8]) -> ApiResult<JsonValue> {
    let body: JsonValue = serde_json::from_slice(raw)
        .map_err(|e| ApiError::BadRequest(format!("body is not valid JSON: {}", e)))?;

    let obfuscated = body
        .get("obfuscated")
        .and_then(JsonValue::as_bool)
        .unwrap_or(false);
    if !obfuscated {
        return Ok(body);
    }

    let data = body
        .get("data")
        .and_then(JsonValue::as_str)
        .ok_or_else(|| ApiError::BadRequest("obfuscated body has no data".to_string()))?;
    let decoded = STANDARD
        .decode(data.trim())
        .map_err(|e| ApiError::BadRequest(format!("obfuscated data is not base64: {}", e)))?;
    serde_json::from_slice(&decoded)
        .map_err(|e| ApiError::BadRequest(format!("obfuscated data is not valid JSON: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_plain_body() {
        let body = decode_body(br#"{"payload": {"message_id": "m-1"}}"#).unwrap();
        assert_eq!(body["payload"]["message_id"], "m-1");
    }

    #[test]
    fn test_decode_obfuscated_body() {
        let inner = r#"{"payload":{"message_id":"m-2"}}"#;
        let wrapped = json!({"obfuscated": true, "data": STANDARD.encode(inner)});
        let body = decode_body(wrapped.to_string().as_bytes()).unwrap();
        assert_eq!(body["payload"]["message_id"], "m-2");
    }

    #[test]
    fn test_decode_rejects_bad_bodies() {
        assert!(matches!(decode_body(b"not json"), Err(ApiError::BadRequest(_))));
        assert!(matches!(
            decode_body(br#"{"obfuscated": true, "data": "%%%"}"#),
            Err(ApiError::BadRequest(_))
        ));
        assert!(matches!(
            decode_body(br#"{"obfuscated": true}"#),
            Err(ApiError::BadRequest(_))
        ));
    }
}
