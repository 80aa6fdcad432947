// ABOUTME: API error type rendered as a JSON error body
// ABOUTME: Maps auth, validation and queue failures to HTTP status codes

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;
use tracing::error;

use superagent_ingest::IngestError;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("Sandbox token required")]
    TokenRequired,

    #[error("Sandbox token invalid")]
    TokenInvalid,

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Ingestion queue unavailable")]
    QueueUnavailable,

    #[error("Internal error: {0}")]
    Internal(String),
}

#[derive(Serialize)]
struct ErrorResponse {
    success: bool,
    error: ErrorDetail,
}

#[derive(Serialize)]
struct ErrorDetail {
    code: &'static str,
    message: String,
}

impl ApiError {
    fn to_status_and_code(&self) -> (StatusCode, &'static str) {
        match self {
            ApiError::TokenRequired => (StatusCode::UNAUTHORIZED, "TOKEN_REQUIRED"),
            ApiError::TokenInvalid => (StatusCode::UNAUTHORIZED, "TOKEN_INVALID"),
            ApiError::BadRequest(_) => (StatusCode::BAD_REQUEST, "BAD_REQUEST"),
            ApiError::QueueUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "QUEUE_UNAVAILABLE"),
            ApiError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "INTERNAL_ERROR"),
        }
    }

    fn to_user_message(&self) -> String {
        match self {
            ApiError::Internal(_) => "An internal server error occurred".to_string(),
            other => other.to_string(),
        }
    }
}

impl From<IngestError> for ApiError {
    fn from(err: IngestError) -> Self {
        match err {
            IngestError::InvalidEnvelope(message) => ApiError::BadRequest(message),
            IngestError::Json(e) => ApiError::BadRequest(e.to_string()),
            IngestError::QueueClosed => ApiError::QueueUnavailable,
            other => ApiError::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, code) = self.to_status_and_code();
        if status.is_server_error() {
            error!(error = %self, code, "Request failed");
        }

        let body = ErrorResponse {
            success: false,
            error: ErrorDetail {
                code,
                message: self.to_user_message(),
            },
        };
        (status, Json(body)).into_response()
    }
}

pub type ApiResult<T> = std::result::Result<T, ApiError>;
