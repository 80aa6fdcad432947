// ABOUTME: Error taxonomy for remote sandbox operations
// ABOUTME: Each variant maps to a stable numeric code surfaced to callers

use std::time::Duration;
use thiserror::Error;

/// Gateway/agent response code for success
pub const CODE_SUCCESS: i64 = 1000;
/// Gateway/agent response code for a generic failure
pub const CODE_ERROR: i64 = 2000;
/// Gateway response code for an unknown sandbox
pub const CODE_NOT_FOUND: i64 = 4004;

pub const CODE_SANDBOX_ID_MISMATCH: i64 = 2001;
pub const CODE_SANDBOX_EXITED: i64 = 2002;
pub const CODE_SANDBOX_READY_TIMEOUT: i64 = 2003;
pub const CODE_WORKSPACE_INIT_FAILED: i64 = 3001;
pub const CODE_WORKSPACE_CHECK_FAILED: i64 = 3002;
pub const CODE_WORKSPACE_READY_TIMEOUT: i64 = 3003;

#[derive(Error, Debug)]
pub enum SandboxError {
    #[error("Sandbox creation failed ({code}): {message}")]
    CreateFailed { code: i64, message: String },

    #[error("Sandbox {sandbox_id} failed to initialize: {message}")]
    InitFailed { sandbox_id: String, message: String },

    #[error("Sandbox {sandbox_id} not ready after {waited:?}")]
    ReadyTimeout { sandbox_id: String, waited: Duration },

    #[error("Gateway returned sandbox {returned} for requested {requested}")]
    IdMismatch { requested: String, returned: String },

    #[error("Sandbox {0} exited while waiting for it")]
    Exited(String),

    #[error("Sandbox operation {operation} failed ({code}): {message}")]
    Operation {
        operation: String,
        code: i64,
        message: String,
    },

    #[error("Workspace in sandbox {sandbox_id} failed to initialize: {message}")]
    WorkspaceInitFailed { sandbox_id: String, message: String },

    #[error("Workspace in sandbox {sandbox_id} not ready after {waited:?}")]
    WorkspaceReadyTimeout { sandbox_id: String, waited: Duration },

    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("HTTP status {status}: {message}")]
    HttpStatus { status: u16, message: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

pub type Result<T> = std::result::Result<T, SandboxError>;

impl SandboxError {
    /// Stable numeric code for this failure
    pub fn code(&self) -> i64 {
        match self {
            Self::CreateFailed { code, .. } | Self::Operation { code, .. } => *code,
            Self::IdMismatch { .. } => CODE_SANDBOX_ID_MISMATCH,
            Self::InitFailed { .. } | Self::Exited(_) => CODE_SANDBOX_EXITED,
            Self::ReadyTimeout { .. } => CODE_SANDBOX_READY_TIMEOUT,
            Self::WorkspaceInitFailed { .. } => CODE_WORKSPACE_INIT_FAILED,
            Self::WorkspaceReadyTimeout { .. } => CODE_WORKSPACE_READY_TIMEOUT,
            Self::Request(_) | Self::HttpStatus { .. } | Self::InvalidResponse(_) => CODE_ERROR,
        }
    }

    /// Transport failures worth retrying: connect/timeouts, 5xx, 408 and 429
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Request(err) => err.is_connect() || err.is_timeout(),
            Self::HttpStatus { status, .. } => *status >= 500 || *status == 408 || *status == 429,
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes() {
        assert_eq!(
            SandboxError::IdMismatch {
                requested: "a".into(),
                returned: "b".into()
            }
            .code(),
            2001
        );
        assert_eq!(SandboxError::Exited("sb".into()).code(), 2002);
        assert_eq!(
            SandboxError::ReadyTimeout {
                sandbox_id: "sb".into(),
                waited: Duration::from_secs(1)
            }
            .code(),
            2003
        );
        assert_eq!(
            SandboxError::Operation {
                operation: "chat".into(),
                code: 5123,
                message: "busy".into()
            }
            .code(),
            5123
        );
    }

    #[test]
    fn test_retryable_statuses() {
        let status = |status| SandboxError::HttpStatus {
            status,
            message: String::new(),
        };
        assert!(status(503).is_retryable());
        assert!(status(429).is_retryable());
        assert!(status(408).is_retryable());
        assert!(!status(400).is_retryable());
        assert!(!SandboxError::InvalidResponse("x".into()).is_retryable());
    }
}
