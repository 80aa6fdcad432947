// ABOUTME: Shared constants for sandbox locking, task limits and protocol defaults
// ABOUTME: Values mirror the gateway and agent protocol contracts

use std::time::Duration;

/// Maximum stored length of a task error message, in characters
pub const MAX_ERROR_MESSAGE_LEN: usize = 500;

/// Marker appended to truncated error messages
pub const ELLIPSIS: &str = "...";

/// Lock key prefix for per-sandbox ingestion locks
pub const SANDBOX_LOCK_PREFIX: &str = "lock:sandbox:";

/// Header carrying the sandbox shared secret on webhook calls
pub const SANDBOX_TOKEN_HEADER: &str = "token";

/// Default task mode when the caller does not pick one
pub const DEFAULT_TASK_MODE: &str = "chat";

/// Default lifetime of upload credentials handed to a sandbox
pub const UPLOAD_CREDENTIAL_EXPIRES: Duration = Duration::from_secs(3600);

/// Total attempts for one gateway status lookup, the first call included
pub const GATEWAY_STATUS_ATTEMPTS: u32 = 3;

/// Default bound on a sandbox or its workspace becoming ready; cold starts take minutes
pub const SANDBOX_READY_TIMEOUT: Duration = Duration::from_secs(600);

/// Default interval between readiness polls
pub const SANDBOX_POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Pause between topics during stale-topic reconciliation
pub const RECONCILE_TOPIC_PAUSE: Duration = Duration::from_millis(100);

/// Build the ingestion lock key for a sandbox
pub fn sandbox_lock_key(sandbox_id: &str) -> String {
    format!("{}{}", SANDBOX_LOCK_PREFIX, sandbox_id)
}
