// ABOUTME: Shared utility functions for the orchestrator
// ABOUTME: ID generation, lock owner tokens and bounded text truncation

use crate::constants::{ELLIPSIS, MAX_ERROR_MESSAGE_LEN};

/// Generate a prefixed unique identifier, e.g. `task_3f2a...`
pub fn generate_id(prefix: &str) -> String {
    format!("{}_{}", prefix, uuid::Uuid::new_v4().simple())
}

/// Generate a random owner token for a distributed lock
pub fn generate_owner_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

/// Truncate `text` to at most `max_chars` characters.
///
/// Text that exceeds the bound keeps its first `max_chars - 3` characters followed by
/// `...`, so the result is exactly `max_chars` long. Counts characters rather than bytes
/// so multi-byte text is never split inside a code point.
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }

    let keep = max_chars.saturating_sub(ELLIPSIS.len());
    let mut truncated: String = text.chars().take(keep).collect();
    truncated.push_str(ELLIPSIS);
    truncated
}

/// Truncate a task error message to the stored bound
pub fn truncate_error_message(text: &str) -> String {
    truncate_with_ellipsis(text, MAX_ERROR_MESSAGE_LEN)
}
