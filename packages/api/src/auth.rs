// ABOUTME: Shared-secret check for sandbox webhook calls
// ABOUTME: Sandboxes send the configured secret in the `token` header

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};
use subtle::ConstantTimeEq;
use tracing::{debug, warn};

use superagent_core::constants::SANDBOX_TOKEN_HEADER;

use crate::error::ApiError;
use crate::AppState;

pub async fn sandbox_token_middleware(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let path = request.uri().path().to_string();

    let token = request
        .headers()
        .get(SANDBOX_TOKEN_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty());

    match token {
        None => {
            warn!(path = %path, "Missing sandbox token");
            Err(ApiError::TokenRequired)
        }
        Some(token) if !token_matches(token, &state.sandbox_token) => {
            warn!(path = %path, "Invalid sandbox token");
            Err(ApiError::TokenInvalid)
        }
        Some(_) => {
            debug!(path = %path, "Sandbox token accepted");
            Ok(next.run(request).await)
        }
    }
}

/// Constant-time comparison against the configured secret
fn token_matches(presented: &str, expected: &str) -> bool {
    presented.as_bytes().ct_eq(expected.as_bytes()).into()
}
