// ABOUTME: HTTP surface sandboxes call back into: message delivery, resume and health
// ABOUTME: Protected routes require the shared sandbox token

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use superagent_ingest::QueuePublisher;
use superagent_tasks::TaskDispatcher;

pub mod auth;
pub mod error;
pub mod handlers;

pub use error::{ApiError, ApiResult};

/// Shared state for every route
#[derive(Clone)]
pub struct AppState {
    pub sandbox_token: Arc<String>,
    pub publisher: QueuePublisher,
    pub dispatcher: Arc<TaskDispatcher>,
}

impl AppState {
    pub fn new(
        sandbox_token: impl Into<String>,
        publisher: QueuePublisher,
        dispatcher: Arc<TaskDispatcher>,
    ) -> Self {
        Self {
            sandbox_token: Arc::new(sandbox_token.into()),
            publisher,
            dispatcher,
        }
    }
}

/// Creates the webhook router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/tasks/deliver-message", post(handlers::deliver_message))
        .route("/tasks/resume", post(handlers::resume))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::sandbox_token_middleware,
        ))
        .route("/health", get(handlers::health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
