// ABOUTME: Core configuration, retry policy and shared helpers for the SuperAgent orchestrator
// ABOUTME: Foundational package used by storage, sandbox, tasks, ingest and api packages

pub mod config;
pub mod constants;
pub mod retry;
pub mod utils;

// Re-export configuration
pub use config::{
    CallbackConfig, Config, ConfigError, GatewayConfig, IngestConfig, ReadinessConfig,
    SweeperConfig,
};

// Re-export retry primitives
pub use retry::{RetryPolicy, Sleeper, TokioSleeper};

// Re-export utilities
pub use utils::{
    generate_id, generate_owner_token, truncate_error_message, truncate_with_ellipsis,
};
