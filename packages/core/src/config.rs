use std::env;
use std::num::ParseIntError;
use std::time::Duration;
use thiserror::Error;

use crate::constants::{SANDBOX_POLL_INTERVAL, SANDBOX_READY_TIMEOUT};
use crate::retry::RetryPolicy;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Invalid number for {key}: {source}")]
    InvalidNumber {
        key: String,
        #[source]
        source: ParseIntError,
    },
    #[error("Port {0} is out of valid range (1-65535)")]
    PortOutOfRange(u16),
    #[error("{0} must be greater than zero")]
    MustBePositive(String),
    #[error("Missing required setting: {0}")]
    Missing(String),
}

/// Connection settings for the sandbox gateway
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    pub base_url: String,
    pub token: String,
    pub create_timeout: Duration,
    pub status_timeout: Duration,
    pub proxy_timeout: Duration,
}

/// URLs handed to a sandbox so it can call back into the orchestrator
#[derive(Debug, Clone)]
pub struct CallbackConfig {
    pub message_url: String,
    pub credential_refresh_url: String,
}

/// Polling budget for sandbox and workspace readiness
#[derive(Debug, Clone)]
pub struct ReadinessConfig {
    pub timeout: Duration,
    pub poll_interval: Duration,
}

/// Ingestion consumer pool settings
#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub workers: usize,
    pub queue_capacity: usize,
    pub lock_ttl: Duration,
    pub lock_retry: RetryPolicy,
}

/// Stale task sweeping settings
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    pub threshold: Duration,
    pub interval: Duration,
    pub limit: u32,
}

/// Orchestrator configuration, built once and injected into every component
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,
    /// Shared secret sandboxes present in the `token` header of webhook calls
    pub sandbox_token: String,
    pub gateway: GatewayConfig,
    pub callbacks: CallbackConfig,
    pub readiness: ReadinessConfig,
    pub ingest: IngestConfig,
    pub sweeper: SweeperConfig,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Build the configuration from an arbitrary key lookup
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &str| lookup(key).unwrap_or_else(|| default.to_string());

        let database_url = get("SUPERAGENT_DATABASE_URL", "sqlite://superagent.db");

        let port = parse_number::<u16>(&lookup, "PORT", 4100)?;
        if port == 0 {
            return Err(ConfigError::PortOutOfRange(port));
        }

        let sandbox_token = get("SANDBOX_TOKEN", "");

        let gateway = GatewayConfig {
            base_url: get("SANDBOX_GATEWAY_URL", "http://localhost:8003")
                .trim_end_matches('/')
                .to_string(),
            token: get("SANDBOX_GATEWAY_TOKEN", ""),
            create_timeout: Duration::from_secs(30),
            status_timeout: Duration::from_secs(10),
            proxy_timeout: Duration::from_secs(30),
        };

        let callback_host = get(
            "SANDBOX_CALLBACK_HOST",
            &format!("http://localhost:{}", port),
        );
        let callback_host = callback_host.trim_end_matches('/');
        let callbacks = CallbackConfig {
            message_url: format!("{}/tasks/deliver-message", callback_host),
            credential_refresh_url: format!("{}/tasks/refresh-credentials", callback_host),
        };

        let readiness = ReadinessConfig {
            timeout: positive_secs(
                &lookup,
                "SANDBOX_READY_TIMEOUT_SECS",
                SANDBOX_READY_TIMEOUT.as_secs(),
            )?,
            poll_interval: positive_secs(
                &lookup,
                "SANDBOX_POLL_INTERVAL_SECS",
                SANDBOX_POLL_INTERVAL.as_secs(),
            )?,
        };

        let workers = parse_number::<usize>(&lookup, "INGEST_WORKERS", 3)?;
        if workers == 0 {
            return Err(ConfigError::MustBePositive("INGEST_WORKERS".to_string()));
        }
        let queue_capacity = parse_number::<usize>(&lookup, "INGEST_QUEUE_CAPACITY", 1024)?;
        if queue_capacity == 0 {
            return Err(ConfigError::MustBePositive(
                "INGEST_QUEUE_CAPACITY".to_string(),
            ));
        }
        let ingest = IngestConfig {
            workers,
            queue_capacity,
            lock_ttl: positive_secs(&lookup, "INGEST_LOCK_TTL_SECS", 30)?,
            lock_retry: RetryPolicy::lock_acquire().with_jitter(Duration::from_millis(
                parse_number::<u64>(&lookup, "INGEST_LOCK_JITTER_MS", 0)?,
            )),
        };

        let sweeper = SweeperConfig {
            threshold: positive_secs(&lookup, "STALE_TASK_THRESHOLD_SECS", 3 * 60 * 60)?,
            interval: positive_secs(&lookup, "STALE_SWEEP_INTERVAL_SECS", 300)?,
            limit: parse_number::<u32>(&lookup, "STALE_SWEEP_LIMIT", 100)?,
        };

        Ok(Config {
            database_url,
            port,
            sandbox_token,
            gateway,
            callbacks,
            readiness,
            ingest,
            sweeper,
        })
    }

    /// Check settings that only matter when serving webhooks
    pub fn require_sandbox_token(&self) -> Result<&str, ConfigError> {
        if self.sandbox_token.is_empty() {
            return Err(ConfigError::Missing("SANDBOX_TOKEN".to_string()));
        }
        Ok(&self.sandbox_token)
    }
}

fn parse_number<T>(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: T,
) -> Result<T, ConfigError>
where
    T: std::str::FromStr<Err = ParseIntError>,
{
    match lookup(key) {
        Some(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|source| ConfigError::InvalidNumber {
                key: key.to_string(),
                source,
            }),
        None => Ok(default),
    }
}

fn positive_secs(
    lookup: &impl Fn(&str) -> Option<String>,
    key: &str,
    default: u64,
) -> Result<Duration, ConfigError> {
    let secs = parse_number::<u64>(lookup, key, default)?;
    if secs == 0 {
        return Err(ConfigError::MustBePositive(key.to_string()));
    }
    Ok(Duration::from_secs(secs))
}
