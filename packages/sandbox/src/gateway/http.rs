// ABOUTME: reqwest implementation of the sandbox gateway API
// ABOUTME: Status lookups retry transient transport failures with exponential backoff

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, StatusCode};
use serde_json::{json, Value as JsonValue};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

use superagent_core::{GatewayConfig, RetryPolicy, Sleeper, TokioSleeper};

use super::{GatewayResponse, SandboxGateway, SandboxState, SandboxStatusInfo};
use crate::error::{Result, SandboxError};

const TOKEN_HEADER: &str = "token";

/// HTTP client for the sandbox gateway
pub struct HttpSandboxGateway {
    client: Client,
    base_url: String,
    token: String,
    create_timeout: Duration,
    status_timeout: Duration,
    proxy_timeout: Duration,
    status_retry: RetryPolicy,
    sleeper: Arc<dyn Sleeper>,
}

impl HttpSandboxGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self> {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            token: config.token.clone(),
            create_timeout: config.create_timeout,
            status_timeout: config.status_timeout,
            proxy_timeout: config.proxy_timeout,
            status_retry: RetryPolicy::gateway_status(),
            sleeper: Arc::new(TokioSleeper),
        })
    }

    /// Override the status retry policy and how it sleeps
    pub fn with_status_retry(mut self, policy: RetryPolicy, sleeper: Arc<dyn Sleeper>) -> Self {
        self.status_retry = policy;
        self.sleeper = sleeper;
        self
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn request(&self, method: Method, path: &str, timeout: Duration) -> RequestBuilder {
        let mut builder = self.client.request(method, self.url(path)).timeout(timeout);
        if !self.token.is_empty() {
            builder = builder.header(TOKEN_HEADER, &self.token);
        }
        builder
    }

    /// Send a request and decode the `{code, message, data}` envelope.
    /// HTTP 404 is reported as a NOT_FOUND envelope rather than an error.
    async fn send(&self, builder: RequestBuilder) -> Result<GatewayResponse> {
        let response = builder.send().await?;
        let status = response.status();

        if status == StatusCode::NOT_FOUND {
            return Ok(GatewayResponse::not_found("sandbox not found"));
        }

        if !status.is_success() {
            let message = response.text().await.unwrap_or_default();
            return Err(SandboxError::HttpStatus {
                status: status.as_u16(),
                message,
            });
        }

        let body = response.text().await?;
        if body.trim().is_empty() {
            return Err(SandboxError::InvalidResponse(
                "empty gateway response".to_string(),
            ));
        }

        serde_json::from_str(&body)
            .map_err(|e| SandboxError::InvalidResponse(format!("{}: {}", e, body)))
    }

    async fn fetch_status(&self, sandbox_id: &str, attempt: u32) -> Result<SandboxStatusInfo> {
        if attempt > 1 {
            info!(sandbox_id = %sandbox_id, attempt, "Retrying sandbox status request");
        }

        let path = format!("api/v1/sandboxes/{}", sandbox_id);
        let response = self
            .send(self.request(Method::GET, &path, self.status_timeout))
            .await
            .inspect_err(|e| {
                warn!(sandbox_id = %sandbox_id, attempt, error = %e, "Sandbox status request failed");
            })?;

        if response.is_not_found() {
            debug!(sandbox_id = %sandbox_id, "Sandbox not found at gateway");
            return Ok(SandboxStatusInfo::new(sandbox_id, SandboxState::NotFound));
        }

        if !response.is_success() {
            return Err(SandboxError::Operation {
                operation: "get_status".to_string(),
                code: response.code,
                message: response.message,
            });
        }

        let state = response
            .data_str("status")
            .map(SandboxState::parse)
            .unwrap_or(SandboxState::Unknown);

        debug!(sandbox_id = %sandbox_id, status = ?state, "Sandbox status retrieved");
        Ok(SandboxStatusInfo::new(sandbox_id, state))
    }
}

#[async_trait]
impl SandboxGateway for HttpSandboxGateway {
    async fn create_sandbox(
        &self,
        project_id: &str,
        requested_sandbox_id: &str,
        work_dir: &str,
    ) -> Result<String> {
        info!(
            project_id = %project_id,
            sandbox_id = %requested_sandbox_id,
            "Creating sandbox"
        );

        let body = json!({
            "project_id": project_id,
            "sandbox_id": requested_sandbox_id,
            "project_oss_path": work_dir,
        });
        let response = self
            .send(
                self.request(Method::POST, "api/v1/sandboxes", self.create_timeout)
                    .json(&body),
            )
            .await?;

        if !response.is_success() {
            error!(
                sandbox_id = %requested_sandbox_id,
                code = response.code,
                message = %response.message,
                "Sandbox creation rejected by gateway"
            );
            return Err(SandboxError::CreateFailed {
                code: response.code,
                message: response.message,
            });
        }

        let sandbox_id = response
            .data_str("sandbox_id")
            .ok_or_else(|| {
                SandboxError::InvalidResponse("create response has no sandbox_id".to_string())
            })?
            .to_string();

        info!(sandbox_id = %sandbox_id, "Sandbox created");
        Ok(sandbox_id)
    }

    async fn get_status(&self, sandbox_id: &str) -> Result<SandboxStatusInfo> {
        self.status_retry
            .run(
                self.sleeper.as_ref(),
                |attempt| self.fetch_status(sandbox_id, attempt),
                SandboxError::is_retryable,
            )
            .await
    }

    async fn get_batch_status(&self, sandbox_ids: &[String]) -> Result<Vec<SandboxStatusInfo>> {
        let ids: Vec<&String> = sandbox_ids.iter().filter(|id| !id.is_empty()).collect();
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let response = self
            .send(
                self.request(Method::POST, "api/v1/sandboxes/queries", self.status_timeout)
                    .json(&json!({ "sandbox_ids": ids })),
            )
            .await?;

        if !response.is_success() {
            return Err(SandboxError::Operation {
                operation: "get_batch_status".to_string(),
                code: response.code,
                message: response.message,
            });
        }

        let entries = response
            .data
            .as_array()
            .or_else(|| response.data.get("sandboxes").and_then(JsonValue::as_array))
            .cloned()
            .unwrap_or_default();

        let mut statuses: Vec<SandboxStatusInfo> = entries
            .iter()
            .filter_map(|entry| {
                let id = entry.get("sandbox_id")?.as_str()?;
                let state = entry
                    .get("status")
                    .and_then(JsonValue::as_str)
                    .map(SandboxState::parse)
                    .unwrap_or(SandboxState::Unknown);
                Some(SandboxStatusInfo::new(id, state))
            })
            .collect();

        // Sandboxes the gateway left out of the answer do not exist
        for id in ids {
            if !statuses.iter().any(|s| &s.sandbox_id == id) {
                statuses.push(SandboxStatusInfo::new(id.as_str(), SandboxState::NotFound));
            }
        }

        Ok(statuses)
    }

    async fn proxy(
        &self,
        sandbox_id: &str,
        method: Method,
        path: &str,
        body: Option<JsonValue>,
    ) -> Result<GatewayResponse> {
        let proxy_path = format!(
            "api/v1/sandboxes/{}/proxy/{}",
            sandbox_id,
            path.trim_start_matches('/')
        );
        debug!(sandbox_id = %sandbox_id, method = %method, path = %path, "Proxying sandbox request");

        let mut builder = self.request(method, &proxy_path, self.proxy_timeout);
        if let Some(body) = body {
            builder = builder.json(&body);
        }
        self.send(builder).await
    }
}
