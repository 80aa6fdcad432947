// ABOUTME: External services the dispatcher depends on: file mention resolution and upload credentials
// ABOUTME: No-op implementations serve deployments without file storage

use async_trait::async_trait;
use serde_json::{json, Value as JsonValue};
use std::time::Duration;

use superagent_sandbox::Mention;

use crate::error::Result;

/// Turns user-mentioned file ids into references a sandbox can fetch
#[async_trait]
pub trait FileResolver: Send + Sync {
    async fn resolve_mentions(&self, file_ids: &[String], project_id: &str)
        -> Result<Vec<Mention>>;
}

/// Issues short-lived credentials a sandbox uses to upload its output
#[async_trait]
pub trait CredentialProvider: Send + Sync {
    async fn upload_credentials(&self, project_id: &str, expires: Duration) -> Result<JsonValue>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopFileResolver;

#[async_trait]
impl FileResolver for NoopFileResolver {
    async fn resolve_mentions(
        &self,
        _file_ids: &[String],
        _project_id: &str,
    ) -> Result<Vec<Mention>> {
        Ok(Vec::new())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct NoopCredentialProvider;

#[async_trait]
impl CredentialProvider for NoopCredentialProvider {
    async fn upload_credentials(&self, _project_id: &str, expires: Duration) -> Result<JsonValue> {
        Ok(json!({ "expires": expires.as_secs() }))
    }
}
