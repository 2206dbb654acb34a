use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use flowline_core::Identifier;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// How an execution was started, as recorded by the execution API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExecutionMode {
    Scheduled,
}

/// Typed workflow input value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    Datetime(DateTime<Utc>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionMetadata {
    pub mode: ExecutionMode,
    pub scheduled_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionSpec {
    pub launch_plan: Identifier,
    pub metadata: ExecutionMetadata,
    pub inputs: BTreeMap<String, Literal>,
}

/// Body of a create-execution call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionCreateRequest {
    pub project: String,
    pub domain: String,
    /// Caller-chosen execution name; the API rejects duplicates.
    pub name: String,
    pub spec: ExecutionSpec,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionCreateResponse {
    pub project: String,
    pub domain: String,
    pub name: String,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutionError {
    /// An execution with the requested name already exists.
    #[error("execution already exists")]
    AlreadyExists,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("API error ({status}): {message}")]
    Api { status: u16, message: String },

    #[error("request timed out after {0:?}")]
    Timeout(Duration),

    #[error("execution API unavailable: {0}")]
    Unavailable(String),
}

impl ExecutionError {
    pub fn is_already_exists(&self) -> bool {
        matches!(self, ExecutionError::AlreadyExists)
    }
}

/// Downstream API that turns a request into a running execution.
#[async_trait]
pub trait ExecutionClient: Send + Sync {
    async fn create_execution(
        &self,
        req: &ExecutionCreateRequest,
    ) -> Result<ExecutionCreateResponse, ExecutionError>;
}

/// JSON-over-HTTP client for the admin service's execution endpoint.
pub struct HttpExecutionClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
}

impl HttpExecutionClient {
    pub fn new(
        base_url: &str,
        token: Option<String>,
        timeout: Duration,
    ) -> Result<Self, ExecutionError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            token,
        })
    }
}

#[async_trait]
impl ExecutionClient for HttpExecutionClient {
    async fn create_execution(
        &self,
        req: &ExecutionCreateRequest,
    ) -> Result<ExecutionCreateResponse, ExecutionError> {
        let url = format!("{}/api/v1/executions", self.base_url);
        debug!(execution = %req.name, project = %req.project, domain = %req.domain, "creating execution");

        let mut builder = self.client.post(&url).json(req);
        if let Some(ref token) = self.token {
            builder = builder.bearer_auth(token);
        }
        let resp = builder.send().await?;

        let status = resp.status().as_u16();
        if status == 409 {
            return Err(ExecutionError::AlreadyExists);
        }

        if !resp.status().is_success() {
            let text = resp.text().await.unwrap_or_default();
            warn!(status, body = %text, "execution API error");
            return Err(ExecutionError::Api {
                status,
                message: text,
            });
        }

        Ok(resp.json().await?)
    }
}
