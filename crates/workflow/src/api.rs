//! HTTP client for the upstream workflow service.
//!
//! Opens a streamed `POST {base}/v1/workflows/run` and hands the raw body
//! back as a byte stream. Decoding happens in [`crate::stream`].

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde::Serialize;

use crate::config::WorkflowConfig;
use crate::frames::FrameError;

/// Raw response body of a streamed run.
pub type ByteStream = BoxStream<'static, Result<Bytes, WorkflowError>>;

/// Errors from the upstream workflow layer.
#[derive(Debug, thiserror::Error)]
pub enum WorkflowError {
    /// The HTTP request itself failed (network, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The service returned a non-2xx status code.
    #[error("Workflow API error ({status}): {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Raw response body for debugging.
        body: String,
    },

    #[error("Workflow response body is empty")]
    EmptyBody,

    #[error("Workflow stream ended before workflow_finished")]
    PrematureEnd,

    #[error(transparent)]
    Frame(#[from] FrameError),

    #[error("Workflow stream failed: {0}")]
    Stream(String),
}

/// Body of a streamed workflow run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowRunRequest {
    pub inputs: WorkflowInputs,
    pub response_mode: &'static str,
    pub user: String,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowInputs {
    pub research_question: String,
}

impl WorkflowRunRequest {
    /// Streaming run for `question` on behalf of `user`.
    pub fn streaming(question: impl Into<String>, user: impl Into<String>) -> Self {
        Self {
            inputs: WorkflowInputs {
                research_question: question.into(),
            },
            response_mode: "streaming",
            user: user.into(),
        }
    }
}

/// Anything that can open a streamed generation run.
///
/// The worker depends on this seam rather than on [`WorkflowApi`], so tests
/// and alternative backends can supply scripted bodies.
#[async_trait]
pub trait GenerationService: Send + Sync {
    /// Start a run and return its raw body once the response headers
    /// arrived with a success status.
    async fn run(&self, request: WorkflowRunRequest) -> Result<ByteStream, WorkflowError>;
}

/// HTTP client for a single workflow service deployment.
pub struct WorkflowApi {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl WorkflowApi {
    /// Create a client from configuration.
    pub fn new(config: &WorkflowConfig) -> Result<Self, WorkflowError> {
        let client = reqwest::Client::builder()
            .connect_timeout(config.connect_timeout)
            .build()?;
        Ok(Self::with_client(client, config))
    }

    /// Create a client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, config: &WorkflowConfig) -> Self {
        Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key.clone(),
        }
    }

    pub fn run_url(&self) -> String {
        format!("{}/v1/workflows/run", self.base_url)
    }

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or a [`WorkflowError::Api`]
    /// containing the status and body text on failure.
    async fn ensure_success(response: reqwest::Response) -> Result<reqwest::Response, WorkflowError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(WorkflowError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(response)
    }
}

#[async_trait]
impl GenerationService for WorkflowApi {
    async fn run(&self, request: WorkflowRunRequest) -> Result<ByteStream, WorkflowError> {
        tracing::debug!(url = %self.run_url(), user = %request.user, "Starting workflow run");

        let response = self
            .client
            .post(self.run_url())
            .bearer_auth(&self.api_key)
            .json(&request)
            .send()
            .await?;
        let response = Self::ensure_success(response).await?;

        Ok(response
            .bytes_stream()
            .map(|chunk| chunk.map_err(WorkflowError::from))
            .boxed())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_body_matches_wire_shape() {
        let body = serde_json::to_value(WorkflowRunRequest::streaming("Q1", "u1")).unwrap();
        assert_eq!(
            body,
            serde_json::json!({
                "inputs": {"research_question": "Q1"},
                "response_mode": "streaming",
                "user": "u1",
            })
        );
    }

    #[test]
    fn run_url_ignores_trailing_slash() {
        let config = WorkflowConfig {
            base_url: "http://dify.local:5001/".into(),
            api_key: "k".into(),
            ..WorkflowConfig::default()
        };
        let api = WorkflowApi::with_client(reqwest::Client::new(), &config);
        assert_eq!(api.run_url(), "http://dify.local:5001/v1/workflows/run");
    }
}
