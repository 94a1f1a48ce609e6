//! The remote batch inference service.
//!
//! [`BatchApi`] is the seam the orchestrator talks through; [`OpenAiBatchClient`]
//! implements it over HTTP, tests implement it in memory.

use std::{path::Path, time::Duration};

use async_trait::async_trait;
use log::debug;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::multipart::{Form, Part};
use serde::Deserialize;
use serde_json::json;

use crate::error::{PipelineError, Result};

/// Lifecycle status as reported by the service.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteStatus {
    Validating,
    InProgress,
    Finalizing,
    Cancelling,
    Completed,
    Failed,
    Expired,
    Cancelled,
    #[serde(other)]
    Unknown,
}

impl RemoteStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            RemoteStatus::Completed | RemoteStatus::Failed | RemoteStatus::Expired | RemoteStatus::Cancelled
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            RemoteStatus::Validating => "validating",
            RemoteStatus::InProgress => "in_progress",
            RemoteStatus::Finalizing => "finalizing",
            RemoteStatus::Cancelling => "cancelling",
            RemoteStatus::Completed => "completed",
            RemoteStatus::Failed => "failed",
            RemoteStatus::Expired => "expired",
            RemoteStatus::Cancelled => "cancelled",
            RemoteStatus::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
pub struct RequestCounts {
    #[serde(default)]
    pub total: u64,
    #[serde(default)]
    pub completed: u64,
    #[serde(default)]
    pub failed: u64,
}

impl RequestCounts {
    pub fn percent_done(&self) -> f64 {
        if self.total == 0 {
            0.0
        } else {
            self.completed as f64 / self.total as f64 * 100.0
        }
    }
}

/// The parts of a remote batch object the pipeline uses.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct RemoteBatch {
    pub id: String,
    pub status: RemoteStatus,
    #[serde(default)]
    pub request_counts: Option<RequestCounts>,
    #[serde(default)]
    pub output_file_id: Option<String>,
    #[serde(default)]
    pub error_file_id: Option<String>,
    #[serde(default)]
    pub completed_at: Option<i64>,
}

#[derive(Debug, Deserialize)]
struct UploadedFile {
    id: String,
}

#[async_trait]
pub trait BatchApi: Send + Sync {
    /// Upload a JSONL request file; returns the remote file id.
    async fn upload_file(&self, path: &Path) -> Result<String>;

    /// Create a batch over an uploaded file.
    async fn create_batch(&self, input_file_id: &str, endpoint: &str, completion_window: &str) -> Result<RemoteBatch>;

    async fn retrieve_batch(&self, batch_id: &str) -> Result<RemoteBatch>;

    /// Raw content of an output file.
    async fn file_content(&self, file_id: &str) -> Result<String>;
}

/// HTTP client for the OpenAI-compatible Batch API.
pub struct OpenAiBatchClient {
    client: reqwest::Client,
    base_url: String,
}

impl OpenAiBatchClient {
    pub fn new(api_key: &str, base_url: &str, timeout: Duration) -> Result<Self> {
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::from_str(&format!("Bearer {api_key}"))
            .map_err(|_| PipelineError::Config("API key contains invalid header characters".into()))?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{path}", self.base_url)
    }

    async fn check(resp: reqwest::Response) -> Result<reqwest::Response> {
        if resp.status().is_success() {
            return Ok(resp);
        }
        let status = resp.status().as_u16();
        let body = resp.text().await.unwrap_or_default();
        Err(PipelineError::Api { status, body })
    }

    async fn json<T: serde::de::DeserializeOwned>(resp: reqwest::Response) -> Result<T> {
        let text = Self::check(resp).await?.text().await?;
        serde_json::from_str(&text)
            .map_err(|e| PipelineError::Decode(format!("{e}; body was:\n{text}")))
    }
}

#[async_trait]
impl BatchApi for OpenAiBatchClient {
    async fn upload_file(&self, path: &Path) -> Result<String> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|e| PipelineError::io(path, e))?;
        let file_name = path
            .file_name()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "batch.jsonl".to_string());
        debug!("uploading {} ({} bytes)", path.display(), bytes.len());

        let part = Part::bytes(bytes)
            .file_name(file_name)
            .mime_str("application/jsonl")?;
        let form = Form::new().text("purpose", "batch").part("file", part);

        let resp = self
            .client
            .post(self.url("/v1/files"))
            .multipart(form)
            .send()
            .await?;
        let uploaded: UploadedFile = Self::json(resp).await?;
        Ok(uploaded.id)
    }

    async fn create_batch(&self, input_file_id: &str, endpoint: &str, completion_window: &str) -> Result<RemoteBatch> {
        let body = json!({
            "input_file_id": input_file_id,
            "endpoint": endpoint,
            "completion_window": completion_window,
        });
        let resp = self
            .client
            .post(self.url("/v1/batches"))
            .json(&body)
            .send()
            .await?;
        Self::json(resp).await
    }

    async fn retrieve_batch(&self, batch_id: &str) -> Result<RemoteBatch> {
        let resp = self
            .client
            .get(self.url(&format!("/v1/batches/{batch_id}")))
            .send()
            .await?;
        Self::json(resp).await
    }

    async fn file_content(&self, file_id: &str) -> Result<String> {
        let resp = self
            .client
            .get(self.url(&format!("/v1/files/{file_id}/content")))
            .send()
            .await?;
        Ok(Self::check(resp).await?.text().await?)
    }
}
