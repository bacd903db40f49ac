//! External collaborators: document storage and processing.
//!
//! The queue only tracks state. Document bytes come from the storage
//! service, results go back to it, and extraction/analysis is done by the
//! processing service. Both are reached over HTTP.
//!
//! Failures are classified so the worker can decide whether to retry:
//!
//! | Response | Error | Retried |
//! |----------|-------|---------|
//! | network error, timeout | `Request` | yes |
//! | 408, 429, 5xx | `Processing` | yes |
//! | 404 | `NotFound` | no |
//! | other 4xx, unreadable body | `InvalidInput` / `Serialization` | no |

use std::time::Duration;

use async_trait::async_trait;
use reqwest::{multipart, Client, Response, StatusCode};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value as JsonValue};
use tracing::{debug, info};
use uuid::Uuid;

use docket_core::{defaults, Error, JobType, Result};

/// Output of one processing run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProcessingOutput {
    pub payload: JsonValue,
    /// Quality estimate in `[0, 1]`; drives cache retention.
    pub confidence: f64,
}

/// What the processor is asked to do.
#[derive(Debug, Clone, Copy)]
pub struct ProcessRequest<'a> {
    pub tenant_id: &'a str,
    pub job_type: JobType,
    pub document: &'a [u8],
    pub parameters: Option<&'a JsonValue>,
}

#[async_trait]
pub trait DocumentStore: Send + Sync {
    /// Raw bytes of a tenant's document.
    async fn fetch(&self, tenant_id: &str, document_ref: &str) -> Result<Vec<u8>>;

    /// Persist a job result and return its reference.
    async fn put_result(&self, tenant_id: &str, job_id: Uuid, result: &JsonValue)
        -> Result<String>;
}

#[async_trait]
pub trait Processor: Send + Sync {
    async fn process(&self, request: ProcessRequest<'_>) -> Result<ProcessingOutput>;
}

/// Connection settings for an HTTP collaborator.
#[derive(Debug, Clone)]
pub struct CollaboratorConfig {
    pub base_url: String,
    pub timeout_seconds: u64,
}

impl CollaboratorConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            timeout_seconds: defaults::COLLABORATOR_TIMEOUT_SECS,
        }
    }

    /// `<prefix>_URL` (required) and `<prefix>_TIMEOUT_SECS`.
    pub fn from_env(prefix: &str) -> Option<Self> {
        let url = std::env::var(format!("{prefix}_URL")).ok()?;
        let timeout_seconds = std::env::var(format!("{prefix}_TIMEOUT_SECS"))
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults::COLLABORATOR_TIMEOUT_SECS);
        Some(Self {
            timeout_seconds,
            ..Self::new(url)
        })
    }

    fn client(&self) -> Result<Client> {
        Client::builder()
            .timeout(Duration::from_secs(self.timeout_seconds))
            .build()
            .map_err(|e| Error::Config(format!("Failed to create HTTP client: {e}")))
    }
}

/// Map a non-success response to the error taxonomy.
async fn status_error(response: Response, what: &str) -> Error {
    let status = response.status();
    let body = response.text().await.unwrap_or_default();
    let detail = format!("{what} returned {status}: {}", body.trim());
    match status {
        StatusCode::NOT_FOUND => Error::NotFound(detail),
        StatusCode::REQUEST_TIMEOUT | StatusCode::TOO_MANY_REQUESTS => Error::Processing(detail),
        s if s.is_server_error() => Error::Processing(detail),
        _ => Error::InvalidInput(detail),
    }
}

#[derive(Deserialize)]
struct PutResultResponse {
    result_ref: String,
}

/// Storage service client.
///
/// - `GET  {base}/documents/{tenant}/{document_ref}` → document bytes
/// - `POST {base}/results/{tenant}/{job_id}` → `{"result_ref": ...}`
pub struct HttpDocumentStore {
    client: Client,
    config: CollaboratorConfig,
}

impl HttpDocumentStore {
    pub fn new(config: CollaboratorConfig) -> Result<Self> {
        let client = config.client()?;
        info!(subsystem = "jobs", component = "storage", url = %config.base_url, "Document store configured");
        Ok(Self { client, config })
    }

    /// From `STORAGE_URL`; `None` when unset.
    pub fn from_env() -> Result<Option<Self>> {
        CollaboratorConfig::from_env("STORAGE").map(Self::new).transpose()
    }
}

#[async_trait]
impl DocumentStore for HttpDocumentStore {
    async fn fetch(&self, tenant_id: &str, document_ref: &str) -> Result<Vec<u8>> {
        let url = format!(
            "{}/documents/{tenant_id}/{document_ref}",
            self.config.base_url
        );
        let response = self.client.get(&url).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response, "storage").await);
        }
        let bytes = response.bytes().await?;
        debug!(subsystem = "jobs", component = "storage", document_ref, size = bytes.len(), "Fetched document");
        Ok(bytes.to_vec())
    }

    async fn put_result(
        &self,
        tenant_id: &str,
        job_id: Uuid,
        result: &JsonValue,
    ) -> Result<String> {
        let url = format!("{}/results/{tenant_id}/{job_id}", self.config.base_url);
        let response = self.client.post(&url).json(result).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response, "storage").await);
        }
        let body: PutResultResponse = response
            .json()
            .await
            .map_err(|e| Error::Serialization(format!("storage result response: {e}")))?;
        Ok(body.result_ref)
    }
}

/// Processing service client.
///
/// `POST {base}/process/{job_type}` with a multipart body: `request` (JSON:
/// tenant and parameters) and `document` (bytes). Responds with
/// [`ProcessingOutput`].
pub struct HttpProcessor {
    client: Client,
    config: CollaboratorConfig,
}

impl HttpProcessor {
    pub fn new(config: CollaboratorConfig) -> Result<Self> {
        let client = config.client()?;
        info!(subsystem = "jobs", component = "processor", url = %config.base_url, "Processor configured");
        Ok(Self { client, config })
    }

    /// From `PROCESSOR_URL`; `None` when unset.
    pub fn from_env() -> Result<Option<Self>> {
        CollaboratorConfig::from_env("PROCESSOR").map(Self::new).transpose()
    }
}

#[async_trait]
impl Processor for HttpProcessor {
    async fn process(&self, request: ProcessRequest<'_>) -> Result<ProcessingOutput> {
        let url = format!("{}/process/{}", self.config.base_url, request.job_type);
        let meta = json!({
            "tenant_id": request.tenant_id,
            "parameters": request.parameters,
        });
        let document = multipart::Part::bytes(request.document.to_vec())
            .file_name("document")
            .mime_str("application/octet-stream")?;
        let form = multipart::Form::new()
            .text("request", meta.to_string())
            .part("document", document);

        let response = self.client.post(&url).multipart(form).send().await?;
        if !response.status().is_success() {
            return Err(status_error(response, "processor").await);
        }
        response
            .json::<ProcessingOutput>()
            .await
            .map_err(|e| Error::Serialization(format!("processor response: {e}")))
    }
}
