//! REST API client for the ComfyUI HTTP endpoints.
//!
//! Wraps the ComfyUI HTTP API (health check, image upload, workflow
//! submission, cancellation, history and image retrieval) using
//! [`reqwest`]. Every request is bounded by the client timeout; a
//! timed-out request surfaces as [`ComfyUIApiError::Timeout`].

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Default bound on a single HTTP request.
pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// HTTP client for a single ComfyUI instance.
#[derive(Clone)]
pub struct ComfyUIApi {
    client: reqwest::Client,
    api_url: String,
}

/// Folder an image lives in on the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ImageKind {
    Input,
    Output,
    Temp,
}

impl ImageKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Input => "input",
            Self::Output => "output",
            Self::Temp => "temp",
        }
    }
}

impl fmt::Display for ImageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Response returned by `/upload/image`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UploadResponse {
    /// Name the server stored the image under.
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub subfolder: String,
    #[serde(default, rename = "type")]
    pub kind: String,
}

/// Raw `/prompt` response body. `prompt_id` is checked by
/// [`ComfyUIApi::submit_workflow`].
#[derive(Debug, Deserialize)]
struct RawSubmitResponse {
    #[serde(default)]
    prompt_id: Option<String>,
    #[serde(default)]
    number: Option<i64>,
}

/// A workflow accepted by the `/prompt` endpoint.
#[derive(Debug, Clone)]
pub struct SubmitResponse {
    /// Server-assigned identifier for the queued prompt.
    pub prompt_id: String,
    /// Position in the execution queue, when reported.
    pub number: Option<i64>,
}

/// Errors from the ComfyUI REST API layer.
#[derive(Debug, thiserror::Error)]
pub enum ComfyUIApiError {
    /// The HTTP request itself failed (network, DNS, TLS, body decode).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// The request did not complete within the client timeout.
    #[error("{operation} timed out")]
    Timeout {
        /// Which call timed out, e.g. `"upload"`.
        operation: &'static str,
    },

    /// `/upload/image` returned a non-2xx status.
    #[error("Image upload rejected ({status}): {body}")]
    Upload { status: u16, body: String },

    /// `/prompt` returned a non-2xx status or no `prompt_id`.
    #[error("Workflow submission failed: {0}")]
    Submission(String),

    /// A read-only retrieval (`/history`, `/view`) returned a non-2xx status.
    #[error("Retrieval failed ({status}): {body}")]
    Retrieval { status: u16, body: String },

    /// Any other endpoint returned a non-2xx status.
    #[error("ComfyUI API error ({status}): {body}")]
    ApiError { status: u16, body: String },

    /// A local file could not be read or written.
    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl ComfyUIApi {
    /// Create a new API client for a ComfyUI instance.
    ///
    /// * `api_url` - Base HTTP URL, e.g. `http://127.0.0.1:8188`.
    /// * `timeout` - Upper bound on every request.
    pub fn new(api_url: String, timeout: Duration) -> Result<Self, ComfyUIApiError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self::with_client(client, api_url))
    }

    /// Create an API client reusing an existing [`reqwest::Client`].
    pub fn with_client(client: reqwest::Client, api_url: String) -> Self {
        Self {
            client,
            api_url: api_url.trim_end_matches('/').to_string(),
        }
    }

    /// Base HTTP URL this client talks to.
    pub fn api_url(&self) -> &str {
        &self.api_url
    }

    /// Health check: `GET /`.
    ///
    /// Returns `true` only for HTTP 200. Any other status, and any
    /// connection failure, means "not running" and is never an error.
    pub async fn check_server(&self) -> bool {
        match self.client.get(format!("{}/", self.api_url)).send().await {
            Ok(response) if response.status() == reqwest::StatusCode::OK => true,
            Ok(response) => {
                tracing::warn!(
                    status = response.status().as_u16(),
                    api_url = %self.api_url,
                    "ComfyUI health check returned unexpected status",
                );
                false
            }
            Err(e) => {
                tracing::debug!(api_url = %self.api_url, error = %e, "ComfyUI is not reachable");
                false
            }
        }
    }

    /// Upload a local image via `POST /upload/image` (multipart).
    ///
    /// * `name`      - filename to store the image under on the server.
    /// * `kind`      - destination folder.
    /// * `overwrite` - replace an existing file of the same name.
    pub async fn upload_image(
        &self,
        path: &Path,
        name: &str,
        kind: ImageKind,
        overwrite: bool,
    ) -> Result<UploadResponse, ComfyUIApiError> {
        let bytes = tokio::fs::read(path)
            .await
            .map_err(|source| ComfyUIApiError::Io {
                path: path.to_path_buf(),
                source,
            })?;

        let part = reqwest::multipart::Part::bytes(bytes)
            .file_name(name.to_string())
            .mime_str(mime_for(name))?;
        let form = reqwest::multipart::Form::new()
            .part("image", part)
            .text("type", kind.as_str())
            .text("overwrite", overwrite.to_string());

        let response = self
            .client
            .post(format!("{}/upload/image", self.api_url))
            .multipart(form)
            .send()
            .await
            .map_err(|e| classify("upload", e))?;

        let response = Self::ensure_success(response, |status, body| {
            ComfyUIApiError::Upload { status, body }
        })
        .await?;

        let uploaded: UploadResponse = response.json().await.map_err(|e| classify("upload", e))?;
        tracing::debug!(name = %uploaded.name, kind = %kind, "Image uploaded to ComfyUI");
        Ok(uploaded)
    }

    /// Submit a workflow for execution.
    ///
    /// Sends a `POST /prompt` request with the given workflow JSON and
    /// client ID. Fails with [`ComfyUIApiError::Submission`] when the
    /// server rejects the workflow or does not return a `prompt_id`.
    pub async fn submit_workflow(
        &self,
        workflow: &serde_json::Value,
        client_id: &str,
    ) -> Result<SubmitResponse, ComfyUIApiError> {
        let body = serde_json::json!({
            "prompt": workflow,
            "client_id": client_id,
        });

        let response = self
            .client
            .post(format!("{}/prompt", self.api_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify("submit", e))?;

        let response = Self::ensure_success(response, |status, body| {
            ComfyUIApiError::Submission(format!("server returned {status}: {body}"))
        })
        .await?;

        let raw: RawSubmitResponse = response.json().await.map_err(|e| classify("submit", e))?;
        match raw.prompt_id {
            Some(prompt_id) if !prompt_id.is_empty() => Ok(SubmitResponse {
                prompt_id,
                number: raw.number,
            }),
            _ => Err(ComfyUIApiError::Submission(
                "response did not contain a prompt_id".to_string(),
            )),
        }
    }

    /// Cancel a queued execution.
    ///
    /// Sends a `POST /queue` request asking ComfyUI to delete the
    /// specified prompt from the queue.
    pub async fn cancel_execution(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        let body = serde_json::json!({
            "delete": [prompt_id],
        });

        let response = self
            .client
            .post(format!("{}/queue", self.api_url))
            .json(&body)
            .send()
            .await
            .map_err(|e| classify("cancel", e))?;

        Self::ensure_success(response, |status, body| ComfyUIApiError::ApiError { status, body })
            .await?;
        Ok(())
    }

    /// Retrieve execution history for a specific prompt.
    ///
    /// Sends a `GET /history/{prompt_id}` request. The returned JSON maps
    /// the prompt id to its `outputs` record.
    pub async fn get_history(&self, prompt_id: &str) -> Result<serde_json::Value, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/history/{}", self.api_url, prompt_id))
            .send()
            .await
            .map_err(|e| classify("history", e))?;

        let response = Self::ensure_success(response, |status, body| {
            ComfyUIApiError::Retrieval { status, body }
        })
        .await?;

        response.json().await.map_err(|e| classify("history", e))
    }

    /// Download raw image bytes via `GET /view`.
    pub async fn get_image(
        &self,
        filename: &str,
        subfolder: &str,
        kind: &str,
    ) -> Result<Vec<u8>, ComfyUIApiError> {
        let response = self
            .client
            .get(format!("{}/view", self.api_url))
            .query(&[("filename", filename), ("subfolder", subfolder), ("type", kind)])
            .send()
            .await
            .map_err(|e| classify("view", e))?;

        let response = Self::ensure_success(response, |status, body| {
            ComfyUIApiError::Retrieval { status, body }
        })
        .await?;

        let bytes = response.bytes().await.map_err(|e| classify("view", e))?;
        Ok(bytes.to_vec())
    }

    // ---- private helpers ----

    /// Ensure the response has a success status code. Returns the
    /// response unchanged on success, or the error built by `on_error`
    /// from the status and body text on failure.
    async fn ensure_success(
        response: reqwest::Response,
        on_error: impl FnOnce(u16, String) -> ComfyUIApiError,
    ) -> Result<reqwest::Response, ComfyUIApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response
                .text()
                .await
                .unwrap_or_else(|_| "<unreadable body>".to_string());
            return Err(on_error(status.as_u16(), body));
        }
        Ok(response)
    }
}

/// Map a transport error, separating timeouts from other failures.
fn classify(operation: &'static str, e: reqwest::Error) -> ComfyUIApiError {
    if e.is_timeout() {
        ComfyUIApiError::Timeout { operation }
    } else {
        ComfyUIApiError::Request(e)
    }
}

/// MIME type for an upload, from its file extension.
fn mime_for(name: &str) -> &'static str {
    let ext = Path::new(name)
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase());
    match ext.as_deref() {
        Some("png") => "image/png",
        Some("jpg" | "jpeg") => "image/jpeg",
        Some("webp") => "image/webp",
        _ => "application/octet-stream",
    }
}
