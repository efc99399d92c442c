//! Server gateway: every network interaction with one ComfyUI server.
//!
//! [`ComfyUIGateway`] bundles the REST client, the WebSocket client and
//! the optional launcher behind the operations the job queue needs.

use std::path::{Path, PathBuf};
use std::time::Duration;

use atelier_core::error::CoreError;
use atelier_core::types::JobId;
use atelier_core::workflow::WorkflowGraph;
use serde_json::Value;
use tokio::process::Child;

use crate::api::{ComfyUIApi, ComfyUIApiError, ImageKind, UploadResponse, DEFAULT_REQUEST_TIMEOUT};
use crate::client::{ComfyUIClient, ComfyUIClientError, DEFAULT_CONNECT_TIMEOUT};
use crate::launcher::{self, ServerLauncher, StartupError};
use crate::outputs;
use crate::session::Session;

/// Default server address (`host:port`).
pub const DEFAULT_ADDRESS: &str = "127.0.0.1:8188";

/// Connection settings for a [`ComfyUIGateway`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// `host:port` of the server, without scheme.
    pub address: String,
    pub request_timeout: Duration,
    pub connect_timeout: Duration,
    pub launcher: Option<ServerLauncher>,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            address: DEFAULT_ADDRESS.to_string(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            launcher: None,
        }
    }
}

impl GatewayConfig {
    pub fn api_url(&self) -> String {
        format!("http://{}", self.address)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.address)
    }
}

/// Facade over the ComfyUI HTTP and WebSocket surfaces.
#[derive(Clone)]
pub struct ComfyUIGateway {
    api: ComfyUIApi,
    client: ComfyUIClient,
    launcher: Option<ServerLauncher>,
}

impl ComfyUIGateway {
    pub fn new(config: &GatewayConfig) -> Result<Self, ComfyUIApiError> {
        let api = ComfyUIApi::new(config.api_url(), config.request_timeout)?;
        let client =
            ComfyUIClient::new(config.ws_url()).with_connect_timeout(config.connect_timeout);
        Ok(Self {
            api,
            client,
            launcher: config.launcher.clone(),
        })
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }

    pub async fn check_server(&self) -> bool {
        self.api.check_server().await
    }

    /// Verify the server is up, launching it if configured.
    pub async fn ensure_server_running(
        &self,
        timeout: Duration,
    ) -> Result<Option<Child>, StartupError> {
        launcher::ensure_server_running(&self.api, self.launcher.as_ref(), timeout).await
    }

    /// Open the process-wide event session.
    pub async fn open_session(&self) -> Result<Session, ComfyUIClientError> {
        Session::open(&self.client).await
    }

    pub async fn upload_image(
        &self,
        path: &Path,
        name: &str,
        kind: ImageKind,
        overwrite: bool,
    ) -> Result<UploadResponse, ComfyUIApiError> {
        self.api.upload_image(path, name, kind, overwrite).await
    }

    /// Submit a prepared workflow under the session's client id and
    /// return the server-assigned prompt id.
    pub async fn submit_job(
        &self,
        session: &Session,
        graph: &WorkflowGraph,
    ) -> Result<String, ComfyUIApiError> {
        let response = self
            .api
            .submit_workflow(&graph.to_prompt_json(), session.client_id())
            .await?;
        tracing::info!(
            prompt_id = %response.prompt_id,
            queue_number = ?response.number,
            nodes = graph.len(),
            "Workflow submitted",
        );
        Ok(response.prompt_id)
    }

    pub async fn fetch_history(&self, prompt_id: &str) -> Result<Value, ComfyUIApiError> {
        self.api.get_history(prompt_id).await
    }

    pub async fn fetch_image(
        &self,
        filename: &str,
        subfolder: &str,
        kind: ImageKind,
    ) -> Result<Vec<u8>, ComfyUIApiError> {
        self.api.get_image(filename, subfolder, kind.as_str()).await
    }

    /// Ask the server to drop a queued prompt.
    pub async fn cancel_prompt(&self, prompt_id: &str) -> Result<(), ComfyUIApiError> {
        self.api.cancel_execution(prompt_id).await
    }

    /// Download the prompt's output images into `output_dir`.
    pub async fn collect_outputs(
        &self,
        prompt_id: &str,
        output_dir: &Path,
    ) -> Result<Vec<PathBuf>, ComfyUIApiError> {
        outputs::collect_outputs(&self.api, prompt_id, output_dir).await
    }

    /// Parse and validate a workflow template.
    pub fn validate_workflow(workflow: &Value) -> Result<WorkflowGraph, CoreError> {
        WorkflowGraph::parse(workflow)
    }
}

/// Server-side filename for a job's input image: `atelier_<job id>.<ext>`.
///
/// The extension is taken from the local file (lowercased) and defaults
/// to `png`.
pub fn upload_name(job_id: JobId, input: &Path) -> String {
    let ext = input
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(str::to_ascii_lowercase)
        .unwrap_or_else(|| "png".to_string());
    format!("atelier_{job_id}.{ext}")
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn urls_from_address() {
        let config = GatewayConfig {
            address: "10.0.0.5:9000".into(),
            ..Default::default()
        };
        assert_eq!(config.api_url(), "http://10.0.0.5:9000");
        assert_eq!(config.ws_url(), "ws://10.0.0.5:9000");
    }

    #[test]
    fn upload_name_keeps_extension() {
        let id = uuid::Uuid::new_v4();
        assert_eq!(
            upload_name(id, Path::new("/tmp/Photo.JPG")),
            format!("atelier_{id}.jpg")
        );
        assert_eq!(upload_name(id, Path::new("noext")), format!("atelier_{id}.png"));
    }

    #[test]
    fn validate_rejects_non_record_node() {
        let bad = json!({"1": {"class_type": "LoadImage", "inputs": {"image": "a.png"}}, "2": 5});
        assert!(matches!(
            ComfyUIGateway::validate_workflow(&bad),
            Err(CoreError::Validation(_))
        ));
    }

    #[test]
    fn validate_allows_untagged_node() {
        let graph = json!({
            "1": {"class_type": "LoadImage", "inputs": {"image": "a.png"}},
            "2": {"inputs": {}}
        });
        let parsed = ComfyUIGateway::validate_workflow(&graph).unwrap();
        assert_eq!(parsed.len(), 2);
    }

    #[tokio::test]
    async fn unreachable_server_is_not_running() {
        let gateway = ComfyUIGateway::new(&GatewayConfig {
            address: "127.0.0.1:1".into(),
            request_timeout: Duration::from_secs(2),
            ..Default::default()
        })
        .unwrap();
        assert!(!gateway.check_server().await);
        assert!(matches!(
            gateway.ensure_server_running(Duration::from_secs(1)).await,
            Err(StartupError::NotRunning { .. })
        ));
    }
}
