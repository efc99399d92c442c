use std::path::PathBuf;

use atelier_comfyui::api::ComfyUIApiError;
use atelier_comfyui::client::ComfyUIClientError;
use atelier_comfyui::launcher::StartupError;
use atelier_core::error::CoreError;
use atelier_core::job::JobStatus;
use atelier_core::types::JobId;

/// Caller errors from [`JobQueue`](crate::JobQueue) operations.
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    NotFound(JobId),

    #[error("Job {id} is still {status} and cannot be removed")]
    NotTerminal { id: JobId, status: JobStatus },
}

/// Why a single job failed. Rendered into the job's `error` field.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Validation(#[from] CoreError),

    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    /// Failure reported by the server while executing the prompt.
    #[error("{0}")]
    Processing(String),

    #[error("Event stream closed before the job finished")]
    StreamClosed,

    #[error("No events received for {0}s")]
    Timeout(u64),

    #[error("No output images produced")]
    NoOutputs,
}

/// The queue could not start. Fatal to the whole session.
#[derive(Debug, thiserror::Error)]
pub enum StartError {
    #[error(transparent)]
    Startup(#[from] StartupError),

    #[error(transparent)]
    Connection(#[from] ComfyUIClientError),

    #[error(transparent)]
    Api(#[from] ComfyUIApiError),

    #[error("Failed to read workflow {}: {source}", path.display())]
    WorkflowRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Invalid workflow {}: {source}", path.display())]
    WorkflowInvalid {
        path: PathBuf,
        #[source]
        source: CoreError,
    },
}
