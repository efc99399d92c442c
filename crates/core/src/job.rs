//! Job lifecycle model.
//!
//! A [`Job`] is one image-processing request. Its status only moves
//! forward: `pending -> running -> (completed | failed | cancelled)`,
//! with `pending` also allowed to jump straight to `failed` or
//! `cancelled`. Terminal jobs never change again.

use std::fmt;
use std::path::PathBuf;

use chrono::Utc;
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::size::ImageSize;
use crate::types::{JobId, Timestamp};

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Cancelled,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether this status is final.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Cancelled | Self::Completed | Self::Failed)
    }

    /// Whether a job in this status may move to `next`.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        use JobStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Cancelled)
                | (Pending, Failed)
                | (Running, Completed)
                | (Running, Failed)
                | (Running, Cancelled)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Cancelled => "cancelled",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Snapshot of one image-processing request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Local path of the image to process.
    pub input_image: PathBuf,
    pub target_size: ImageSize,
    pub status: JobStatus,
    /// Overall completion, 0-100.
    pub progress: u8,
    /// Server-assigned prompt id, set once the workflow is queued.
    pub prompt_id: Option<String>,
    /// Node the server reported as executing most recently.
    pub current_node: Option<String>,
    /// Where the result was written, when completed.
    pub output_path: Option<PathBuf>,
    /// Human-readable failure description, when failed.
    pub error: Option<String>,
    pub created_at: Timestamp,
    pub updated_at: Timestamp,
}

impl Job {
    /// Create a new job in `pending` state with a fresh identifier.
    pub fn new(input_image: PathBuf, target_size: ImageSize) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4(),
            input_image,
            target_size,
            status: JobStatus::Pending,
            progress: 0,
            prompt_id: None,
            current_node: None,
            output_path: None,
            error: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Move from `pending` to `running`.
    pub fn start(&mut self) -> Result<(), CoreError> {
        self.transition(JobStatus::Running)
    }

    /// Record the prompt id assigned by the server.
    pub fn set_prompt_id(&mut self, prompt_id: impl Into<String>) {
        self.prompt_id = Some(prompt_id.into());
        self.touch();
    }

    /// Update overall progress. Progress never decreases and is clamped
    /// to 100. Returns `true` if the stored value changed.
    pub fn set_progress(&mut self, percent: u8, current_node: Option<String>) -> bool {
        if current_node.is_some() {
            self.current_node = current_node;
        }
        let percent = percent.min(100);
        if percent <= self.progress {
            return false;
        }
        self.progress = percent;
        self.touch();
        true
    }

    /// Mark the job completed with its output path.
    pub fn complete(&mut self, output_path: PathBuf) -> Result<(), CoreError> {
        self.transition(JobStatus::Completed)?;
        self.progress = 100;
        self.output_path = Some(output_path);
        Ok(())
    }

    /// Mark the job failed with a human-readable message.
    pub fn fail(&mut self, message: impl Into<String>) -> Result<(), CoreError> {
        self.transition(JobStatus::Failed)?;
        self.error = Some(message.into());
        Ok(())
    }

    /// Mark the job cancelled.
    pub fn cancel(&mut self) -> Result<(), CoreError> {
        self.transition(JobStatus::Cancelled)
    }

    fn transition(&mut self, next: JobStatus) -> Result<(), CoreError> {
        if !self.status.can_transition_to(next) {
            return Err(CoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: next,
            });
        }
        self.status = next;
        self.touch();
        Ok(())
    }

    fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
