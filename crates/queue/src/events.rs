//! Queue notifications for attached observers.
//!
//! Every job state change is published as a [`QueueEvent`] on a
//! `tokio::sync::broadcast` channel. Observers call
//! [`QueueEvents::subscribe`]; publishing with no subscribers is a no-op.

use std::path::PathBuf;

use atelier_core::types::JobId;
use serde::Serialize;
use tokio::sync::broadcast;

/// Default buffer capacity for the broadcast channel.
const DEFAULT_CAPACITY: usize = 1024;

/// A change to the queue or to one of its jobs.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum QueueEvent {
    JobAdded { job_id: JobId },
    JobStarted { job_id: JobId, prompt_id: String },
    JobProgress {
        job_id: JobId,
        percent: u8,
        node: Option<String>,
    },
    JobCompleted { job_id: JobId, output_path: PathBuf },
    JobFailed { job_id: JobId, error: String },
    JobCancelled { job_id: JobId },
    JobRemoved { job_id: JobId },
}

impl QueueEvent {
    pub fn job_id(&self) -> JobId {
        match self {
            Self::JobAdded { job_id }
            | Self::JobStarted { job_id, .. }
            | Self::JobProgress { job_id, .. }
            | Self::JobCompleted { job_id, .. }
            | Self::JobFailed { job_id, .. }
            | Self::JobCancelled { job_id }
            | Self::JobRemoved { job_id } => *job_id,
        }
    }

    /// Whether this event reports a job reaching a terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            Self::JobCompleted { .. } | Self::JobFailed { .. } | Self::JobCancelled { .. }
        )
    }
}

/// Fan-out publisher for [`QueueEvent`]s.
#[derive(Clone)]
pub struct QueueEvents {
    sender: broadcast::Sender<QueueEvent>,
}

impl QueueEvents {
    /// When the buffer is full, slow receivers observe
    /// `RecvError::Lagged` and miss the oldest events.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    pub fn publish(&self, event: QueueEvent) {
        // Only fails when there are no receivers.
        let _ = self.sender.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.sender.subscribe()
    }

    pub fn subscriber_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for QueueEvents {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY)
    }
}
