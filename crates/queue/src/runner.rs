//! Per-job execution unit.
//!
//! A [`JobRunner`] owns one job's state through a `watch::Sender<Job>`:
//! it is the only writer, the coordinator only reads snapshots. The run
//! is upload -> inject inputs -> submit -> track -> collect outputs, with
//! a cancellation checkpoint at every network-call boundary.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use atelier_comfyui::api::{ComfyUIApiError, ImageKind};
use atelier_comfyui::gateway::{upload_name, ComfyUIGateway};
use atelier_comfyui::session::Session;
use atelier_comfyui::tracker::{track_prompt, ProgressTracker, TrackOutcome, TrackerEvent};
use atelier_core::error::CoreError;
use atelier_core::job::Job;
use atelier_core::types::JobId;
use atelier_core::workflow::{random_seed, JobInputs, WorkflowGraph};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use crate::error::JobError;
use crate::events::{QueueEvent, QueueEvents};

/// Everything a job needs that is shared across the queue.
pub struct JobContext {
    pub gateway: ComfyUIGateway,
    pub session: Arc<Session>,
    pub template: WorkflowGraph,
    pub events: QueueEvents,
    pub output_dir: PathBuf,
    pub checkpoint: Option<String>,
    pub idle_timeout: Duration,
}

/// Why a run stopped early.
enum Stop {
    Cancelled,
    Failed(JobError),
}

impl From<JobError> for Stop {
    fn from(err: JobError) -> Self {
        Stop::Failed(err)
    }
}

impl From<CoreError> for Stop {
    fn from(err: CoreError) -> Self {
        Stop::Failed(JobError::Validation(err))
    }
}

impl From<ComfyUIApiError> for Stop {
    fn from(err: ComfyUIApiError) -> Self {
        Stop::Failed(JobError::Api(err))
    }
}

pub struct JobRunner {
    ctx: Arc<JobContext>,
    state: watch::Sender<Job>,
    cancel: CancellationToken,
    job_id: JobId,
}

impl JobRunner {
    pub fn new(ctx: Arc<JobContext>, state: watch::Sender<Job>, cancel: CancellationToken) -> Self {
        let job_id = state.borrow().id;
        Self {
            ctx,
            state,
            cancel,
            job_id,
        }
    }

    /// Run the job to a terminal state.
    pub async fn run(self) {
        let job_id = self.job_id;

        match self.execute().await {
            Ok(output_path) => {
                match self.transition(|job| job.complete(output_path.clone())) {
                    Ok(()) => {
                        tracing::info!(job_id = %job_id, path = %output_path.display(), "Job completed");
                        self.ctx.events.publish(QueueEvent::JobCompleted {
                            job_id,
                            output_path,
                        });
                    }
                    Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Could not complete job"),
                }
            }
            Err(Stop::Cancelled) => match self.transition(Job::cancel) {
                Ok(()) => {
                    tracing::info!(job_id = %job_id, "Job cancelled");
                    self.ctx.events.publish(QueueEvent::JobCancelled { job_id });
                }
                Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Could not cancel job"),
            },
            Err(Stop::Failed(err)) => {
                let message = err.to_string();
                match self.transition(|job| job.fail(message.clone())) {
                    Ok(()) => {
                        tracing::error!(job_id = %job_id, error = %message, "Job failed");
                        self.ctx.events.publish(QueueEvent::JobFailed {
                            job_id,
                            error: message,
                        });
                    }
                    Err(e) => tracing::warn!(job_id = %job_id, error = %e, "Could not fail job"),
                }
            }
        }
    }

    async fn execute(&self) -> Result<PathBuf, Stop> {
        self.checkpoint()?;
        self.transition(Job::start)?;

        let (input_image, target_size) = {
            let job = self.state.borrow();
            (job.input_image.clone(), job.target_size)
        };

        let name = upload_name(self.job_id, &input_image);
        let uploaded = self
            .ctx
            .gateway
            .upload_image(&input_image, &name, ImageKind::Input, true)
            .await?;
        self.checkpoint()?;

        let image_name = if uploaded.name.is_empty() {
            name
        } else {
            uploaded.name
        };
        let mut graph = self.ctx.template.clone();
        let seed = random_seed();
        let applied = graph.apply_job_inputs(&JobInputs {
            image_name,
            size: target_size,
            seed,
            checkpoint: self.ctx.checkpoint.clone(),
        })?;
        tracing::debug!(job_id = %self.job_id, seed, ?applied, "Workflow prepared");

        let prompt_id = self.ctx.gateway.submit_job(&self.ctx.session, &graph).await?;
        let mut rx = self.ctx.session.register(&prompt_id).await;

        self.state.send_modify(|job| job.set_prompt_id(prompt_id.clone()));
        self.ctx.events.publish(QueueEvent::JobStarted {
            job_id: self.job_id,
            prompt_id: prompt_id.clone(),
        });

        let mut tracker = ProgressTracker::new(prompt_id.clone(), &graph);
        let outcome = track_prompt(
            &mut tracker,
            &mut rx,
            &self.cancel,
            self.ctx.idle_timeout,
            |event| self.on_tracker_event(event),
        )
        .await;
        self.ctx.session.unregister(&prompt_id).await;

        match outcome {
            TrackOutcome::Finished => {}
            TrackOutcome::Failed(message) => return Err(Stop::Failed(JobError::Processing(message))),
            TrackOutcome::Cancelled => {
                self.cancel_remote(&prompt_id).await;
                return Err(Stop::Cancelled);
            }
            TrackOutcome::StreamClosed => return Err(Stop::Failed(JobError::StreamClosed)),
            TrackOutcome::TimedOut => {
                return Err(Stop::Failed(JobError::Timeout(self.ctx.idle_timeout.as_secs())))
            }
        }

        self.checkpoint()?;
        let outputs = self
            .ctx
            .gateway
            .collect_outputs(&prompt_id, &self.ctx.output_dir)
            .await?;
        self.checkpoint()?;

        outputs
            .into_iter()
            .next()
            .ok_or(Stop::Failed(JobError::NoOutputs))
    }

    fn on_tracker_event(&self, event: TrackerEvent) {
        match event {
            TrackerEvent::Started => {
                tracing::debug!(job_id = %self.job_id, "Prompt execution started");
            }
            TrackerEvent::Progress { percent, node } => {
                let changed = self
                    .state
                    .send_if_modified(|job| job.set_progress(percent, node.clone()));
                if changed {
                    self.ctx.events.publish(QueueEvent::JobProgress {
                        job_id: self.job_id,
                        percent,
                        node,
                    });
                }
            }
            TrackerEvent::Step {
                node,
                value,
                max,
                percent,
            } => {
                tracing::debug!(job_id = %self.job_id, ?node, value, max, percent, "Step progress");
            }
            // Terminal events end tracking and never reach the callback.
            TrackerEvent::Finished | TrackerEvent::Failed(_) => {}
        }
    }

    /// Best-effort removal of a submitted prompt from the server queue.
    async fn cancel_remote(&self, prompt_id: &str) {
        if let Err(e) = self.ctx.gateway.cancel_prompt(prompt_id).await {
            tracing::warn!(
                job_id = %self.job_id,
                prompt_id = %prompt_id,
                error = %e,
                "Failed to cancel prompt on server",
            );
        }
    }

    fn checkpoint(&self) -> Result<(), Stop> {
        if self.cancel.is_cancelled() {
            Err(Stop::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Apply a lifecycle transition; watchers are only notified when it
    /// succeeds.
    fn transition<F>(&self, f: F) -> Result<(), CoreError>
    where
        F: FnOnce(&mut Job) -> Result<(), CoreError>,
    {
        let mut result = Ok(());
        self.state.send_if_modified(|job| {
            result = f(job);
            result.is_ok()
        });
        result
    }
}
