//! Multi-job coordinator.
//!
//! [`JobQueue`] is the public surface for any presentation layer. It
//! verifies (or launches) the ComfyUI server, opens the single shared
//! session and runs every added job on its own task. Job state is written
//! only by that task; the queue keeps a `watch::Receiver` per job for
//! snapshots and a child cancellation token for cooperative cancel.
//!
//! State changes are broadcast as [`QueueEvent`]s. Call
//! [`JobQueue::subscribe`] to receive them.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use atelier_comfyui::gateway::ComfyUIGateway;
use atelier_core::job::Job;
use atelier_core::size::ImageSize;
use atelier_core::types::JobId;
use atelier_core::workflow::WorkflowGraph;
use tokio::process::Child;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, watch, Mutex, RwLock};
use tokio_util::sync::CancellationToken;

use crate::config::AppConfig;
use crate::error::{QueueError, StartError};
use crate::events::{QueueEvent, QueueEvents};
use crate::runner::{JobContext, JobRunner};

/// How long [`JobQueue::shutdown`] waits for each job task.
const SHUTDOWN_TASK_TIMEOUT: Duration = Duration::from_secs(5);

/// Tracks every job for the lifetime of the session.
///
/// Created once via [`JobQueue::start`]; the returned `Arc` can be cloned
/// into any number of observers.
pub struct JobQueue {
    jobs: RwLock<HashMap<JobId, ManagedJob>>,
    ctx: Arc<JobContext>,
    /// Master cancellation token; every job holds a child of it.
    cancel: CancellationToken,
    /// Monotonic insertion counter used to order `list_jobs`.
    next_seq: AtomicU64,
    /// Server process launched at startup, if any.
    server_process: Mutex<Option<Child>>,
}

impl fmt::Debug for JobQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("client_id", &self.ctx.session.client_id())
            .field("jobs", &self.jobs.try_read().map(|jobs| jobs.len()).ok())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish_non_exhaustive()
    }
}

/// Internal bookkeeping for one job.
struct ManagedJob {
    seq: u64,
    state: watch::Receiver<Job>,
    cancel: CancellationToken,
    task_handle: Option<tokio::task::JoinHandle<()>>,
}

impl JobQueue {
    /// Bring up the server connection and load the workflow template.
    ///
    /// Health check, optional launch, session, then template. Any failure
    /// here is fatal: no job can run without a server.
    pub async fn start(config: &AppConfig) -> Result<Arc<Self>, StartError> {
        let gateway = ComfyUIGateway::new(&config.gateway_config())?;
        let server_process = gateway
            .ensure_server_running(config.startup_timeout)
            .await?;

        let template = load_workflow(&config.workflow_path).await?;
        let session = gateway.open_session().await?;

        tracing::info!(
            address = %config.comfyui_address,
            client_id = %session.client_id(),
            workflow = %config.workflow_path.display(),
            nodes = template.len(),
            "Job queue ready",
        );

        let ctx = JobContext {
            gateway,
            session: Arc::new(session),
            template,
            events: QueueEvents::default(),
            output_dir: config.output_dir.clone(),
            checkpoint: config.checkpoint_name.clone(),
            idle_timeout: config.tracking_idle_timeout,
        };

        let queue = Self::new(ctx);
        *queue.server_process.lock().await = server_process;
        Ok(queue)
    }

    /// Build a queue around an already-established context.
    pub fn new(ctx: JobContext) -> Arc<Self> {
        Arc::new(Self {
            jobs: RwLock::new(HashMap::new()),
            ctx: Arc::new(ctx),
            cancel: CancellationToken::new(),
            next_seq: AtomicU64::new(0),
            server_process: Mutex::new(None),
        })
    }

    /// Subscribe to job notifications.
    pub fn subscribe(&self) -> broadcast::Receiver<QueueEvent> {
        self.ctx.events.subscribe()
    }

    /// Client id of the shared session.
    pub fn client_id(&self) -> &str {
        self.ctx.session.client_id()
    }

    /// Create a pending job and start its execution task.
    ///
    /// Returns immediately; progress is reported through events.
    pub async fn add_job(&self, input_image: impl Into<PathBuf>, target_size: ImageSize) -> JobId {
        let job = Job::new(input_image.into(), target_size);
        let job_id = job.id;
        let (state_tx, state_rx) = watch::channel(job);
        let cancel = self.cancel.child_token();
        let seq = self.next_seq.fetch_add(1, Ordering::Relaxed);

        let mut jobs = self.jobs.write().await;
        jobs.insert(
            job_id,
            ManagedJob {
                seq,
                state: state_rx,
                cancel: cancel.clone(),
                task_handle: None,
            },
        );
        self.ctx.events.publish(QueueEvent::JobAdded { job_id });
        tracing::info!(job_id = %job_id, size = %target_size, "Job added");

        let runner = JobRunner::new(Arc::clone(&self.ctx), state_tx, cancel);
        let handle = tokio::spawn(runner.run());
        if let Some(managed) = jobs.get_mut(&job_id) {
            managed.task_handle = Some(handle);
        }

        job_id
    }

    /// Request cooperative cancellation.
    ///
    /// The job stops at its next checkpoint and emits no further progress.
    /// Cancelling a job that already finished is a no-op.
    pub async fn cancel(&self, job_id: JobId) -> Result<(), QueueError> {
        let jobs = self.jobs.read().await;
        let managed = jobs.get(&job_id).ok_or(QueueError::NotFound(job_id))?;

        if managed.state.borrow().is_terminal() {
            return Ok(());
        }
        managed.cancel.cancel();
        tracing::info!(job_id = %job_id, "Cancellation requested");
        Ok(())
    }

    /// Cancel every job that has not finished. Returns how many were signalled.
    pub async fn cancel_all(&self) -> usize {
        let jobs = self.jobs.read().await;
        let mut count = 0;
        for managed in jobs.values() {
            if !managed.state.borrow().is_terminal() {
                managed.cancel.cancel();
                count += 1;
            }
        }
        tracing::info!(count, "Cancellation requested for all active jobs");
        count
    }

    /// Remove a finished job's bookkeeping.
    pub async fn remove(&self, job_id: JobId) -> Result<(), QueueError> {
        let mut jobs = self.jobs.write().await;
        let managed = jobs.get(&job_id).ok_or(QueueError::NotFound(job_id))?;

        let status = managed.state.borrow().status;
        if !status.is_terminal() {
            return Err(QueueError::NotTerminal { id: job_id, status });
        }

        jobs.remove(&job_id);
        self.ctx.events.publish(QueueEvent::JobRemoved { job_id });
        tracing::debug!(job_id = %job_id, "Job removed");
        Ok(())
    }

    /// Remove every finished job. Returns the removed ids.
    pub async fn clear_finished(&self) -> Vec<JobId> {
        let mut jobs = self.jobs.write().await;
        let finished: Vec<JobId> = jobs
            .iter()
            .filter(|(_, m)| m.state.borrow().is_terminal())
            .map(|(id, _)| *id)
            .collect();

        for job_id in &finished {
            jobs.remove(job_id);
            self.ctx.events.publish(QueueEvent::JobRemoved { job_id: *job_id });
        }
        tracing::info!(count = finished.len(), "Cleared finished jobs");
        finished
    }

    /// Snapshot of one job.
    pub async fn get_job(&self, job_id: JobId) -> Option<Job> {
        self.jobs
            .read()
            .await
            .get(&job_id)
            .map(|m| m.state.borrow().clone())
    }

    /// Snapshots of every job, oldest first.
    pub async fn list_jobs(&self) -> Vec<Job> {
        let jobs = self.jobs.read().await;
        let mut entries: Vec<_> = jobs.values().collect();
        entries.sort_by_key(|m| m.seq);
        entries
            .into_iter()
            .map(|m| m.state.borrow().clone())
            .collect()
    }

    /// Wait until the job reaches a terminal state and return it.
    pub async fn wait_for_job(&self, job_id: JobId) -> Result<Job, QueueError> {
        let mut state = self
            .jobs
            .read()
            .await
            .get(&job_id)
            .map(|m| m.state.clone())
            .ok_or(QueueError::NotFound(job_id))?;

        if let Ok(job) = state.wait_for(|job| job.is_terminal()).await {
            return Ok(job.clone());
        }
        // The runner is gone; report whatever it left behind.
        let job = state.borrow().clone();
        Ok(job)
    }

    /// Drive the queue until every job has finished.
    ///
    /// Every event from `events` is passed to `on_event`. When `interrupt`
    /// resolves, all active jobs are cancelled (once) and the wait goes on
    /// until they have stopped. Returns the final snapshots, oldest first.
    pub async fn run_until_idle<I, F>(
        &self,
        mut events: broadcast::Receiver<QueueEvent>,
        interrupt: I,
        mut on_event: F,
    ) -> Vec<Job>
    where
        I: Future<Output = ()>,
        F: FnMut(&QueueEvent),
    {
        tokio::pin!(interrupt);
        let mut interrupted = false;

        loop {
            if self.list_jobs().await.iter().all(Job::is_terminal) {
                break;
            }

            tokio::select! {
                () = &mut interrupt, if !interrupted => {
                    interrupted = true;
                    let count = self.cancel_all().await;
                    tracing::warn!(count, "Interrupted, cancelling jobs");
                }
                event = events.recv() => match event {
                    Ok(event) => on_event(&event),
                    Err(RecvError::Lagged(missed)) => {
                        tracing::warn!(missed, "Event receiver lagged");
                    }
                    Err(RecvError::Closed) => break,
                },
            }
        }

        self.list_jobs().await
    }

    /// Cancel every job, wait for the tasks, then close the session.
    ///
    /// Waits up to 5 seconds per task. A server launched at startup is
    /// stopped as well.
    pub async fn shutdown(&self) {
        tracing::info!("Shutting down job queue");
        self.cancel.cancel();

        let handles: Vec<_> = {
            let mut jobs = self.jobs.write().await;
            jobs.iter_mut()
                .filter_map(|(id, m)| m.task_handle.take().map(|h| (*id, h)))
                .collect()
        };
        for (job_id, handle) in handles {
            if tokio::time::timeout(SHUTDOWN_TASK_TIMEOUT, handle).await.is_err() {
                tracing::warn!(job_id = %job_id, "Job task did not stop in time");
            }
        }

        self.ctx.session.close().await;

        if let Some(mut child) = self.server_process.lock().await.take() {
            tracing::info!("Stopping launched ComfyUI server");
            if let Err(e) = child.kill().await {
                tracing::warn!(error = %e, "Failed to stop ComfyUI server");
            }
        }

        tracing::info!("Job queue shut down complete");
    }
}

/// Read and validate the workflow template.
async fn load_workflow(path: &std::path::Path) -> Result<WorkflowGraph, StartError> {
    let text = tokio::fs::read_to_string(path)
        .await
        .map_err(|source| StartError::WorkflowRead {
            path: path.to_path_buf(),
            source,
        })?;
    WorkflowGraph::from_json_str(&text).map_err(|source| StartError::WorkflowInvalid {
        path: path.to_path_buf(),
        source,
    })
}
