//! `atelier` -- process images through a ComfyUI workflow.
//!
//! Enqueues one job per image argument, logs every queue event and exits
//! once all jobs have finished. Ctrl-C (or SIGTERM) cancels everything
//! still running.
//! Exits non-zero when any job failed.
//!
//! ```text
//! atelier photo1.png photo2.jpg
//! ```
//!
//! Configuration comes from the environment (and `.env`); see
//! [`AppConfig::from_env`] for the variables.

use std::path::PathBuf;

use anyhow::Context;
use atelier_core::job::JobStatus;
use atelier_queue::{AppConfig, JobQueue, QueueEvent};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "atelier_queue=info,atelier_comfyui=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let images: Vec<PathBuf> = std::env::args_os().skip(1).map(PathBuf::from).collect();
    if images.is_empty() {
        eprintln!("usage: atelier <IMAGE>...");
        std::process::exit(2);
    }

    let config = AppConfig::from_env().context("invalid configuration")?;
    let queue = JobQueue::start(&config)
        .await
        .context("failed to start job queue")?;

    let events = queue.subscribe();
    for image in images {
        queue.add_job(image, config.target_size).await;
    }

    let jobs = queue
        .run_until_idle(events, interrupt_signal(), log_event)
        .await;
    let failed = jobs
        .iter()
        .filter(|job| job.status == JobStatus::Failed)
        .count();
    tracing::info!(
        total = jobs.len(),
        failed,
        completed = jobs.iter().filter(|j| j.status == JobStatus::Completed).count(),
        "All jobs finished",
    );

    queue.shutdown().await;

    if failed > 0 {
        std::process::exit(1);
    }
    Ok(())
}

/// Resolve on SIGINT (Ctrl-C) or, on Unix, SIGTERM.
///
/// A handler that cannot be installed never fires.
async fn interrupt_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "Failed to install Ctrl-C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => tracing::info!("Received SIGINT (Ctrl-C)"),
        () = terminate => tracing::info!("Received SIGTERM"),
    }
}

fn log_event(event: &QueueEvent) {
    match event {
        QueueEvent::JobAdded { job_id } => tracing::info!(job_id = %job_id, "Queued"),
        QueueEvent::JobStarted { job_id, prompt_id } => {
            tracing::info!(job_id = %job_id, prompt_id = %prompt_id, "Submitted")
        }
        QueueEvent::JobProgress {
            job_id,
            percent,
            node,
        } => tracing::info!(job_id = %job_id, percent, node = ?node, "Progress"),
        QueueEvent::JobCompleted {
            job_id,
            output_path,
        } => tracing::info!(job_id = %job_id, output = %output_path.display(), "Completed"),
        QueueEvent::JobFailed { job_id, error } => {
            tracing::error!(job_id = %job_id, error = %error, "Failed")
        }
        QueueEvent::JobCancelled { job_id } => tracing::warn!(job_id = %job_id, "Cancelled"),
        QueueEvent::JobRemoved { job_id } => tracing::debug!(job_id = %job_id, "Removed"),
    }
}
