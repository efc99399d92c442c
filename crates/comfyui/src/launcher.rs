//! Optional local bootstrap of the ComfyUI server.
//!
//! When the health check fails and a launch command is configured, the
//! server is spawned as a subprocess and polled once per second until it
//! answers or the startup timeout elapses.

use std::process::ExitStatus;
use std::time::{Duration, Instant};

use tokio::process::{Child, Command};

use crate::api::ComfyUIApi;

/// Interval between health checks while waiting for startup.
pub const HEALTH_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// How to start the server locally.
#[derive(Debug, Clone)]
pub struct ServerLauncher {
    pub command: String,
    pub args: Vec<String>,
}

impl ServerLauncher {
    pub fn new(command: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            command: command.into(),
            args,
        }
    }

    fn spawn(&self) -> Result<Child, StartupError> {
        let mut cmd = Command::new(&self.command);
        cmd.args(&self.args);
        cmd.spawn().map_err(|source| StartupError::Spawn {
            command: self.command.clone(),
            source,
        })
    }
}

/// The server could not be brought up. Fatal to the whole session.
#[derive(Debug, thiserror::Error)]
pub enum StartupError {
    #[error("ComfyUI is not running at {address} and no launch command is configured")]
    NotRunning { address: String },

    #[error("Failed to launch '{command}': {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("ComfyUI did not become ready within {timeout_secs}s")]
    Timeout { timeout_secs: u64 },

    #[error("ComfyUI process exited during startup ({status})")]
    Exited { status: ExitStatus },
}

/// Make sure a server answers the health check.
///
/// Returns `Ok(None)` when the server was already running, or the handle
/// of the child process that was launched.
pub async fn ensure_server_running(
    api: &ComfyUIApi,
    launcher: Option<&ServerLauncher>,
    timeout: Duration,
) -> Result<Option<Child>, StartupError> {
    if api.check_server().await {
        tracing::info!(address = %api.api_url(), "ComfyUI server is running");
        return Ok(None);
    }

    let Some(launcher) = launcher else {
        return Err(StartupError::NotRunning {
            address: api.api_url().to_string(),
        });
    };

    tracing::info!(
        command = %launcher.command,
        args = ?launcher.args,
        "ComfyUI not running, launching server",
    );
    let mut child = launcher.spawn()?;

    match wait_for_server(api, timeout, Some(&mut child)).await {
        Ok(()) => Ok(Some(child)),
        Err(e) => {
            if let Err(kill_err) = child.kill().await {
                tracing::debug!(error = %kill_err, "Failed to kill ComfyUI child after startup failure");
            }
            Err(e)
        }
    }
}

/// Poll the health check every [`HEALTH_POLL_INTERVAL`] until it succeeds.
///
/// When `child` is given, an early exit of that process aborts the wait.
pub async fn wait_for_server(
    api: &ComfyUIApi,
    timeout: Duration,
    mut child: Option<&mut Child>,
) -> Result<(), StartupError> {
    let started = Instant::now();

    loop {
        if api.check_server().await {
            tracing::info!(
                elapsed_ms = started.elapsed().as_millis() as u64,
                "ComfyUI server is ready",
            );
            return Ok(());
        }

        if let Some(child) = child.as_deref_mut() {
            match child.try_wait() {
                Ok(Some(status)) => return Err(StartupError::Exited { status }),
                Ok(None) => {}
                Err(e) => tracing::debug!(error = %e, "Could not poll ComfyUI child status"),
            }
        }

        if started.elapsed() >= timeout {
            return Err(StartupError::Timeout {
                timeout_secs: timeout.as_secs(),
            });
        }

        tokio::time::sleep(HEALTH_POLL_INTERVAL).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unreachable_api() -> ComfyUIApi {
        ComfyUIApi::new("http://127.0.0.1:1".into(), Duration::from_secs(2)).unwrap()
    }

    #[tokio::test]
    async fn not_running_without_launcher() {
        let result = ensure_server_running(&unreachable_api(), None, Duration::from_secs(1)).await;
        assert!(matches!(result, Err(StartupError::NotRunning { .. })));
    }

    #[tokio::test]
    async fn missing_executable_is_spawn_error() {
        let launcher = ServerLauncher::new("/nonexistent/atelier-comfyui-binary", vec![]);
        let result =
            ensure_server_running(&unreachable_api(), Some(&launcher), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(StartupError::Spawn { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn early_exit_is_reported() {
        let launcher = ServerLauncher::new("sh", vec!["-c".into(), "exit 3".into()]);
        let result =
            ensure_server_running(&unreachable_api(), Some(&launcher), Duration::from_secs(10)).await;
        assert!(matches!(result, Err(StartupError::Exited { .. })));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn unresponsive_server_times_out() {
        let launcher = ServerLauncher::new("sleep", vec!["30".into()]);
        let result =
            ensure_server_running(&unreachable_api(), Some(&launcher), Duration::from_secs(1)).await;
        assert!(matches!(result, Err(StartupError::Timeout { timeout_secs: 1 })));
    }
}
