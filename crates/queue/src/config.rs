use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use atelier_comfyui::client::DEFAULT_CONNECT_TIMEOUT;
use atelier_comfyui::gateway::{GatewayConfig, DEFAULT_ADDRESS};
use atelier_comfyui::launcher::ServerLauncher;
use atelier_core::size::{ImageSize, SIZE_512};

/// Application configuration loaded from environment variables.
///
/// All fields have defaults suitable for a local ComfyUI install.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// `host:port` of the ComfyUI server.
    pub comfyui_address: String,
    /// Executable used to start ComfyUI when it is not running.
    pub launch_command: Option<String>,
    pub launch_args: Vec<String>,
    pub startup_timeout: Duration,
    /// Bound on every HTTP call.
    pub request_timeout: Duration,
    /// Max silence on a job's event stream.
    pub tracking_idle_timeout: Duration,
    /// API-format workflow template.
    pub workflow_path: PathBuf,
    pub output_dir: PathBuf,
    /// Overrides every checkpoint loader's model when set.
    pub checkpoint_name: Option<String>,
    /// Default target size for new jobs.
    pub target_size: ImageSize,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            comfyui_address: DEFAULT_ADDRESS.to_string(),
            launch_command: None,
            launch_args: Vec::new(),
            startup_timeout: Duration::from_secs(30),
            request_timeout: Duration::from_secs(30),
            tracking_idle_timeout: Duration::from_secs(600),
            workflow_path: PathBuf::from("workflow_api.json"),
            output_dir: PathBuf::from("."),
            checkpoint_name: None,
            target_size: SIZE_512,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

impl AppConfig {
    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                       | Default             |
    /// |-------------------------------|---------------------|
    /// | `COMFYUI_ADDRESS`             | `127.0.0.1:8188`    |
    /// | `COMFYUI_LAUNCH_COMMAND`      | unset               |
    /// | `COMFYUI_LAUNCH_ARGS`         | empty               |
    /// | `SERVER_STARTUP_TIMEOUT_SECS` | `30`                |
    /// | `REQUEST_TIMEOUT_SECS`        | `30`                |
    /// | `TRACKING_IDLE_TIMEOUT_SECS`  | `600`               |
    /// | `WORKFLOW_PATH`               | `workflow_api.json` |
    /// | `OUTPUT_DIR`                  | `.`                 |
    /// | `CHECKPOINT_NAME`             | unset               |
    /// | `TARGET_SIZE`                 | `512x512`           |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());

        let secs = |var: &'static str, default: Duration| -> Result<Duration, ConfigError> {
            match get(var) {
                None => Ok(default),
                Some(raw) => match raw.parse::<u64>() {
                    Ok(0) => Err(invalid(var, raw, "must be greater than zero")),
                    Ok(n) => Ok(Duration::from_secs(n)),
                    Err(e) => Err(invalid(var, raw, e)),
                },
            }
        };

        let target_size = match get("TARGET_SIZE") {
            None => defaults.target_size,
            Some(raw) => ImageSize::from_str(&raw).map_err(|e| invalid("TARGET_SIZE", raw, e))?,
        };

        Ok(Self {
            comfyui_address: get("COMFYUI_ADDRESS").unwrap_or(defaults.comfyui_address),
            launch_command: get("COMFYUI_LAUNCH_COMMAND"),
            launch_args: get("COMFYUI_LAUNCH_ARGS")
                .map(|v| v.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
            startup_timeout: secs("SERVER_STARTUP_TIMEOUT_SECS", defaults.startup_timeout)?,
            request_timeout: secs("REQUEST_TIMEOUT_SECS", defaults.request_timeout)?,
            tracking_idle_timeout: secs(
                "TRACKING_IDLE_TIMEOUT_SECS",
                defaults.tracking_idle_timeout,
            )?,
            workflow_path: get("WORKFLOW_PATH")
                .map(PathBuf::from)
                .unwrap_or(defaults.workflow_path),
            output_dir: get("OUTPUT_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.output_dir),
            checkpoint_name: get("CHECKPOINT_NAME"),
            target_size,
        })
    }

    pub fn launcher(&self) -> Option<ServerLauncher> {
        self.launch_command
            .as_ref()
            .map(|cmd| ServerLauncher::new(cmd.clone(), self.launch_args.clone()))
    }

    pub fn gateway_config(&self) -> GatewayConfig {
        GatewayConfig {
            address: self.comfyui_address.clone(),
            request_timeout: self.request_timeout,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
            launcher: self.launcher(),
        }
    }
}

fn invalid(var: &'static str, value: String, reason: impl ToString) -> ConfigError {
    ConfigError::Invalid {
        var,
        value,
        reason: reason.to_string(),
    }
}
