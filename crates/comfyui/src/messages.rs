//! Frames received on the ComfyUI event socket.
//!
//! Every text frame is `{"type": "<kind>", "data": {...}}`. [`parse_message`]
//! turns one into a [`ComfyUIMessage`]; [`ComfyUIMessage::prompt_id`] is the
//! key the session routes on.

use serde::Deserialize;
use serde_json::Value;

/// Fallback text for an `error` frame without a message.
pub const UNKNOWN_ERROR_MESSAGE: &str = "Unknown error";

/// One event from the server, tagged by its `type` field.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ComfyUIMessage {
    /// Queue depth broadcast. Not tied to any prompt.
    Status(StatusData),
    ExecutionStart(ExecutionStartData),
    /// Nodes whose results were reused without running.
    ExecutionCached(ExecutionCachedData),
    /// `node: None` means the prompt is done.
    Executing(ExecutingData),
    /// Sampler step counter inside one node.
    Progress(ProgressData),
    Executed(ExecutedData),
    /// Sent by newer servers right before the final `executing`.
    ExecutionSuccess(ExecutionStartData),
    ExecutionError(ExecutionErrorData),
    ExecutionInterrupted(InterruptedData),
    /// Server-level failure, often without a prompt id.
    Error(ServerErrorData),
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StatusData {
    #[serde(default)]
    pub status: QueueStatus,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct QueueStatus {
    #[serde(default)]
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ExecInfo {
    #[serde(default)]
    pub queue_remaining: i32,
}

/// Shared by `execution_start` and `execution_success`.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionStartData {
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionCachedData {
    pub prompt_id: String,
    #[serde(default)]
    pub nodes: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: i64,
    pub max: i64,
    /// Absent on older servers.
    #[serde(default)]
    pub prompt_id: Option<String>,
    #[serde(default)]
    pub node: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    #[serde(default)]
    pub output: Value,
    pub prompt_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutionErrorData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
    #[serde(default)]
    pub exception_message: String,
    #[serde(default)]
    pub exception_type: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct InterruptedData {
    pub prompt_id: String,
    #[serde(default)]
    pub node_id: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ServerErrorData {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

impl ServerErrorData {
    pub fn message_or_default(&self) -> &str {
        self.message.as_deref().unwrap_or(UNKNOWN_ERROR_MESSAGE)
    }
}

impl ComfyUIMessage {
    /// Prompt named by the frame, if any.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            Self::Status(_) => None,
            Self::ExecutionStart(d) | Self::ExecutionSuccess(d) => Some(&d.prompt_id),
            Self::ExecutionCached(d) => Some(&d.prompt_id),
            Self::Executing(d) => d.prompt_id.as_deref(),
            Self::Progress(d) => d.prompt_id.as_deref(),
            Self::Executed(d) => Some(&d.prompt_id),
            Self::ExecutionError(d) => Some(&d.prompt_id),
            Self::ExecutionInterrupted(d) => Some(&d.prompt_id),
            Self::Error(d) => d.prompt_id.as_deref(),
        }
    }

    /// Wire name of the frame type.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Status(_) => "status",
            Self::ExecutionStart(_) => "execution_start",
            Self::ExecutionCached(_) => "execution_cached",
            Self::Executing(_) => "executing",
            Self::Progress(_) => "progress",
            Self::Executed(_) => "executed",
            Self::ExecutionSuccess(_) => "execution_success",
            Self::ExecutionError(_) => "execution_error",
            Self::ExecutionInterrupted(_) => "execution_interrupted",
            Self::Error(_) => "error",
        }
    }
}

/// Parse one text frame.
///
/// `error` frames are accepted with the message either in `data` or at
/// the top level. Malformed JSON and unknown types are errors; the
/// session logs and skips them.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    let mut value: Value = serde_json::from_str(text)?;

    if value.get("type").and_then(Value::as_str) == Some("error") {
        normalize_error_frame(&mut value);
    }

    serde_json::from_value(value)
}

/// Move a top-level `message` into `data`, creating `data` if needed.
fn normalize_error_frame(value: &mut Value) {
    let Some(frame) = value.as_object_mut() else {
        return;
    };
    let top_level_message = frame.get("message").cloned();
    let data = frame
        .entry("data")
        .or_insert_with(|| Value::Object(Default::default()));
    if !data.is_object() {
        *data = Value::Object(Default::default());
    }
    if let (Some(message), Some(data)) = (top_level_message, data.as_object_mut()) {
        data.entry("message").or_insert(message);
    }
}
