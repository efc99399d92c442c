//! Progress tracking for one submitted prompt.
//!
//! [`ProgressTracker`] is a pure state machine
//! (`Waiting -> Executing -> Completed | Failed`) fed with the messages
//! the session routes to a prompt. [`track_prompt`] drives it from a
//! route receiver until the prompt finishes, fails, the stream closes,
//! the stream goes idle for too long, or the caller cancels.

use std::time::Duration;

use atelier_core::progress::{step_percent, NodeProgress};
use atelier_core::workflow::WorkflowGraph;
use tokio_util::sync::CancellationToken;

use crate::messages::{ComfyUIMessage, UNKNOWN_ERROR_MESSAGE};
use crate::session::MessageReceiver;

/// Failure message for `execution_interrupted`.
pub const INTERRUPTED_MESSAGE: &str = "Execution interrupted";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackerState {
    Waiting,
    Executing,
    Completed,
    Failed,
}

/// Normalized progress event emitted by the tracker.
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerEvent {
    /// The server started executing the prompt.
    Started,
    /// Overall progress changed (finished nodes / total nodes).
    Progress { percent: u8, node: Option<String> },
    /// Step counter from a long-running node. Informational only.
    Step {
        node: Option<String>,
        value: i64,
        max: i64,
        percent: u8,
    },
    /// The prompt finished executing; outputs can be collected.
    Finished,
    /// The server reported a failure.
    Failed(String),
}

/// Turns routed ComfyUI messages into progress for a single prompt.
#[derive(Debug)]
pub struct ProgressTracker {
    prompt_id: String,
    nodes: NodeProgress,
    state: TrackerState,
}

impl ProgressTracker {
    pub fn new(prompt_id: impl Into<String>, graph: &WorkflowGraph) -> Self {
        Self {
            prompt_id: prompt_id.into(),
            nodes: NodeProgress::new(graph.node_ids()),
            state: TrackerState::Waiting,
        }
    }

    pub fn prompt_id(&self) -> &str {
        &self.prompt_id
    }

    pub fn state(&self) -> TrackerState {
        self.state
    }

    pub fn percent(&self) -> u8 {
        self.nodes.percent()
    }

    /// Apply one message and return the events it produced.
    ///
    /// Messages naming a different prompt, and anything arriving after a
    /// terminal state, are ignored.
    pub fn handle(&mut self, msg: &ComfyUIMessage) -> Vec<TrackerEvent> {
        let mut events = Vec::new();

        if matches!(self.state, TrackerState::Completed | TrackerState::Failed) {
            return events;
        }
        if msg.prompt_id().is_some_and(|p| p != self.prompt_id) {
            return events;
        }

        match msg {
            ComfyUIMessage::Status(_) | ComfyUIMessage::ExecutionSuccess(_) => {}

            ComfyUIMessage::ExecutionStart(_) => self.begin(&mut events),

            ComfyUIMessage::ExecutionCached(data) => {
                self.begin(&mut events);
                let mut changed = false;
                for node in &data.nodes {
                    changed |= self.nodes.mark_finished(node);
                }
                if changed {
                    events.push(TrackerEvent::Progress {
                        percent: self.nodes.percent(),
                        node: None,
                    });
                }
            }

            ComfyUIMessage::Executing(data) => match &data.node {
                Some(node) => {
                    self.begin(&mut events);
                    self.finish_node(node, &mut events);
                }
                None => {
                    // Completion must name this prompt explicitly.
                    if data.prompt_id.as_deref() == Some(self.prompt_id.as_str()) {
                        self.state = TrackerState::Completed;
                        events.push(TrackerEvent::Finished);
                    }
                }
            },

            ComfyUIMessage::Executed(data) => {
                self.begin(&mut events);
                self.finish_node(&data.node, &mut events);
            }

            ComfyUIMessage::Progress(data) => {
                self.begin(&mut events);
                events.push(TrackerEvent::Step {
                    node: data.node.clone(),
                    value: data.value,
                    max: data.max,
                    percent: step_percent(data.value, data.max),
                });
            }

            ComfyUIMessage::ExecutionError(data) => {
                let message = if !data.exception_message.is_empty() {
                    data.exception_message.clone()
                } else if !data.exception_type.is_empty() {
                    data.exception_type.clone()
                } else {
                    UNKNOWN_ERROR_MESSAGE.to_string()
                };
                self.fail(message, &mut events);
            }

            ComfyUIMessage::ExecutionInterrupted(_) => {
                self.fail(INTERRUPTED_MESSAGE.to_string(), &mut events);
            }

            ComfyUIMessage::Error(data) => {
                self.fail(data.message_or_default().to_string(), &mut events);
            }
        }

        events
    }

    fn begin(&mut self, events: &mut Vec<TrackerEvent>) {
        if self.state == TrackerState::Waiting {
            self.state = TrackerState::Executing;
            events.push(TrackerEvent::Started);
        }
    }

    fn finish_node(&mut self, node: &str, events: &mut Vec<TrackerEvent>) {
        if self.nodes.mark_finished(node) {
            events.push(TrackerEvent::Progress {
                percent: self.nodes.percent(),
                node: Some(node.to_string()),
            });
        }
    }

    fn fail(&mut self, message: String, events: &mut Vec<TrackerEvent>) {
        self.state = TrackerState::Failed;
        events.push(TrackerEvent::Failed(message));
    }
}

/// How a tracking loop ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrackOutcome {
    Finished,
    Failed(String),
    Cancelled,
    /// The session dropped the route (socket closed).
    StreamClosed,
    /// Nothing arrived for the whole idle timeout.
    TimedOut,
}

/// Drive `tracker` from `rx` until the prompt reaches an outcome.
///
/// Non-terminal events are passed to `on_event`. The cancellation token is
/// checked before every receive and before every emitted event, so no
/// event is emitted once cancellation has been requested.
///
/// `idle_timeout` only applies once the prompt has started executing. A
/// prompt still waiting in the server queue can stay silent indefinitely.
pub async fn track_prompt<F>(
    tracker: &mut ProgressTracker,
    rx: &mut MessageReceiver,
    cancel: &CancellationToken,
    idle_timeout: Duration,
    mut on_event: F,
) -> TrackOutcome
where
    F: FnMut(TrackerEvent),
{
    loop {
        let waiting = tracker.state() == TrackerState::Waiting;
        let next = async {
            if waiting {
                Ok(rx.recv().await)
            } else {
                tokio::time::timeout(idle_timeout, rx.recv()).await
            }
        };

        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => return TrackOutcome::Cancelled,
            received = next => match received {
                Ok(Some(msg)) => msg,
                Ok(None) => return TrackOutcome::StreamClosed,
                Err(_) => {
                    tracing::warn!(
                        prompt_id = %tracker.prompt_id(),
                        idle_secs = idle_timeout.as_secs(),
                        "No events received within idle timeout",
                    );
                    return TrackOutcome::TimedOut;
                }
            },
        };

        tracing::trace!(prompt_id = %tracker.prompt_id(), kind = msg.kind(), "Tracker received message");

        for event in tracker.handle(&msg) {
            match event {
                TrackerEvent::Finished => return TrackOutcome::Finished,
                TrackerEvent::Failed(message) => return TrackOutcome::Failed(message),
                event => {
                    if cancel.is_cancelled() {
                        return TrackOutcome::Cancelled;
                    }
                    on_event(event);
                }
            }
        }
    }
}
