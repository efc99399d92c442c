//! Shared WebSocket session with per-prompt routing.
//!
//! One [`Session`] owns the process's single WebSocket to ComfyUI. A
//! reader task parses every frame and routes it to the tracker that
//! registered the frame's prompt id, so any number of jobs can be tracked
//! over the same connection. Finishing one job never closes the socket.
//!
//! Routing rules:
//! - frames naming a `prompt_id` go to that prompt's route;
//! - frames without one (`progress` on older servers, bare `error`) go
//!   to the prompt most recently seen executing; an `error` with no
//!   current prompt goes to every registered route;
//! - frames for a prompt that has not registered yet are buffered and
//!   flushed on registration;
//! - `status` and unparseable frames are dropped.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_util::sync::CancellationToken;

use crate::client::{ComfyUIClient, ComfyUIClientError};
use crate::messages::{parse_message, ComfyUIMessage};

/// Max prompts with buffered, not-yet-registered frames.
const MAX_PENDING_PROMPTS: usize = 64;

/// Max buffered frames per unregistered prompt.
const MAX_PENDING_FRAMES: usize = 512;

/// How many finished prompt ids are remembered so their late frames are
/// dropped instead of buffered.
const MAX_RETIRED_PROMPTS: usize = 256;

/// How long [`Session::close`] waits for the reader task.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

/// Receiving half of a prompt's route.
pub type MessageReceiver = mpsc::UnboundedReceiver<ComfyUIMessage>;

/// The live connection context: client id plus the routed event stream.
pub struct Session {
    client_id: String,
    routes: Arc<Mutex<Routes>>,
    cancel: CancellationToken,
    reader: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Session {
    /// Connect to ComfyUI with a fresh client id and start routing frames.
    pub async fn open(client: &ComfyUIClient) -> Result<Self, ComfyUIClientError> {
        let client_id = ComfyUIClient::new_client_id();
        let conn = client.connect(&client_id).await?;
        Ok(Self::from_stream(conn.client_id, conn.ws_stream))
    }

    /// Start routing frames from an already-established stream.
    pub fn from_stream<S>(client_id: String, stream: S) -> Self
    where
        S: Stream<Item = Result<Message, tungstenite::Error>> + Send + Unpin + 'static,
    {
        let routes = Arc::new(Mutex::new(Routes::default()));
        let cancel = CancellationToken::new();

        let reader = tokio::spawn(read_frames(
            stream,
            Arc::clone(&routes),
            cancel.clone(),
            client_id.clone(),
        ));

        Self {
            client_id,
            routes,
            cancel,
            reader: Mutex::new(Some(reader)),
        }
    }

    /// Client id all prompts must be submitted with.
    pub fn client_id(&self) -> &str {
        &self.client_id
    }

    /// Register a route for `prompt_id`.
    ///
    /// Frames already buffered for the prompt are delivered first. If the
    /// session has closed, the returned receiver yields `None` immediately.
    pub async fn register(&self, prompt_id: &str) -> MessageReceiver {
        self.routes.lock().await.register(prompt_id)
    }

    /// Drop the route for `prompt_id`. Later frames for it are discarded.
    pub async fn unregister(&self, prompt_id: &str) {
        self.routes.lock().await.unregister(prompt_id);
    }

    /// Whether the underlying socket has stopped delivering frames.
    pub async fn is_closed(&self) -> bool {
        self.routes.lock().await.closed
    }

    /// Stop the reader task and drop every route.
    pub async fn close(&self) {
        self.cancel.cancel();
        if let Some(handle) = self.reader.lock().await.take() {
            let _ = tokio::time::timeout(CLOSE_TIMEOUT, handle).await;
        }
        self.routes.lock().await.close();
        tracing::info!(client_id = %self.client_id, "ComfyUI session closed");
    }
}

/// Read frames until the socket closes or the session is cancelled.
async fn read_frames<S>(
    mut stream: S,
    routes: Arc<Mutex<Routes>>,
    cancel: CancellationToken,
    client_id: String,
) where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    loop {
        let frame = tokio::select! {
            _ = cancel.cancelled() => break,
            frame = stream.next() => frame,
        };

        match frame {
            Some(Ok(Message::Text(text))) => match parse_message(&text) {
                Ok(msg) => routes.lock().await.dispatch(msg),
                Err(e) => {
                    tracing::warn!(
                        client_id = %client_id,
                        error = %e,
                        raw_message = %text,
                        "Failed to parse ComfyUI message",
                    );
                }
            },
            Some(Ok(Message::Binary(_))) => {
                // Preview images; not used.
                tracing::trace!(client_id = %client_id, "Ignoring binary message (preview image)");
            }
            Some(Ok(Message::Close(frame))) => {
                tracing::info!(client_id = %client_id, ?frame, "ComfyUI WebSocket closed");
                break;
            }
            Some(Ok(_)) => {
                // Ping/Pong handled by tungstenite.
            }
            Some(Err(e)) => {
                tracing::error!(client_id = %client_id, error = %e, "WebSocket receive error");
                break;
            }
            None => {
                tracing::info!(client_id = %client_id, "WebSocket stream exhausted");
                break;
            }
        }
    }

    routes.lock().await.close();
}

// ---------------------------------------------------------------------------
// Routing table
// ---------------------------------------------------------------------------

/// Dispatch table keyed by prompt id.
#[derive(Default)]
struct Routes {
    active: HashMap<String, mpsc::UnboundedSender<ComfyUIMessage>>,
    pending: HashMap<String, Vec<ComfyUIMessage>>,
    pending_order: VecDeque<String>,
    retired: VecDeque<String>,
    /// Prompt most recently seen executing.
    current_prompt: Option<String>,
    closed: bool,
}

impl Routes {
    fn register(&mut self, prompt_id: &str) -> MessageReceiver {
        let (tx, rx) = mpsc::unbounded_channel();
        self.retired.retain(|p| p != prompt_id);

        if let Some(buffered) = self.pending.remove(prompt_id) {
            self.pending_order.retain(|p| p != prompt_id);
            tracing::debug!(
                prompt_id = %prompt_id,
                count = buffered.len(),
                "Flushing buffered frames to new route",
            );
            for msg in buffered {
                let _ = tx.send(msg);
            }
        }

        if !self.closed {
            self.active.insert(prompt_id.to_string(), tx);
        }
        rx
    }

    fn unregister(&mut self, prompt_id: &str) {
        self.active.remove(prompt_id);
        self.pending.remove(prompt_id);
        self.pending_order.retain(|p| p != prompt_id);
        if self.current_prompt.as_deref() == Some(prompt_id) {
            self.current_prompt = None;
        }
        self.retired.push_back(prompt_id.to_string());
        while self.retired.len() > MAX_RETIRED_PROMPTS {
            self.retired.pop_front();
        }
    }

    fn close(&mut self) {
        self.closed = true;
        self.active.clear();
        self.pending.clear();
        self.pending_order.clear();
    }

    fn dispatch(&mut self, msg: ComfyUIMessage) {
        if let ComfyUIMessage::Status(data) = &msg {
            tracing::debug!(
                queue_remaining = data.status.exec_info.queue_remaining,
                "ComfyUI queue status",
            );
            return;
        }

        let target = msg
            .prompt_id()
            .map(str::to_string)
            .or_else(|| self.current_prompt.clone());

        self.track_current(&msg);

        match target {
            Some(prompt_id) => self.deliver(&prompt_id, msg),
            None if matches!(msg, ComfyUIMessage::Error(_)) => {
                tracing::warn!(
                    routes = self.active.len(),
                    "Error frame without prompt id, delivering to every route",
                );
                self.active.retain(|_, tx| tx.send(msg.clone()).is_ok());
            }
            None => {
                tracing::trace!(kind = msg.kind(), "Dropping frame with no target prompt");
            }
        }
    }

    /// Keep `current_prompt` in step with the server's execution.
    fn track_current(&mut self, msg: &ComfyUIMessage) {
        match msg {
            ComfyUIMessage::ExecutionStart(d) => self.current_prompt = Some(d.prompt_id.clone()),
            ComfyUIMessage::ExecutionCached(d) => self.current_prompt = Some(d.prompt_id.clone()),
            ComfyUIMessage::Executing(d) => match (&d.node, &d.prompt_id) {
                (Some(_), Some(prompt_id)) => self.current_prompt = Some(prompt_id.clone()),
                (None, Some(prompt_id)) => self.clear_current(prompt_id),
                _ => {}
            },
            ComfyUIMessage::ExecutionSuccess(d) => self.clear_current(&d.prompt_id),
            ComfyUIMessage::ExecutionError(d) => self.clear_current(&d.prompt_id),
            ComfyUIMessage::ExecutionInterrupted(d) => self.clear_current(&d.prompt_id),
            _ => {}
        }
    }

    fn clear_current(&mut self, prompt_id: &str) {
        if self.current_prompt.as_deref() == Some(prompt_id) {
            self.current_prompt = None;
        }
    }

    fn deliver(&mut self, prompt_id: &str, msg: ComfyUIMessage) {
        if let Some(tx) = self.active.get(prompt_id) {
            if tx.send(msg).is_err() {
                // Tracker went away without unregistering.
                self.active.remove(prompt_id);
            }
            return;
        }

        if self.closed || self.retired.iter().any(|p| p == prompt_id) {
            return;
        }

        let buffer = self.pending.entry(prompt_id.to_string()).or_insert_with(|| {
            self.pending_order.push_back(prompt_id.to_string());
            Vec::new()
        });
        if buffer.len() >= MAX_PENDING_FRAMES {
            tracing::warn!(prompt_id = %prompt_id, "Pending frame buffer full, dropping frame");
            return;
        }
        buffer.push(msg);

        while self.pending_order.len() > MAX_PENDING_PROMPTS {
            if let Some(evicted) = self.pending_order.pop_front() {
                self.pending.remove(&evicted);
                tracing::debug!(prompt_id = %evicted, "Evicted unclaimed buffered frames");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(json: &str) -> ComfyUIMessage {
        parse_message(json).unwrap()
    }

    fn executing(node: &str, prompt: &str) -> ComfyUIMessage {
        msg(&format!(
            r#"{{"type":"executing","data":{{"node":"{node}","prompt_id":"{prompt}"}}}}"#
        ))
    }

    fn finished(prompt: &str) -> ComfyUIMessage {
        msg(&format!(
            r#"{{"type":"executing","data":{{"node":null,"prompt_id":"{prompt}"}}}}"#
        ))
    }

    fn progress() -> ComfyUIMessage {
        msg(r#"{"type":"progress","data":{"value":1,"max":2}}"#)
    }

    fn drain(rx: &mut MessageReceiver) -> Vec<ComfyUIMessage> {
        let mut out = Vec::new();
        while let Ok(m) = rx.try_recv() {
            out.push(m);
        }
        out
    }

    #[test]
    fn frames_route_by_prompt_id() {
        let mut routes = Routes::default();
        let mut a = routes.register("a");
        let mut b = routes.register("b");

        routes.dispatch(executing("1", "a"));
        routes.dispatch(executing("2", "b"));
        routes.dispatch(finished("a"));

        assert_eq!(drain(&mut a).len(), 2);
        assert_eq!(drain(&mut b).len(), 1);
    }

    #[test]
    fn progress_without_prompt_goes_to_current() {
        let mut routes = Routes::default();
        let mut a = routes.register("a");
        let mut b = routes.register("b");

        routes.dispatch(executing("3", "b"));
        routes.dispatch(progress());

        assert!(drain(&mut a).is_empty());
        let got = drain(&mut b);
        assert_eq!(got.len(), 2);
        assert!(matches!(got[1], ComfyUIMessage::Progress(_)));
    }

    #[test]
    fn completion_clears_current_prompt() {
        let mut routes = Routes::default();
        let mut a = routes.register("a");

        routes.dispatch(executing("3", "a"));
        routes.dispatch(finished("a"));
        routes.dispatch(progress());

        // The stray progress after completion is not delivered.
        assert_eq!(drain(&mut a).len(), 2);
    }

    #[test]
    fn early_frames_are_buffered_until_registration() {
        let mut routes = Routes::default();

        routes.dispatch(executing("1", "late"));
        routes.dispatch(finished("late"));

        let mut rx = routes.register("late");
        let got = drain(&mut rx);
        assert_eq!(got.len(), 2);
        assert!(matches!(got[0], ComfyUIMessage::Executing(_)));
    }

    #[test]
    fn retired_prompts_do_not_buffer() {
        let mut routes = Routes::default();
        let _rx = routes.register("done");
        routes.unregister("done");

        routes.dispatch(msg(r#"{"type":"execution_success","data":{"prompt_id":"done"}}"#));
        assert!(routes.pending.is_empty());
    }

    #[test]
    fn pending_buffer_is_bounded() {
        let mut routes = Routes::default();
        for i in 0..(MAX_PENDING_PROMPTS + 10) {
            routes.dispatch(executing("1", &format!("p{i}")));
        }
        assert_eq!(routes.pending.len(), MAX_PENDING_PROMPTS);
        assert!(!routes.pending.contains_key("p0"));
    }

    #[test]
    fn bare_error_without_current_prompt_reaches_every_route() {
        let mut routes = Routes::default();
        let mut a = routes.register("a");
        let mut b = routes.register("b");

        routes.dispatch(msg(r#"{"type":"error","message":"oom"}"#));

        assert_eq!(drain(&mut a).len(), 1);
        assert_eq!(drain(&mut b).len(), 1);
    }

    #[test]
    fn status_frames_are_dropped() {
        let mut routes = Routes::default();
        let mut a = routes.register("a");
        routes.dispatch(executing("1", "a"));
        routes.dispatch(msg(
            r#"{"type":"status","data":{"status":{"exec_info":{"queue_remaining":0}}}}"#,
        ));
        assert_eq!(drain(&mut a).len(), 1);
    }

    #[test]
    fn register_after_close_yields_closed_receiver() {
        let mut routes = Routes::default();
        routes.close();
        let mut rx = routes.register("a");
        assert!(matches!(
            rx.try_recv(),
            Err(mpsc::error::TryRecvError::Disconnected)
        ));
    }

    #[tokio::test]
    async fn session_routes_frames_from_stream() {
        let frames = vec![
            Ok(Message::Text(
                r#"{"type":"executing","data":{"node":"1","prompt_id":"p"}}"#.to_string(),
            )),
            Ok(Message::Text("garbage".to_string())),
            Ok(Message::Text(
                r#"{"type":"executing","data":{"node":null,"prompt_id":"p"}}"#.to_string(),
            )),
        ];
        // Keep the stream open until the test drops the session.
        let stream = futures::stream::iter(frames).chain(futures::stream::pending());
        let session = Session::from_stream("client".to_string(), Box::pin(stream));

        let mut rx = session.register("p").await;
        let first = rx.recv().await.unwrap();
        let second = rx.recv().await.unwrap();
        assert!(matches!(first, ComfyUIMessage::Executing(ref d) if d.node.as_deref() == Some("1")));
        assert!(matches!(second, ComfyUIMessage::Executing(ref d) if d.node.is_none()));

        assert!(!session.is_closed().await);
        session.close().await;
        assert!(session.is_closed().await);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn stream_end_closes_every_route() {
        let stream = futures::stream::iter(Vec::<Result<Message, tungstenite::Error>>::new());
        let session = Session::from_stream("client".to_string(), stream);
        let mut rx = session.register("p").await;
        // Either the route was registered before the reader noticed the
        // end of stream (and is then dropped), or after (and is born closed).
        assert!(rx.recv().await.is_none());
    }
}
