//! In-process mock of the ComfyUI HTTP + WebSocket surface.
//!
//! Every test spawns its own [`MockComfy`] on an ephemeral port. After a
//! prompt is accepted the mock plays the configured [`Scenario`] as
//! WebSocket frames to every connected client, and serves matching
//! `/history` and `/view` responses.

#![allow(dead_code)]

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use atelier_core::job::Job;
use atelier_queue::{AppConfig, JobQueue, QueueEvent};
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path as UrlPath, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tokio::sync::broadcast;

/// What the mock does after accepting a prompt.
#[derive(Debug, Clone)]
pub enum Scenario {
    /// `progress(50/100)` then `executing(null)`; history has one output
    /// image and one preview image.
    Complete,
    /// Full event sequence: start, cached, executing per node, step
    /// progress, executed, success, finish.
    CompleteWithNodeEvents,
    /// `execution_start` then a bare `error` frame with this message.
    Fail(String),
    /// `execution_start`, then silence.
    Hang,
    /// Accepted but queued behind other work: only `status` frames for
    /// this long, then plays out like `Complete`.
    Queued(Duration),
    /// Finishes, but history lists no output images.
    NoOutputs,
    /// `/prompt` answers 200 without a `prompt_id`.
    NoPromptId,
}

#[derive(Debug, Clone)]
pub struct UploadRecord {
    pub name: String,
    pub kind: String,
    pub overwrite: String,
    pub bytes: Vec<u8>,
}

pub struct MockState {
    scenario: Mutex<Scenario>,
    health_status: AtomicU16,
    next_prompt: AtomicU64,
    uploads: Mutex<Vec<UploadRecord>>,
    prompts: Mutex<Vec<Value>>,
    deletes: Mutex<Vec<String>>,
    frames: broadcast::Sender<String>,
}

pub struct MockComfy {
    pub addr: SocketAddr,
    pub state: Arc<MockState>,
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

impl MockComfy {
    pub async fn start(scenario: Scenario) -> Self {
        let (frames, _) = broadcast::channel(256);
        let state = Arc::new(MockState {
            scenario: Mutex::new(scenario),
            health_status: AtomicU16::new(200),
            next_prompt: AtomicU64::new(1),
            uploads: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
            deletes: Mutex::new(Vec::new()),
            frames,
        });

        let app = Router::new()
            .route("/", get(health))
            .route("/upload/image", post(upload))
            .route("/prompt", post(prompt))
            .route("/queue", post(queue))
            .route("/history/{prompt_id}", get(history))
            .route("/view", get(view))
            .route("/ws", get(ws))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    /// `host:port` for `COMFYUI_ADDRESS`.
    pub fn address(&self) -> String {
        self.addr.to_string()
    }

    pub fn set_health_status(&self, status: u16) {
        self.state.health_status.store(status, Ordering::SeqCst);
    }

    pub fn set_scenario(&self, scenario: Scenario) {
        *self.state.scenario.lock().unwrap() = scenario;
    }

    pub fn uploads(&self) -> Vec<UploadRecord> {
        self.state.uploads.lock().unwrap().clone()
    }

    /// Bodies of every `POST /prompt`.
    pub fn prompts(&self) -> Vec<Value> {
        self.state.prompts.lock().unwrap().clone()
    }

    /// Prompt ids deleted through `POST /queue`.
    pub fn deletes(&self) -> Vec<String> {
        self.state.deletes.lock().unwrap().clone()
    }

    /// Push a raw frame to every connected WebSocket client.
    pub fn send_frame(&self, frame: Value) {
        let _ = self.state.frames.send(frame.to_string());
    }
}

async fn health(State(state): State<Arc<MockState>>) -> StatusCode {
    StatusCode::from_u16(state.health_status.load(Ordering::SeqCst))
        .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR)
}

async fn upload(State(state): State<Arc<MockState>>, mut multipart: Multipart) -> Json<Value> {
    let mut record = UploadRecord {
        name: String::new(),
        kind: String::new(),
        overwrite: String::new(),
        bytes: Vec::new(),
    };

    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                record.name = field.file_name().unwrap_or_default().to_string();
                record.bytes = field.bytes().await.unwrap().to_vec();
            }
            "type" => record.kind = field.text().await.unwrap(),
            "overwrite" => record.overwrite = field.text().await.unwrap(),
            _ => {}
        }
    }

    let response = json!({"name": record.name, "subfolder": "", "type": record.kind});
    state.uploads.lock().unwrap().push(record);
    Json(response)
}

async fn prompt(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Json<Value> {
    let scenario = state.scenario.lock().unwrap().clone();
    state.prompts.lock().unwrap().push(body.clone());

    if matches!(scenario, Scenario::NoPromptId) {
        return Json(json!({"error": "queue full"}));
    }

    let number = state.next_prompt.fetch_add(1, Ordering::SeqCst);
    let prompt_id = format!("prompt-{number}");
    let node_ids: Vec<String> = body["prompt"]
        .as_object()
        .map(|m| m.keys().cloned().collect())
        .unwrap_or_default();

    let frames = scenario_frames(&scenario, &prompt_id, &node_ids);
    let tx = state.frames.clone();
    tokio::spawn(async move {
        if let Scenario::Queued(wait) = scenario {
            let status = json!({"type": "status", "data": {"status": {"exec_info": {"queue_remaining": 2}}}});
            let until = tokio::time::Instant::now() + wait;
            while tokio::time::Instant::now() < until {
                let _ = tx.send(status.to_string());
                tokio::time::sleep(Duration::from_millis(200)).await;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        for frame in frames {
            let _ = tx.send(frame.to_string());
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    });

    Json(json!({"prompt_id": prompt_id, "number": number, "node_errors": {}}))
}

async fn queue(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> StatusCode {
    if let Some(ids) = body["delete"].as_array() {
        let mut deletes = state.deletes.lock().unwrap();
        deletes.extend(ids.iter().filter_map(|v| v.as_str().map(str::to_string)));
    }
    StatusCode::OK
}

async fn history(
    State(state): State<Arc<MockState>>,
    UrlPath(prompt_id): UrlPath<String>,
) -> Json<Value> {
    let scenario = state.scenario.lock().unwrap().clone();
    let preview = json!({"filename": "preview.png", "subfolder": "", "type": "temp"});

    let images = match scenario {
        Scenario::NoOutputs => vec![preview],
        _ => vec![
            json!({"filename": format!("result_{prompt_id}.png"), "subfolder": "", "type": "output"}),
            preview,
        ],
    };

    let mut body = serde_json::Map::new();
    body.insert(
        prompt_id,
        json!({
            "prompt": [],
            "outputs": {"9": {"images": images}},
            "status": {"status_str": "success", "completed": true}
        }),
    );
    Json(Value::Object(body))
}

async fn view(Query(params): Query<HashMap<String, String>>) -> impl IntoResponse {
    let filename = params.get("filename").cloned().unwrap_or_default();
    image_bytes(&filename)
}

async fn ws(State(state): State<Arc<MockState>>, upgrade: WebSocketUpgrade) -> impl IntoResponse {
    // Subscribe before the upgrade completes so no frame is missed.
    let rx = state.frames.subscribe();
    upgrade.on_upgrade(move |socket| forward_frames(socket, rx))
}

async fn forward_frames(mut socket: WebSocket, mut rx: broadcast::Receiver<String>) {
    let status = json!({"type": "status", "data": {"status": {"exec_info": {"queue_remaining": 0}}}});
    if socket.send(Message::Text(status.to_string().into())).await.is_err() {
        return;
    }

    loop {
        match rx.recv().await {
            Ok(frame) => {
                if socket.send(Message::Text(frame.into())).await.is_err() {
                    return;
                }
            }
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => return,
        }
    }
}

fn scenario_frames(scenario: &Scenario, prompt_id: &str, node_ids: &[String]) -> Vec<Value> {
    let start = json!({"type": "execution_start", "data": {"prompt_id": prompt_id}});
    let finish = json!({"type": "executing", "data": {"node": null, "prompt_id": prompt_id}});

    match scenario {
        Scenario::Complete | Scenario::NoOutputs | Scenario::Queued(_) => vec![
            json!({"type": "progress", "data": {"value": 50, "max": 100, "prompt_id": prompt_id}}),
            finish,
        ],
        Scenario::CompleteWithNodeEvents => {
            let mut frames = vec![start];
            let (cached, executed) = node_ids.split_at(node_ids.len().min(1));
            frames.push(json!({
                "type": "execution_cached",
                "data": {"prompt_id": prompt_id, "nodes": cached}
            }));
            for node in executed {
                frames.push(json!({
                    "type": "executing",
                    "data": {"node": node, "prompt_id": prompt_id}
                }));
                frames.push(json!({"type": "progress", "data": {"value": 1, "max": 2}}));
                frames.push(json!({
                    "type": "executed",
                    "data": {"node": node, "output": {}, "prompt_id": prompt_id}
                }));
            }
            frames.push(json!({"type": "execution_success", "data": {"prompt_id": prompt_id}}));
            frames.push(finish);
            frames
        }
        Scenario::Fail(message) => vec![start, json!({"type": "error", "data": {"message": message}})],
        Scenario::Hang => vec![start],
        Scenario::NoPromptId => Vec::new(),
    }
}

/// Bytes the mock serves for an output image.
pub fn image_bytes(filename: &str) -> Vec<u8> {
    format!("image-bytes:{filename}").into_bytes()
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

/// Minimal API-format workflow with one node of each injected kind.
pub fn workflow_json() -> Value {
    json!({
        "1": {"class_type": "LoadImage", "inputs": {"image": "input_image.png", "upload": "image"}},
        "2": {"class_type": "ImageScale", "inputs": {
            "upscale_method": "nearest-exact", "width": 512, "height": 512, "crop": "disabled",
            "image": ["1", 0]
        }},
        "3": {"class_type": "KSampler", "inputs": {"seed": 0, "steps": 20, "cfg": 7.0}},
        "9": {"class_type": "SaveImage", "inputs": {"filename_prefix": "ComfyUI", "images": ["2", 0]}}
    })
}

pub fn write_workflow(dir: &Path) -> PathBuf {
    let path = dir.join("workflow_api.json");
    std::fs::write(&path, workflow_json().to_string()).unwrap();
    path
}

pub fn write_image(dir: &Path, name: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, b"\x89PNG fake image").unwrap();
    path
}

/// Configuration pointing at `mock`, with files under `dir`.
pub fn test_config(mock: &MockComfy, dir: &Path) -> AppConfig {
    AppConfig {
        comfyui_address: mock.address(),
        request_timeout: Duration::from_secs(5),
        startup_timeout: Duration::from_secs(2),
        tracking_idle_timeout: Duration::from_secs(10),
        workflow_path: write_workflow(dir),
        output_dir: dir.join("out"),
        ..AppConfig::default()
    }
}

/// Start a queue against a fresh mock running `scenario`.
pub async fn start_queue(scenario: Scenario) -> (MockComfy, Arc<JobQueue>, tempfile::TempDir) {
    let mock = MockComfy::start(scenario).await;
    let dir = tempfile::tempdir().unwrap();
    let queue = JobQueue::start(&test_config(&mock, dir.path())).await.unwrap();
    (mock, queue, dir)
}

/// Wait for the job to reach a terminal state, bounded so a hung job
/// fails the test instead of stalling it.
pub async fn wait_terminal(queue: &JobQueue, job_id: uuid::Uuid) -> Job {
    tokio::time::timeout(Duration::from_secs(15), queue.wait_for_job(job_id))
        .await
        .expect("job did not finish in time")
        .unwrap()
}

/// Collect every event already buffered on `rx`.
pub fn drain_events(rx: &mut broadcast::Receiver<QueueEvent>) -> Vec<QueueEvent> {
    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }
    events
}
