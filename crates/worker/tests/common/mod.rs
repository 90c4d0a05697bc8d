#![allow(dead_code)]

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path as UrlPath, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::{json, Value};
use tempfile::TempDir;
use tokio::sync::Notify;

use faceswap_worker::config::WorkerConfig;

pub const PROMPT_ID: &str = "abc";
pub const OUTPUT_FILENAME: &str = "ComfyUI_00001_.png";
pub const IMAGE_BYTES: &[u8] = b"\x89PNG\r\n\x1a\nfake face swap";

/// How the mock engine reacts to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Behavior {
    Succeed,
    /// `/system_stats` always answers 503.
    NeverReady,
    /// `/prompt` answers 400.
    RejectPrompt,
    /// The socket reports an `execution_error` for the prompt.
    FailExecution,
}

pub struct MockState {
    behavior: Behavior,
    stats_hits: AtomicUsize,
    prompts: Mutex<Vec<Value>>,
    socket_clients: Mutex<Vec<String>>,
    submitted: Notify,
}

/// An axum server speaking enough of the ComfyUI protocol for one job.
pub struct MockEngine {
    pub host: String,
    state: Arc<MockState>,
}

impl MockEngine {
    pub async fn start(behavior: Behavior) -> Self {
        let state = Arc::new(MockState {
            behavior,
            stats_hits: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
            socket_clients: Mutex::new(Vec::new()),
            submitted: Notify::new(),
        });

        let app = Router::new()
            .route("/system_stats", get(system_stats))
            .route("/prompt", post(prompt))
            .route("/ws", get(ws))
            .route("/history/{prompt_id}", get(history))
            .route("/view", get(view))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let host = listener.local_addr().unwrap().to_string();
        tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });

        Self { host, state }
    }

    pub fn stats_hits(&self) -> usize {
        self.state.stats_hits.load(Ordering::SeqCst)
    }

    /// Bodies received on `POST /prompt`.
    pub fn prompts(&self) -> Vec<Value> {
        self.state.prompts.lock().unwrap().clone()
    }

    /// `clientId` of every socket opened.
    pub fn socket_clients(&self) -> Vec<String> {
        self.state.socket_clients.lock().unwrap().clone()
    }
}

async fn system_stats(State(state): State<Arc<MockState>>) -> Response {
    state.stats_hits.fetch_add(1, Ordering::SeqCst);
    if state.behavior == Behavior::NeverReady {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }
    Json(json!({"system": {"os": "posix", "comfyui_version": "0.3.10"}, "devices": []}))
        .into_response()
}

async fn prompt(State(state): State<Arc<MockState>>, Json(body): Json<Value>) -> Response {
    state.prompts.lock().unwrap().push(body);
    if state.behavior == Behavior::RejectPrompt {
        return (StatusCode::BAD_REQUEST, r#"{"error":"invalid prompt"}"#).into_response();
    }
    state.submitted.notify_one();
    Json(json!({"prompt_id": PROMPT_ID, "number": 3, "node_errors": {}})).into_response()
}

async fn ws(
    State(state): State<Arc<MockState>>,
    Query(params): Query<HashMap<String, String>>,
    upgrade: WebSocketUpgrade,
) -> Response {
    if let Some(client_id) = params.get("clientId") {
        state.socket_clients.lock().unwrap().push(client_id.clone());
    }
    upgrade.on_upgrade(move |socket| drive_socket(socket, state))
}

fn frame(value: Value) -> Message {
    Message::Text(value.to_string().into())
}

async fn drive_socket(mut socket: WebSocket, state: Arc<MockState>) {
    let status = frame(json!({"type": "status", "data": {"status": {"exec_info": {"queue_remaining": 0}}, "sid": "mock"}}));
    if socket.send(status).await.is_err() {
        return;
    }

    state.submitted.notified().await;

    let mut frames = vec![
        frame(json!({"type": "execution_start", "data": {"prompt_id": PROMPT_ID}})),
        frame(json!({"type": "executing", "data": {"node": "240", "prompt_id": PROMPT_ID}})),
        frame(json!({"type": "progress", "data": {"value": 1, "max": 2, "prompt_id": PROMPT_ID, "node": "413"}})),
        Message::Binary(vec![1u8, 0, 0, 0].into()),
        frame(json!({"type": "executing", "data": {"node": null, "prompt_id": "someone-else"}})),
    ];
    if state.behavior == Behavior::FailExecution {
        frames.push(frame(json!({"type": "execution_error", "data": {
            "prompt_id": PROMPT_ID,
            "node_id": "413",
            "node_type": "ReActorFaceSwap",
            "exception_message": "No face found",
            "exception_type": "ValueError",
        }})));
    } else {
        frames.push(frame(json!({"type": "executing", "data": {"node": null, "prompt_id": PROMPT_ID}})));
    }

    for message in frames {
        if socket.send(message).await.is_err() {
            return;
        }
    }
    while let Some(Ok(_)) = socket.recv().await {}
}

async fn history(UrlPath(prompt_id): UrlPath<String>) -> Json<Value> {
    if prompt_id != PROMPT_ID {
        return Json(json!({}));
    }
    Json(json!({
        "abc": {
            "prompt": [],
            "outputs": {
                "413": {"images": [{"filename": OUTPUT_FILENAME, "subfolder": "", "type": "output"}]},
                "500": {"images": [{"filename": "preview.png", "subfolder": "", "type": "temp"}]},
            },
            "status": {"status_str": "success", "completed": true},
        }
    }))
}

async fn view(Query(params): Query<HashMap<String, String>>) -> Response {
    let wanted = params.get("filename").map(String::as_str) == Some(OUTPUT_FILENAME)
        && params.get("type").map(String::as_str) == Some("output");
    if wanted {
        IMAGE_BYTES.to_vec().into_response()
    } else {
        StatusCode::NOT_FOUND.into_response()
    }
}

/// Scratch directory holding a fake engine install, a workflow and two
/// input images.
pub struct Fixture {
    pub dir: TempDir,
    pub image1: PathBuf,
    pub image2: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("main.py"), "exec sleep 30\n").unwrap();
        std::fs::write(dir.path().join("good.json"), workflow().to_string()).unwrap();

        let image1 = dir.path().join("source.png");
        let image2 = dir.path().join("target.png");
        std::fs::write(&image1, b"source").unwrap();
        std::fs::write(&image2, b"target").unwrap();

        Self { dir, image1, image2 }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn job(&self) -> Value {
        json!({
            "id": "job-1",
            "input": {
                "image1_path": self.image1.to_str().unwrap(),
                "image2_path": self.image2.to_str().unwrap(),
            }
        })
    }

    /// Worker configuration pointing at `host`, launching the fake engine
    /// with `sh`.
    pub fn config(&self, host: &str) -> WorkerConfig {
        let dir = self.path().to_str().unwrap().to_string();
        let vars: HashMap<&str, String> = HashMap::from([
            ("COMFYUI_HOST", host.to_string()),
            ("COMFYUI_PATH", dir.clone()),
            ("COMFYUI_PYTHON", "sh".to_string()),
            ("WORKFLOW_PATH", format!("{dir}/good.json")),
            ("NETWORK_STORAGE_PATH", dir),
            ("COMFYUI_TIMEOUT", "10".to_string()),
            ("EXECUTION_TIMEOUT", "10".to_string()),
            ("SOCKET_TIMEOUT", "10".to_string()),
        ]);
        let mut config = WorkerConfig::from_lookup(|key| vars.get(key).cloned()).unwrap();
        config.engine.poll_interval = Duration::from_millis(50);
        config
    }
}

/// Face-swap graph with two loaders and an output node.
pub fn workflow() -> Value {
    json!({
        "10": {"class_type": "LoadImage", "inputs": {"image": "placeholder_source.png"}},
        "11": {"class_type": "LoadImage", "inputs": {"image": "placeholder_target.png"}},
        "240": {"class_type": "ReActorFaceSwap", "inputs": {"enabled": true, "input_image": ["11", 0], "source_image": ["10", 0]}},
        "413": {"class_type": "SaveImage", "inputs": {"filename_prefix": "ComfyUI", "images": ["240", 0]}},
    })
}

/// A localhost port with nothing listening.
pub fn unused_host() -> String {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().to_string()
}
