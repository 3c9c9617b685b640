// In-process restvirt API used by the integration tests
//
// Serves the volume and attachment endpoints from an in-memory table on an
// ephemeral localhost port.

#![allow(dead_code)]

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use restvirt_csi::backend::{Attachment, CreateVolumeInput, Volume};
use serde_json::json;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};

#[derive(Debug, Default)]
struct FakeState {
    volumes: Vec<Volume>,
    attachments: HashMap<(String, String), Attachment>,
    next_volume: u32,
    next_slot: u32,
    next_failure: Option<(StatusCode, String)>,
}

impl FakeState {
    fn take_failure(&mut self) -> Option<Response> {
        self.next_failure.take().map(|(status, body)| (status, body).into_response())
    }
}

type Shared = Arc<Mutex<FakeState>>;

fn error(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "Error": message }))).into_response()
}

async fn create_volume(State(state): State<Shared>, Json(input): Json<CreateVolumeInput>) -> Response {
    let mut state = state.lock().unwrap();
    if let Some(failure) = state.take_failure() {
        return failure;
    }

    state.next_volume += 1;
    let volume = Volume { id: format!("v{}", state.next_volume), name: input.name, size: input.size };
    state.volumes.push(volume.clone());
    (StatusCode::CREATED, Json(volume)).into_response()
}

async fn list_volumes(State(state): State<Shared>) -> Response {
    let mut state = state.lock().unwrap();
    if let Some(failure) = state.take_failure() {
        return failure;
    }

    Json(json!({ "volumes": state.volumes })).into_response()
}

async fn get_volume(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let mut state = state.lock().unwrap();
    if let Some(failure) = state.take_failure() {
        return failure;
    }

    match state.volumes.iter().find(|v| v.id == id) {
        Some(volume) => Json(volume.clone()).into_response(),
        None => error(StatusCode::NOT_FOUND, "volume not found"),
    }
}

async fn delete_volume(State(state): State<Shared>, Path(id): Path<String>) -> Response {
    let mut state = state.lock().unwrap();
    if let Some(failure) = state.take_failure() {
        return failure;
    }

    if state.attachments.keys().any(|(_, volume)| *volume == id) {
        return error(StatusCode::CONFLICT, "volume is attached");
    }

    let before = state.volumes.len();
    state.volumes.retain(|v| v.id != id);
    if state.volumes.len() == before {
        return error(StatusCode::NOT_FOUND, "volume not found");
    }
    StatusCode::NO_CONTENT.into_response()
}

async fn put_attachment(
    State(state): State<Shared>,
    Path((node, volume)): Path<(String, String)>,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Some(failure) = state.take_failure() {
        return failure;
    }

    if !state.volumes.iter().any(|v| v.id == volume) {
        return error(StatusCode::NOT_FOUND, "volume not found");
    }
    let key = (node, volume);
    if state.attachments.contains_key(&key) {
        return error(StatusCode::CONFLICT, "volume already attached");
    }

    let attachment =
        Attachment { disk_address: format!("pci-0000:00:{:02x}.0", 5 + state.next_slot) };
    state.next_slot += 1;
    state.attachments.insert(key, attachment.clone());
    (StatusCode::CREATED, Json(attachment)).into_response()
}

async fn get_attachment(
    State(state): State<Shared>,
    Path((node, volume)): Path<(String, String)>,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Some(failure) = state.take_failure() {
        return failure;
    }

    match state.attachments.get(&(node, volume)) {
        Some(attachment) => Json(attachment.clone()).into_response(),
        None => error(StatusCode::NOT_FOUND, "attachment not found"),
    }
}

async fn delete_attachment(
    State(state): State<Shared>,
    Path((node, volume)): Path<(String, String)>,
) -> Response {
    let mut state = state.lock().unwrap();
    if let Some(failure) = state.take_failure() {
        return failure;
    }

    match state.attachments.remove(&(node, volume)) {
        Some(_) => StatusCode::NO_CONTENT.into_response(),
        None => error(StatusCode::NOT_FOUND, "attachment not found"),
    }
}

/// Handle to a running fake restvirt server.
pub struct FakeRestvirt {
    pub endpoint: String,
    state: Shared,
}

impl FakeRestvirt {
    pub async fn start() -> Self {
        let state: Shared = Arc::default();
        let app = Router::new()
            .route("/volumes", get(list_volumes).post(create_volume))
            .route("/volumes/{id}", get(get_volume).delete(delete_volume))
            .route(
                "/domains/{node}/volumes/{volume}",
                get(get_attachment).put(put_attachment).delete(delete_attachment),
            )
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { endpoint: format!("http://{}", addr), state }
    }

    /// Answer the next request with `status` and a raw `body`.
    pub fn fail_next(&self, status: StatusCode, body: &str) {
        self.state.lock().unwrap().next_failure = Some((status, body.to_string()));
    }

    pub fn volume_count(&self) -> usize {
        self.state.lock().unwrap().volumes.len()
    }

    pub fn attachment(&self, node: &str, volume: &str) -> Option<Attachment> {
        self.state
            .lock()
            .unwrap()
            .attachments
            .get(&(node.to_string(), volume.to_string()))
            .cloned()
    }
}
