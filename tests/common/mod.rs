//! In-process stub of the face-recognition service.
//!
//! Routes mirror the real service's JSON contract. Every route counts its
//! calls, and tests can script failures:
//! - `fail_compares` / `fail_batches`: answer the next N requests with HTTP 500.
//! - `compare_delay_ms`: hold compare responses to exercise timeouts and
//!   cancellation.
//! - images whose decoded bytes start with [`NO_FACE`] are answered with
//!   `success: false` (or a per-item batch error).

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Json, Router};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use face_compare::{ClientConfig, ClientOptions, FaceCompareClient, ImagePayload};
use serde_json::{Value, json};

/// Image bytes starting with this marker are "photos without a face".
pub const NO_FACE: &[u8] = b"noface";

#[derive(Default)]
pub struct StubState {
    pub init_calls: AtomicUsize,
    pub compare_calls: AtomicUsize,
    pub batch_calls: AtomicUsize,
    pub user_calls: AtomicUsize,
    pub delete_calls: AtomicUsize,
    pub root_calls: AtomicUsize,
    pub health_calls: AtomicUsize,
    pub fail_compares: AtomicUsize,
    pub fail_batches: AtomicUsize,
    pub compare_delay_ms: AtomicU64,
    pub last_auth: Mutex<Option<String>>,
    pub last_threshold: Mutex<Option<f64>>,
    pub users: Mutex<HashMap<String, String>>,
}

impl StubState {
    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

pub struct StubService {
    pub base_url: String,
    pub state: Arc<StubState>,
}

impl StubService {
    pub async fn start() -> Self {
        let state = Arc::new(StubState::default());
        let app = Router::new()
            .route("/", get(root))
            .route("/health", get(health))
            .route("/api/face-init", post(face_init))
            .route("/api/face-compare", post(face_compare))
            .route("/api/face-compare-batch", post(face_compare_batch))
            .route("/api/users", get(list_users))
            .route("/api/users/{user_id}", get(get_user))
            .route("/api/users/{user_id}", delete(delete_user))
            .with_state(state.clone());

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind stub listener");
        let addr = listener.local_addr().expect("stub local addr");
        tokio::spawn(async move {
            axum::serve(listener, app).await.expect("stub server");
        });

        Self {
            base_url: format!("http://{addr}"),
            state,
        }
    }

    pub fn config(&self, identity: &str) -> ClientConfig {
        ClientConfig::new(self.base_url.clone(), identity)
    }

    /// A client with millisecond-scale backoff so retry tests stay fast.
    pub fn client(&self, identity: &str) -> FaceCompareClient {
        self.client_with(identity, fast_options())
    }

    pub fn client_with(&self, identity: &str, options: ClientOptions) -> FaceCompareClient {
        FaceCompareClient::with_options(self.config(identity), options).expect("valid client")
    }
}

pub fn fast_options() -> ClientOptions {
    ClientOptions {
        timeout: Duration::from_secs(5),
        retry_base_delay: Duration::from_millis(10),
        retry_max_delay: Duration::from_millis(40),
        logging_enabled: false,
        ..Default::default()
    }
}

pub fn face(tag: &str) -> ImagePayload {
    ImagePayload::from_bytes("jpeg", format!("face:{tag}").as_bytes()).expect("valid image")
}

pub fn faceless(tag: &str) -> ImagePayload {
    let mut bytes = NO_FACE.to_vec();
    bytes.extend_from_slice(tag.as_bytes());
    ImagePayload::from_bytes("jpeg", &bytes).expect("valid image")
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn has_face(image_data: &str) -> bool {
    image_data
        .split_once(";base64,")
        .and_then(|(_, data)| STANDARD.decode(data).ok())
        .is_some_and(|bytes| !bytes.starts_with(NO_FACE))
}

fn remember_auth(state: &StubState, headers: &HeaderMap) {
    let auth = headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    *state.last_auth.lock().unwrap() = auth;
}

fn server_error() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({"detail": "model crashed"})),
    )
        .into_response()
}

fn take_failure(counter: &AtomicUsize) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

async fn face_init(
    State(state): State<Arc<StubState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.init_calls.fetch_add(1, Ordering::SeqCst);
    remember_auth(&state, &headers);

    let image = body["imageData"].as_str().unwrap_or_default();
    if !has_face(image) {
        return Json(json!({"success": false, "message": "No face detected in image"}))
            .into_response();
    }
    let user_id = body["userId"].as_str().unwrap_or("generated-user").to_string();
    let count = {
        let mut users = state.users.lock().unwrap();
        users.insert(user_id.clone(), "2026-01-05T10:00:00".to_string());
        users.len()
    };
    Json(json!({
        "success": true,
        "message": "Face registered successfully",
        "data": {"userId": user_id, "faceData": "registered", "faceCount": count}
    }))
    .into_response()
}

async fn face_compare(
    State(state): State<Arc<StubState>>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    state.compare_calls.fetch_add(1, Ordering::SeqCst);
    remember_auth(&state, &headers);
    *state.last_threshold.lock().unwrap() = body["threshold"].as_f64();

    let delay = state.compare_delay_ms.load(Ordering::SeqCst);
    if delay > 0 {
        tokio::time::sleep(Duration::from_millis(delay)).await;
    }
    if take_failure(&state.fail_compares) {
        return server_error();
    }
    if !has_face(body["imageData"].as_str().unwrap_or_default()) {
        return Json(json!({"success": false, "message": "No face detected in image"}))
            .into_response();
    }
    Json(json!({
        "success": true,
        "message": "Comparison completed",
        "data": {"similarity": 0.82, "isMatch": true, "confidence": 0.91}
    }))
    .into_response()
}

async fn face_compare_batch(
    State(state): State<Arc<StubState>>,
    Json(body): Json<Value>,
) -> Response {
    state.batch_calls.fetch_add(1, Ordering::SeqCst);
    if take_failure(&state.fail_batches) {
        return server_error();
    }
    let threshold = body["threshold"].as_f64().unwrap_or(0.6);
    let images = body["imageDataList"].as_array().cloned().unwrap_or_default();

    let mut results = Vec::new();
    let mut errors = Vec::new();
    for (index, image) in images.iter().enumerate() {
        if has_face(image.as_str().unwrap_or_default()) {
            let similarity = 0.5 + index as f64 * 0.1;
            results.push(json!({
                "index": index,
                "similarity": similarity,
                "isMatch": similarity >= threshold,
                "confidence": 0.9,
                "threshold": threshold
            }));
        } else {
            errors.push(json!({"index": index, "error": "No face detected in image"}));
        }
    }
    Json(json!({
        "success": true,
        "message": "Batch comparison completed",
        "data": {
            "results": results,
            "errors": errors,
            "total": images.len(),
            "successCount": results.len(),
            "errorCount": errors.len()
        }
    }))
    .into_response()
}

async fn get_user(
    State(state): State<Arc<StubState>>,
    Path(user_id): Path<String>,
) -> Response {
    state.user_calls.fetch_add(1, Ordering::SeqCst);
    let created = state.users.lock().unwrap().get(&user_id).cloned();
    match created {
        Some(created_at) => Json(json!({
            "userId": user_id,
            "createdAt": created_at,
            "imageSize": [112, 112, 3]
        }))
        .into_response(),
        None => (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": "User not found"})),
        )
            .into_response(),
    }
}

async fn list_users(State(state): State<Arc<StubState>>) -> Response {
    state.user_calls.fetch_add(1, Ordering::SeqCst);
    let users: Vec<Value> = state
        .users
        .lock()
        .unwrap()
        .iter()
        .map(|(id, created)| json!({"userId": id, "createdAt": created, "imageSize": [112, 112, 3]}))
        .collect();
    Json(json!({
        "success": true,
        "message": format!("Found {} users", users.len()),
        "data": {"totalCount": users.len(), "users": users}
    }))
    .into_response()
}

async fn delete_user(
    State(state): State<Arc<StubState>>,
    Path(user_id): Path<String>,
) -> Response {
    state.delete_calls.fetch_add(1, Ordering::SeqCst);
    let removed = state.users.lock().unwrap().remove(&user_id).is_some();
    if removed {
        Json(json!({"success": true, "message": format!("User {user_id} deleted")})).into_response()
    } else {
        (
            StatusCode::NOT_FOUND,
            Json(json!({"detail": "User not found"})),
        )
            .into_response()
    }
}

async fn root(State(state): State<Arc<StubState>>) -> Response {
    state.root_calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({
        "service": "InsightFace Recognition Service",
        "version": "1.0.0",
        "status": "running",
        "modelStatus": "loaded",
        "docs": "/docs",
        "health": "/health"
    }))
    .into_response()
}

async fn health(State(state): State<Arc<StubState>>) -> Response {
    state.health_calls.fetch_add(1, Ordering::SeqCst);
    Json(json!({"status": "healthy", "timestamp": "2026-01-05T10:00:00", "insightface": "0.7.3"}))
        .into_response()
}
