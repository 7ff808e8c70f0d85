//! Shared fixtures: an in-process fake chat backend, a fake Bot Framework connector,
//! and a helper that starts the gateway on a free port.
#![allow(dead_code)]

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use ferry::config::Config;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").expect("bind free port");
    listener.local_addr().expect("local_addr").port()
}

async fn serve(app: Router) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind fake server");
    let addr = listener.local_addr().expect("local_addr");
    tokio::spawn(async move {
        let _ = axum::serve(listener, app).await;
    });
    format!("http://{}", addr)
}

/// Session ids with fixed behaviour: "boom" answers 500, "garbled" answers 200 with a
/// non-JSON body, "slow" answers after 500ms.
#[derive(Clone, Default)]
pub struct FakeBackend {
    sessions: Arc<Mutex<HashMap<String, u64>>>,
    created: Arc<AtomicUsize>,
}

impl FakeBackend {
    /// Forget every session, as a backend restart would.
    pub fn expire_all(&self) {
        self.sessions.lock().unwrap().clear();
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn live(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

pub async fn spawn_backend() -> (String, FakeBackend) {
    let backend = FakeBackend::default();
    let app = Router::new()
        .route("/health", get(health))
        .route("/sessions", post(create_session))
        .route("/sessions/:id", get(get_session).delete(delete_session))
        .route("/sessions/:id/messages", post(send_message))
        .with_state(backend.clone());
    (serve(app).await, backend)
}

async fn health() -> Json<Value> {
    Json(json!({ "status": "healthy", "model": "fake-model", "active_sessions": 0 }))
}

async fn create_session(State(b): State<FakeBackend>) -> Json<Value> {
    let n = b.created.fetch_add(1, Ordering::SeqCst) + 1;
    let id = format!("sess-{}", n);
    b.sessions.lock().unwrap().insert(id.clone(), 0);
    Json(json!({
        "session_id": id,
        "created_at": "2026-01-01T00:00:00Z",
        "model": "fake-model",
    }))
}

fn not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "detail": "Session not found" })),
    )
        .into_response()
}

async fn send_message(
    State(b): State<FakeBackend>,
    Path(id): Path<String>,
    Json(body): Json<Value>,
) -> Response {
    let text = body["message"].as_str().unwrap_or_default().to_string();
    match id.as_str() {
        "boom" => return (StatusCode::INTERNAL_SERVER_ERROR, "boom").into_response(),
        "garbled" => return (StatusCode::OK, "<html>not json</html>").into_response(),
        "slow" => {
            tokio::time::sleep(Duration::from_millis(500)).await;
            return Json(json!({ "assistant_message": "late" })).into_response();
        }
        _ => {}
    }
    let count = {
        let mut sessions = b.sessions.lock().unwrap();
        match sessions.get_mut(&id) {
            Some(count) => {
                *count += 1;
                *count
            }
            None => return not_found(),
        }
    };
    Json(json!({
        "session_id": id,
        "user_message": text,
        "assistant_message": format!("echo: {}", text),
        "response_id": format!("resp-{}", count),
        "timestamp": "2026-01-01T00:00:01Z",
    }))
    .into_response()
}

async fn get_session(State(b): State<FakeBackend>, Path(id): Path<String>) -> Response {
    let Some(count) = b.sessions.lock().unwrap().get(&id).copied() else {
        return not_found();
    };
    Json(json!({
        "session_id": id,
        "created_at": "2026-01-01T00:00:00Z",
        "model": "fake-model",
        "message_count": count,
        "last_response_id": format!("resp-{}", count),
    }))
    .into_response()
}

async fn delete_session(State(b): State<FakeBackend>, Path(id): Path<String>) -> Response {
    if b.sessions.lock().unwrap().remove(&id).is_none() {
        return not_found();
    }
    Json(json!({ "status": "deleted", "session_id": id })).into_response()
}

/// Records every activity posted to /v3/conversations/{id}/activities.
#[derive(Clone, Default)]
pub struct FakeConnector {
    activities: Arc<Mutex<Vec<(String, Value)>>>,
}

impl FakeConnector {
    /// Wait (up to 5s) until at least `n` activities arrived; returns all of them.
    pub async fn wait_for(&self, n: usize) -> Vec<(String, Value)> {
        for _ in 0..100 {
            {
                let got = self.activities.lock().unwrap();
                if got.len() >= n {
                    return got.clone();
                }
            }
            tokio::time::sleep(Duration::from_millis(50)).await;
        }
        let got = self.activities.lock().unwrap().clone();
        panic!("expected {} activities within 5s, got {:?}", n, got);
    }
}

pub async fn spawn_connector() -> (String, FakeConnector) {
    let connector = FakeConnector::default();
    let app = Router::new()
        .route("/v3/conversations/:id/activities", post(post_activity))
        .with_state(connector.clone());
    (serve(app).await, connector)
}

async fn post_activity(
    State(c): State<FakeConnector>,
    Path(id): Path<String>,
    Json(activity): Json<Value>,
) -> Json<Value> {
    c.activities.lock().unwrap().push((id, activity));
    Json(json!({ "id": "reply-1" }))
}

/// Start the gateway in the background and wait until GET / answers. Returns its base URL.
pub async fn start_gateway(mut config: Config) -> String {
    let port = free_port();
    config.gateway.port = port;
    config.gateway.bind = "127.0.0.1".to_string();
    tokio::spawn(async move {
        if let Err(e) = ferry::gateway::run_gateway(config).await {
            eprintln!("gateway exited: {:#}", e);
        }
    });

    let base = format!("http://127.0.0.1:{}", port);
    let client = reqwest::Client::new();
    for _ in 0..100 {
        if let Ok(resp) = client.get(format!("{}/", base)).send().await {
            if resp.status().is_success() {
                return base;
            }
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("gateway on port {} did not come up within 5s", port);
}

/// Gateway config pointing at the given backend.
pub fn config_for(backend_url: &str) -> Config {
    let mut config = Config::default();
    config.backend.url = backend_url.to_string();
    config.backend.timeout_ms = 2_000;
    config
}
