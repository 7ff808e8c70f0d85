//! Chat backend abstraction and REST client.
//!
//! The backend owns conversation sessions; Ferry only creates them, posts messages into
//! them and drops them. Clients classify outcomes into [`BackendError`] and never retry.

mod http;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use http::HttpBackend;

#[derive(Debug, Clone, thiserror::Error)]
pub enum BackendError {
    /// The backend answered 404 for the session (expired, evicted or never existed).
    #[error("backend session not found")]
    SessionNotFound,
    /// Network failure, timeout, or an unexpected status.
    #[error("backend unavailable: {0}")]
    Unavailable(String),
    /// The backend answered but the body could not be understood.
    #[error("malformed backend reply: {0}")]
    MalformedReply(String),
}

/// Response of `POST /sessions`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendSession {
    pub session_id: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
}

/// Response of `POST /sessions/{id}/messages`. Only `assistant_message` is required.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendReply {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub user_message: Option<String>,
    pub assistant_message: String,
    #[serde(default)]
    pub response_id: Option<String>,
    #[serde(default)]
    pub timestamp: Option<String>,
}

/// Response of `GET /sessions/{id}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionDetail {
    pub session_id: String,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default)]
    pub message_count: u64,
    #[serde(default)]
    pub last_response_id: Option<String>,
}

/// Response of `GET /health`; extra fields are kept as-is for status output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendHealth {
    pub status: String,
    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

/// Session-oriented chat backend.
#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Create a new backend session.
    async fn create_session(&self) -> Result<BackendSession, BackendError>;

    /// Post one user message into a session and return the assistant reply.
    async fn send_message(&self, session_id: &str, text: &str)
        -> Result<BackendReply, BackendError>;

    /// Fetch session details.
    async fn get_session(&self, session_id: &str) -> Result<SessionDetail, BackendError>;

    /// Delete a session. Best effort: failures are logged, never returned.
    async fn delete_session(&self, session_id: &str);

    /// Backend liveness probe.
    async fn health(&self) -> Result<BackendHealth, BackendError>;
}
