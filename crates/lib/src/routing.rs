//! Conversation–session bindings: (channel_id, conversation_id) -> backend session id.
//!
//! A binding records which backend session serves a channel conversation. Bindings live
//! in memory for the lifetime of the process; a restart starts every conversation on a
//! fresh backend session. The router owns the store through the [`BindingStore`] trait
//! so a persistent implementation can replace [`MemoryBindingStore`].

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Key for the channel side of a binding (channel id + conversation id, e.g. msteams + Teams conversation id).
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConversationKey {
    pub channel_id: String,
    pub conversation_id: String,
}

impl ConversationKey {
    pub fn new(channel_id: impl Into<String>, conversation_id: impl Into<String>) -> Self {
        Self {
            channel_id: channel_id.into(),
            conversation_id: conversation_id.into(),
        }
    }
}

impl fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.channel_id, self.conversation_id)
    }
}

/// One conversation's current backend session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionBinding {
    pub conversation_key: ConversationKey,
    pub backend_session_id: String,
    pub created_at: DateTime<Utc>,
}

/// Storage for bindings. At most one binding exists per key.
#[async_trait]
pub trait BindingStore: Send + Sync {
    /// Current binding for the conversation, if any.
    async fn get(&self, key: &ConversationKey) -> Option<SessionBinding>;
    /// Bind the conversation to a backend session, replacing any previous binding.
    async fn put(&self, key: &ConversationKey, backend_session_id: &str) -> SessionBinding;
    /// Drop the conversation's binding; returns what was removed.
    async fn remove(&self, key: &ConversationKey) -> Option<SessionBinding>;
    /// Snapshot of all bindings (no particular order).
    async fn list(&self) -> Vec<SessionBinding>;
}

/// In-memory binding store.
pub struct MemoryBindingStore {
    inner: Arc<RwLock<HashMap<ConversationKey, SessionBinding>>>,
}

impl Default for MemoryBindingStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryBindingStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(RwLock::new(HashMap::new())),
        }
    }
}

#[async_trait]
impl BindingStore for MemoryBindingStore {
    async fn get(&self, key: &ConversationKey) -> Option<SessionBinding> {
        self.inner.read().await.get(key).cloned()
    }

    async fn put(&self, key: &ConversationKey, backend_session_id: &str) -> SessionBinding {
        let binding = SessionBinding {
            conversation_key: key.clone(),
            backend_session_id: backend_session_id.to_string(),
            created_at: Utc::now(),
        };
        if let Some(old) = self.inner.write().await.insert(key.clone(), binding.clone()) {
            log::debug!(
                "binding for {} replaced (was {})",
                key,
                old.backend_session_id
            );
        }
        binding
    }

    async fn remove(&self, key: &ConversationKey) -> Option<SessionBinding> {
        self.inner.write().await.remove(key)
    }

    async fn list(&self) -> Vec<SessionBinding> {
        self.inner.read().await.values().cloned().collect()
    }
}
