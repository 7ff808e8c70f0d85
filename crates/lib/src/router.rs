//! Message router: conversation -> backend session, with self-healing bindings.
//!
//! Each conversation is either without a backend session or bound to one. A message on an
//! unbound conversation creates a session first. When the backend answers 404 for a bound
//! session the binding is dropped, a new session is created and the message is sent again,
//! at most `max_recoveries` times per message. All backend failures stop here and come out
//! as a [`RouteError`] carrying a user-facing text.

use crate::backend::{BackendError, ChatBackend};
use crate::routing::{BindingStore, ConversationKey, SessionBinding};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

/// Text shown to the user when the backend cannot produce a reply.
pub const UNAVAILABLE_REPLY: &str =
    "Sorry, I'm having trouble connecting to the AI service. Please try again later.";

/// Prune idle lock entries once the map grows past this size.
const LOCK_PRUNE_THRESHOLD: usize = 256;

/// Successful routing result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoutedReply {
    /// Backend reply text, unchanged.
    pub text: String,
    /// Session that produced the reply.
    pub session_id: String,
    /// Number of stale sessions replaced while handling this message.
    pub recoveries: u32,
}

#[derive(Debug, thiserror::Error)]
pub enum RouteError {
    /// Backend unreachable, timed out, failed, or kept reporting the session missing.
    #[error("{0}")]
    Unavailable(BackendError),
    /// Backend answered with something that could not be decoded.
    #[error("backend reply could not be parsed: {0}")]
    MalformedReply(String),
}

impl From<BackendError> for RouteError {
    fn from(e: BackendError) -> Self {
        match e {
            BackendError::MalformedReply(detail) => RouteError::MalformedReply(detail),
            other => RouteError::Unavailable(other),
        }
    }
}

impl RouteError {
    /// Text to show the user in the channel.
    pub fn user_message(&self) -> &'static str {
        UNAVAILABLE_REPLY
    }
}

/// Observable per-conversation state, derived from binding presence.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", rename_all = "camelCase")]
pub enum ConversationState {
    NoSession,
    #[serde(rename_all = "camelCase")]
    Active {
        session_id: String,
        since: DateTime<Utc>,
    },
}

/// One async mutex per conversation key. Entries nobody holds or waits on are pruned.
#[derive(Default)]
struct KeyLocks {
    inner: Mutex<HashMap<ConversationKey, Arc<AsyncMutex<()>>>>,
}

impl KeyLocks {
    async fn acquire(&self, key: &ConversationKey) -> OwnedMutexGuard<()> {
        let lock = {
            let mut map = self.inner.lock().unwrap_or_else(|p| p.into_inner());
            if map.len() >= LOCK_PRUNE_THRESHOLD {
                map.retain(|_, l| Arc::strong_count(l) > 1);
            }
            map.entry(key.clone()).or_default().clone()
        };
        lock.lock_owned().await
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|p| p.into_inner()).len()
    }
}

/// Routes channel messages to backend sessions. Cheap to share behind an `Arc`.
pub struct MessageRouter {
    backend: Arc<dyn ChatBackend>,
    bindings: Arc<dyn BindingStore>,
    locks: KeyLocks,
    max_recoveries: u32,
}

impl MessageRouter {
    pub fn new(
        backend: Arc<dyn ChatBackend>,
        bindings: Arc<dyn BindingStore>,
        max_recoveries: u32,
    ) -> Self {
        Self {
            backend,
            bindings,
            locks: KeyLocks::default(),
            max_recoveries,
        }
    }

    pub fn max_recoveries(&self) -> u32 {
        self.max_recoveries
    }

    pub fn backend(&self) -> &Arc<dyn ChatBackend> {
        &self.backend
    }

    /// Forward one message for a conversation and return the backend's reply.
    pub async fn route(&self, key: &ConversationKey, text: &str) -> Result<RoutedReply, RouteError> {
        let _guard = self.locks.acquire(key).await;

        let mut session_id = match self.bindings.get(key).await {
            Some(binding) => binding.backend_session_id,
            None => self.open_session(key).await?,
        };
        let mut recoveries = 0;
        loop {
            match self.backend.send_message(&session_id, text).await {
                Ok(reply) => {
                    return Ok(RoutedReply {
                        text: reply.assistant_message,
                        session_id,
                        recoveries,
                    })
                }
                Err(BackendError::SessionNotFound) if recoveries < self.max_recoveries => {
                    recoveries += 1;
                    log::info!(
                        "{}: backend session {} not found, recreating ({}/{})",
                        key,
                        session_id,
                        recoveries,
                        self.max_recoveries
                    );
                    self.bindings.remove(key).await;
                    session_id = self.open_session(key).await?;
                }
                Err(e) => {
                    match &e {
                        BackendError::MalformedReply(detail) => log::warn!(
                            "{}: malformed reply from backend session {}: {}",
                            key,
                            session_id,
                            detail
                        ),
                        BackendError::SessionNotFound => log::warn!(
                            "{}: backend session {} still missing after {} recovery attempt(s); giving up",
                            key,
                            session_id,
                            recoveries
                        ),
                        BackendError::Unavailable(detail) => log::warn!(
                            "{}: sending to backend session {} failed: {}",
                            key,
                            session_id,
                            detail
                        ),
                    }
                    return Err(e.into());
                }
            }
        }
    }

    /// Create a backend session and bind it. Nothing is stored on failure.
    async fn open_session(&self, key: &ConversationKey) -> Result<String, RouteError> {
        match self.backend.create_session().await {
            Ok(session) => {
                self.bindings.put(key, &session.session_id).await;
                log::info!("{}: created backend session {}", key, session.session_id);
                Ok(session.session_id)
            }
            Err(e) => {
                log::warn!("{}: creating backend session failed: {}", key, e);
                Err(e.into())
            }
        }
    }

    /// Drop the conversation's binding and delete its backend session (best effort).
    /// The next message starts a fresh session.
    pub async fn reset(&self, key: &ConversationKey) -> Option<SessionBinding> {
        let _guard = self.locks.acquire(key).await;
        let removed = self.bindings.remove(key).await?;
        log::info!(
            "{}: reset, dropping backend session {}",
            key,
            removed.backend_session_id
        );
        self.backend.delete_session(&removed.backend_session_id).await;
        Some(removed)
    }

    pub async fn state(&self, key: &ConversationKey) -> ConversationState {
        match self.bindings.get(key).await {
            Some(b) => ConversationState::Active {
                session_id: b.backend_session_id,
                since: b.created_at,
            },
            None => ConversationState::NoSession,
        }
    }

    pub async fn bindings(&self) -> Vec<SessionBinding> {
        self.bindings.list().await
    }
}
