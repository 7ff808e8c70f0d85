//! REST client for the chat backend (http://localhost:8000 by default).

use super::{BackendError, BackendHealth, BackendReply, BackendSession, ChatBackend, SessionDetail};
use anyhow::Context;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// Client for the backend HTTP API. Every request carries the configured timeout.
#[derive(Clone)]
pub struct HttpBackend {
    base_url: Url,
    client: reqwest::Client,
}

#[derive(Debug, Serialize)]
struct MessageRequest<'a> {
    message: &'a str,
}

impl HttpBackend {
    pub fn new(base_url: &str, timeout: Duration) -> anyhow::Result<Self> {
        let base_url = Url::parse(base_url.trim())
            .with_context(|| format!("invalid backend url {:?}", base_url))?;
        if base_url.cannot_be_a_base() {
            anyhow::bail!("backend url {} cannot carry a path", base_url);
        }
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building backend http client")?;
        Ok(Self { base_url, client })
    }

    pub fn base_url(&self) -> &str {
        self.base_url.as_str()
    }

    /// Base URL with path segments appended; each segment is percent-encoded on its own.
    fn url(&self, segments: &[&str]) -> Result<Url, BackendError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BackendError::Unavailable("backend url cannot carry a path".to_string()))?
            .pop_if_empty()
            .extend(segments);
        Ok(url)
    }
}

fn transport_error(e: reqwest::Error) -> BackendError {
    if e.is_timeout() {
        BackendError::Unavailable(format!("request timed out: {}", e))
    } else {
        BackendError::Unavailable(e.to_string())
    }
}

/// Read the whole body (still under the request timeout) and decode it.
async fn decode<T: DeserializeOwned>(res: reqwest::Response) -> Result<T, BackendError> {
    let bytes = res.bytes().await.map_err(transport_error)?;
    serde_json::from_slice(&bytes).map_err(|e| BackendError::MalformedReply(e.to_string()))
}

async fn status_error(what: &str, res: reqwest::Response) -> BackendError {
    let status = res.status();
    let body = res.text().await.unwrap_or_default();
    BackendError::Unavailable(format!("{} failed: {} {}", what, status, body))
}

#[async_trait]
impl ChatBackend for HttpBackend {
    /// POST /sessions
    async fn create_session(&self) -> Result<BackendSession, BackendError> {
        let url = self.url(&["sessions"])?;
        let res = self.client.post(url).send().await.map_err(transport_error)?;
        if !res.status().is_success() {
            return Err(status_error("create session", res).await);
        }
        let session: BackendSession = decode(res).await?;
        if session.session_id.trim().is_empty() {
            return Err(BackendError::MalformedReply(
                "empty session_id in create session response".to_string(),
            ));
        }
        Ok(session)
    }

    /// POST /sessions/{id}/messages
    async fn send_message(
        &self,
        session_id: &str,
        text: &str,
    ) -> Result<BackendReply, BackendError> {
        let url = self.url(&["sessions", session_id, "messages"])?;
        let res = self
            .client
            .post(url)
            .json(&MessageRequest { message: text })
            .send()
            .await
            .map_err(transport_error)?;
        if res.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::SessionNotFound);
        }
        if !res.status().is_success() {
            return Err(status_error("send message", res).await);
        }
        decode(res).await
    }

    /// GET /sessions/{id}
    async fn get_session(&self, session_id: &str) -> Result<SessionDetail, BackendError> {
        let url = self.url(&["sessions", session_id])?;
        let res = self.client.get(url).send().await.map_err(transport_error)?;
        if res.status() == StatusCode::NOT_FOUND {
            return Err(BackendError::SessionNotFound);
        }
        if !res.status().is_success() {
            return Err(status_error("get session", res).await);
        }
        decode(res).await
    }

    /// DELETE /sessions/{id}
    async fn delete_session(&self, session_id: &str) {
        let url = match self.url(&["sessions", session_id]) {
            Ok(u) => u,
            Err(e) => {
                log::warn!("delete session {}: {}", session_id, e);
                return;
            }
        };
        match self.client.delete(url).send().await {
            Ok(res) if res.status().is_success() => {
                log::debug!("deleted backend session {}", session_id);
            }
            Ok(res) if res.status() == StatusCode::NOT_FOUND => {
                log::debug!("backend session {} already gone", session_id);
            }
            Ok(res) => {
                log::warn!(
                    "delete session {} returned {}; leaving it to expire",
                    session_id,
                    res.status()
                );
            }
            Err(e) => {
                log::warn!("delete session {} failed: {}", session_id, e);
            }
        }
    }

    /// GET /health
    async fn health(&self) -> Result<BackendHealth, BackendError> {
        let url = self.url(&["health"])?;
        let res = self.client.get(url).send().await.map_err(transport_error)?;
        if !res.status().is_success() {
            return Err(status_error("health", res).await);
        }
        decode(res).await
    }
}
