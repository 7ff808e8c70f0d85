//! Microsoft Teams channel: Bot Framework activities in, connector REST calls out.
//!
//! Inbound activities arrive on the gateway's /api/messages webhook. Each one refreshes the
//! conversation's reference (service URL, bot and user accounts, last activity id), which
//! is what replies are addressed with.

mod activity;
mod auth;

pub use activity::{Activity, ChannelAccount, ConversationAccount, DEFAULT_CHANNEL_ID};
pub use auth::ConnectorAuth;

use crate::channels::registry::{ChannelError, ChannelHandle};
use crate::config::TeamsCredentials;
use async_trait::async_trait;
use reqwest::Url;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;
use tokio::sync::RwLock;

/// Connector hosts that may receive the bot's bearer token.
const TRUSTED_SERVICE_HOSTS: &[&str] = &[
    "botframework.com",
    "trafficmanager.net",
    "botframework.azure.us",
    "teams.microsoft.com",
];

/// Upper bound on remembered conversations; the least recently seen one is dropped first.
const MAX_REFERENCES: usize = 10_000;

/// Where and how to answer in one conversation.
#[derive(Debug, Clone)]
struct ConversationReference {
    service_url: String,
    bot: Option<ChannelAccount>,
    user: Option<ChannelAccount>,
    conversation: ConversationAccount,
    last_activity_id: Option<String>,
    seen: Instant,
}

/// Teams channel connector.
pub struct TeamsChannel {
    id: String,
    running: AtomicBool,
    client: reqwest::Client,
    auth: Option<ConnectorAuth>,
    references: RwLock<HashMap<String, ConversationReference>>,
    max_references: usize,
}

impl TeamsChannel {
    /// Without credentials, replies go out unauthenticated (Bot Framework Emulator).
    pub fn new(credentials: Option<TeamsCredentials>) -> Self {
        let client = reqwest::Client::new();
        let auth = credentials.map(|c| ConnectorAuth::new(c, client.clone()));
        Self {
            id: DEFAULT_CHANNEL_ID.to_string(),
            running: AtomicBool::new(true),
            client,
            auth,
            references: RwLock::new(HashMap::new()),
            max_references: MAX_REFERENCES,
        }
    }

    pub fn running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    pub fn authenticated(&self) -> bool {
        self.auth.is_some()
    }

    /// Record the reply address carried by an inbound activity. When the map is full the
    /// least recently seen conversation is forgotten.
    pub async fn remember(&self, activity: &Activity) {
        let (Some(service_url), Some(conversation)) =
            (activity.service_url.as_ref(), activity.conversation.as_ref())
        else {
            return;
        };
        let reference = ConversationReference {
            service_url: service_url.clone(),
            bot: activity.recipient.clone(),
            user: activity.from.clone(),
            conversation: conversation.clone(),
            last_activity_id: activity.id.clone(),
            seen: Instant::now(),
        };
        let mut references = self.references.write().await;
        if references.len() >= self.max_references && !references.contains_key(&conversation.id) {
            let oldest = references
                .iter()
                .min_by_key(|(_, r)| r.seen)
                .map(|(id, _)| id.clone());
            if let Some(oldest) = oldest {
                log::debug!("teams: forgetting conversation {}", oldest);
                references.remove(&oldest);
            }
        }
        references.insert(conversation.id.clone(), reference);
    }

    pub async fn knows(&self, conversation_id: &str) -> bool {
        self.references.read().await.contains_key(conversation_id)
    }

    /// POST {serviceUrl}/v3/conversations/{id}/activities with a message activity.
    pub async fn send_text(&self, conversation_id: &str, text: &str) -> Result<(), ChannelError> {
        let reference = self
            .references
            .read()
            .await
            .get(conversation_id)
            .cloned()
            .ok_or_else(|| ChannelError::UnknownConversation(conversation_id.to_string()))?;

        let url = activities_url(&reference.service_url, &reference.conversation.id)?;
        let activity = Activity {
            typ: "message".to_string(),
            text: Some(text.to_string()),
            from: reference.bot,
            recipient: reference.user,
            conversation: Some(reference.conversation),
            reply_to_id: reference.last_activity_id,
            ..Default::default()
        };
        let mut req = self.client.post(url.clone()).json(&activity);
        if let Some(ref auth) = self.auth {
            if !is_trusted_service_url(&url) {
                return Err(ChannelError::UntrustedServiceUrl(reference.service_url));
            }
            req = req.bearer_auth(auth.bearer().await?);
        }
        let res = req.send().await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ChannelError::Api(format!("send activity failed: {} {}", status, body)));
        }
        Ok(())
    }
}

fn activities_url(service_url: &str, conversation_id: &str) -> Result<Url, ChannelError> {
    let mut url = Url::parse(service_url)
        .map_err(|e| ChannelError::Api(format!("invalid service url {:?}: {}", service_url, e)))?;
    url.path_segments_mut()
        .map_err(|_| ChannelError::Api(format!("invalid service url {:?}", service_url)))?
        .pop_if_empty()
        .extend(["v3", "conversations", conversation_id, "activities"]);
    Ok(url)
}

fn is_trusted_service_url(url: &Url) -> bool {
    if url.scheme() != "https" {
        return false;
    }
    let Some(host) = url.host_str() else {
        return false;
    };
    TRUSTED_SERVICE_HOSTS
        .iter()
        .any(|h| host == *h || host.ends_with(&format!(".{}", h)))
}

#[async_trait]
impl ChannelHandle for TeamsChannel {
    fn id(&self) -> &str {
        &self.id
    }

    fn stop(&self) {
        self.running.store(false, Ordering::SeqCst);
    }

    async fn send_message(&self, conversation_id: &str, text: &str) -> Result<(), ChannelError> {
        self.send_text(conversation_id, text).await
    }
}
