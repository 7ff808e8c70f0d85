//! Bot Framework connector tokens via the OAuth2 client-credentials grant.

use crate::channels::registry::ChannelError;
use crate::config::TeamsCredentials;
use serde::Deserialize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;

const LOGIN_BASE: &str = "https://login.microsoftonline.com";
const CONNECTOR_SCOPE: &str = "https://api.botframework.com/.default";
/// Tokens are refreshed this long before they expire.
const REFRESH_MARGIN: Duration = Duration::from_secs(300);

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    expires_in: u64,
}

struct CachedToken {
    value: String,
    refresh_at: Instant,
}

/// Fetches and caches the bearer token the connector expects on outbound activities.
pub struct ConnectorAuth {
    credentials: TeamsCredentials,
    token_url: String,
    client: reqwest::Client,
    cached: Mutex<Option<CachedToken>>,
}

impl ConnectorAuth {
    pub fn new(credentials: TeamsCredentials, client: reqwest::Client) -> Self {
        let token_url = format!("{}/{}/oauth2/v2.0/token", LOGIN_BASE, credentials.tenant_id);
        Self::with_token_url(credentials, client, token_url)
    }

    /// Use a specific token endpoint (sovereign clouds, a local token server).
    pub fn with_token_url(
        credentials: TeamsCredentials,
        client: reqwest::Client,
        token_url: impl Into<String>,
    ) -> Self {
        Self {
            credentials,
            token_url: token_url.into(),
            client,
            cached: Mutex::new(None),
        }
    }

    /// Current bearer token, fetching a new one when the cached token is close to expiry.
    pub async fn bearer(&self) -> Result<String, ChannelError> {
        let mut cached = self.cached.lock().await;
        if let Some(ref t) = *cached {
            if Instant::now() < t.refresh_at {
                return Ok(t.value.clone());
            }
        }
        let res = self
            .client
            .post(&self.token_url)
            .form(&[
                ("grant_type", "client_credentials"),
                ("client_id", self.credentials.app_id.as_str()),
                ("client_secret", self.credentials.app_password.as_str()),
                ("scope", CONNECTOR_SCOPE),
            ])
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            return Err(ChannelError::Api(format!("token request failed: {} {}", status, body)));
        }
        let token: TokenResponse = res.json().await?;
        let lifetime = Duration::from_secs(token.expires_in).saturating_sub(REFRESH_MARGIN);
        log::debug!("teams: fetched connector token (refresh in {:?})", lifetime);
        *cached = Some(CachedToken {
            value: token.access_token.clone(),
            refresh_at: Instant::now() + lifetime,
        });
        Ok(token.access_token)
    }
}
