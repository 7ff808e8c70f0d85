//! Configuration types and loading.
//!
//! Config is loaded from a JSON file (e.g. `~/.ferry/config.json`) and environment.
//! Environment variables override the file for the values operators usually set per
//! deployment (backend URL, port, gateway token, Teams credentials).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Top-level application config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Gateway server settings.
    #[serde(default)]
    pub gateway: GatewayConfig,

    /// External chat backend settings.
    #[serde(default)]
    pub backend: BackendConfig,

    /// Session routing and recovery settings.
    #[serde(default)]
    pub routing: RoutingConfig,

    /// Channel settings (e.g. Teams).
    #[serde(default)]
    pub channels: ChannelsConfig,
}

/// Gateway bind, port, and auth settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Port for the activity webhook, HTTP and WebSocket (default 3978). Overridden by PORT env.
    #[serde(default = "default_gateway_port")]
    pub port: u16,

    /// Bind address (default "127.0.0.1").
    #[serde(default = "default_gateway_bind")]
    pub bind: String,

    /// Auth settings for the WebSocket control plane.
    #[serde(default)]
    pub auth: GatewayAuthConfig,
}

/// Gateway auth: token or none (loopback-only when none).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayAuthConfig {
    /// "none" = no shared secret (only safe when bind is loopback). "token" = require connect.auth.token.
    #[serde(default)]
    pub mode: GatewayAuthMode,

    /// Shared secret for WebSocket connect. Overridden by FERRY_GATEWAY_TOKEN env.
    pub token: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GatewayAuthMode {
    /// No auth; allow only when bind is loopback.
    #[default]
    None,

    /// Require connect.auth.token to match configured token.
    Token,
}

/// Where the chat backend lives and how long a single call may take.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackendConfig {
    /// Base URL of the backend REST API (default http://localhost:8000). Overridden by BACKEND_API_URL env.
    #[serde(default = "default_backend_url")]
    pub url: String,

    /// Per-call timeout in milliseconds (default 30000). A timed-out call counts as backend unavailable.
    #[serde(default = "default_backend_timeout_ms")]
    pub timeout_ms: u64,
}

/// Router settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoutingConfig {
    /// How many times one message may recreate a missing backend session before the user gets an error (default 1).
    #[serde(default = "default_max_recoveries")]
    pub max_recoveries: u32,
}

/// Per-channel config.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelsConfig {
    #[serde(default)]
    pub teams: TeamsChannelConfig,
}

/// Teams (Bot Framework) channel config.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TeamsChannelConfig {
    /// Serve the activity webhook at /api/messages (default true).
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Bot app (client) id. Overridden by CONNECTIONS__SERVICE_CONNECTION__SETTINGS__CLIENTID env.
    pub app_id: Option<String>,
    /// Bot app secret. Overridden by CONNECTIONS__SERVICE_CONNECTION__SETTINGS__CLIENTSECRET env.
    pub app_password: Option<String>,
    /// Tenant for the token endpoint (single-tenant bots). Defaults to "botframework.com".
    /// Overridden by CONNECTIONS__SERVICE_CONNECTION__SETTINGS__TENANTID env.
    pub tenant_id: Option<String>,
    /// Text sent when a user joins the conversation or types /help. Defaults to a built-in greeting.
    pub welcome_message: Option<String>,
}

fn default_gateway_port() -> u16 {
    3978
}

fn default_gateway_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_backend_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_backend_timeout_ms() -> u64 {
    30_000
}

fn default_max_recoveries() -> u32 {
    1
}

fn default_true() -> bool {
    true
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: default_gateway_port(),
            bind: default_gateway_bind(),
            auth: GatewayAuthConfig::default(),
        }
    }
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: default_backend_url(),
            timeout_ms: default_backend_timeout_ms(),
        }
    }
}

impl BackendConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms.max(1))
    }
}

impl Default for RoutingConfig {
    fn default() -> Self {
        Self {
            max_recoveries: default_max_recoveries(),
        }
    }
}

impl Default for TeamsChannelConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            app_id: None,
            app_password: None,
            tenant_id: None,
            welcome_message: None,
        }
    }
}

/// Client-credential settings for replying through the Bot Framework connector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TeamsCredentials {
    pub app_id: String,
    pub app_password: String,
    pub tenant_id: String,
}

const DEFAULT_TEAMS_TENANT: &str = "botframework.com";

pub const TEAMS_CLIENT_ID_ENV: &str = "CONNECTIONS__SERVICE_CONNECTION__SETTINGS__CLIENTID";
pub const TEAMS_CLIENT_SECRET_ENV: &str = "CONNECTIONS__SERVICE_CONNECTION__SETTINGS__CLIENTSECRET";
pub const TEAMS_TENANT_ID_ENV: &str = "CONNECTIONS__SERVICE_CONNECTION__SETTINGS__TENANTID";

/// Trimmed, non-empty env var value.
fn env_nonempty(name: &str) -> Option<String> {
    std::env::var(name).ok().and_then(|s| {
        let t = s.trim();
        if t.is_empty() {
            None
        } else {
            Some(t.to_string())
        }
    })
}

fn nonempty(value: Option<&String>) -> Option<String> {
    value
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

/// Resolve the gateway token: env FERRY_GATEWAY_TOKEN overrides config.
pub fn resolve_gateway_token(config: &Config) -> Option<String> {
    env_nonempty("FERRY_GATEWAY_TOKEN").or_else(|| nonempty(config.gateway.auth.token.as_ref()))
}

/// Resolve the backend base URL: env BACKEND_API_URL overrides config. Trailing slashes are dropped.
pub fn resolve_backend_url(config: &Config) -> String {
    env_nonempty("BACKEND_API_URL")
        .unwrap_or_else(|| config.backend.url.trim().to_string())
        .trim_end_matches('/')
        .to_string()
}

/// Resolve the gateway port: a valid PORT env overrides config.
pub fn resolve_gateway_port(config: &Config) -> u16 {
    match env_nonempty("PORT") {
        Some(p) => match p.parse() {
            Ok(port) => port,
            Err(_) => {
                log::warn!("ignoring invalid PORT value {:?}", p);
                config.gateway.port
            }
        },
        None => config.gateway.port,
    }
}

/// Resolve Teams credentials: env overrides config. None when id or secret is missing
/// (replies are then sent unauthenticated, which only the local emulator accepts).
pub fn resolve_teams_credentials(config: &Config) -> Option<TeamsCredentials> {
    let teams = &config.channels.teams;
    let app_id = env_nonempty(TEAMS_CLIENT_ID_ENV).or_else(|| nonempty(teams.app_id.as_ref()))?;
    let app_password =
        env_nonempty(TEAMS_CLIENT_SECRET_ENV).or_else(|| nonempty(teams.app_password.as_ref()))?;
    let tenant_id = env_nonempty(TEAMS_TENANT_ID_ENV)
        .or_else(|| nonempty(teams.tenant_id.as_ref()))
        .unwrap_or_else(|| DEFAULT_TEAMS_TENANT.to_string());
    Some(TeamsCredentials {
        app_id,
        app_password,
        tenant_id,
    })
}

/// True if the bind address is loopback (127.0.0.1, ::1, etc.).
pub fn is_loopback_bind(bind: &str) -> bool {
    let b = bind.trim();
    b == "127.0.0.1" || b == "::1" || b == "localhost"
}

/// Resolve config path from env or default.
pub fn default_config_path() -> PathBuf {
    std::env::var("FERRY_CONFIG_PATH").map(PathBuf::from).unwrap_or_else(|_| {
        dirs::home_dir()
            .map(|h| h.join(".ferry").join("config.json"))
            .unwrap_or_else(|| PathBuf::from("config.json"))
    })
}

/// Load config from the given path (or the default). Missing file => default config.
/// Returns the config and the path that was used.
pub fn load_config(path: Option<PathBuf>) -> Result<(Config, PathBuf)> {
    let path = path.unwrap_or_else(default_config_path);
    let config = if !path.exists() {
        log::debug!("config file not found, using defaults: {}", path.display());
        Config::default()
    } else {
        let s = std::fs::read_to_string(&path)
            .with_context(|| format!("reading config from {}", path.display()))?;
        parse_config(&s).with_context(|| format!("parsing config from {}", path.display()))?
    };
    Ok((config, path))
}

/// Parse a JSON config document.
pub fn parse_config(s: &str) -> Result<Config> {
    Ok(serde_json::from_str(s)?)
}

/// Write a default config file (and its directory) unless one already exists. Returns true when written.
pub fn init_config_file(config_path: &Path) -> Result<bool> {
    if config_path.exists() {
        log::debug!("config already exists at {}, skipping", config_path.display());
        return Ok(false);
    }
    let config_dir = config_path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("creating config directory {}", config_dir.display()))?;
    let json = serde_json::to_string_pretty(&Config::default())?;
    std::fs::write(config_path, json)
        .with_context(|| format!("writing default config to {}", config_path.display()))?;
    log::info!("created default config at {}", config_path.display());
    Ok(true)
}
