//! Gateway HTTP + WebSocket server (single port).

use crate::backend::{ChatBackend, HttpBackend};
use crate::channels::{Activity, ChannelHandle, ChannelRegistry, InboundEvent, TeamsChannel};
use crate::config::{self, Config};
use crate::gateway::lanes::{LaneHandler, Lanes};
use crate::gateway::protocol::{
    ChatParams, ConnectParams, HelloOk, HelloPolicy, ResetParams, SendParams, WsRequest,
    WsResponse,
};
use crate::router::MessageRouter;
use crate::routing::{ConversationKey, MemoryBindingStore};
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::Response,
    routing::{get, post},
    Json, Router,
};
use futures_util::FutureExt;
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::mpsc;

const PROTOCOL_VERSION: u32 = 1;

/// Channel id for conversations started over the WebSocket `chat` method.
pub const GATEWAY_CHANNEL_ID: &str = "gateway";

const SHUTDOWN_EVENT_JSON: &str = r#"{"type":"event","event":"shutdown","payload":{}}"#;

/// Commands recognised in channel messages (case-insensitive).
const HELP_COMMAND: &str = "/help";
const NEW_SESSION_COMMAND: &str = "/new";

const DEFAULT_WELCOME: &str = "Welcome! I'm connected to the AI backend. \
Just send me a message and I'll respond using AI. \
Type /new to start a fresh conversation or /help for this message.";

const SESSION_RESTARTED_REPLY: &str =
    "Session restarted. Your next message starts a fresh conversation.";

/// Lanes without traffic for this long are retired.
const LANE_IDLE: Duration = Duration::from_secs(60);
/// Upper bound on waiting for in-flight messages during shutdown.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// Shared state for the gateway (config, router, channels).
#[derive(Clone)]
pub struct GatewayState {
    pub config: Arc<Config>,
    /// Resolved backend base URL (after env overrides).
    pub backend_url: String,
    /// When Some, WebSocket connect must provide params.auth.token matching this.
    pub required_token: Option<String>,
    /// Broadcasts events to connected clients (e.g. shutdown). Subscribers receive JSON event frames.
    pub event_tx: broadcast::Sender<String>,
    /// Sender for inbound channel events (e.g. Teams webhook POSTs). The dispatcher task receives.
    pub inbound_tx: mpsc::Sender<InboundEvent>,
    pub router: Arc<MessageRouter>,
    pub channel_registry: Arc<ChannelRegistry>,
    /// Set when the Teams channel is enabled.
    pub teams: Option<Arc<TeamsChannel>>,
    pub welcome_message: Arc<str>,
}

/// When auth mode is token and a token is configured, returns it for connect validation.
fn require_connect_token(config: &Config) -> Option<String> {
    if config.gateway.auth.mode == config::GatewayAuthMode::Token {
        config::resolve_gateway_token(config)
    } else {
        None
    }
}

/// Broadcast a session.message event over WebSocket to connected clients.
fn broadcast_session_message(
    state: &GatewayState,
    key: &ConversationKey,
    session_id: Option<&str>,
    role: &str,
    content: &str,
) {
    let event = json!({
        "type": "event",
        "event": "session.message",
        "payload": {
            "sessionId": session_id,
            "role": role,
            "content": content,
            "channelId": key.channel_id,
            "conversationId": key.conversation_id,
        }
    });
    if let Ok(text) = serde_json::to_string(&event) {
        let _ = state.event_tx.send(text);
    }
}

/// Deliver text to a channel conversation; failures are logged.
async fn deliver(state: &GatewayState, key: &ConversationKey, text: &str) {
    if text.trim().is_empty() {
        log::debug!("{}: empty reply, nothing to send", key);
        return;
    }
    let mut handle = state.channel_registry.get(&key.channel_id).await;
    if handle.is_none() {
        // Bot Framework channels other than msteams (emulator, webchat) reply via the connector.
        if let Some(ref teams) = state.teams {
            if teams.knows(&key.conversation_id).await {
                handle = Some(teams.clone() as Arc<dyn ChannelHandle>);
            }
        }
    }
    match handle {
        Some(handle) => {
            if let Err(e) = handle.send_message(&key.conversation_id, text).await {
                log::warn!("{}: delivering reply failed: {}", key, e);
            }
        }
        None => log::warn!("{}: no channel registered for reply", key),
    }
}

/// Process one inbound channel event: welcome, command, or route the message and reply.
async fn process_inbound_event(state: GatewayState, event: InboundEvent) {
    let key = event.key();
    let msg = match event {
        InboundEvent::MembersAdded { .. } => {
            deliver(&state, &key, &state.welcome_message).await;
            return;
        }
        InboundEvent::Message(msg) => msg,
    };

    let trimmed = msg.text.trim();
    if trimmed.is_empty() {
        return;
    }
    if trimmed.starts_with('/') {
        if trimmed.eq_ignore_ascii_case(HELP_COMMAND) {
            deliver(&state, &key, &state.welcome_message).await;
        } else if trimmed.eq_ignore_ascii_case(NEW_SESSION_COMMAND) {
            state.router.reset(&key).await;
            deliver(&state, &key, SESSION_RESTARTED_REPLY).await;
        } else {
            log::debug!("{}: ignoring unknown command {:?}", key, trimmed);
        }
        return;
    }

    log::debug!(
        "{}: message from {}",
        key,
        msg.sender.as_deref().unwrap_or("unknown sender")
    );
    broadcast_session_message(&state, &key, None, "user", &msg.text);
    match state.router.route(&key, &msg.text).await {
        Ok(reply) => {
            broadcast_session_message(
                &state,
                &key,
                Some(&reply.session_id),
                "assistant",
                &reply.text,
            );
            deliver(&state, &key, &reply.text).await;
        }
        Err(e) => {
            log::warn!("{}: message not answered: {}", key, e);
            deliver(&state, &key, e.user_message()).await;
        }
    }
}

/// Build the shared state: backend client, router, and enabled channels.
pub async fn build_state(
    config: Config,
    inbound_tx: mpsc::Sender<InboundEvent>,
    event_tx: broadcast::Sender<String>,
) -> Result<GatewayState> {
    let backend_url = config::resolve_backend_url(&config);
    let backend: Arc<dyn ChatBackend> =
        Arc::new(HttpBackend::new(&backend_url, config.backend.timeout())?);
    let router = Arc::new(MessageRouter::new(
        backend,
        Arc::new(MemoryBindingStore::new()),
        config.routing.max_recoveries,
    ));
    let channel_registry = Arc::new(ChannelRegistry::new());

    let teams = if config.channels.teams.enabled {
        let credentials = config::resolve_teams_credentials(&config);
        if credentials.is_none() {
            log::warn!("teams: no app credentials configured; replies are sent unauthenticated (emulator only)");
        }
        let teams = Arc::new(TeamsChannel::new(credentials));
        channel_registry
            .register(teams.id().to_string(), teams.clone())
            .await;
        log::info!("teams channel registered at /api/messages");
        Some(teams)
    } else {
        None
    };

    let welcome_message: Arc<str> = config
        .channels
        .teams
        .welcome_message
        .as_deref()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .unwrap_or(DEFAULT_WELCOME)
        .into();

    Ok(GatewayState {
        required_token: require_connect_token(&config),
        config: Arc::new(config),
        backend_url,
        event_tx,
        inbound_tx,
        router,
        channel_registry,
        teams,
        welcome_message,
    })
}

/// HTTP routes for the given state.
pub fn app(state: GatewayState) -> Router {
    let mut app = Router::new()
        .route("/", get(health_http))
        .route("/ws", get(ws_handler));
    if state.teams.is_some() {
        app = app.route("/api/messages", post(teams_webhook).get(messages_probe));
    }
    app.with_state(state)
}

/// Run the gateway server; binds to config.gateway.bind:config.gateway.port.
/// When bind is not loopback, a gateway token must be configured or startup fails.
/// Blocks until shutdown (e.g. Ctrl+C).
pub async fn run_gateway(config: Config) -> Result<()> {
    let bind = config.gateway.bind.trim().to_string();
    if !config::is_loopback_bind(&bind) {
        let token = config::resolve_gateway_token(&config);
        if token.is_none() || config.gateway.auth.mode != config::GatewayAuthMode::Token {
            anyhow::bail!(
                "refusing to bind gateway to {} without auth (set gateway.auth.mode to \"token\" and gateway.auth.token or FERRY_GATEWAY_TOKEN)",
                bind
            );
        }
    }
    let port = config.gateway.port;

    let (event_tx, _) = broadcast::channel(64);
    let (inbound_tx, mut inbound_rx) = mpsc::channel::<InboundEvent>(64);
    let state = build_state(config, inbound_tx, event_tx.clone()).await?;
    log::info!(
        "backend {} (timeout {:?}, max recoveries {})",
        state.backend_url,
        state.config.backend.timeout(),
        state.router.max_recoveries()
    );

    let lanes = {
        let state_inbound = state.clone();
        let handler: LaneHandler = Arc::new(move |event: InboundEvent| {
            process_inbound_event(state_inbound.clone(), event).boxed()
        });
        Arc::new(Lanes::new(handler, LANE_IDLE))
    };
    {
        let lanes = lanes.clone();
        tokio::spawn(async move {
            while let Some(event) = inbound_rx.recv().await {
                lanes.dispatch(event);
            }
        });
    }

    let channel_registry = state.channel_registry.clone();
    let app = app(state);

    let bind_addr = format!("{}:{}", bind, port);
    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .with_context(|| format!("binding to {}", bind_addr))?;
    log::info!("gateway listening on {}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal(event_tx, channel_registry, lanes))
        .await
        .context("gateway server exited")?;
    log::info!("gateway stopped");
    Ok(())
}

/// Future that completes when the process should shut down (SIGINT or SIGTERM).
/// Broadcasts a shutdown event to WebSocket clients, stops channel connectors, then waits
/// (bounded) for conversations still being answered.
async fn shutdown_signal(
    event_tx: broadcast::Sender<String>,
    channel_registry: Arc<ChannelRegistry>,
    lanes: Arc<Lanes>,
) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            log::warn!("failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                log::warn!("failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    log::info!("shutdown signal received, broadcasting shutdown and draining conversations");

    let _ = event_tx.send(SHUTDOWN_EVENT_JSON.to_string());

    for id in channel_registry.ids().await {
        if let Some(handle) = channel_registry.get(&id).await {
            handle.stop();
        }
    }

    log::debug!("{} conversation lane(s) open at shutdown", lanes.active());
    let busy = lanes.drain(DRAIN_TIMEOUT).await;
    if busy > 0 {
        log::warn!("shutting down with {} message(s) still being answered", busy);
    } else {
        log::info!("in-flight messages drained");
    }
}

/// POST /api/messages: receives a Bot Framework activity, remembers its reply address, queues it.
async fn teams_webhook(State(state): State<GatewayState>, body: Bytes) -> StatusCode {
    let Some(teams) = state.teams.as_ref() else {
        return StatusCode::NOT_FOUND;
    };
    if !teams.running() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    let activity: Activity = match serde_json::from_slice(&body) {
        Ok(a) => a,
        Err(e) => {
            log::debug!("teams webhook: invalid activity: {}", e);
            return StatusCode::BAD_REQUEST;
        }
    };
    teams.remember(&activity).await;
    let Some(event) = activity.to_event() else {
        log::debug!("teams webhook: ignoring {} activity", activity.typ);
        return StatusCode::OK;
    };
    if state.inbound_tx.send(event).await.is_err() {
        return StatusCode::SERVICE_UNAVAILABLE;
    }
    StatusCode::OK
}

/// GET /api/messages answers 200 so tunnels and probes can check the endpoint.
async fn messages_probe() -> StatusCode {
    StatusCode::OK
}

/// GET / returns a simple health JSON (for probes).
async fn health_http(State(state): State<GatewayState>) -> Json<serde_json::Value> {
    Json(json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.config.gateway.port,
        "backend": state.backend_url,
    }))
}

/// GET /ws upgrades to WebSocket. First request must be connect; we reply with hello-ok.
async fn ws_handler(State(state): State<GatewayState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn status_payload(state: &GatewayState) -> serde_json::Value {
    let auth_mode = if state.required_token.is_some() {
        "token"
    } else {
        "none"
    };
    let backend_health = match state.router.backend().health().await {
        Ok(h) => json!(h),
        Err(e) => json!({ "status": "unreachable", "error": e.to_string() }),
    };
    let teams = state.teams.as_ref().map(|t| {
        json!({
            "running": t.running(),
            "authenticated": t.authenticated(),
        })
    });
    json!({
        "runtime": "running",
        "protocol": PROTOCOL_VERSION,
        "port": state.config.gateway.port,
        "bind": state.config.gateway.bind,
        "auth": auth_mode,
        "backend": {
            "url": state.backend_url,
            "timeoutMs": state.config.backend.timeout_ms,
            "health": backend_health,
        },
        "routing": { "maxRecoveries": state.router.max_recoveries() },
        "channels": state.channel_registry.ids().await,
        "teams": teams,
        "bindings": state.router.bindings().await,
    })
}

/// Check connect params against the configured token. Returns an error message on failure.
fn check_connect(state: &GatewayState, params: &ConnectParams) -> Result<(), &'static str> {
    let Some(ref required) = state.required_token else {
        return Ok(());
    };
    let provided = params.auth.token.as_deref().unwrap_or("").trim();
    if provided.is_empty() {
        return Err("unauthorized: gateway token missing (set FERRY_GATEWAY_TOKEN or gateway.auth.token)");
    }
    if provided != required {
        return Err("unauthorized: gateway token mismatch");
    }
    Ok(())
}

async fn handle_request(state: &GatewayState, req: &WsRequest) -> WsResponse {
    match req.method.as_str() {
        "health" => WsResponse::ok(
            &req.id,
            json!({ "runtime": "running", "protocol": PROTOCOL_VERSION }),
        ),
        "status" => WsResponse::ok(&req.id, status_payload(state).await),
        "chat" => {
            let params: ChatParams = match serde_json::from_value(req.params.clone()) {
                Ok(p) => p,
                Err(_) => return WsResponse::err(&req.id, "invalid chat params"),
            };
            if params.message.trim().is_empty() {
                return WsResponse::err(&req.id, "message is empty");
            }
            let conversation_id = params
                .conversation_id
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());
            let key = ConversationKey::new(GATEWAY_CHANNEL_ID, conversation_id);
            broadcast_session_message(state, &key, None, "user", &params.message);
            match state.router.route(&key, &params.message).await {
                Ok(reply) => {
                    broadcast_session_message(
                        state,
                        &key,
                        Some(&reply.session_id),
                        "assistant",
                        &reply.text,
                    );
                    WsResponse::ok(
                        &req.id,
                        json!({
                            "reply": reply.text,
                            "sessionId": reply.session_id,
                            "conversationId": key.conversation_id,
                            "recoveries": reply.recoveries,
                        }),
                    )
                }
                Err(e) => {
                    log::warn!("{}: chat not answered: {}", key, e);
                    WsResponse::err(&req.id, e.user_message())
                }
            }
        }
        "reset" => {
            let params: ResetParams = match serde_json::from_value(req.params.clone()) {
                Ok(p) => p,
                Err(_) => return WsResponse::err(&req.id, "invalid reset params"),
            };
            let channel_id = params
                .channel_id
                .unwrap_or_else(|| GATEWAY_CHANNEL_ID.to_string());
            let key = ConversationKey::new(channel_id, params.conversation_id);
            let removed = state.router.reset(&key).await;
            WsResponse::ok(
                &req.id,
                json!({
                    "reset": removed.is_some(),
                    "sessionId": removed.map(|b| b.backend_session_id),
                }),
            )
        }
        "send" => {
            let params: SendParams = match serde_json::from_value(req.params.clone()) {
                Ok(p) => p,
                Err(_) => return WsResponse::err(&req.id, "invalid send params"),
            };
            match state.channel_registry.get(&params.channel_id).await {
                None => WsResponse::err(&req.id, "channel not found"),
                Some(handle) => match handle
                    .send_message(&params.conversation_id, &params.message)
                    .await
                {
                    Ok(()) => WsResponse::ok(&req.id, json!({ "sent": true })),
                    Err(e) => WsResponse::err(&req.id, e.to_string()),
                },
            }
        }
        _ => WsResponse::err(&req.id, format!("unknown method: {}", req.method)),
    }
}

async fn handle_socket(mut socket: WebSocket, state: GatewayState) {
    let mut connected = false;
    let mut event_rx = state.event_tx.subscribe();

    loop {
        tokio::select! {
            biased;

            event = event_rx.recv() => {
                match event {
                    Ok(text) => {
                        let is_shutdown = text == SHUTDOWN_EVENT_JSON;
                        if connected || is_shutdown {
                            let _ = socket.send(Message::Text(text)).await;
                        }
                        if is_shutdown {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::debug!("ws client lagged {} broadcast messages", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = socket.recv() => {
                let Some(Ok(msg)) = msg else { break };
                let Message::Text(text) = msg else { continue };
                let Ok(req): Result<WsRequest, _> = serde_json::from_str(&text) else { continue };
                if req.typ != "req" {
                    continue;
                }

                let res = if req.method == "connect" {
                    let params: ConnectParams = match serde_json::from_value(req.params.clone()) {
                        Ok(p) => p,
                        Err(_) => {
                            let res = WsResponse::err(&req.id, "invalid connect params");
                            let _ = socket.send(Message::Text(res.to_text())).await;
                            continue;
                        }
                    };
                    match check_connect(&state, &params) {
                        Ok(()) => {
                            connected = true;
                            let protocol = params.max_protocol.unwrap_or(PROTOCOL_VERSION).min(PROTOCOL_VERSION);
                            let hello = HelloOk {
                                typ: "hello-ok".to_string(),
                                protocol,
                                policy: Some(HelloPolicy {
                                    tick_interval_ms: Some(15_000),
                                }),
                            };
                            WsResponse::ok(&req.id, serde_json::to_value(&hello).unwrap_or(json!({})))
                        }
                        Err(e) => WsResponse::err(&req.id, e),
                    }
                } else if !connected {
                    WsResponse::err(&req.id, "connect first")
                } else {
                    handle_request(&state, &req).await
                };
                if socket.send(Message::Text(res.to_text())).await.is_err() {
                    break;
                }
            }
        }
    }

    if !connected {
        log::debug!("ws client disconnected before sending connect");
    }
}
