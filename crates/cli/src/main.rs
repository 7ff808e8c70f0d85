use clap::{Parser, Subcommand};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::Message;

#[derive(Parser)]
#[command(name = "ferry")]
#[command(about = "Ferry: bridge Teams conversations to a session-based chat backend", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Show version
    Version,

    /// Write a default configuration file.
    Init {
        /// Config file path (default: FERRY_CONFIG_PATH or ~/.ferry/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,
    },

    /// Run the gateway (Teams webhook at /api/messages, HTTP + WebSocket control plane).
    Gateway {
        /// Config file path (default: FERRY_CONFIG_PATH or ~/.ferry/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// HTTP and WebSocket port (default: PORT env, then config, then 3978)
        #[arg(long, short)]
        port: Option<u16>,
    },

    /// Chat with the backend through a running gateway (interactive).
    Chat {
        /// Config file path (default: FERRY_CONFIG_PATH or ~/.ferry/config.json)
        #[arg(long, short, value_name = "PATH")]
        config: Option<std::path::PathBuf>,

        /// Gateway port to connect to (default: PORT env, then config, then 3978)
        #[arg(long, short)]
        port: Option<u16>,

        /// Gateway conversation id to continue (default: start a new one).
        #[arg(long, value_name = "ID")]
        conversation: Option<String>,
    },
}

#[tokio::main]
async fn main() {
    // A local .env is optional; variables already set in the environment win.
    let _ = dotenvy::dotenv();
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("warn")).init();

    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Version) => {
            println!("ferry {}", env!("CARGO_PKG_VERSION"));
        }
        Some(Commands::Init { config }) => {
            if let Err(e) = run_init(config) {
                log::error!("init failed: {}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Gateway { config, port }) => {
            if let Err(e) = run_gateway(config, port).await {
                log::error!("gateway failed: {:#}", e);
                std::process::exit(1);
            }
        }
        Some(Commands::Chat {
            config,
            port,
            conversation,
        }) => {
            if let Err(e) = run_chat(config, port, conversation).await {
                log::error!("chat failed: {:#}", e);
                std::process::exit(1);
            }
        }
        None => {
            println!("Run with --help for usage");
        }
    }
}

fn run_init(config_path: Option<std::path::PathBuf>) -> anyhow::Result<()> {
    let path = config_path.unwrap_or_else(ferry::config::default_config_path);
    if ferry::config::init_config_file(&path)? {
        println!("wrote default configuration to {}", path.display());
    } else {
        println!("configuration already exists at {}", path.display());
    }
    Ok(())
}

async fn run_gateway(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
) -> anyhow::Result<()> {
    let (mut config, path) = ferry::config::load_config(config_path)?;
    log::debug!("using config {}", path.display());
    config.gateway.port = port.unwrap_or_else(|| ferry::config::resolve_gateway_port(&config));
    log::info!("starting gateway on {}:{}", config.gateway.bind, config.gateway.port);
    ferry::gateway::run_gateway(config).await
}

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

#[derive(Debug)]
struct ChatReply {
    conversation_id: String,
    reply: String,
}

async fn run_chat(
    config_path: Option<std::path::PathBuf>,
    port: Option<u16>,
    conversation: Option<String>,
) -> anyhow::Result<()> {
    use std::io::{self, Write};

    let (config, _) = ferry::config::load_config(config_path)?;
    let port = port.unwrap_or_else(|| ferry::config::resolve_gateway_port(&config));
    let mut ws = connect_gateway(&config, port).await?;
    let mut current_conversation = conversation;
    let stdin = io::stdin();
    let mut stdout = io::stdout();
    let mut next_id: u64 = 2;

    loop {
        write!(stdout, "> ")?;
        stdout.flush()?;
        let mut line = String::new();
        if stdin.read_line(&mut line)? == 0 {
            break;
        }
        let input = line.trim();
        if input.is_empty() {
            continue;
        }
        if input.eq_ignore_ascii_case("/exit") || input.eq_ignore_ascii_case("/quit") {
            break;
        }
        if input.eq_ignore_ascii_case("/new") {
            if let Some(id) = current_conversation.take() {
                let params = serde_json::json!({ "conversationId": id });
                if let Err(e) = request(&mut ws, &next_id.to_string(), "reset", params).await {
                    eprintln!("reset error: {}", e);
                }
                next_id += 1;
            }
            println!("< started a new conversation");
            continue;
        }

        let id = next_id.to_string();
        next_id += 1;
        match chat_turn(&mut ws, &id, current_conversation.as_deref(), input).await {
            Ok(reply) => {
                current_conversation = Some(reply.conversation_id);
                println!("< {}", reply.reply.trim());
            }
            Err(e) => {
                eprintln!("chat error: {}", e);
            }
        }
    }

    Ok(())
}

/// Open the gateway WebSocket and complete the connect handshake.
async fn connect_gateway(config: &ferry::config::Config, port: u16) -> anyhow::Result<WsStream> {
    let bind = config.gateway.bind.trim();
    // A wildcard bind is reachable on loopback.
    let host = match bind {
        "0.0.0.0" | "::" | "" => "127.0.0.1",
        other => other,
    };
    let ws_url = format!("ws://{}:{}/ws", host, port);

    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url)
        .await
        .map_err(|e| anyhow::anyhow!("connecting to {}: {}", ws_url, e))?;

    let mut auth = serde_json::json!({});
    if let Some(t) = ferry::config::resolve_gateway_token(config) {
        auth["token"] = serde_json::Value::String(t);
    }
    let params = serde_json::json!({
        "minProtocol": 1,
        "maxProtocol": 1,
        "client": { "id": "ferry-cli", "version": env!("CARGO_PKG_VERSION") },
        "auth": auth,
    });
    request(&mut ws, "1", "connect", params).await?;
    Ok(ws)
}

async fn chat_turn(
    ws: &mut WsStream,
    id: &str,
    conversation_id: Option<&str>,
    message: &str,
) -> anyhow::Result<ChatReply> {
    let mut params = serde_json::json!({ "message": message });
    if let Some(c) = conversation_id {
        params["conversationId"] = serde_json::Value::String(c.to_string());
    }
    let payload = request(ws, id, "chat", params).await?;
    let conversation_id = payload
        .get("conversationId")
        .and_then(|v| v.as_str())
        .ok_or_else(|| anyhow::anyhow!("missing conversationId in chat response"))?
        .to_string();
    let reply = payload
        .get("reply")
        .and_then(|v| v.as_str())
        .unwrap_or("")
        .to_string();
    Ok(ChatReply {
        conversation_id,
        reply,
    })
}

/// Send one request and wait for its response, skipping events. Returns the payload.
async fn request(
    ws: &mut WsStream,
    id: &str,
    method: &str,
    params: serde_json::Value,
) -> anyhow::Result<serde_json::Value> {
    let req = serde_json::json!({
        "type": "req",
        "id": id,
        "method": method,
        "params": params,
    });
    ws.send(Message::Text(req.to_string())).await?;

    while let Some(msg) = ws.next().await {
        let Message::Text(text) = msg? else { continue };
        let res: serde_json::Value = serde_json::from_str(&text)?;
        match res.get("type").and_then(|v| v.as_str()) {
            Some("event") => {
                if res.get("event").and_then(|v| v.as_str()) == Some("shutdown") {
                    anyhow::bail!("gateway is shutting down");
                }
                continue;
            }
            Some("res") => {}
            _ => continue,
        }
        if res.get("id").and_then(|v| v.as_str()) != Some(id) {
            continue;
        }
        if !res.get("ok").and_then(|v| v.as_bool()).unwrap_or(false) {
            let err = res
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("request failed");
            anyhow::bail!("{}: {}", method, err);
        }
        return Ok(res.get("payload").cloned().unwrap_or(serde_json::Value::Null));
    }

    anyhow::bail!("gateway closed the connection")
}
