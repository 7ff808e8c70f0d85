//! End to end: Teams activity -> webhook -> router -> fake backend -> fake connector.

mod common;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio_tungstenite::tungstenite::Message;

fn message_activity(connector: &str, conversation: &str, id: &str, text: &str) -> Value {
    json!({
        "type": "message",
        "id": id,
        "text": text,
        "serviceUrl": format!("{}/", connector),
        "channelId": "msteams",
        "from": { "id": "29:user", "name": "Dana" },
        "recipient": { "id": "28:bot", "name": "Ferry" },
        "conversation": { "id": conversation },
    })
}

async fn post_activity(gateway: &str, activity: &Value) {
    let resp = reqwest::Client::new()
        .post(format!("{}/api/messages", gateway))
        .json(activity)
        .send()
        .await
        .expect("POST /api/messages");
    assert_eq!(resp.status(), reqwest::StatusCode::OK);
}

#[tokio::test]
async fn message_is_answered_in_the_same_conversation() {
    let (backend_url, backend) = common::spawn_backend().await;
    let (connector_url, connector) = common::spawn_connector().await;
    let gateway = common::start_gateway(common::config_for(&backend_url)).await;

    post_activity(
        &gateway,
        &message_activity(&connector_url, "conv-1", "act-1", "hello"),
    )
    .await;

    let sent = connector.wait_for(1).await;
    let (conversation, reply) = &sent[0];
    assert_eq!(conversation, "conv-1");
    assert_eq!(reply["type"], "message");
    assert_eq!(reply["text"], "echo: hello");
    assert_eq!(reply["replyToId"], "act-1");
    assert_eq!(reply["conversation"]["id"], "conv-1");
    assert_eq!(reply["from"]["id"], "28:bot");
    assert_eq!(reply["recipient"]["id"], "29:user");
    assert_eq!(backend.created(), 1);

    // Same conversation reuses the session.
    post_activity(
        &gateway,
        &message_activity(&connector_url, "conv-1", "act-2", "again"),
    )
    .await;
    let sent = connector.wait_for(2).await;
    assert_eq!(sent[1].1["text"], "echo: again");
    assert_eq!(backend.created(), 1);
}

#[tokio::test]
async fn expired_session_is_replaced_transparently() {
    let (backend_url, backend) = common::spawn_backend().await;
    let (connector_url, connector) = common::spawn_connector().await;
    let gateway = common::start_gateway(common::config_for(&backend_url)).await;

    post_activity(
        &gateway,
        &message_activity(&connector_url, "conv-r", "act-1", "first"),
    )
    .await;
    connector.wait_for(1).await;

    backend.expire_all();
    post_activity(
        &gateway,
        &message_activity(&connector_url, "conv-r", "act-2", "second"),
    )
    .await;
    let sent = connector.wait_for(2).await;
    assert_eq!(sent[1].1["text"], "echo: second");
    assert_eq!(backend.created(), 2);
}

#[tokio::test]
async fn unreachable_backend_gets_an_apology() {
    let (connector_url, connector) = common::spawn_connector().await;
    let dead = format!("http://127.0.0.1:{}", common::free_port());
    let gateway = common::start_gateway(common::config_for(&dead)).await;

    post_activity(
        &gateway,
        &message_activity(&connector_url, "conv-d", "act-1", "anyone there?"),
    )
    .await;
    let sent = connector.wait_for(1).await;
    assert_eq!(sent[0].1["text"], ferry::router::UNAVAILABLE_REPLY);
}

#[tokio::test]
async fn help_and_join_send_the_welcome_without_a_session() {
    let (backend_url, backend) = common::spawn_backend().await;
    let (connector_url, connector) = common::spawn_connector().await;
    let mut config = common::config_for(&backend_url);
    config.channels.teams.welcome_message = Some("Hi, ask me anything.".to_string());
    let gateway = common::start_gateway(config).await;

    let join = json!({
        "type": "conversationUpdate",
        "serviceUrl": format!("{}/", connector_url),
        "recipient": { "id": "28:bot" },
        "conversation": { "id": "conv-w" },
        "membersAdded": [ { "id": "28:bot" }, { "id": "29:user" } ],
    });
    post_activity(&gateway, &join).await;
    let sent = connector.wait_for(1).await;
    assert_eq!(sent[0].1["text"], "Hi, ask me anything.");

    post_activity(
        &gateway,
        &message_activity(&connector_url, "conv-w", "act-1", "/HELP"),
    )
    .await;
    let sent = connector.wait_for(2).await;
    assert_eq!(sent[1].1["text"], "Hi, ask me anything.");
    assert_eq!(backend.created(), 0);
}

#[tokio::test]
async fn new_command_starts_a_fresh_session() {
    let (backend_url, backend) = common::spawn_backend().await;
    let (connector_url, connector) = common::spawn_connector().await;
    let gateway = common::start_gateway(common::config_for(&backend_url)).await;

    post_activity(
        &gateway,
        &message_activity(&connector_url, "conv-n", "act-1", "one"),
    )
    .await;
    connector.wait_for(1).await;

    post_activity(
        &gateway,
        &message_activity(&connector_url, "conv-n", "act-2", "/new"),
    )
    .await;
    let sent = connector.wait_for(2).await;
    assert!(sent[1].1["text"].as_str().unwrap().starts_with("Session restarted"));
    assert_eq!(backend.live(), 0);

    post_activity(
        &gateway,
        &message_activity(&connector_url, "conv-n", "act-3", "two"),
    )
    .await;
    let sent = connector.wait_for(3).await;
    assert_eq!(sent[2].1["text"], "echo: two");
    assert_eq!(backend.created(), 2);
}

async fn ws_request(
    ws: &mut tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >,
    id: &str,
    method: &str,
    params: Value,
) -> Value {
    let req = json!({ "type": "req", "id": id, "method": method, "params": params });
    ws.send(Message::Text(req.to_string())).await.unwrap();
    while let Some(msg) = ws.next().await {
        let Message::Text(text) = msg.unwrap() else {
            continue;
        };
        let v: Value = serde_json::from_str(&text).unwrap();
        if v["type"] == "res" && v["id"] == id {
            return v;
        }
    }
    panic!("socket closed before response to {}", id);
}

#[tokio::test]
async fn websocket_chat_and_reset() {
    let (backend_url, backend) = common::spawn_backend().await;
    let gateway = common::start_gateway(common::config_for(&backend_url)).await;
    let ws_url = format!("{}/ws", gateway.replacen("http://", "ws://", 1));
    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url).await.unwrap();

    let early = ws_request(&mut ws, "0", "status", json!({})).await;
    assert_eq!(early["ok"], false);

    let hello = ws_request(&mut ws, "1", "connect", json!({ "maxProtocol": 1 })).await;
    assert_eq!(hello["ok"], true);
    assert_eq!(hello["payload"]["type"], "hello-ok");

    let chat = ws_request(&mut ws, "2", "chat", json!({ "message": "ping" })).await;
    assert_eq!(chat["ok"], true);
    assert_eq!(chat["payload"]["reply"], "echo: ping");
    let conversation = chat["payload"]["conversationId"].as_str().unwrap().to_string();

    let status = ws_request(&mut ws, "3", "status", json!({})).await;
    assert_eq!(status["payload"]["backend"]["health"]["status"], "healthy");
    assert_eq!(status["payload"]["bindings"].as_array().unwrap().len(), 1);

    let reset = ws_request(
        &mut ws,
        "4",
        "reset",
        json!({ "conversationId": conversation }),
    )
    .await;
    assert_eq!(reset["payload"]["reset"], true);
    assert_eq!(backend.live(), 0);

    let unknown = ws_request(&mut ws, "5", "agent", json!({})).await;
    assert_eq!(unknown["ok"], false);
}

#[tokio::test]
async fn websocket_send_delivers_to_a_known_conversation() {
    let (backend_url, backend) = common::spawn_backend().await;
    let (connector_url, connector) = common::spawn_connector().await;
    let gateway = common::start_gateway(common::config_for(&backend_url)).await;

    // An ignored command still records where the conversation lives.
    post_activity(
        &gateway,
        &message_activity(&connector_url, "conv-s", "act-1", "/unknown"),
    )
    .await;

    let ws_url = format!("{}/ws", gateway.replacen("http://", "ws://", 1));
    let (mut ws, _) = tokio_tungstenite::connect_async(&ws_url).await.unwrap();
    let hello = ws_request(&mut ws, "1", "connect", json!({})).await;
    assert_eq!(hello["ok"], true);

    let sent = ws_request(
        &mut ws,
        "2",
        "send",
        json!({ "channelId": "msteams", "conversationId": "conv-s", "message": "maintenance at 5pm" }),
    )
    .await;
    assert_eq!(sent["ok"], true);
    assert_eq!(sent["payload"]["sent"], true);

    let delivered = connector.wait_for(1).await;
    assert_eq!(delivered[0].0, "conv-s");
    assert_eq!(delivered[0].1["text"], "maintenance at 5pm");
    assert_eq!(delivered[0].1["replyToId"], "act-1");

    let unknown_channel = ws_request(
        &mut ws,
        "3",
        "send",
        json!({ "channelId": "slack", "conversationId": "conv-s", "message": "hi" }),
    )
    .await;
    assert_eq!(unknown_channel["ok"], false);
    assert_eq!(unknown_channel["error"], "channel not found");

    let unknown_conversation = ws_request(
        &mut ws,
        "4",
        "send",
        json!({ "channelId": "msteams", "conversationId": "nobody", "message": "hi" }),
    )
    .await;
    assert_eq!(unknown_conversation["ok"], false);

    let blank = ws_request(&mut ws, "5", "chat", json!({ "message": "   " })).await;
    assert_eq!(blank["ok"], false);
    assert_eq!(backend.created(), 0);
}
