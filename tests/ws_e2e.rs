//! End-to-end WebSocket behavior over real sockets

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use serial_test::serial;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

use fluxgate::auth::AuthScheme;
use fluxgate::config::{EndpointConfig, EndpointKind, StepConfig};
use fluxgate::endpoints::BroadcastFilter;
use fluxgate::registry::EndpointRegistry;
use fluxgate::tools::{Tool, ToolRegistry, ToolResult};

/// Tool that records every params object it is invoked with
struct Recorder {
    seen: Arc<parking_lot::Mutex<Vec<Value>>>,
}

#[async_trait]
impl Tool for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    async fn invoke(&self, params: Value) -> ToolResult<Value> {
        self.seen.lock().push(params.clone());
        Ok(params)
    }
}

fn registry_with_recorder(
    dir: &std::path::Path,
) -> (EndpointRegistry, Arc<parking_lot::Mutex<Vec<Value>>>) {
    let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));
    let tools = ToolRegistry::with_builtins();
    tools.register(Arc::new(Recorder { seen: seen.clone() }));
    (EndpointRegistry::new(dir, Arc::new(tools)), seen)
}

fn ws_config(name: &str, port: u16) -> EndpointConfig {
    let mut config = EndpointConfig::new(name, EndpointKind::WsServer);
    config.port = port;
    config.path = "/ws".to_string();
    config
}

fn recorder_step(event: &str) -> (String, Vec<StepConfig>) {
    (
        event.to_string(),
        vec![StepConfig {
            tool: "recorder".to_string(),
            params: json!({
                "event": event,
                "client_id": "{! websocket.client_id !}",
                "message": "{! websocket.message !}",
            }),
            output: "seen".to_string(),
        }],
    )
}

/// Read frames until a Text frame arrives, skipping heartbeat Ping/Pong
async fn next_text<S>(ws: &mut S) -> String
where
    S: StreamExt<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match ws.next().await.unwrap().unwrap() {
                Message::Text(text) => break text.to_string(),
                Message::Ping(_) | Message::Pong(_) => continue,
                frame => panic!("expected text frame, got {frame:?}"),
            }
        }
    })
    .await
    .unwrap()
}

async fn wait_for<F: Fn() -> bool>(what: &str, check: F) {
    for _ in 0..100 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

#[tokio::test]
#[serial]
async fn event_pipelines_fire_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, seen) = registry_with_recorder(dir.path());

    let mut config = ws_config("feed", 39321);
    config.event_handlers = [
        recorder_step("on_connect"),
        recorder_step("on_message"),
        recorder_step("on_disconnect"),
    ]
    .into_iter()
    .collect();
    registry.start(config).await.unwrap();

    let (mut ws, _) = connect_async("ws://127.0.0.1:39321/ws").await.unwrap();
    ws.send(Message::Text(r#"{"kind":"ping"}"#.into()))
        .await
        .unwrap();
    ws.close(None).await.unwrap();

    wait_for("all three events", || seen.lock().len() >= 3).await;
    let events: Vec<String> = seen
        .lock()
        .iter()
        .map(|v| v["event"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(events, vec!["on_connect", "on_message", "on_disconnect"]);

    // The message event saw the parsed JSON payload
    let message_event = &seen.lock()[1].clone();
    assert_eq!(message_event["message"]["kind"], json!("ping"));
    assert!(!message_event["client_id"].as_str().unwrap().is_empty());

    registry.stop("feed").await.unwrap();
}

#[tokio::test]
#[serial]
async fn upgrade_auth_closes_with_policy_violation() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _) = registry_with_recorder(dir.path());

    let mut config = ws_config("secure", 39322);
    config.auth = AuthScheme::QueryParam {
        name: "token".to_string(),
        token: "abc".into(),
    };
    registry.start(config).await.unwrap();

    // Wrong token: the upgrade completes but the first frame is a close
    let (mut ws, _) = connect_async("ws://127.0.0.1:39322/ws?token=wrong")
        .await
        .unwrap();
    let frame = ws.next().await.unwrap().unwrap();
    let Message::Close(Some(close)) = frame else {
        panic!("expected close frame, got {frame:?}");
    };
    assert_eq!(u16::from(close.code), 1008);

    // Right token: the socket stays open
    let (mut ws, _) = connect_async("ws://127.0.0.1:39322/ws?token=abc")
        .await
        .unwrap();
    ws.send(Message::Text("hello".into())).await.unwrap();
    ws.close(None).await.unwrap();

    registry.stop("secure").await.unwrap();
}

#[tokio::test]
#[serial]
async fn rate_limit_soft_throttles_without_closing() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, seen) = registry_with_recorder(dir.path());

    let mut config = ws_config("limited", 39323);
    config.connection_policy.messages_per_minute = 2;
    config.event_handlers = [recorder_step("on_message")].into_iter().collect();
    registry.start(config).await.unwrap();

    let (mut ws, _) = connect_async("ws://127.0.0.1:39323/ws").await.unwrap();
    for _ in 0..3 {
        ws.send(Message::Text(r#"{"n":1}"#.into())).await.unwrap();
    }

    // The third message bounced with a notice instead of a close
    let text = next_text(&mut ws).await;
    let notice: Value = serde_json::from_str(&text).unwrap();
    assert_eq!(notice["type"], json!("rate_limit"));

    // Socket is still usable and only two messages reached the pipeline
    wait_for("two pipeline runs", || seen.lock().len() >= 2).await;
    assert_eq!(seen.lock().len(), 2);
    ws.close(None).await.unwrap();

    registry.stop("limited").await.unwrap();
}

#[tokio::test]
#[serial]
async fn broadcast_respects_filters_and_counts() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, _) = registry_with_recorder(dir.path());
    registry.start(ws_config("room", 39324)).await.unwrap();

    let (mut ws_a, _) = connect_async("ws://127.0.0.1:39324/ws").await.unwrap();
    let (mut ws_b, _) = connect_async("ws://127.0.0.1:39324/ws").await.unwrap();

    let mut connected = false;
    for _ in 0..100 {
        let status = registry.status("room", false, true).await.unwrap();
        if status["connections"].as_array().map(Vec::len) == Some(2) {
            connected = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(connected, "both connections registered");

    let outcome = registry
        .broadcast("room", json!({"news": "hello"}), BroadcastFilter::default())
        .await
        .unwrap();
    assert_eq!(outcome.total, 2);
    assert_eq!(outcome.sent, 2);
    assert_eq!(outcome.failed, 0);

    for ws in [&mut ws_a, &mut ws_b] {
        let text = next_text(ws).await;
        assert_eq!(
            serde_json::from_str::<Value>(&text).unwrap(),
            json!({"news": "hello"})
        );
    }

    // Exclude one client by id
    let status = registry.status("room", false, true).await.unwrap();
    let first_id = status["connections"][0]["client_id"]
        .as_str()
        .unwrap()
        .to_string();
    let outcome = registry
        .broadcast(
            "room",
            json!({"only": "one"}),
            BroadcastFilter {
                exclude: vec![first_id],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert_eq!(outcome.total, 1);
    assert_eq!(outcome.sent, 1);

    ws_a.close(None).await.unwrap();
    ws_b.close(None).await.unwrap();
    registry.stop("room").await.unwrap();
}

#[tokio::test]
#[serial]
async fn ws_client_connects_and_sends() {
    let dir = tempfile::tempdir().unwrap();
    let (registry, seen) = registry_with_recorder(dir.path());

    // Inbound server records everything it hears
    let mut server = ws_config("sink", 39325);
    server.event_handlers = [recorder_step("on_message")].into_iter().collect();
    registry.start(server).await.unwrap();

    // Outbound client pointed at it
    let mut client = EndpointConfig::new("pusher", EndpointKind::WsClient);
    client.url = Some("ws://127.0.0.1:39325/ws".to_string());
    registry.start(client).await.unwrap();

    // Wait until the session is live, then push a message through it
    let mut connected = false;
    for _ in 0..100 {
        let status = registry.status("pusher", true, false).await.unwrap();
        if status["metrics"]["connected"] == json!(true) {
            connected = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(connected, "client session established");

    registry
        .client_send("pusher", json!({"from": "client"}))
        .await
        .unwrap();

    wait_for("server heard the message", || !seen.lock().is_empty()).await;
    let heard = seen.lock()[0].clone();
    assert_eq!(heard["message"]["from"], json!("client"));

    registry.stop("pusher").await.unwrap();
    registry.stop("sink").await.unwrap();
}
