//! Outbound WebSocket client endpoint
//!
//! Connects to a configured ws/wss URL, runs the same event pipelines as
//! the inbound server, and reconnects with configurable backoff. After the
//! attempt budget is exhausted the endpoint is marked Failed and stays
//! visible in that state rather than retrying silently.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use base64::Engine;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Map, Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderName;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::auth::AuthScheme;
use crate::config::{EndpointConfig, EndpointStatus};
use crate::errors::gateway_error::{GatewayError, GatewayResult};
use crate::pipeline::{self, ContextBuilder, PipelineMode};
use crate::tools::ToolRegistry;

/// Outbound queue depth for `send`
const OUTBOUND_BUFFER: usize = 32;

#[derive(Default)]
struct ClientMetrics {
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    reconnects: AtomicU64,
}

struct ClientShared {
    config: EndpointConfig,
    tools: Arc<ToolRegistry>,
    cancel: CancellationToken,
    status: parking_lot::Mutex<EndpointStatus>,
    /// Present while a session is live
    outbound: parking_lot::Mutex<Option<mpsc::Sender<String>>>,
    metrics: ClientMetrics,
}

/// A running outbound WebSocket client
pub struct WsClientEndpoint {
    shared: Arc<ClientShared>,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl WsClientEndpoint {
    /// Validate the connect request and start the session loop.
    ///
    /// Connecting happens in the background; the endpoint reports Starting
    /// until the first session is established.
    pub fn start(config: EndpointConfig, tools: Arc<ToolRegistry>) -> GatewayResult<Arc<Self>> {
        // Surface bad URLs and unusable auth headers synchronously
        build_request(&config).map_err(|e| GatewayError::transport(&config.name, e))?;

        let shared = Arc::new(ClientShared {
            config,
            tools,
            cancel: CancellationToken::new(),
            status: parking_lot::Mutex::new(EndpointStatus::Starting),
            outbound: parking_lot::Mutex::new(None),
            metrics: ClientMetrics::default(),
        });

        let task = tokio::spawn(run_loop(shared.clone()));
        Ok(Arc::new(Self {
            shared,
            task: parking_lot::Mutex::new(Some(task)),
        }))
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.shared.config
    }

    pub fn status(&self) -> EndpointStatus {
        *self.shared.status.lock()
    }

    /// Close the session and stop reconnecting
    pub async fn stop(&self) {
        self.shared.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task
            && tokio::time::timeout(Duration::from_secs(6), task)
                .await
                .is_err()
        {
            warn!(endpoint = %self.shared.config.name, "Client session did not stop in time");
        }
        *self.shared.status.lock() = EndpointStatus::Stopped;
        info!(endpoint = %self.shared.config.name, "WebSocket client stopped");
    }

    /// Push a text message through the live connection
    pub async fn send(&self, message: Value) -> GatewayResult<()> {
        let text = match message {
            Value::String(s) => s,
            other => other.to_string(),
        };
        let tx = self.shared.outbound.lock().clone();
        let Some(tx) = tx else {
            return Err(GatewayError::transport(
                &self.shared.config.name,
                "not connected",
            ));
        };
        tx.send(text)
            .await
            .map_err(|_| GatewayError::transport(&self.shared.config.name, "connection closed"))
    }

    pub fn metrics(&self) -> Value {
        let metrics = &self.shared.metrics;
        json!({
            "connected": self.shared.outbound.lock().is_some(),
            "messages_received": metrics.messages_received.load(Ordering::Relaxed),
            "messages_sent": metrics.messages_sent.load(Ordering::Relaxed),
            "reconnects": metrics.reconnects.load(Ordering::Relaxed),
        })
    }
}

/// Session loop: connect, run, reconnect with backoff, give up after the
/// attempt budget
async fn run_loop(shared: Arc<ClientShared>) {
    let mut attempt: u32 = 0;
    loop {
        if shared.cancel.is_cancelled() {
            break;
        }

        match run_session(&shared).await {
            Ok(()) => {
                // A session that was established counts as a fresh start
                attempt = 0;
            }
            Err(e) => {
                warn!(endpoint = %shared.config.name, error = %e, "WebSocket client session failed");
            }
        }
        *shared.outbound.lock() = None;

        if shared.cancel.is_cancelled() {
            break;
        }

        attempt += 1;
        if attempt > shared.config.reconnect.max_attempts {
            error!(
                endpoint = %shared.config.name,
                attempts = shared.config.reconnect.max_attempts,
                "Reconnect attempts exhausted, marking endpoint failed"
            );
            *shared.status.lock() = EndpointStatus::Failed;
            return;
        }

        *shared.status.lock() = EndpointStatus::Starting;
        let delay = shared.config.reconnect.delay(attempt);
        shared.metrics.reconnects.fetch_add(1, Ordering::Relaxed);
        info!(
            endpoint = %shared.config.name,
            attempt,
            delay_ms = delay.as_millis() as u64,
            "Reconnecting"
        );
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
}

/// One connection lifetime, from handshake to disconnect
async fn run_session(shared: &Arc<ClientShared>) -> Result<(), String> {
    let request = build_request(&shared.config)?;
    let (ws, _response) = connect_async(request).await.map_err(|e| e.to_string())?;
    *shared.status.lock() = EndpointStatus::Running;
    info!(
        endpoint = %shared.config.name,
        url = %shared.config.url.as_deref().unwrap_or_default(),
        "WebSocket client connected"
    );

    let (mut sink, mut stream) = ws.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<String>(OUTBOUND_BUFFER);
    *shared.outbound.lock() = Some(outbound_tx);

    let metadata = session_metadata(&shared.config);
    run_event(shared, "on_connect", &metadata, None).await;

    let mut heartbeat = tokio::time::interval(Duration::from_secs(
        shared.config.connection_policy.heartbeat_interval_secs,
    ));
    heartbeat.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    heartbeat.reset(); // no ping right after the handshake

    let result = loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => {
                let _ = sink.send(Message::Close(None)).await;
                break Ok(());
            }
            Some(text) = outbound_rx.recv() => {
                if let Err(e) = sink.send(Message::Text(text.into())).await {
                    break Err(format!("send failed: {e}"));
                }
                shared.metrics.messages_sent.fetch_add(1, Ordering::Relaxed);
            }
            _ = heartbeat.tick() => {
                if sink.send(Message::Ping(Vec::new().into())).await.is_err() {
                    break Err("heartbeat failed".to_string());
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    shared.metrics.messages_received.fetch_add(1, Ordering::Relaxed);
                    run_event(shared, "on_message", &metadata, Some(text.as_str())).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    shared.metrics.messages_received.fetch_add(1, Ordering::Relaxed);
                    let encoded = base64::engine::general_purpose::STANDARD.encode(&data);
                    run_event(shared, "on_message", &metadata, Some(&encoded)).await;
                }
                Some(Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_))) => {}
                Some(Ok(Message::Close(_))) | None => {
                    debug!(endpoint = %shared.config.name, "Connection closed by peer");
                    break Ok(());
                }
                Some(Err(e)) => break Err(format!("read failed: {e}")),
            }
        }
    };

    *shared.outbound.lock() = None;
    run_event(shared, "on_disconnect", &metadata, None).await;
    result
}

fn session_metadata(config: &EndpointConfig) -> Value {
    json!({
        "client_id": uuid::Uuid::new_v4().to_string(),
        "endpoint": config.name,
        "url": config.url,
        "connected_at": time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default(),
    })
}

async fn run_event(
    shared: &Arc<ClientShared>,
    event: &str,
    metadata: &Value,
    message: Option<&str>,
) {
    let steps = shared.config.event_pipeline(event);
    if steps.is_empty() {
        return;
    }
    let ctx: Map<String, Value> = ContextBuilder::new()
        .websocket(metadata.clone(), message)
        .build();
    let timeout = Duration::from_secs(shared.config.pipeline_timeout_secs);
    match pipeline::run(steps, ctx, &shared.tools, PipelineMode::BestEffort, timeout).await {
        Ok(outcome) if !outcome.success => warn!(
            endpoint = %shared.config.name,
            event = %event,
            "Event pipeline had failing steps"
        ),
        Ok(_) => {}
        Err(e) => warn!(
            endpoint = %shared.config.name,
            event = %event,
            error = %e,
            "Event pipeline aborted"
        ),
    }
}

/// Build the connect request with the endpoint's auth attached
fn build_request(
    config: &EndpointConfig,
) -> Result<tokio_tungstenite::tungstenite::handshake::client::Request, String> {
    let url = config.url.as_deref().ok_or("missing url")?;
    let mut url = url::Url::parse(url).map_err(|e| e.to_string())?;

    if let AuthScheme::QueryParam { name, token } = &config.auth {
        url.query_pairs_mut().append_pair(name, token.expose());
    }

    let mut request = url
        .as_str()
        .into_client_request()
        .map_err(|e| e.to_string())?;

    match &config.auth {
        AuthScheme::BearerToken { token } => {
            let value = format!("Bearer {}", token.expose())
                .parse()
                .map_err(|_| "bearer token is not a valid header value".to_string())?;
            request.headers_mut().insert("authorization", value);
        }
        AuthScheme::Header { name, token } => {
            let name = HeaderName::try_from(name.as_str())
                .map_err(|_| format!("invalid auth header name '{name}'"))?;
            let value = token
                .expose()
                .parse()
                .map_err(|_| "auth token is not a valid header value".to_string())?;
            request.headers_mut().insert(name, value);
        }
        _ => {}
    }

    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EndpointKind;

    fn client_config(auth: AuthScheme) -> EndpointConfig {
        let mut config = EndpointConfig::new("out", EndpointKind::WsClient);
        config.url = Some("ws://127.0.0.1:9100/feed".to_string());
        config.auth = auth;
        config
    }

    #[test]
    fn test_bearer_attached_as_header() {
        let config = client_config(AuthScheme::BearerToken {
            token: "s3cret".into(),
        });
        let request = build_request(&config).unwrap();
        assert_eq!(
            request.headers().get("authorization").unwrap(),
            "Bearer s3cret"
        );
    }

    #[test]
    fn test_query_param_attached_to_url() {
        let config = client_config(AuthScheme::QueryParam {
            name: "token".to_string(),
            token: "abc".into(),
        });
        let request = build_request(&config).unwrap();
        assert_eq!(request.uri().query(), Some("token=abc"));
    }

    #[test]
    fn test_custom_header_attached() {
        let config = client_config(AuthScheme::Header {
            name: "X-Api-Key".to_string(),
            token: "k".into(),
        });
        let request = build_request(&config).unwrap();
        assert_eq!(request.headers().get("x-api-key").unwrap(), "k");
    }

    #[tokio::test]
    async fn test_reports_starting_before_first_session() {
        let endpoint = WsClientEndpoint::start(
            client_config(AuthScheme::None),
            Arc::new(ToolRegistry::with_builtins()),
        )
        .unwrap();
        // Connecting happens in the background; the Failed transition only
        // comes after the whole reconnect budget is spent
        assert_eq!(endpoint.status(), EndpointStatus::Starting);
        endpoint.stop().await;
        assert_eq!(endpoint.status(), EndpointStatus::Stopped);
    }

    #[tokio::test]
    async fn test_send_before_connect_is_transport_error() {
        let endpoint = WsClientEndpoint::start(
            client_config(AuthScheme::None),
            Arc::new(ToolRegistry::with_builtins()),
        )
        .unwrap();
        let err = endpoint.send(json!({"x": 1})).await.unwrap_err();
        assert!(matches!(err, GatewayError::TransportError { .. }));
        endpoint.stop().await;
    }
}
