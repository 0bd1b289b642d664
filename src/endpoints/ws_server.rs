//! Inbound WebSocket endpoint
//!
//! One listener per endpoint. Auth is evaluated once at upgrade time from
//! the initial headers and query; a failing upgrade is closed with a policy
//! violation code before any message is read. Each accepted socket gets its
//! own receive loop and sender task; per-endpoint heartbeat and idle loops
//! sweep the shared connection map.

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use axum::Router;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, RawQuery, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum_server::tls_rustls::RustlsConfig;
use base64::Engine;
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::{EndpointConfig, EndpointStatus};
use crate::errors::gateway_error::{GatewayError, GatewayResult};
use crate::pipeline::{self, ContextBuilder, PipelineMode};
use crate::tools::ToolRegistry;

use super::connection::{LiveConnection, Outbound, RateDecision};
use super::{BroadcastFilter, BroadcastOutcome};

/// Per-connection outbound queue depth
const OUTBOUND_BUFFER: usize = 32;

/// Close codes used by the endpoint
const CLOSE_POLICY_VIOLATION: u16 = 1008;
const CLOSE_GOING_AWAY: u16 = 1001;
const CLOSE_NORMAL: u16 = 1000;

/// Idle sweep cadence
const IDLE_SWEEP_INTERVAL: Duration = Duration::from_secs(60);

const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

#[derive(Default)]
struct WsMetrics {
    total_connections: AtomicU64,
    messages_received: AtomicU64,
    messages_sent: AtomicU64,
    rate_limited: AtomicU64,
    auth_failures: AtomicU64,
}

/// State shared by the upgrade handler, socket tasks and sweep loops
struct WsShared {
    config: EndpointConfig,
    tools: Arc<ToolRegistry>,
    connections: DashMap<String, Arc<LiveConnection>>,
    metrics: WsMetrics,
    cancel: CancellationToken,
}

/// A running inbound WebSocket endpoint
pub struct WsServerEndpoint {
    shared: Arc<WsShared>,
    handle: axum_server::Handle,
    status: parking_lot::Mutex<EndpointStatus>,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl WsServerEndpoint {
    /// Bind the listener, start serving and start the sweep loops
    pub async fn start(
        config: EndpointConfig,
        tools: Arc<ToolRegistry>,
    ) -> GatewayResult<Arc<Self>> {
        let address = config.address();
        let addr: SocketAddr = address
            .parse()
            .map_err(|e| GatewayError::bind(&config.name, &address, e))?;
        let listener = std::net::TcpListener::bind(addr)
            .map_err(|e| GatewayError::bind(&config.name, &address, e))?;
        listener
            .set_nonblocking(true)
            .map_err(|e| GatewayError::bind(&config.name, &address, e))?;

        let tls_config = match &config.tls {
            Some(tls) if tls.enabled => Some(
                RustlsConfig::from_pem_file(&tls.cert_file, &tls.key_file)
                    .await
                    .map_err(|e| GatewayError::TlsError {
                        endpoint: config.name.clone(),
                        error: e.to_string(),
                    })?,
            ),
            _ => None,
        };

        let name = config.name.clone();
        let path = config.path.clone();
        let shared = Arc::new(WsShared {
            config,
            tools,
            connections: DashMap::new(),
            metrics: WsMetrics::default(),
            cancel: CancellationToken::new(),
        });

        let app = Router::new()
            .route(&path, get(upgrade_handler))
            .with_state(shared.clone());
        let handle = axum_server::Handle::new();
        let serve_handle = handle.clone();
        let task_name = name.clone();
        let serve_task = tokio::spawn(async move {
            let service = app.into_make_service_with_connect_info::<SocketAddr>();
            let result = match tls_config {
                Some(tls) => {
                    axum_server::from_tcp_rustls(listener, tls)
                        .handle(serve_handle)
                        .serve(service)
                        .await
                }
                None => {
                    axum_server::from_tcp(listener)
                        .handle(serve_handle)
                        .serve(service)
                        .await
                }
            };
            if let Err(e) = result {
                error!(endpoint = %task_name, error = %e, "WebSocket listener exited with error");
            }
        });

        let heartbeat_task = tokio::spawn(heartbeat_loop(shared.clone()));
        let idle_task = tokio::spawn(idle_loop(shared.clone()));

        info!(
            endpoint = %name,
            address = %address,
            path = %shared.config.path,
            "WebSocket endpoint listening"
        );

        Ok(Arc::new(Self {
            shared,
            handle,
            status: parking_lot::Mutex::new(EndpointStatus::Running),
            tasks: parking_lot::Mutex::new(vec![serve_task, heartbeat_task, idle_task]),
        }))
    }

    pub fn config(&self) -> &EndpointConfig {
        &self.shared.config
    }

    pub fn status(&self) -> EndpointStatus {
        *self.status.lock()
    }

    /// Close every connection, stop the listener and the sweep loops
    pub async fn stop(&self) {
        self.shared.cancel.cancel();
        self.handle.graceful_shutdown(Some(SHUTDOWN_GRACE));
        let tasks: Vec<_> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if tokio::time::timeout(SHUTDOWN_GRACE + Duration::from_secs(1), task)
                .await
                .is_err()
            {
                warn!(endpoint = %self.shared.config.name, "WebSocket task did not stop in time");
            }
        }
        self.shared.connections.clear();
        *self.status.lock() = EndpointStatus::Stopped;
        info!(endpoint = %self.shared.config.name, "WebSocket endpoint stopped");
    }

    pub fn metrics(&self) -> Value {
        let metrics = &self.shared.metrics;
        json!({
            "active_connections": self.shared.connections.len(),
            "total_connections": metrics.total_connections.load(Ordering::Relaxed),
            "messages_received": metrics.messages_received.load(Ordering::Relaxed),
            "messages_sent": metrics.messages_sent.load(Ordering::Relaxed),
            "rate_limited": metrics.rate_limited.load(Ordering::Relaxed),
            "auth_failures": metrics.auth_failures.load(Ordering::Relaxed),
        })
    }

    /// Metadata snapshots of the open connections
    pub fn connection_snapshots(&self) -> Vec<Value> {
        self.shared
            .connections
            .iter()
            .map(|entry| entry.value().snapshot())
            .collect()
    }

    /// Fan a message out to every connection the filter admits.
    ///
    /// Delivery uses the non-blocking per-connection queue: a slow or dead
    /// client counts as failed and never delays the others.
    pub async fn broadcast(&self, message: Value, filter: BroadcastFilter) -> BroadcastOutcome {
        broadcast_to(&self.shared, message, filter)
    }
}

fn broadcast_to(shared: &Arc<WsShared>, message: Value, filter: BroadcastFilter) -> BroadcastOutcome {
    let text = match message {
        Value::String(s) => s,
        other => other.to_string(),
    };

    let targets: Vec<Arc<LiveConnection>> = shared
        .connections
        .iter()
        .filter(|entry| filter.admits(entry.key(), &entry.value().snapshot()))
        .map(|entry| entry.value().clone())
        .collect();

    let mut outcome = BroadcastOutcome {
        total: targets.len(),
        ..Default::default()
    };
    for conn in targets {
        if conn.try_send(Outbound::Text(text.clone())).is_ok() {
            conn.record_outbound();
            shared.metrics.messages_sent.fetch_add(1, Ordering::Relaxed);
            outcome.sent += 1;
        } else {
            outcome.failed += 1;
        }
    }

    debug!(
        endpoint = %shared.config.name,
        sent = outcome.sent,
        failed = outcome.failed,
        total = outcome.total,
        "Broadcast delivered"
    );
    outcome
}

async fn upgrade_handler(
    ws: WebSocketUpgrade,
    State(shared): State<Arc<WsShared>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
) -> Response {
    if shared.connections.len() >= shared.config.connection_policy.max_connections {
        warn!(endpoint = %shared.config.name, "Connection limit reached, refusing upgrade");
        return (StatusCode::SERVICE_UNAVAILABLE, "connection limit reached").into_response();
    }

    let header_pairs: Vec<(String, String)> = headers
        .iter()
        .map(|(k, v)| {
            (
                k.as_str().to_lowercase(),
                v.to_str().unwrap_or_default().to_string(),
            )
        })
        .collect();
    let query_pairs: Vec<(String, String)> = raw_query
        .as_deref()
        .map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default();

    match shared.config.auth.verify(&header_pairs, &query_pairs, &[]) {
        Ok(outcome) => ws.on_upgrade(move |socket| handle_socket(socket, shared, addr, outcome)),
        Err(e) => {
            shared.metrics.auth_failures.fetch_add(1, Ordering::Relaxed);
            debug!(endpoint = %shared.config.name, remote_addr = %addr, error = %e, "Upgrade rejected at auth");
            // Complete the upgrade, then close before reading anything
            ws.on_upgrade(move |mut socket| async move {
                let _ = socket
                    .send(Message::Close(Some(CloseFrame {
                        code: CLOSE_POLICY_VIOLATION,
                        reason: "authentication failed".into(),
                    })))
                    .await;
            })
        }
    }
}

async fn handle_socket(
    socket: WebSocket,
    shared: Arc<WsShared>,
    addr: SocketAddr,
    auth: crate::auth::AuthOutcome,
) {
    let (mut sender, mut receiver) = socket.split();
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);
    let conn = Arc::new(LiveConnection::new(
        &shared.config.name,
        addr.to_string(),
        auth,
        outbound_tx,
    ));
    shared
        .connections
        .insert(conn.client_id.clone(), conn.clone());
    shared
        .metrics
        .total_connections
        .fetch_add(1, Ordering::Relaxed);
    info!(
        endpoint = %shared.config.name,
        client_id = %conn.client_id,
        remote_addr = %addr,
        "WebSocket connection opened"
    );

    let sender_task = tokio::spawn(async move {
        while let Some(frame) = outbound_rx.recv().await {
            let result = match frame {
                Outbound::Text(text) => sender.send(Message::Text(text.into())).await,
                Outbound::Ping => sender.send(Message::Ping(Vec::new().into())).await,
                Outbound::Close { code, reason } => {
                    let _ = sender
                        .send(Message::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            };
            if result.is_err() {
                break;
            }
        }
    });

    // on_connect runs to completion before the first message is processed
    run_event(&shared, "on_connect", &conn, None).await;

    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(Message::Text(text))) => {
                    let size = text.len();
                    handle_inbound(&shared, &conn, text.as_str(), size).await;
                }
                Some(Ok(Message::Binary(data))) => {
                    let encoded = base64::engine::general_purpose::STANDARD.encode(&data);
                    handle_inbound(&shared, &conn, &encoded, data.len()).await;
                }
                Some(Ok(Message::Ping(_)) | Ok(Message::Pong(_))) => conn.touch(),
                Some(Ok(Message::Close(_))) | None => {
                    debug!(endpoint = %shared.config.name, client_id = %conn.client_id, "Connection closed by client");
                    break;
                }
                Some(Err(e)) => {
                    debug!(endpoint = %shared.config.name, client_id = %conn.client_id, error = %e, "WebSocket read error");
                    break;
                }
            },
            _ = conn.wait_closed() => {
                debug!(endpoint = %shared.config.name, client_id = %conn.client_id, "Connection closed by sweep");
                break;
            }
            _ = shared.cancel.cancelled() => {
                let _ = conn.send(Outbound::Close {
                    code: CLOSE_GOING_AWAY,
                    reason: "endpoint stopping".to_string(),
                }).await;
                break;
            }
        }
    }

    shared.connections.remove(&conn.client_id);
    run_event(&shared, "on_disconnect", &conn, None).await;
    sender_task.abort();
    info!(
        endpoint = %shared.config.name,
        client_id = %conn.client_id,
        "WebSocket connection closed"
    );
}

/// Rate-limit then dispatch one inbound message
async fn handle_inbound(shared: &Arc<WsShared>, conn: &Arc<LiveConnection>, text: &str, size: usize) {
    let limit = shared.config.connection_policy.window_limit();
    match conn.record_inbound(size, limit) {
        RateDecision::Throttled => {
            shared.metrics.rate_limited.fetch_add(1, Ordering::Relaxed);
            debug!(endpoint = %shared.config.name, client_id = %conn.client_id, "Message dropped by rate limit");
            // Soft throttle: notify and drop, never close
            let notice = json!({
                "type": "rate_limit",
                "error": "message rate limit exceeded",
                "limit_per_minute": limit,
            });
            let _ = conn.try_send(Outbound::Text(notice.to_string()));
        }
        RateDecision::Allowed => {
            shared
                .metrics
                .messages_received
                .fetch_add(1, Ordering::Relaxed);
            run_event(shared, "on_message", conn, Some(text)).await;
        }
    }
}

/// Run an event pipeline; failures are logged and never close the socket
async fn run_event(
    shared: &Arc<WsShared>,
    event: &str,
    conn: &Arc<LiveConnection>,
    message: Option<&str>,
) {
    let steps = shared.config.event_pipeline(event);
    if steps.is_empty() {
        return;
    }
    let ctx = ContextBuilder::new()
        .websocket(conn.snapshot(), message)
        .build();
    let timeout = Duration::from_secs(shared.config.pipeline_timeout_secs);
    match pipeline::run(steps, ctx, &shared.tools, PipelineMode::BestEffort, timeout).await {
        Ok(outcome) if !outcome.success => warn!(
            endpoint = %shared.config.name,
            client_id = %conn.client_id,
            event = %event,
            "Event pipeline had failing steps"
        ),
        Ok(_) => {}
        Err(e) => warn!(
            endpoint = %shared.config.name,
            client_id = %conn.client_id,
            event = %event,
            error = %e,
            "Event pipeline aborted"
        ),
    }
}

/// Ping all open connections on the configured cadence.
///
/// A connection whose outbound queue is closed or saturated failed its
/// heartbeat and is dropped from the map; its socket task cleans itself up.
async fn heartbeat_loop(shared: Arc<WsShared>) {
    let mut interval = tokio::time::interval(Duration::from_secs(
        shared.config.connection_policy.heartbeat_interval_secs,
    ));
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = interval.tick() => sweep_heartbeat(&shared),
        }
    }
}

/// One heartbeat pass: ping everyone, drop connections whose queue is gone
fn sweep_heartbeat(shared: &Arc<WsShared>) {
    let connections: Vec<(String, Arc<LiveConnection>)> = shared
        .connections
        .iter()
        .map(|entry| (entry.key().clone(), entry.value().clone()))
        .collect();
    for (client_id, conn) in connections {
        if conn.try_send(Outbound::Ping).is_err() {
            warn!(
                endpoint = %shared.config.name,
                client_id = %client_id,
                "Heartbeat failed, dropping connection"
            );
            shared.connections.remove(&client_id);
            conn.begin_close();
        }
    }
}

/// Close connections idle past the configured timeout, on a fixed cadence
async fn idle_loop(shared: Arc<WsShared>) {
    let idle_timeout = Duration::from_secs(shared.config.connection_policy.idle_timeout_secs);
    let mut interval = tokio::time::interval(IDLE_SWEEP_INTERVAL);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    loop {
        tokio::select! {
            _ = shared.cancel.cancelled() => break,
            _ = interval.tick() => sweep_idle(&shared, idle_timeout),
        }
    }
}

/// One idle pass: queue a close frame for stale connections and signal
/// their socket tasks, which a silent peer would otherwise never wake
fn sweep_idle(shared: &Arc<WsShared>, idle_timeout: Duration) {
    let stale: Vec<(String, Arc<LiveConnection>)> = shared
        .connections
        .iter()
        .filter(|entry| entry.value().idle_for() > idle_timeout)
        .map(|entry| (entry.key().clone(), entry.value().clone()))
        .collect();
    for (client_id, conn) in stale {
        info!(
            endpoint = %shared.config.name,
            client_id = %client_id,
            idle_secs = conn.idle_for().as_secs(),
            "Closing idle connection"
        );
        let _ = conn.try_send(Outbound::Close {
            code: CLOSE_NORMAL,
            reason: "idle timeout".to_string(),
        });
        shared.connections.remove(&client_id);
        conn.begin_close();
    }
}
