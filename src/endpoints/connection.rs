//! Live WebSocket connection state
//!
//! One [`LiveConnection`] per open socket, owned by its endpoint's
//! connection map. Mutable counters live behind a `parking_lot` mutex so
//! the heartbeat and idle loops can read them without touching the socket
//! task.

use std::time::Instant;

use parking_lot::Mutex;
use serde_json::{Value, json};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::auth::AuthOutcome;

/// Fixed rate-limit window length
const WINDOW: std::time::Duration = std::time::Duration::from_secs(60);

/// Frame queued for the connection's sender task
#[derive(Debug, Clone, PartialEq)]
pub enum Outbound {
    Text(String),
    Ping,
    /// Close with code and reason; the sender task exits after sending
    Close { code: u16, reason: String },
}

/// Verdict for one inbound message against the connection's window
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed,
    /// Over budget for the current window; drop the message, keep the socket
    Throttled,
}

#[derive(Debug)]
struct Activity {
    last_activity: Instant,
    window_start: Instant,
    window_count: u32,
    messages_received: u64,
    messages_sent: u64,
    bytes_received: u64,
}

/// State for one open connection
#[derive(Debug)]
pub struct LiveConnection {
    pub client_id: String,
    pub endpoint: String,
    pub remote_addr: String,
    pub auth: AuthOutcome,
    pub connected_at: OffsetDateTime,
    outbound: mpsc::Sender<Outbound>,
    activity: Mutex<Activity>,
    closed: CancellationToken,
}

impl LiveConnection {
    pub fn new(
        endpoint: impl Into<String>,
        remote_addr: impl Into<String>,
        auth: AuthOutcome,
        outbound: mpsc::Sender<Outbound>,
    ) -> Self {
        let now = Instant::now();
        Self {
            client_id: uuid::Uuid::new_v4().to_string(),
            endpoint: endpoint.into(),
            remote_addr: remote_addr.into(),
            auth,
            connected_at: OffsetDateTime::now_utc(),
            outbound,
            activity: Mutex::new(Activity {
                last_activity: now,
                window_start: now,
                window_count: 0,
                messages_received: 0,
                messages_sent: 0,
                bytes_received: 0,
            }),
            closed: CancellationToken::new(),
        }
    }

    /// Signal the socket task to tear this connection down.
    ///
    /// Needed by the sweep loops: a dead-silent peer never wakes the
    /// receive side, so removal from the map alone would leave the task
    /// running until the endpoint stops.
    pub fn begin_close(&self) {
        self.closed.cancel();
    }

    /// Resolves once [`LiveConnection::begin_close`] has been called
    pub async fn wait_closed(&self) {
        self.closed.cancelled().await;
    }

    /// Record an inbound message and apply the fixed-window limit.
    ///
    /// The window resets when a message arrives more than one window after
    /// the current window's start. Throttled messages still count as
    /// received activity so an abusive client is not reaped as idle.
    pub fn record_inbound(&self, bytes: usize, window_limit: u32) -> RateDecision {
        let mut activity = self.activity.lock();
        let now = Instant::now();
        activity.last_activity = now;
        if now.duration_since(activity.window_start) >= WINDOW {
            activity.window_start = now;
            activity.window_count = 0;
        }
        activity.window_count += 1;
        if activity.window_count > window_limit {
            return RateDecision::Throttled;
        }
        activity.messages_received += 1;
        activity.bytes_received += bytes as u64;
        RateDecision::Allowed
    }

    /// Record any non-message activity (pong frames)
    pub fn touch(&self) {
        self.activity.lock().last_activity = Instant::now();
    }

    pub fn record_outbound(&self) {
        self.activity.lock().messages_sent += 1;
    }

    /// Time since the last inbound activity
    pub fn idle_for(&self) -> std::time::Duration {
        self.activity.lock().last_activity.elapsed()
    }

    /// Queue a frame without blocking; a full or closed queue is an error
    /// so slow or dead clients never stall the caller
    pub fn try_send(&self, frame: Outbound) -> Result<(), ()> {
        self.outbound.try_send(frame).map_err(|_| ())
    }

    /// Queue a frame, waiting for queue space
    pub async fn send(&self, frame: Outbound) -> Result<(), ()> {
        self.outbound.send(frame).await.map_err(|_| ())
    }

    /// Client metadata exposed to event pipelines and broadcast conditions
    pub fn snapshot(&self) -> Value {
        let activity = self.activity.lock();
        json!({
            "client_id": self.client_id,
            "endpoint": self.endpoint,
            "remote_addr": self.remote_addr,
            "auth": self.auth,
            "connected_at": self
                .connected_at
                .format(&Rfc3339)
                .unwrap_or_else(|_| self.connected_at.to_string()),
            "messages_received": activity.messages_received,
            "messages_sent": activity.messages_sent,
            "bytes_received": activity.bytes_received,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn connection() -> (LiveConnection, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(4);
        let conn = LiveConnection::new(
            "feed",
            "127.0.0.1:50000",
            AuthOutcome {
                method: "none",
                verified: false,
            },
            tx,
        );
        (conn, rx)
    }

    #[test]
    fn test_window_throttles_above_limit() {
        let (conn, _rx) = connection();
        for _ in 0..3 {
            assert_eq!(conn.record_inbound(10, 3), RateDecision::Allowed);
        }
        assert_eq!(conn.record_inbound(10, 3), RateDecision::Throttled);

        // Throttled messages are not counted as received
        let snapshot = conn.snapshot();
        assert_eq!(snapshot["messages_received"], serde_json::json!(3));
        assert_eq!(snapshot["bytes_received"], serde_json::json!(30));
    }

    #[test]
    fn test_try_send_fails_when_queue_full() {
        let (conn, mut rx) = connection();
        for _ in 0..4 {
            conn.try_send(Outbound::Ping).unwrap();
        }
        assert!(conn.try_send(Outbound::Ping).is_err());

        rx.close();
        assert!(conn.try_send(Outbound::Ping).is_err());
    }

    #[test]
    fn test_snapshot_shape() {
        let (conn, _rx) = connection();
        let snapshot = conn.snapshot();
        assert_eq!(snapshot["endpoint"], serde_json::json!("feed"));
        assert_eq!(snapshot["auth"]["method"], serde_json::json!("none"));
        assert!(snapshot["client_id"].as_str().unwrap().len() == 36);
    }
}
