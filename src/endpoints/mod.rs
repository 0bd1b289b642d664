//! Live endpoint implementations
//!
//! One module per endpoint kind plus the shared connection state. The
//! registry holds an [`Endpoint`] handle per name and dispatches operations
//! through it; kind-specific operations on the wrong kind fail with
//! `UnsupportedOperation`.

pub mod connection;
pub mod http;
pub mod ws_client;
pub mod ws_server;

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::debug;

use crate::config::{EndpointConfig, EndpointStatus};
use crate::errors::gateway_error::{GatewayError, GatewayResult};
use crate::expr;

pub use connection::{LiveConnection, Outbound, RateDecision};
pub use http::HttpEndpoint;
pub use ws_client::WsClientEndpoint;
pub use ws_server::WsServerEndpoint;

/// Client selection for a broadcast
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BroadcastFilter {
    /// Only these client ids (empty = all)
    #[serde(default)]
    pub include: Vec<String>,
    /// Never these client ids
    #[serde(default)]
    pub exclude: Vec<String>,
    /// Expression over `client.*` metadata; absent values are falsy
    #[serde(default)]
    pub condition: Option<String>,
}

impl BroadcastFilter {
    /// Decide whether a client receives the broadcast.
    ///
    /// A condition that fails to evaluate excludes the client rather than
    /// failing the whole broadcast.
    pub fn admits(&self, client_id: &str, metadata: &Value) -> bool {
        if !self.include.is_empty() && !self.include.iter().any(|id| id == client_id) {
            return false;
        }
        if self.exclude.iter().any(|id| id == client_id) {
            return false;
        }
        if let Some(condition) = &self.condition {
            let mut ctx = Map::new();
            ctx.insert("client".to_string(), metadata.clone());
            return match expr::evaluate_condition(condition, &ctx) {
                Ok(admitted) => admitted,
                Err(e) => {
                    debug!(client_id = %client_id, error = %e, "Broadcast condition failed, excluding client");
                    false
                }
            };
        }
        true
    }
}

/// Delivery counts for a broadcast
#[derive(Debug, Clone, Copy, Default, Serialize, PartialEq, Eq)]
pub struct BroadcastOutcome {
    pub sent: usize,
    pub failed: usize,
    /// Connections that matched the filter
    pub total: usize,
}

/// Handle to a running endpoint, held by the registry
#[derive(Clone)]
pub enum Endpoint {
    Http(Arc<HttpEndpoint>),
    WsServer(Arc<WsServerEndpoint>),
    WsClient(Arc<WsClientEndpoint>),
}

impl Endpoint {
    pub fn config(&self) -> &EndpointConfig {
        match self {
            Self::Http(e) => e.config(),
            Self::WsServer(e) => e.config(),
            Self::WsClient(e) => e.config(),
        }
    }

    pub fn name(&self) -> &str {
        &self.config().name
    }

    pub fn status(&self) -> EndpointStatus {
        match self {
            Self::Http(e) => e.status(),
            Self::WsServer(e) => e.status(),
            Self::WsClient(e) => e.status(),
        }
    }

    /// Stop accepting, drain, release resources
    pub async fn stop(&self) {
        match self {
            Self::Http(e) => e.stop().await,
            Self::WsServer(e) => e.stop().await,
            Self::WsClient(e) => e.stop().await,
        }
    }

    /// Counters for status display
    pub fn metrics(&self) -> Value {
        match self {
            Self::Http(e) => e.metrics(),
            Self::WsServer(e) => e.metrics(),
            Self::WsClient(e) => e.metrics(),
        }
    }

    /// Snapshots of open connections (ws-server only, empty otherwise)
    pub fn connections(&self) -> Vec<Value> {
        match self {
            Self::WsServer(e) => e.connection_snapshots(),
            _ => Vec::new(),
        }
    }

    /// Fan a message out to matching ws-server clients
    pub async fn broadcast(
        &self,
        message: Value,
        filter: BroadcastFilter,
    ) -> GatewayResult<BroadcastOutcome> {
        match self {
            Self::WsServer(e) => Ok(e.broadcast(message, filter).await),
            _ => Err(GatewayError::UnsupportedOperation {
                operation: "broadcast".to_string(),
                kind: self.config().kind.to_string(),
            }),
        }
    }

    /// Push a message through a ws-client's live connection
    pub async fn client_send(&self, message: Value) -> GatewayResult<()> {
        match self {
            Self::WsClient(e) => e.send(message).await,
            _ => Err(GatewayError::UnsupportedOperation {
                operation: "send".to_string(),
                kind: self.config().kind.to_string(),
            }),
        }
    }

    /// One-line summary for list display, secrets masked
    pub fn summary(&self) -> Value {
        let config = self.config();
        json!({
            "name": config.name,
            "kind": config.kind,
            "status": self.status(),
            "address": match config.kind {
                crate::config::EndpointKind::WsClient => config.url.clone().unwrap_or_default(),
                _ => config.address(),
            },
            "path": config.path,
            "auth": config.auth.kind_name(),
            "created_at": config.created_at.and_then(|t| {
                t.format(&time::format_description::well_known::Rfc3339).ok()
            }),
        })
    }
}
