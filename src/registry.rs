//! Endpoint registry
//!
//! Single source of truth for live endpoints: a name-keyed map behind one
//! async lock, plus write-through persistence so a restart can restore every
//! endpoint that was running. Start is idempotent by replacement: starting a
//! name that already exists stops the old listener first, so the port is
//! free before the new bind.

use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use serde_json::{Value, json};
use time::OffsetDateTime;
use tokio::sync::{Mutex, OnceCell};
use tracing::{error, info, warn};

use crate::auth::{AuthScheme, sign_payload};
use crate::config::store::ConfigStore;
use crate::config::{EndpointConfig, EndpointKind, EndpointStatus};
use crate::endpoints::{
    BroadcastFilter, BroadcastOutcome, Endpoint, HttpEndpoint, WsClientEndpoint, WsServerEndpoint,
};
use crate::errors::gateway_error::{GatewayError, GatewayResult};
use crate::tools::ToolRegistry;

/// Registry of live endpoints with write-through persistence
pub struct EndpointRegistry {
    endpoints: Mutex<HashMap<String, Endpoint>>,
    store: ConfigStore,
    tools: Arc<ToolRegistry>,
    restored: OnceCell<usize>,
}

impl EndpointRegistry {
    pub fn new(state_dir: impl AsRef<Path>, tools: Arc<ToolRegistry>) -> Self {
        Self {
            endpoints: Mutex::new(HashMap::new()),
            store: ConfigStore::new(state_dir.as_ref()),
            tools,
            restored: OnceCell::new(),
        }
    }

    pub fn tools(&self) -> &Arc<ToolRegistry> {
        &self.tools
    }

    /// Start an endpoint from its config.
    ///
    /// Validates first, replaces any endpoint already registered under the
    /// name (graceful stop, which frees the port before the new bind), and
    /// persists the config before returning. A bind failure leaves no
    /// registry entry and nothing persisted.
    pub async fn start(&self, mut config: EndpointConfig) -> GatewayResult<Value> {
        config.validate()?;

        let mut endpoints = self.endpoints.lock().await;
        if let Some(existing) = endpoints.remove(&config.name) {
            info!(endpoint = %config.name, "Replacing existing endpoint");
            existing.stop().await;
            // The replaced endpoint may be of a different kind; drop its
            // stale file so only one persisted copy exists per name
            if existing.config().kind != config.kind {
                let _ = self.store.delete(&config.name, existing.config().kind);
            }
        }

        if config.created_at.is_none() {
            config.created_at = Some(OffsetDateTime::now_utc());
        }
        config.status = EndpointStatus::Running;

        let endpoint = launch(config.clone(), self.tools.clone()).await?;
        if let Err(e) = self.store.save(&config) {
            // A failed persist must not leave an orphaned listener serving
            // with no registry entry
            endpoint.stop().await;
            return Err(GatewayError::persistence(&config.name, e));
        }

        let summary = endpoint.summary();
        endpoints.insert(config.name.clone(), endpoint);
        info!(endpoint = %config.name, kind = %config.kind, "Endpoint started");
        Ok(summary)
    }

    /// Stop an endpoint and remove its persisted config
    pub async fn stop(&self, name: &str) -> GatewayResult<()> {
        let endpoint = {
            let mut endpoints = self.endpoints.lock().await;
            endpoints
                .remove(name)
                .ok_or_else(|| GatewayError::EndpointNotFound(name.to_string()))?
        };
        endpoint.stop().await;
        self.store
            .delete(name, endpoint.config().kind)
            .map_err(|e| GatewayError::persistence(name, e))?;
        info!(endpoint = %name, "Endpoint stopped");
        Ok(())
    }

    /// Summaries of all registered endpoints, secrets masked
    pub async fn list(&self) -> Vec<Value> {
        let endpoints = self.endpoints.lock().await;
        let mut summaries: Vec<Value> = endpoints.values().map(Endpoint::summary).collect();
        summaries.sort_by(|a, b| a["name"].as_str().cmp(&b["name"].as_str()));
        summaries
    }

    /// Status of one endpoint, optionally with metrics and connections
    pub async fn status(
        &self,
        name: &str,
        include_metrics: bool,
        include_connections: bool,
    ) -> GatewayResult<Value> {
        let endpoints = self.endpoints.lock().await;
        let endpoint = endpoints
            .get(name)
            .ok_or_else(|| GatewayError::EndpointNotFound(name.to_string()))?;

        let masked = endpoint.config().masked();
        let mut status = json!({
            "name": name,
            "kind": masked.kind,
            "status": endpoint.status(),
            "config": serde_json::to_value(&masked)
                .map_err(|e| GatewayError::Internal(e.to_string()))?,
        });
        if include_metrics {
            status["metrics"] = endpoint.metrics();
        }
        if include_connections {
            status["connections"] = Value::Array(endpoint.connections());
        }
        Ok(status)
    }

    /// Restore persisted endpoints, once per process.
    ///
    /// A config that fails to start is logged and its file deleted so the
    /// next restart does not trip over it again. Returns the number of
    /// endpoints restored (the first call's count on repeat calls).
    pub async fn restore_all(&self) -> usize {
        *self
            .restored
            .get_or_init(|| async {
                let mut restored = 0;
                for config in self.store.load_all() {
                    let name = config.name.clone();
                    let kind = config.kind;
                    info!(endpoint = %name, kind = %kind, "Restoring endpoint");
                    match self.start(config).await {
                        Ok(_) => restored += 1,
                        Err(e) => {
                            error!(endpoint = %name, error = %e, "Restore failed, removing stale config");
                            let _ = self.store.delete(&name, kind);
                        }
                    }
                }
                info!(count = restored, "Restore complete");
                restored
            })
            .await
    }

    /// Deliver a test payload through an endpoint's real network path.
    ///
    /// HTTP endpoints get a loopback POST with the endpoint's own auth
    /// attached; ws-server endpoints broadcast the payload; ws-client
    /// endpoints send it through the live connection.
    pub async fn test(&self, name: &str, payload: Value) -> GatewayResult<Value> {
        let endpoint = {
            let endpoints = self.endpoints.lock().await;
            endpoints
                .get(name)
                .cloned()
                .ok_or_else(|| GatewayError::EndpointNotFound(name.to_string()))?
        };

        match &endpoint {
            Endpoint::Http(_) => self.test_http(&endpoint, payload).await,
            Endpoint::WsServer(_) => {
                let outcome = endpoint
                    .broadcast(payload, BroadcastFilter::default())
                    .await?;
                Ok(json!({"delivery": "broadcast", "result": outcome}))
            }
            Endpoint::WsClient(_) => {
                endpoint.client_send(payload).await?;
                Ok(json!({"delivery": "client_send", "result": "sent"}))
            }
        }
    }

    async fn test_http(&self, endpoint: &Endpoint, payload: Value) -> GatewayResult<Value> {
        let config = endpoint.config();
        let body =
            serde_json::to_vec(&payload).map_err(|e| GatewayError::Internal(e.to_string()))?;
        let scheme = if config.is_tls_enabled() { "https" } else { "http" };
        let url = format!(
            "{scheme}://127.0.0.1:{}{}",
            config.port,
            config.path
        );

        let client = reqwest::Client::builder()
            // Loopback delivery to our own listener; the cert is typically
            // self-signed
            .danger_accept_invalid_certs(true)
            .build()
            .map_err(|e| GatewayError::transport(&config.name, e))?;

        let mut request = client
            .post(&url)
            .header("content-type", "application/json")
            .body(body.clone());
        request = match &config.auth {
            AuthScheme::None => request,
            AuthScheme::BearerToken { token } => {
                request.header("authorization", format!("Bearer {}", token.expose()))
            }
            AuthScheme::QueryParam { name, token } => {
                request.query(&[(name.as_str(), token.expose())])
            }
            AuthScheme::Header { name, token } => request.header(name.as_str(), token.expose()),
            AuthScheme::GithubSignature { secret } => {
                let signature = sign_payload(secret, &body)?;
                request.header(crate::auth::SIGNATURE_HEADER, signature)
            }
        };

        let response = request
            .send()
            .await
            .map_err(|e| GatewayError::transport(&config.name, e))?;
        let status = response.status().as_u16();
        let text = response
            .text()
            .await
            .map_err(|e| GatewayError::transport(&config.name, e))?;
        let body: Value = serde_json::from_str(&text).unwrap_or(Value::String(text));

        Ok(json!({"delivery": "http", "status": status, "response": body}))
    }

    /// Broadcast to a ws-server endpoint's clients
    pub async fn broadcast(
        &self,
        name: &str,
        message: Value,
        filter: BroadcastFilter,
    ) -> GatewayResult<BroadcastOutcome> {
        let endpoint = {
            let endpoints = self.endpoints.lock().await;
            endpoints
                .get(name)
                .cloned()
                .ok_or_else(|| GatewayError::EndpointNotFound(name.to_string()))?
        };
        endpoint.broadcast(message, filter).await
    }

    /// Send through a ws-client endpoint's live connection
    pub async fn client_send(&self, name: &str, message: Value) -> GatewayResult<()> {
        let endpoint = {
            let endpoints = self.endpoints.lock().await;
            endpoints
                .get(name)
                .cloned()
                .ok_or_else(|| GatewayError::EndpointNotFound(name.to_string()))?
        };
        endpoint.client_send(message).await
    }

    /// Stop every endpoint without touching persisted configs, so the next
    /// process restores them
    pub async fn shutdown_all(&self) {
        let endpoints: Vec<Endpoint> = {
            let mut map = self.endpoints.lock().await;
            map.drain().map(|(_, endpoint)| endpoint).collect()
        };
        for endpoint in endpoints {
            let name = endpoint.name().to_string();
            endpoint.stop().await;
            info!(endpoint = %name, "Endpoint stopped for shutdown");
        }
    }
}

/// Bind/connect the endpoint for its kind
async fn launch(config: EndpointConfig, tools: Arc<ToolRegistry>) -> GatewayResult<Endpoint> {
    match config.kind {
        EndpointKind::Http => Ok(Endpoint::Http(HttpEndpoint::start(config, tools).await?)),
        EndpointKind::WsServer => Ok(Endpoint::WsServer(
            WsServerEndpoint::start(config, tools).await?,
        )),
        EndpointKind::WsClient => Ok(Endpoint::WsClient(WsClientEndpoint::start(config, tools)?)),
    }
}
