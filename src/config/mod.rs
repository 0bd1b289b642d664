//! Endpoint and gateway configuration types
//!
//! This module defines the schema for endpoint configurations that users
//! provide to create live HTTP/WebSocket endpoints. The definitions are
//! serde-serializable for YAML and JSON support; defaults are applied once
//! at load time and everything is validated before any listener is bound.

pub mod store;

use std::collections::HashMap;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use time::OffsetDateTime;

use crate::auth::AuthScheme;

/// Default bind host for inbound endpoints
fn default_bind_host() -> String {
    "127.0.0.1".to_string()
}

/// Default request path for inbound endpoints
fn default_path() -> String {
    "/".to_string()
}

/// Default HTTP response status
const fn default_response_status() -> u16 {
    200
}

/// Default overall pipeline timeout (seconds)
const fn default_pipeline_timeout_secs() -> u64 {
    30
}

/// Default heartbeat interval (seconds)
const fn default_heartbeat_secs() -> u64 {
    30
}

/// Default idle timeout before a connection is reaped (seconds)
const fn default_idle_timeout_secs() -> u64 {
    300
}

/// Default maximum concurrent connections per WebSocket endpoint
const fn default_max_connections() -> usize {
    100
}

/// Default per-connection message budget per rolling minute
const fn default_messages_per_minute() -> u32 {
    60
}

/// Default reconnect base delay for outbound clients (milliseconds)
const fn default_reconnect_base_ms() -> u64 {
    1000
}

/// Default maximum reconnect attempts before the client is marked failed
const fn default_max_reconnect_attempts() -> u32 {
    5
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Error type for configuration validation and parsing
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ConfigError {
    #[error("Failed to parse endpoint config: {0}")]
    ParseError(String),

    #[error("Missing required field: {0}")]
    MissingField(String),

    #[error("Invalid field '{field}': {message}")]
    InvalidField { field: String, message: String },

    #[error("Invalid endpoint name '{0}': must be non-empty, alphanumeric with '-' or '_'")]
    InvalidName(String),

    #[error("Port {0} is out of range (1-65535)")]
    PortOutOfRange(u32),

    #[error("Unknown event handler '{0}' (expected on_connect, on_message or on_disconnect)")]
    UnknownEventHandler(String),
}

impl ConfigError {
    pub fn invalid(field: impl Into<String>, message: impl std::fmt::Display) -> Self {
        Self::InvalidField {
            field: field.into(),
            message: message.to_string(),
        }
    }
}

/// Endpoint flavor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum EndpointKind {
    /// Inbound HTTP listener (webhook receiver)
    Http,
    /// Inbound WebSocket listener
    WsServer,
    /// Outbound WebSocket client
    WsClient,
}

impl EndpointKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::WsServer => "ws-server",
            Self::WsClient => "ws-client",
        }
    }

    /// Per-kind directory for persisted configs
    pub fn store_dir(&self) -> &'static str {
        match self {
            Self::Http => "webhook",
            Self::WsServer | Self::WsClient => "websocket",
        }
    }
}

impl std::fmt::Display for EndpointKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum EndpointStatus {
    /// Connecting in the background (ws-client endpoints; inbound
    /// endpoints bind synchronously and go straight to Running)
    Starting,
    Running,
    #[default]
    Stopped,
    Failed,
}

impl std::fmt::Display for EndpointStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Starting => "starting",
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Failed => "failed",
        };
        f.write_str(s)
    }
}

/// One pipeline step: a tool invocation with templated params
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct StepConfig {
    /// Tool name, resolved through the registry at invocation time
    pub tool: String,
    /// Params object; string scalars may embed `{! !}` / `[! !]` expressions
    #[serde(default)]
    pub params: Value,
    /// Context key the step result is stored under
    pub output: String,
}

/// An HTML route served by an HTTP endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HtmlRoute {
    /// URL pattern with `{name}` path segments, e.g. `/users/{id}`
    pub url_pattern: String,
    /// HTML template file; `{{placeholder}}` markers are replaced
    pub template_file: PathBuf,
    /// Pipeline run before rendering
    #[serde(default)]
    pub pipeline: Vec<StepConfig>,
    /// Placeholder name -> template string evaluated against the context
    #[serde(default)]
    pub placeholder_map: HashMap<String, String>,
}

/// TLS settings for an inbound endpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TlsConfig {
    #[serde(default)]
    pub enabled: bool,
    pub cert_file: PathBuf,
    pub key_file: PathBuf,
}

/// Connection behavior for WebSocket endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ConnectionPolicy {
    /// Ping cadence (seconds)
    #[serde(default = "default_heartbeat_secs")]
    pub heartbeat_interval_secs: u64,
    /// Close connections idle longer than this (seconds)
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Maximum concurrent connections
    #[serde(default = "default_max_connections")]
    pub max_connections: usize,
    /// Per-connection message budget within one rolling minute
    #[serde(default = "default_messages_per_minute")]
    pub messages_per_minute: u32,
    /// Extra messages tolerated above the per-minute budget
    #[serde(default)]
    pub burst: u32,
}

impl Default for ConnectionPolicy {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: default_heartbeat_secs(),
            idle_timeout_secs: default_idle_timeout_secs(),
            max_connections: default_max_connections(),
            messages_per_minute: default_messages_per_minute(),
            burst: 0,
        }
    }
}

impl ConnectionPolicy {
    /// Effective per-window message limit
    pub fn window_limit(&self) -> u32 {
        self.messages_per_minute.saturating_add(self.burst)
    }
}

/// Backoff shape for outbound client reconnection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Fixed,
    Linear,
    #[default]
    Exponential,
}

/// Reconnect policy for `ws-client` endpoints
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectPolicy {
    #[serde(default)]
    pub strategy: BackoffStrategy,
    #[serde(default = "default_reconnect_base_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            strategy: BackoffStrategy::Exponential,
            base_delay_ms: default_reconnect_base_ms(),
            max_attempts: default_max_reconnect_attempts(),
        }
    }
}

impl ReconnectPolicy {
    /// Delay before reconnect attempt `attempt` (1-based)
    pub fn delay(&self, attempt: u32) -> std::time::Duration {
        let attempt = attempt.max(1);
        let millis = match self.strategy {
            BackoffStrategy::Fixed => self.base_delay_ms,
            BackoffStrategy::Linear => self.base_delay_ms.saturating_mul(attempt as u64),
            BackoffStrategy::Exponential => self
                .base_delay_ms
                .saturating_mul(1u64 << (attempt - 1).min(16)),
        };
        std::time::Duration::from_millis(millis)
    }
}

/// Complete configuration for one named endpoint.
///
/// Persisted as-is (secrets included; the restore path needs them). Display
/// paths use [`EndpointConfig::masked`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EndpointConfig {
    /// Unique name across all endpoint kinds
    pub name: String,
    pub kind: EndpointKind,

    /// Bind host for inbound endpoints
    #[serde(default = "default_bind_host")]
    pub bind_host: String,
    /// Listen port for inbound endpoints
    #[serde(default)]
    pub port: u16,
    /// Request path for inbound endpoints
    #[serde(default = "default_path")]
    pub path: String,
    /// Target URL for `ws-client` endpoints
    #[serde(default)]
    pub url: Option<String>,

    #[serde(default)]
    pub auth: AuthScheme,
    #[serde(default)]
    pub tls: Option<TlsConfig>,

    /// Response body template with embedded expressions, evaluated per event
    #[serde(default)]
    pub response_template: Option<Value>,
    /// HTTP response status (http endpoints)
    #[serde(default = "default_response_status")]
    pub response_status: u16,
    /// Extra response headers (http endpoints)
    #[serde(default)]
    pub response_headers: HashMap<String, String>,
    /// Respond immediately (202), run the pipeline after the flush
    #[serde(default)]
    pub async_mode: bool,

    /// Main pipeline, run per request/message
    #[serde(default)]
    pub pipeline: Vec<StepConfig>,
    /// Overall per-invocation pipeline timeout (seconds)
    #[serde(default = "default_pipeline_timeout_secs")]
    pub pipeline_timeout_secs: u64,

    /// HTML routes (http endpoints only)
    #[serde(default)]
    pub html_routes: Vec<HtmlRoute>,
    /// Event pipelines (`on_connect`/`on_message`/`on_disconnect`)
    #[serde(default)]
    pub event_handlers: HashMap<String, Vec<StepConfig>>,

    #[serde(default)]
    pub connection_policy: ConnectionPolicy,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,

    #[serde(default, with = "time::serde::rfc3339::option")]
    pub created_at: Option<OffsetDateTime>,
    #[serde(default)]
    pub status: EndpointStatus,
}

/// Event handler names accepted in `event_handlers`
pub const EVENT_HANDLER_NAMES: [&str; 3] = ["on_connect", "on_message", "on_disconnect"];

impl EndpointConfig {
    /// Minimal config for the given name and kind, defaults everywhere else
    pub fn new(name: impl Into<String>, kind: EndpointKind) -> Self {
        serde_json::from_value(serde_json::json!({
            "name": name.into(),
            "kind": kind,
        }))
        .expect("minimal config deserializes")
    }

    /// Parse from a JSON or YAML string (JSON is valid YAML, so a single
    /// YAML parse covers both)
    pub fn parse(text: &str) -> ConfigResult<Self> {
        serde_yaml::from_str(text).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Validate before any listener is touched
    pub fn validate(&self) -> ConfigResult<()> {
        if self.name.is_empty()
            || !self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
        {
            return Err(ConfigError::InvalidName(self.name.clone()));
        }

        match self.kind {
            EndpointKind::Http | EndpointKind::WsServer => {
                if self.port == 0 {
                    return Err(ConfigError::PortOutOfRange(self.port as u32));
                }
                if !self.path.starts_with('/') {
                    return Err(ConfigError::invalid("path", "must start with '/'"));
                }
            }
            EndpointKind::WsClient => {
                let url = self
                    .url
                    .as_deref()
                    .ok_or_else(|| ConfigError::MissingField("url".to_string()))?;
                if !(url.starts_with("ws://") || url.starts_with("wss://")) {
                    return Err(ConfigError::invalid("url", "must be a ws:// or wss:// URL"));
                }
                url::Url::parse(url).map_err(|e| ConfigError::invalid("url", e))?;
            }
        }

        if matches!(self.auth, AuthScheme::GithubSignature { .. })
            && self.kind != EndpointKind::Http
        {
            return Err(ConfigError::invalid(
                "auth",
                "github_signature requires a request body and only applies to http endpoints",
            ));
        }

        if let Some(tls) = &self.tls
            && tls.enabled
            && self.kind == EndpointKind::WsClient
        {
            return Err(ConfigError::invalid(
                "tls",
                "listener TLS does not apply to ws-client endpoints (use wss:// in url)",
            ));
        }

        if !self.html_routes.is_empty() && self.kind != EndpointKind::Http {
            return Err(ConfigError::invalid(
                "html_routes",
                "only http endpoints serve HTML routes",
            ));
        }
        for route in &self.html_routes {
            if !route.url_pattern.starts_with('/') {
                return Err(ConfigError::invalid(
                    "html_routes",
                    "pattern must start with '/'",
                ));
            }
        }

        for name in self.event_handlers.keys() {
            if !EVENT_HANDLER_NAMES.contains(&name.as_str()) {
                return Err(ConfigError::UnknownEventHandler(name.clone()));
            }
        }
        if !self.event_handlers.is_empty() && self.kind == EndpointKind::Http {
            return Err(ConfigError::invalid(
                "event_handlers",
                "event handlers only apply to websocket endpoints",
            ));
        }

        if self.connection_policy.heartbeat_interval_secs == 0 {
            return Err(ConfigError::invalid(
                "connection_policy.heartbeat_interval_secs",
                "must be positive",
            ));
        }
        if self.connection_policy.messages_per_minute == 0 {
            return Err(ConfigError::invalid(
                "connection_policy.messages_per_minute",
                "must be positive",
            ));
        }

        Ok(())
    }

    /// Whether TLS is enabled for this endpoint
    pub fn is_tls_enabled(&self) -> bool {
        self.tls.as_ref().map(|t| t.enabled).unwrap_or(false)
    }

    /// Bind address string
    pub fn address(&self) -> String {
        format!("{}:{}", self.bind_host, self.port)
    }

    /// Event pipeline by name, empty slice when unset
    pub fn event_pipeline(&self, event: &str) -> &[StepConfig] {
        self.event_handlers
            .get(event)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Copy with secrets masked, for list/status display only
    pub fn masked(&self) -> Self {
        let mut masked = self.clone();
        masked.auth = self.auth.masked();
        masked
    }
}

/// Top-level gateway (control-plane) configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    /// Control-plane bind host
    #[serde(default = "default_bind_host")]
    pub host: String,
    /// Control-plane port
    #[serde(default = "default_control_port")]
    pub port: u16,
    /// Directory for persisted endpoint configs
    #[serde(default = "default_state_dir")]
    pub state_dir: PathBuf,
    /// Optional bearer secret protecting the control-plane API
    #[serde(default)]
    pub control_token: Option<crate::auth::Secret>,
    /// Control-plane rate limit (requests per second)
    #[serde(default = "default_rate_limit_rps")]
    pub rate_limit_requests_per_second: u32,
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst_size: u32,
    /// Comma-separated allowed origins, or "*"
    #[serde(default)]
    pub cors_allowed_origins: Option<String>,
}

const fn default_control_port() -> u16 {
    7410
}

fn default_state_dir() -> PathBuf {
    PathBuf::from(".fluxgate")
}

const fn default_rate_limit_rps() -> u32 {
    60
}

const fn default_rate_limit_burst() -> u32 {
    10
}

impl Default for GatewayConfig {
    fn default() -> Self {
        serde_json::from_value(serde_json::json!({})).expect("defaults deserialize")
    }
}

impl GatewayConfig {
    /// Load from a YAML file
    pub fn from_file(path: &std::path::Path) -> ConfigResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::ParseError(format!("{}: {e}", path.display())))?;
        serde_yaml::from_str(&text).map_err(|e| ConfigError::ParseError(e.to_string()))
    }

    /// Load from environment variables, falling back to defaults
    pub fn from_env() -> ConfigResult<Self> {
        let mut config = Self::default();
        if let Ok(host) = std::env::var("FLUXGATE_HOST") {
            config.host = host;
        }
        if let Ok(port) = std::env::var("FLUXGATE_PORT") {
            config.port = port
                .parse()
                .map_err(|e| ConfigError::invalid("FLUXGATE_PORT", e))?;
        }
        if let Ok(dir) = std::env::var("FLUXGATE_STATE_DIR") {
            config.state_dir = PathBuf::from(dir);
        }
        if let Ok(token) = std::env::var("FLUXGATE_CONTROL_TOKEN") {
            config.control_token = Some(crate::auth::Secret::new(token));
        }
        Ok(config)
    }

    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}
