//! Gateway error umbrella
//!
//! Centralized error handling for the endpoint gateway. Component-level
//! errors (expression, tool, pipeline, config) are defined next to their
//! modules and converge here for the control-plane API surface.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::config::ConfigError;
use crate::errors::auth_error::AuthError;
use crate::expr::ExpressionError;
use crate::pipeline::PipelineError;
use crate::tools::ToolError;

/// Result type for gateway operations
pub type GatewayResult<T> = Result<T, GatewayError>;

/// Comprehensive error type for the endpoint gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    // ─────────────────────────────────────────────────────────────────────────
    // Configuration / lookup
    // ─────────────────────────────────────────────────────────────────────────
    /// Endpoint configuration rejected before any listener was touched
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// No endpoint registered under this name
    #[error("Endpoint not found: {0}")]
    EndpointNotFound(String),

    /// Operation does not apply to this endpoint kind
    /// (e.g. broadcast on an HTTP endpoint)
    #[error("Operation '{operation}' not supported for endpoint kind '{kind}'")]
    UnsupportedOperation { operation: String, kind: String },

    // ─────────────────────────────────────────────────────────────────────────
    // Boundary / runtime
    // ─────────────────────────────────────────────────────────────────────────
    /// Authentication failure at the boundary
    #[error(transparent)]
    Auth(#[from] AuthError),

    /// Template or parameter expression failed to evaluate
    #[error(transparent)]
    Expression(#[from] ExpressionError),

    /// Tool invocation failure surfaced from the registry
    #[error(transparent)]
    Tool(#[from] ToolError),

    /// Pipeline-level failure (step error or overall timeout)
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    // ─────────────────────────────────────────────────────────────────────────
    // Transport
    // ─────────────────────────────────────────────────────────────────────────
    /// Listener bind failure
    #[error("Failed to bind {address} for endpoint '{endpoint}': {error}")]
    BindError {
        endpoint: String,
        address: String,
        error: String,
    },

    /// TLS setup or handshake failure
    #[error("TLS error for endpoint '{endpoint}': {error}")]
    TlsError { endpoint: String, error: String },

    /// Send on a closed or broken connection
    #[error("Transport error for endpoint '{endpoint}': {error}")]
    TransportError { endpoint: String, error: String },

    /// Persisted config could not be written or removed
    #[error("Persistence error for endpoint '{endpoint}': {error}")]
    PersistenceError { endpoint: String, error: String },

    /// Internal error (should not occur in normal operation)
    #[error("Internal gateway error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// Create a transport error
    pub fn transport(endpoint: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::TransportError {
            endpoint: endpoint.into(),
            error: error.to_string(),
        }
    }

    /// Create a bind error
    pub fn bind(
        endpoint: impl Into<String>,
        address: impl Into<String>,
        error: impl std::fmt::Display,
    ) -> Self {
        Self::BindError {
            endpoint: endpoint.into(),
            address: address.into(),
            error: error.to_string(),
        }
    }

    /// Create a persistence error
    pub fn persistence(endpoint: impl Into<String>, error: impl std::fmt::Display) -> Self {
        Self::PersistenceError {
            endpoint: endpoint.into(),
            error: error.to_string(),
        }
    }

    /// Check if this error was rejected synchronously before any listener
    /// was bound
    pub fn is_config_error(&self) -> bool {
        matches!(self, Self::Config(_) | Self::UnsupportedOperation { .. })
    }

    /// HTTP status for the control-plane API
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Config(_) | Self::UnsupportedOperation { .. } => StatusCode::BAD_REQUEST,
            Self::EndpointNotFound(_) => StatusCode::NOT_FOUND,
            Self::Auth(e) => e.status_code(),
            Self::BindError { .. } => StatusCode::CONFLICT,
            Self::Expression(_) | Self::Tool(_) | Self::Pipeline(_) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = axum::Json(serde_json::json!({
            "success": false,
            "error": self.to_string(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bind_error_display() {
        let err = GatewayError::bind("hooks", "127.0.0.1:8080", "address in use");
        assert_eq!(
            err.to_string(),
            "Failed to bind 127.0.0.1:8080 for endpoint 'hooks': address in use"
        );
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
    }

    #[test]
    fn test_not_found_status() {
        let err = GatewayError::EndpointNotFound("missing".to_string());
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn test_config_error_classification() {
        let err = GatewayError::UnsupportedOperation {
            operation: "broadcast".to_string(),
            kind: "http".to_string(),
        };
        assert!(err.is_config_error());
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
    }
}
