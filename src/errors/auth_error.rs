//! Authentication error types
//!
//! Auth failures are rejected at the boundary (HTTP request or WebSocket
//! upgrade) and never reach the pipeline. Responses are constant-shape so
//! the body does not leak which check failed.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

/// Result type for authentication operations
pub type AuthResult<T> = Result<T, AuthError>;

/// Error type for endpoint authentication
#[derive(Error, Debug, Clone, PartialEq)]
pub enum AuthError {
    /// No credential was supplied where one is required
    #[error("Missing credentials")]
    MissingCredentials,

    /// Credential was supplied but malformed (e.g. non-UTF8 header)
    #[error("Invalid authorization header")]
    InvalidAuthHeader,

    /// Credential did not match the configured secret
    #[error("Unauthorized")]
    Unauthorized,

    /// Signature header present but the HMAC did not verify
    #[error("Invalid signature")]
    InvalidSignature,

    /// Auth scheme is not usable for this endpoint kind
    #[error("Auth configuration error: {0}")]
    ConfigError(String),
}

impl AuthError {
    /// HTTP status for this failure.
    ///
    /// Missing credentials map to 401, everything else to 403.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::MissingCredentials | Self::InvalidAuthHeader => StatusCode::UNAUTHORIZED,
            Self::Unauthorized | Self::InvalidSignature => StatusCode::FORBIDDEN,
            Self::ConfigError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        // Constant-shape body: same fields regardless of which check failed
        let body = axum::Json(serde_json::json!({
            "error": "authentication failed",
            "status": status.as_u16(),
        }));
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_codes() {
        assert_eq!(
            AuthError::MissingCredentials.status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(AuthError::Unauthorized.status_code(), StatusCode::FORBIDDEN);
        assert_eq!(
            AuthError::InvalidSignature.status_code(),
            StatusCode::FORBIDDEN
        );
    }

    #[test]
    fn test_display() {
        assert_eq!(AuthError::Unauthorized.to_string(), "Unauthorized");
    }
}
