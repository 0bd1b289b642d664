//! Control-plane authentication middleware
//!
//! Protects the management API with an optional bearer secret. When no
//! control token is configured the middleware passes everything through.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::middleware::Next;
use axum::response::Response;
use tracing::debug;

use crate::errors::auth_error::AuthError;
use crate::state::AppState;

/// Extract the presented token from the Authorization header or, for
/// clients that cannot set headers, the `token` query parameter
fn extract_token(request: &Request) -> Result<String, AuthError> {
    if let Some(header) = request.headers().get("authorization") {
        let value = header.to_str().map_err(|_| AuthError::InvalidAuthHeader)?;
        return value
            .strip_prefix("Bearer ")
            .map(str::to_string)
            .ok_or(AuthError::InvalidAuthHeader);
    }

    if let Some(query) = request.uri().query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            if key == "token" {
                return Ok(value.into_owned());
            }
        }
    }

    Err(AuthError::MissingCredentials)
}

/// Validate the control-plane bearer secret, if one is configured
pub async fn control_auth_middleware(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Result<Response, AuthError> {
    let Some(expected) = &state.config.control_token else {
        return Ok(next.run(request).await);
    };

    let presented = extract_token(&request)?;
    if !expected.matches(&presented) {
        debug!(path = %request.uri().path(), "Control-plane auth rejected");
        return Err(AuthError::Unauthorized);
    }

    Ok(next.run(request).await)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::Body;

    fn request(uri: &str, auth: Option<&str>) -> Request {
        let mut builder = Request::builder().uri(uri);
        if let Some(auth) = auth {
            builder = builder.header("authorization", auth);
        }
        builder.body(Body::empty()).unwrap()
    }

    #[test]
    fn test_extract_from_header() {
        let token = extract_token(&request("/endpoints", Some("Bearer abc"))).unwrap();
        assert_eq!(token, "abc");
    }

    #[test]
    fn test_extract_from_query() {
        let token = extract_token(&request("/endpoints?token=xyz", None)).unwrap();
        assert_eq!(token, "xyz");
    }

    #[test]
    fn test_header_wins_and_must_be_bearer() {
        assert_eq!(
            extract_token(&request("/endpoints", Some("Token abc"))),
            Err(AuthError::InvalidAuthHeader)
        );
        assert_eq!(
            extract_token(&request("/endpoints", None)),
            Err(AuthError::MissingCredentials)
        );
    }
}
