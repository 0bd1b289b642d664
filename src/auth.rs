//! Endpoint authentication
//!
//! Auth is evaluated once at the boundary: per HTTP request, or once at
//! WebSocket upgrade time from the initial headers/query. Token comparisons
//! are constant-time wherever the value is secret-derived.

use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

use crate::errors::auth_error::{AuthError, AuthResult};

type HmacSha256 = Hmac<Sha256>;

/// Header carrying a GitHub-style payload signature
pub const SIGNATURE_HEADER: &str = "x-hub-signature-256";

/// Secret material wrapper: zeroized on drop, masked in Debug output.
///
/// Serializes transparently so on-disk configs keep the full secret (the
/// restore path needs it); masking happens only in display paths.
#[derive(Clone, Serialize, Deserialize, Zeroize, ZeroizeOnDrop, PartialEq)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Access the raw secret (verification paths only)
    pub fn expose(&self) -> &str {
        &self.0
    }

    /// Masked form for list/status display
    pub fn masked(&self) -> String {
        if self.0.len() <= 4 {
            "****".to_string()
        } else {
            format!("{}****", &self.0[..4])
        }
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Constant-time comparison against a presented value
    pub fn matches(&self, presented: &str) -> bool {
        constant_time_eq(presented.as_bytes(), self.0.as_bytes())
    }
}

impl std::fmt::Debug for Secret {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Secret(****)")
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

/// Authentication scheme attached to an endpoint.
///
/// For outbound WebSocket clients the bearer/header/query variants are
/// attached to the connect request instead of being verified.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthScheme {
    /// No authentication
    #[default]
    None,
    /// `Authorization: Bearer <token>` exact match
    BearerToken { token: Secret },
    /// Token in a query parameter
    QueryParam { name: String, token: Secret },
    /// Token in a custom header
    Header { name: String, token: Secret },
    /// GitHub-style HMAC-SHA256 signature over the raw body
    GithubSignature { secret: Secret },
}

impl AuthScheme {
    /// Short name for list/status display
    pub fn kind_name(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::BearerToken { .. } => "bearer_token",
            Self::QueryParam { .. } => "query_param",
            Self::Header { .. } => "header",
            Self::GithubSignature { .. } => "github_signature",
        }
    }

    /// Whether this scheme needs the request body to verify
    pub fn needs_body(&self) -> bool {
        matches!(self, Self::GithubSignature { .. })
    }

    /// Copy with secrets masked, for read-back-for-display paths only
    pub fn masked(&self) -> AuthScheme {
        match self {
            Self::None => Self::None,
            Self::BearerToken { token } => Self::BearerToken {
                token: Secret::new(token.masked()),
            },
            Self::QueryParam { name, token } => Self::QueryParam {
                name: name.clone(),
                token: Secret::new(token.masked()),
            },
            Self::Header { name, token } => Self::Header {
                name: name.clone(),
                token: Secret::new(token.masked()),
            },
            Self::GithubSignature { secret } => Self::GithubSignature {
                secret: Secret::new(secret.masked()),
            },
        }
    }

    /// Verify an inbound request against this scheme.
    ///
    /// `headers` are lowercased header name/value pairs, `query` the parsed
    /// query pairs, `body` the raw payload (signature schemes only).
    pub fn verify(
        &self,
        headers: &[(String, String)],
        query: &[(String, String)],
        body: &[u8],
    ) -> AuthResult<AuthOutcome> {
        match self {
            Self::None => Ok(AuthOutcome::anonymous()),

            Self::BearerToken { token } => {
                let header = header_value(headers, "authorization")
                    .ok_or(AuthError::MissingCredentials)?;
                let presented = header
                    .strip_prefix("Bearer ")
                    .ok_or(AuthError::InvalidAuthHeader)?;
                if constant_time_eq(presented.as_bytes(), token.expose().as_bytes()) {
                    Ok(AuthOutcome::verified("bearer_token"))
                } else {
                    Err(AuthError::Unauthorized)
                }
            }

            Self::QueryParam { name, token } => {
                let presented = query
                    .iter()
                    .find(|(k, _)| k == name)
                    .map(|(_, v)| v.as_str())
                    .ok_or(AuthError::MissingCredentials)?;
                if constant_time_eq(presented.as_bytes(), token.expose().as_bytes()) {
                    Ok(AuthOutcome::verified("query_param"))
                } else {
                    Err(AuthError::Unauthorized)
                }
            }

            Self::Header { name, token } => {
                let presented = header_value(headers, &name.to_lowercase())
                    .ok_or(AuthError::MissingCredentials)?;
                if constant_time_eq(presented.as_bytes(), token.expose().as_bytes()) {
                    Ok(AuthOutcome::verified("header"))
                } else {
                    Err(AuthError::Unauthorized)
                }
            }

            Self::GithubSignature { secret } => {
                let presented = header_value(headers, SIGNATURE_HEADER)
                    .ok_or(AuthError::MissingCredentials)?;
                let presented = presented
                    .strip_prefix("sha256=")
                    .ok_or(AuthError::InvalidSignature)?;
                let presented =
                    hex::decode(presented).map_err(|_| AuthError::InvalidSignature)?;

                let mut mac = HmacSha256::new_from_slice(secret.expose().as_bytes())
                    .map_err(|e| AuthError::ConfigError(e.to_string()))?;
                mac.update(body);
                let expected = mac.finalize().into_bytes();

                if constant_time_eq(&presented, &expected) {
                    Ok(AuthOutcome::verified("github_signature"))
                } else {
                    Err(AuthError::InvalidSignature)
                }
            }
        }
    }
}

/// Compute a GitHub-style signature header value for a payload.
///
/// Used by the loopback `test` operation to exercise signed endpoints.
pub fn sign_payload(secret: &Secret, body: &[u8]) -> AuthResult<String> {
    let mut mac = HmacSha256::new_from_slice(secret.expose().as_bytes())
        .map_err(|e| AuthError::ConfigError(e.to_string()))?;
    mac.update(body);
    Ok(format!("sha256={}", hex::encode(mac.finalize().into_bytes())))
}

/// Outcome recorded in the request/connection context
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct AuthOutcome {
    /// Scheme that admitted the request ("none" when auth is disabled)
    pub method: &'static str,
    pub verified: bool,
}

impl AuthOutcome {
    fn anonymous() -> Self {
        Self {
            method: "none",
            verified: false,
        }
    }

    fn verified(method: &'static str) -> Self {
        Self {
            method,
            verified: true,
        }
    }
}

fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(k, _)| k == name)
        .map(|(_, v)| v.as_str())
}

/// Constant-time byte comparison.
///
/// A length mismatch returns early; only the length is observable, never
/// the content of the secret.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.ct_eq(b).into()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn headers(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[test]
    fn test_none_always_passes() {
        let outcome = AuthScheme::None.verify(&[], &[], &[]).unwrap();
        assert!(!outcome.verified);
        assert_eq!(outcome.method, "none");
    }

    #[test]
    fn test_bearer_token() {
        let scheme = AuthScheme::BearerToken {
            token: "s3cret".into(),
        };
        let ok = scheme
            .verify(&headers(&[("authorization", "Bearer s3cret")]), &[], &[])
            .unwrap();
        assert!(ok.verified);

        assert_eq!(
            scheme.verify(&headers(&[("authorization", "Bearer wrong")]), &[], &[]),
            Err(AuthError::Unauthorized)
        );
        assert_eq!(
            scheme.verify(&[], &[], &[]),
            Err(AuthError::MissingCredentials)
        );
        assert_eq!(
            scheme.verify(&headers(&[("authorization", "Token s3cret")]), &[], &[]),
            Err(AuthError::InvalidAuthHeader)
        );
    }

    #[test]
    fn test_query_param() {
        let scheme = AuthScheme::QueryParam {
            name: "token".to_string(),
            token: "abc".into(),
        };
        let query = vec![("token".to_string(), "abc".to_string())];
        assert!(scheme.verify(&[], &query, &[]).unwrap().verified);
        assert_eq!(
            scheme.verify(&[], &[], &[]),
            Err(AuthError::MissingCredentials)
        );
    }

    #[test]
    fn test_custom_header_case_insensitive_name() {
        let scheme = AuthScheme::Header {
            name: "X-Api-Key".to_string(),
            token: "k".into(),
        };
        // Inbound headers are normalized to lowercase by the endpoint
        assert!(
            scheme
                .verify(&headers(&[("x-api-key", "k")]), &[], &[])
                .unwrap()
                .verified
        );
    }

    #[test]
    fn test_github_signature_roundtrip() {
        let secret = Secret::new("webhook-secret");
        let body = br#"{"message":"a b c"}"#;
        let signature = sign_payload(&secret, body).unwrap();

        let scheme = AuthScheme::GithubSignature {
            secret: secret.clone(),
        };
        let ok = scheme
            .verify(
                &headers(&[(SIGNATURE_HEADER, signature.as_str())]),
                &[],
                body,
            )
            .unwrap();
        assert!(ok.verified);

        // Tampered body fails
        assert_eq!(
            scheme.verify(
                &headers(&[(SIGNATURE_HEADER, signature.as_str())]),
                &[],
                b"tampered",
            ),
            Err(AuthError::InvalidSignature)
        );
    }

    #[test]
    fn test_secret_masking() {
        let secret = Secret::new("supersecret");
        assert_eq!(secret.masked(), "supe****");
        assert_eq!(format!("{secret:?}"), "Secret(****)");

        let masked = AuthScheme::BearerToken {
            token: "supersecret".into(),
        }
        .masked();
        let AuthScheme::BearerToken { token } = masked else {
            panic!("variant preserved");
        };
        assert_eq!(token.expose(), "supe****");
    }

    #[test]
    fn test_scheme_serde_tagging() {
        let json = r#"{"type":"bearer_token","token":"t"}"#;
        let scheme: AuthScheme = serde_json::from_str(json).unwrap();
        assert_eq!(scheme.kind_name(), "bearer_token");

        let none: AuthScheme = serde_json::from_str(r#"{"type":"none"}"#).unwrap();
        assert_eq!(none, AuthScheme::None);
    }
}
