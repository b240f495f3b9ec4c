//! Client authentication: the AUTH frame payload, the pluggable
//! authenticator, and the whitelist predicate consulted after it.

pub mod token;
pub mod whitelist;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

pub use token::JwtAuthenticator;
pub use whitelist::{AllowAll, StaticWhitelist, Whitelist};

/// Body of the AUTH frame, JSON encoded.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthRequest {
    pub token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
    /// Rooms to join as soon as the channel is authenticated.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rooms: Vec<String>,
    /// Operation codes the client wants pushed. Empty accepts everything.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub accepts: Vec<u32>,
}

impl AuthRequest {
    pub fn parse(body: &[u8]) -> Result<Self, AuthError> {
        serde_json::from_slice(body).map_err(|e| {
            tracing::debug!(?e, "auth body is not a valid auth request");
            AuthError::Malformed
        })
    }
}

/// Who a channel belongs to once authenticated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub user_id: String,
    pub platform: Option<String>,
}

#[derive(thiserror::Error, Debug)]
pub enum AuthError {
    #[error("malformed auth request")]
    Malformed,
    #[error("invalid or expired token")]
    InvalidToken,
    #[error("user {0} is not whitelisted")]
    NotWhitelisted(String),
    #[error("authenticator unavailable: {0}")]
    Unavailable(String),
}

/// Validates an auth request and resolves the identity behind it.
#[async_trait]
pub trait Authenticator: Send + Sync {
    async fn authenticate(&self, request: &AuthRequest) -> Result<Identity, AuthError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_minimal_request() {
        let req = AuthRequest::parse(br#"{"token":"abc"}"#).unwrap();
        assert_eq!(req.token, "abc");
        assert!(req.rooms.is_empty());
        assert!(req.accepts.is_empty());
        assert!(req.platform.is_none());
    }

    #[test]
    fn parse_full_request() {
        let req = AuthRequest::parse(
            br#"{"token":"abc","platform":"web","rooms":["live://1"],"accepts":[1000,1001]}"#,
        )
        .unwrap();
        assert_eq!(req.platform.as_deref(), Some("web"));
        assert_eq!(req.rooms, vec!["live://1"]);
        assert_eq!(req.accepts, vec![1000, 1001]);
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(matches!(AuthRequest::parse(b"not json"), Err(AuthError::Malformed)));
        assert!(matches!(AuthRequest::parse(b"{}"), Err(AuthError::Malformed)));
    }
}
