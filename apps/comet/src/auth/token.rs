//! HS256 client tokens.

use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::{AuthError, AuthRequest, Authenticator, Identity};

/// Claims carried by a client token.
#[derive(Debug, Serialize, Deserialize)]
pub struct ClientClaims {
    pub sub: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub platform: Option<String>,
}

/// Validates client tokens signed with a shared secret.
pub struct JwtAuthenticator {
    encoding: EncodingKey,
    decoding: DecodingKey,
    validation: Validation,
}

impl JwtAuthenticator {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 5;
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    /// Mint a token for `user_id`, valid for `ttl`.
    pub fn issue(
        &self,
        user_id: &str,
        platform: Option<&str>,
        ttl: Duration,
    ) -> Result<String, jsonwebtoken::errors::Error> {
        let now = chrono::Utc::now().timestamp();
        let claims = ClientClaims {
            sub: user_id.to_string(),
            iat: now,
            exp: now + ttl.as_secs() as i64,
            platform: platform.map(str::to_string),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding)
    }
}

#[async_trait]
impl Authenticator for JwtAuthenticator {
    async fn authenticate(&self, request: &AuthRequest) -> Result<Identity, AuthError> {
        let data = jsonwebtoken::decode::<ClientClaims>(&request.token, &self.decoding, &self.validation)
            .map_err(|e| {
                tracing::debug!(?e, "client token validation failed");
                AuthError::InvalidToken
            })?;
        let claims = data.claims;
        if claims.sub.is_empty() {
            return Err(AuthError::InvalidToken);
        }
        Ok(Identity {
            user_id: claims.sub,
            platform: request.platform.clone().or(claims.platform),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(token: String) -> AuthRequest {
        AuthRequest {
            token,
            platform: None,
            rooms: vec![],
            accepts: vec![],
        }
    }

    #[tokio::test]
    async fn issued_token_authenticates() {
        let auth = JwtAuthenticator::new("secret");
        let token = auth.issue("u1", Some("ios"), Duration::from_secs(60)).unwrap();
        let identity = auth.authenticate(&request(token)).await.unwrap();
        assert_eq!(identity.user_id, "u1");
        assert_eq!(identity.platform.as_deref(), Some("ios"));
    }

    #[tokio::test]
    async fn request_platform_overrides_claim() {
        let auth = JwtAuthenticator::new("secret");
        let token = auth.issue("u1", Some("ios"), Duration::from_secs(60)).unwrap();
        let mut req = request(token);
        req.platform = Some("web".to_string());
        let identity = auth.authenticate(&req).await.unwrap();
        assert_eq!(identity.platform.as_deref(), Some("web"));
    }

    #[tokio::test]
    async fn wrong_secret_is_rejected() {
        let issuer = JwtAuthenticator::new("secret-a");
        let verifier = JwtAuthenticator::new("secret-b");
        let token = issuer.issue("u1", None, Duration::from_secs(60)).unwrap();
        assert!(matches!(
            verifier.authenticate(&request(token)).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn expired_token_is_rejected() {
        let auth = JwtAuthenticator::new("secret");
        let now = chrono::Utc::now().timestamp();
        let claims = ClientClaims {
            sub: "u1".to_string(),
            iat: now - 600,
            exp: now - 300,
            platform: None,
        };
        let token = jsonwebtoken::encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"secret"),
        )
        .unwrap();
        assert!(matches!(
            auth.authenticate(&request(token)).await,
            Err(AuthError::InvalidToken)
        ));
    }

    #[tokio::test]
    async fn garbage_token_is_rejected() {
        let auth = JwtAuthenticator::new("secret");
        assert!(auth.authenticate(&request("nope".into())).await.is_err());
    }
}
