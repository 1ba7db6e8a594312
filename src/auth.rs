//! Token issuance and verification.
//!
//! Access and refresh tokens are HMAC-signed JWTs bound to a
//! (session, user, device) triple plus scopes. The same verification path
//! serves REST `Bearer` headers and the WebSocket `?token=` query parameter.

use chrono::{DateTime, Duration, Utc};
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::RelayConfig;
use crate::envelope::DeviceClass;

/// Token kind, carried in the `type` claim.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenKind {
    Access,
    Refresh,
}

impl std::fmt::Display for TokenKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Access => write!(f, "access"),
            Self::Refresh => write!(f, "refresh"),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthError {
    #[error("token expired")]
    Expired,
    #[error("expected {expected} token, got {actual}")]
    InvalidKind {
        expected: TokenKind,
        actual: TokenKind,
    },
    #[error("malformed token: {0}")]
    Malformed(String),
}

/// JWT claims. `sub` is the session id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub user_id: String,
    pub device_id: String,
    /// Dedicated device-class claim. Older tokens omit it, in which case
    /// `scopes[0]` is consulted instead — see [`Claims::device_class`].
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,
    #[serde(default)]
    pub scopes: Vec<String>,
    pub aud: String,
    pub iss: String,
    pub jti: String,
    pub iat: i64,
    pub exp: i64,
    #[serde(rename = "type")]
    pub kind: TokenKind,
}

impl Claims {
    pub fn session_id(&self) -> &str {
        &self.sub
    }

    /// Resolve the device class, falling back to the first scope for tokens
    /// minted before the dedicated claim existed.
    pub fn device_class(&self) -> Option<DeviceClass> {
        self.device
            .as_deref()
            .or_else(|| self.scopes.first().map(String::as_str))
            .and_then(DeviceClass::parse)
    }
}

/// The pair returned by `issue` and `refresh`.
#[derive(Debug, Clone)]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub session_id: String,
}

/// Signs and verifies bearer tokens for one deployment (fixed issuer and
/// audience).
pub struct TokenIssuer {
    encoding: EncodingKey,
    decoding: DecodingKey,
    algorithm: Algorithm,
    audience: String,
    issuer: String,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenIssuer {
    pub fn new(config: &RelayConfig) -> Self {
        Self {
            encoding: EncodingKey::from_secret(config.jwt_secret.as_bytes()),
            decoding: DecodingKey::from_secret(config.jwt_secret.as_bytes()),
            algorithm: config.jwt_algorithm,
            audience: config.jwt_audience.clone(),
            issuer: config.jwt_issuer.clone(),
            access_ttl: Duration::minutes(config.access_token_expire_minutes),
            refresh_ttl: Duration::minutes(config.refresh_token_expire_minutes),
        }
    }

    /// Mint an access + refresh pair for a fresh session.
    pub fn issue(
        &self,
        user_id: &str,
        device_id: &str,
        device_class: Option<DeviceClass>,
        scopes: Vec<String>,
    ) -> Result<TokenPair, AuthError> {
        let session_id = Uuid::new_v4().to_string();
        self.issue_for_session(&session_id, user_id, device_id, device_class, scopes)
    }

    fn issue_for_session(
        &self,
        session_id: &str,
        user_id: &str,
        device_id: &str,
        device_class: Option<DeviceClass>,
        scopes: Vec<String>,
    ) -> Result<TokenPair, AuthError> {
        let expires_at = Utc::now() + self.access_ttl;
        let access = self.sign(
            session_id,
            user_id,
            device_id,
            device_class,
            &scopes,
            TokenKind::Access,
        )?;
        let refresh = self.sign(
            session_id,
            user_id,
            device_id,
            device_class,
            &scopes,
            TokenKind::Refresh,
        )?;
        Ok(TokenPair {
            access_token: access,
            refresh_token: refresh,
            expires_at,
            session_id: session_id.to_string(),
        })
    }

    /// Exchange a refresh token for a new access token. The refresh token is
    /// returned unchanged; no new session is created.
    pub fn refresh(&self, refresh_token: &str) -> Result<TokenPair, AuthError> {
        let claims = self.verify(refresh_token, TokenKind::Refresh)?;
        let expires_at = Utc::now() + self.access_ttl;
        let access = self.sign(
            &claims.sub,
            &claims.user_id,
            &claims.device_id,
            claims.device_class(),
            &claims.scopes,
            TokenKind::Access,
        )?;
        Ok(TokenPair {
            access_token: access,
            refresh_token: refresh_token.to_string(),
            expires_at,
            session_id: claims.sub,
        })
    }

    /// Verify signature, expiry, audience, issuer, and kind.
    pub fn verify(&self, token: &str, expected: TokenKind) -> Result<Claims, AuthError> {
        let mut validation = Validation::new(self.algorithm);
        validation.set_audience(&[self.audience.clone()]);
        validation.set_issuer(&[self.issuer.clone()]);

        let data = jsonwebtoken::decode::<Claims>(token, &self.decoding, &validation).map_err(
            |e| match e.kind() {
                jsonwebtoken::errors::ErrorKind::ExpiredSignature => AuthError::Expired,
                _ => AuthError::Malformed(e.to_string()),
            },
        )?;

        if data.claims.kind != expected {
            return Err(AuthError::InvalidKind {
                expected,
                actual: data.claims.kind,
            });
        }
        Ok(data.claims)
    }

    fn sign(
        &self,
        session_id: &str,
        user_id: &str,
        device_id: &str,
        device_class: Option<DeviceClass>,
        scopes: &[String],
        kind: TokenKind,
    ) -> Result<String, AuthError> {
        let now = Utc::now();
        let ttl = match kind {
            TokenKind::Access => self.access_ttl,
            TokenKind::Refresh => self.refresh_ttl,
        };
        let claims = Claims {
            sub: session_id.to_string(),
            user_id: user_id.to_string(),
            device_id: device_id.to_string(),
            device: device_class.map(|c| c.to_string()),
            scopes: scopes.to_vec(),
            aud: self.audience.clone(),
            iss: self.issuer.clone(),
            jti: format!("{session_id}:{kind}:{}", now.timestamp_millis()),
            iat: now.timestamp(),
            exp: (now + ttl).timestamp(),
            kind,
        };
        jsonwebtoken::encode(&Header::new(self.algorithm), &claims, &self.encoding)
            .map_err(|e| AuthError::Malformed(e.to_string()))
    }
}

/// Extract the token from a `Bearer <token>` authorization header value.
pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}
