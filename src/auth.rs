//! Authentication at the broker boundary.
//!
//! Two credentials are checked here:
//!
//! - Agents present a JWT (HS256) in their `register` frame. The token's
//!   signature, issuer, audience and expiry are validated and its `sub` must
//!   name the tenant being registered.
//! - Callers of the HTTP facade present the broker's pre-shared API key as
//!   `Authorization: Bearer <key>`. The session listing takes the admin key
//!   as a `?token=` query parameter instead.

use std::time::Duration;

use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use serde_json::json;
use thiserror::Error;

/// Axum middleware that rejects requests without a valid `Authorization: Bearer`
/// header. The expected key is injected via the [`ApiKey`] extension.
///
/// # Error responses
///
/// - `401 Unauthorized`: header missing or malformed
/// - `403 Forbidden`: key present but invalid
/// - `500 Internal Server Error`: [`ApiKey`] extension not found
pub async fn require_api_key(request: Request, next: Next) -> Response {
    let Some(ApiKey(expected)) = request.extensions().get::<ApiKey>().cloned() else {
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({"error": "Server configuration error", "code": "INTERNAL"})),
        )
            .into_response();
    };

    let provided = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "));

    let Some(provided) = provided else {
        return (
            StatusCode::UNAUTHORIZED,
            Json(json!({"error": "Missing or invalid Authorization header", "code": "UNAUTHORIZED"})),
        )
            .into_response();
    };

    if !constant_time_eq(expected.as_bytes(), provided.as_bytes()) {
        return (
            StatusCode::FORBIDDEN,
            Json(json!({"error": "Invalid API key", "code": "FORBIDDEN"})),
        )
            .into_response();
    }

    next.run(request).await
}

/// Constant-time byte comparison.
///
/// Always iterates over the full length of `expected` regardless of `provided`
/// length, so response times do not reveal the key length.
pub fn constant_time_eq(expected: &[u8], provided: &[u8]) -> bool {
    let mut diff = u8::from(expected.len() != provided.len());
    for (i, e) in expected.iter().enumerate() {
        diff |= e ^ provided.get(i).copied().unwrap_or(0xff);
    }
    diff == 0
}

/// Extension carrying the expected API key, injected into the router layer
/// so [`require_api_key`] can reach it without touching handler state.
#[derive(Clone)]
pub struct ApiKey(pub String);

/// Why a registration token was refused.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("invalid token signature")]
    InvalidSignature,
    #[error("unexpected token issuer")]
    InvalidIssuer,
    #[error("unexpected token audience")]
    InvalidAudience,
    #[error("token subject {found} does not match tenant {expected}")]
    TenantMismatch { expected: String, found: String },
    #[error("malformed token: {0}")]
    Malformed(String),
}

impl From<jsonwebtoken::errors::Error> for TokenError {
    fn from(e: jsonwebtoken::errors::Error) -> Self {
        match e.kind() {
            ErrorKind::ExpiredSignature => Self::Expired,
            ErrorKind::InvalidSignature => Self::InvalidSignature,
            ErrorKind::InvalidIssuer => Self::InvalidIssuer,
            ErrorKind::InvalidAudience => Self::InvalidAudience,
            _ => Self::Malformed(e.to_string()),
        }
    }
}

/// Claims carried by an agent registration token.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TunnelClaims {
    /// Tenant the token was issued for.
    pub sub: String,
    pub exp: u64,
    pub iss: String,
    pub aud: String,
}

/// Validates (and, for operators and tests, issues) agent registration tokens.
#[derive(Clone)]
pub struct TokenValidator {
    decoding: DecodingKey,
    encoding: EncodingKey,
    validation: Validation,
    issuer: String,
    audience: String,
}

impl TokenValidator {
    pub fn new(secret: &[u8], issuer: &str, audience: &str, leeway: Duration) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.set_issuer(&[issuer]);
        validation.set_audience(&[audience]);
        validation.set_required_spec_claims(&["exp", "sub", "iss", "aud"]);
        validation.leeway = leeway.as_secs();
        Self {
            decoding: DecodingKey::from_secret(secret),
            encoding: EncodingKey::from_secret(secret),
            validation,
            issuer: issuer.to_string(),
            audience: audience.to_string(),
        }
    }

    /// Validate `token` for `tenant_id`.
    pub fn validate(&self, token: &str, tenant_id: &str) -> Result<TunnelClaims, TokenError> {
        let data = jsonwebtoken::decode::<TunnelClaims>(token, &self.decoding, &self.validation)?;
        if data.claims.sub != tenant_id {
            return Err(TokenError::TenantMismatch {
                expected: tenant_id.to_string(),
                found: data.claims.sub,
            });
        }
        Ok(data.claims)
    }

    /// Mint a token for `tenant_id` valid for `ttl`.
    pub fn issue(&self, tenant_id: &str, ttl: Duration) -> Result<String, TokenError> {
        let claims = TunnelClaims {
            sub: tenant_id.to_string(),
            exp: jsonwebtoken::get_current_timestamp() + ttl.as_secs(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };
        jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &self.encoding).map_err(TokenError::from)
    }
}
