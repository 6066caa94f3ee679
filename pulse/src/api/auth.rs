//! Dashboard authentication.
//!
//! Standard HS256 JWTs over `{username, iat, exp}` claims with a 24-hour
//! lifetime, validated by a bearer middleware in front of the read API. The
//! public probes, the Prometheus endpoint and the live channel stay open.

use std::sync::Arc;

use axum::extract::{Request, State};
use axum::http::header::AUTHORIZATION;
use axum::middleware::Next;
use axum::response::Response;
use axum::{Extension, Json};
use chrono::Utc;
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

use super::error::ApiError;
use crate::engine::Pulse;

/// Token lifetime: 24 hours.
pub const TOKEN_LIFETIME_SECS: i64 = 24 * 60 * 60;

/// Dashboard token claims.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    pub username: String,
    /// Issued at (unix seconds).
    pub iat: i64,
    /// Expiry (unix seconds).
    pub exp: i64,
}

/// Sign a token for `username`.
pub fn issue_token(secret: &str, username: &str) -> Result<String, ApiError> {
    let now = Utc::now().timestamp();
    let claims = Claims {
        username: username.to_string(),
        iat: now,
        exp: now + TOKEN_LIFETIME_SECS,
    };
    encode(
        &Header::new(Algorithm::HS256),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .map_err(|e| ApiError::Internal(e.to_string()))
}

/// Verify a token and return its claims.
pub fn verify_token(secret: &str, token: &str) -> Result<Claims, ApiError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.validate_exp = true;
    validation.leeway = 0;
    validation.required_spec_claims.clear();

    decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .map(|data| data.claims)
    .map_err(|e| match e.kind() {
        jsonwebtoken::errors::ErrorKind::ExpiredSignature => ApiError::TokenExpired,
        jsonwebtoken::errors::ErrorKind::InvalidSignature => ApiError::InvalidSignature,
        _ => ApiError::InvalidToken,
    })
}

/// Bearer-token middleware for the read API.
pub async fn require_auth(
    State(pulse): State<Arc<Pulse>>,
    mut request: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let secret = &pulse.config().auth.jwt_secret;
    if secret.is_empty() {
        return Err(ApiError::AuthNotConfigured);
    }

    let header = request
        .headers()
        .get(AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .ok_or(ApiError::MissingAuth)?;
    let token = header.strip_prefix("Bearer ").ok_or(ApiError::MissingAuth)?;

    let claims = verify_token(secret, token)?;
    request.extensions_mut().insert(claims);

    Ok(next.run(request).await)
}

// ============================================================================
// Handlers
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub username: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_in: i64,
}

/// `POST <p>/api/auth/login`
pub async fn login(
    State(pulse): State<Arc<Pulse>>,
    Json(body): Json<LoginRequest>,
) -> Result<Json<LoginResponse>, ApiError> {
    let auth = &pulse.config().auth;
    if auth.jwt_secret.is_empty() || auth.password.is_empty() {
        return Err(ApiError::AuthNotConfigured);
    }
    if body.username != auth.username || body.password != auth.password {
        return Err(ApiError::InvalidCredentials);
    }

    let token = issue_token(&auth.jwt_secret, &body.username)?;
    Ok(Json(LoginResponse {
        token,
        expires_in: TOKEN_LIFETIME_SECS,
    }))
}

#[derive(Debug, Serialize)]
pub struct VerifyResponse {
    pub valid: bool,
    pub username: String,
}

/// `GET <p>/api/auth/verify`. Reached only with a valid token.
pub async fn verify(Extension(claims): Extension<Claims>) -> Json<VerifyResponse> {
    Json(VerifyResponse {
        valid: true,
        username: claims.username,
    })
}
