//! Read API error types.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Errors surfaced by the dashboard API.
#[derive(Debug, Error)]
pub enum ApiError {
    /// Missing or malformed `Authorization` header.
    #[error("missing or invalid authorization header")]
    MissingAuth,

    /// Token signature did not verify.
    #[error("invalid signature")]
    InvalidSignature,

    /// Token expired.
    #[error("token expired")]
    TokenExpired,

    /// Token malformed or otherwise unusable.
    #[error("invalid token")]
    InvalidToken,

    /// Wrong username or password.
    #[error("invalid credentials")]
    InvalidCredentials,

    /// No JWT secret configured; the dashboard API cannot issue tokens.
    #[error("authentication is not configured")]
    AuthNotConfigured,

    /// Invalid request input.
    #[error("{0}")]
    Validation(String),

    /// Unknown resource.
    #[error("{0} not found")]
    NotFound(String),

    /// Anything else.
    #[error("internal error")]
    Internal(String),
}

/// Error response body.
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::MissingAuth
            | Self::InvalidSignature
            | Self::TokenExpired
            | Self::InvalidToken
            | Self::InvalidCredentials => StatusCode::UNAUTHORIZED,
            Self::AuthNotConfigured => StatusCode::SERVICE_UNAVAILABLE,
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };

        let body = Json(ErrorResponse {
            error: self.to_string(),
        });
        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn auth_errors_are_401() {
        for err in [
            ApiError::MissingAuth,
            ApiError::InvalidSignature,
            ApiError::TokenExpired,
            ApiError::InvalidCredentials,
        ] {
            let response = err.into_response();
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
    }

    #[test]
    fn not_found_is_404_with_reason() {
        let response = ApiError::NotFound("error record".into()).into_response();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
