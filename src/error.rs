// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application error types with consistent API responses.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;

/// Application error type that converts to HTTP responses.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Authentication required")]
    Unauthorized,

    #[error("Invalid or expired token")]
    InvalidToken,

    #[error("Multi-factor authentication required")]
    MfaRequired,

    #[error("Expired: {0}")]
    Expired(String),

    #[error("Inactive: {0}")]
    Inactive(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Invalid request: {0}")]
    InvalidInput(String),

    #[error("Invalid user: {0}")]
    InvalidUser(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    /// Upstream failure that is safe to retry (timeouts, 429, 5xx).
    #[error("Upstream temporarily unavailable: {0}")]
    UpstreamTransient(String),

    /// Upstream rejected the request; retrying will not help.
    #[error("Upstream error: {0}")]
    UpstreamPermanent(String),

    #[error("Database error: {0}")]
    Database(String),

    #[error("Internal server error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl AppError {
    /// Whether the operation that produced this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(self, AppError::UpstreamTransient(_))
    }

    /// Whether this error came from an external provider.
    pub fn is_upstream(&self) -> bool {
        matches!(
            self,
            AppError::UpstreamTransient(_) | AppError::UpstreamPermanent(_)
        )
    }
}

/// JSON error response body
#[derive(Serialize)]
struct ErrorResponse {
    error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    details: Option<String>,
}

impl AppError {
    /// Stable machine-readable code sent to clients.
    pub fn code(&self) -> &'static str {
        match self {
            AppError::Unauthorized => "unauthorized",
            AppError::InvalidToken => "invalid_token",
            AppError::MfaRequired => "mfa_required",
            AppError::Expired(_) => "expired",
            AppError::Inactive(_) => "inactive",
            AppError::NotFound(_) => "not_found",
            AppError::InvalidInput(_) => "invalid_input",
            AppError::InvalidUser(_) => "invalid_user",
            AppError::Conflict(_) => "conflict",
            AppError::UpstreamTransient(_) => "upstream_unavailable",
            AppError::UpstreamPermanent(_) => "upstream_error",
            AppError::Database(_) => "database_error",
            AppError::Internal(_) => "internal_error",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, details) = match &self {
            AppError::Unauthorized | AppError::InvalidToken | AppError::MfaRequired => {
                (StatusCode::UNAUTHORIZED, None)
            }
            AppError::Expired(msg) | AppError::Inactive(msg) => {
                (StatusCode::UNAUTHORIZED, Some(msg.clone()))
            }
            AppError::NotFound(msg) => (StatusCode::NOT_FOUND, Some(msg.clone())),
            AppError::InvalidInput(msg) | AppError::InvalidUser(msg) => {
                (StatusCode::BAD_REQUEST, Some(msg.clone()))
            }
            AppError::Conflict(msg) => (StatusCode::CONFLICT, Some(msg.clone())),
            AppError::UpstreamTransient(msg) => {
                tracing::warn!(error = %msg, "Upstream transient failure");
                (StatusCode::SERVICE_UNAVAILABLE, None)
            }
            AppError::UpstreamPermanent(msg) => {
                tracing::warn!(error = %msg, "Upstream permanent failure");
                (StatusCode::BAD_GATEWAY, None)
            }
            AppError::Database(msg) => {
                tracing::error!(error = %msg, "Database error");
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
            AppError::Internal(err) => {
                tracing::error!(error = %err, "Internal server error");
                (StatusCode::INTERNAL_SERVER_ERROR, None)
            }
        };

        let body = ErrorResponse {
            error: self.code().to_string(),
            details,
        };

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers
pub type Result<T> = std::result::Result<T, AppError>;
