// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Session authentication middleware.

use crate::error::AppError;
use crate::models::Session;
use crate::services::auth::ClientInfo;
use crate::AppState;
use axum::{
    extract::{Request, State},
    http::{header, HeaderMap},
    middleware::Next,
    response::Response,
};
use axum_extra::extract::cookie::CookieJar;
use std::sync::Arc;
use uuid::Uuid;

/// Cookie carrying the opaque session token.
pub const SESSION_COOKIE: &str = "gateway_session";

/// Authenticated caller, inserted into request extensions.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    /// The session behind the request, absent for session-less access tokens
    pub session: Option<Session>,
}

/// Middleware that requires a live session cookie or a bearer access token.
pub async fn require_auth(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    mut request: Request,
    next: Next,
) -> Result<Response, AppError> {
    // Try cookie first, then header. A stale cookie does not shadow a
    // valid bearer token.
    let bearer = bearer_token(request.headers());
    let auth_user = match jar.get(SESSION_COOKIE) {
        Some(cookie) => match state.sessions.validate(cookie.value()).await {
            Ok(session) => AuthUser {
                user_id: session.user_id,
                session: Some(session),
            },
            Err(e) => match bearer {
                Some(token) => {
                    tracing::debug!(error = %e, "Session cookie rejected, using bearer token");
                    bearer_user(&state, token).await?
                }
                None => return Err(e.into()),
            },
        },
        None => bearer_user(&state, bearer.ok_or(AppError::Unauthorized)?).await?,
    };

    request.extensions_mut().insert(auth_user);
    Ok(next.run(request).await)
}

async fn bearer_user(state: &AppState, token: &str) -> Result<AuthUser, AppError> {
    let claims = state.tokens.verify_access(token)?;
    let session = match claims.sid {
        Some(session_id) => Some(state.sessions.validate_by_id(session_id).await?),
        None => None,
    };
    Ok(AuthUser {
        user_id: claims.user_id()?,
        session,
    })
}

/// Extract the token from an `Authorization: Bearer` header.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(header::AUTHORIZATION)
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Caller address and agent, for sessions and the audit log.
///
/// The first `X-Forwarded-For` hop wins over `X-Real-IP`.
pub fn client_info(headers: &HeaderMap) -> ClientInfo {
    let header_str = |name: &str| {
        headers
            .get(name)
            .and_then(|h| h.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    let ip_address = header_str("x-forwarded-for")
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .or_else(|| header_str("x-real-ip").map(str::to_string));

    ClientInfo {
        ip_address,
        user_agent: header_str(header::USER_AGENT.as_str()).map(str::to_string),
    }
}
