// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Login, registration and token routes, plus the OAuth provider callback.

use axum::{
    extract::{Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{Html, IntoResponse, Response},
    routing::{get, post},
    Extension, Form, Json, Router,
};
use axum_extra::extract::cookie::{Cookie, CookieJar, SameSite};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::crypto;
use crate::error::{AppError, Result};
use crate::middleware::auth::{client_info, AuthUser, SESSION_COOKIE};
use crate::services::auth::{LoginRequest, RegisterRequest, UserProfile};
use crate::services::identity::Introspection;
use crate::services::risk::DeviceAssessment;
use crate::services::token::TokenPair;
use crate::AppState;

/// Routes reachable without a session.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/refresh", post(refresh))
        .route("/auth/introspect", post(introspect))
        .route("/oauth/callback", get(oauth_callback))
}

/// Routes that end the caller's own sessions (mounted behind `require_auth`).
pub fn protected_routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/auth/logout", post(logout))
        .route("/auth/logout-all", post(logout_all))
}

// ─── Cookies ─────────────────────────────────────────────────

fn secure_cookies(state: &AppState) -> bool {
    state.config.api_url.starts_with("https://")
}

fn session_cookie(state: &AppState, token: String, expires_at: DateTime<Utc>) -> Cookie<'static> {
    let max_age = (expires_at - Utc::now()).num_seconds().max(0);
    Cookie::build((SESSION_COOKIE, token))
        .path("/")
        .http_only(true)
        .secure(secure_cookies(state))
        .same_site(SameSite::Lax)
        .max_age(time::Duration::seconds(max_age))
        .build()
}

pub(crate) fn expired_session_cookie(state: &AppState) -> Cookie<'static> {
    Cookie::build((SESSION_COOKIE, ""))
        .path("/")
        .http_only(true)
        .secure(secure_cookies(state))
        .same_site(SameSite::Lax)
        .max_age(time::Duration::ZERO)
        .build()
}

// ─── Registration & Login ────────────────────────────────────

async fn register(
    State(state): State<Arc<AppState>>,
    Json(req): Json<RegisterRequest>,
) -> Result<(StatusCode, Json<UserProfile>)> {
    req.validate()
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;

    let user = state.auth.register(&req).await?;
    let profile = state.auth.profile(user.id).await?;
    Ok((StatusCode::CREATED, Json(profile)))
}

#[derive(Serialize)]
pub struct LoginResponse {
    pub user: UserProfile,
    pub tokens: TokenPair,
    pub session_expires_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<DeviceAssessment>,
}

async fn login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    headers: HeaderMap,
    Json(req): Json<LoginRequest>,
) -> Result<(CookieJar, Json<LoginResponse>)> {
    req.validate()
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;

    let client = client_info(&headers);
    let outcome = state.auth.login(&req, &client).await?;
    let user = state.auth.profile(outcome.user.id).await?;

    let jar = jar.add(session_cookie(
        &state,
        outcome.session.session_token.clone(),
        outcome.session.expires_at,
    ));

    Ok((
        jar,
        Json(LoginResponse {
            user,
            tokens: outcome.tokens,
            session_expires_at: outcome.session.expires_at,
            device: outcome.device,
        }),
    ))
}

// ─── Tokens ──────────────────────────────────────────────────

#[derive(Debug, Deserialize, Validate)]
pub struct RefreshRequest {
    #[validate(length(min = 1, message = "Refresh token is required"))]
    pub refresh_token: String,
}

async fn refresh(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<RefreshRequest>,
) -> Result<Json<TokenPair>> {
    req.validate()
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;

    let pair = state
        .auth
        .refresh(&req.refresh_token, &client_info(&headers))
        .await?;
    Ok(Json(pair))
}

/// RFC 7662 request body.
#[derive(Debug, Deserialize)]
pub struct IntrospectRequest {
    pub token: String,
}

async fn introspect(
    State(state): State<Arc<AppState>>,
    Form(req): Form<IntrospectRequest>,
) -> Result<Json<Introspection>> {
    if req.token.trim().is_empty() {
        return Ok(Json(Introspection::default()));
    }
    Ok(Json(state.auth.introspect(req.token.trim()).await?))
}

// ─── Logout ──────────────────────────────────────────────────

async fn logout(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    jar: CookieJar,
) -> Result<(CookieJar, StatusCode)> {
    if let Some(session) = &user.session {
        state.auth.logout(session).await?;
    }
    Ok((jar.add(expired_session_cookie(&state)), StatusCode::NO_CONTENT))
}

#[derive(Serialize)]
pub struct LogoutAllResponse {
    pub sessions_revoked: usize,
}

async fn logout_all(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    jar: CookieJar,
    headers: HeaderMap,
) -> Result<(CookieJar, Json<LogoutAllResponse>)> {
    let sessions_revoked = state
        .auth
        .logout_everywhere(user.user_id, &client_info(&headers))
        .await?;
    Ok((
        jar.add(expired_session_cookie(&state)),
        Json(LogoutAllResponse { sessions_revoked }),
    ))
}

// ─── OAuth Provider Callback ─────────────────────────────────

#[derive(Debug, Deserialize)]
pub struct OAuthCallbackParams {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    state: Option<String>,
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    app_id: Option<String>,
}

/// Message posted to the opener window.
#[derive(Debug, Serialize)]
struct CallbackMessage {
    #[serde(rename = "type")]
    kind: &'static str,
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    app_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    provider: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    connection_id: Option<Uuid>,
    #[serde(skip_serializing_if = "Option::is_none")]
    email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

/// Provider redirect target. Always answers with a small page that posts
/// the outcome to the frontend and closes itself.
async fn oauth_callback(
    State(state): State<Arc<AppState>>,
    Query(params): Query<OAuthCallbackParams>,
) -> Result<Response> {
    let message = match (&params.error, &params.code, &params.state) {
        (Some(error), _, _) => {
            tracing::warn!(error = %error, "OAuth provider returned an error");
            CallbackMessage::failure(params.app_id.clone(), "access_denied")
        }
        (None, Some(code), Some(oauth_state)) => {
            match state
                .connections
                .complete_callback(params.app_id.as_deref(), code, oauth_state)
                .await
            {
                Ok(conn) => CallbackMessage {
                    kind: "oauth_result",
                    success: true,
                    app_id: Some(conn.app_id),
                    provider: Some(conn.provider),
                    connection_id: Some(conn.id),
                    email: conn.account_email,
                    error: None,
                },
                Err(e) => {
                    tracing::warn!(error = %e, "OAuth callback failed");
                    CallbackMessage::failure(params.app_id.clone(), e.code())
                }
            }
        }
        _ => CallbackMessage::failure(params.app_id.clone(), "invalid_input"),
    };

    render_callback_page(&state.config.frontend_url, &message)
}

impl CallbackMessage {
    fn failure(app_id: Option<String>, error: &str) -> Self {
        Self {
            kind: "oauth_result",
            success: false,
            app_id,
            provider: None,
            connection_id: None,
            email: None,
            error: Some(error.to_string()),
        }
    }
}

/// Origin (`scheme://host[:port]`) of the frontend URL.
pub fn frontend_origin(frontend_url: &str) -> Result<String> {
    let url = reqwest::Url::parse(frontend_url)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("Invalid frontend URL: {}", e)))?;
    Ok(url.origin().ascii_serialization())
}

/// Serialize a value for embedding inside an inline `<script>`.
pub fn script_json<T: Serialize>(value: &T) -> Result<String> {
    let json = serde_json::to_string(value)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("JSON encode failed: {}", e)))?;
    Ok(json.replace("</", "<\\/").replace("<!--", "<\\!--"))
}

fn render_callback_page(frontend_url: &str, message: &CallbackMessage) -> Result<Response> {
    let origin = frontend_origin(frontend_url)?;
    let nonce = crypto::random_token(16)?;
    let body = format!(
        r#"<!doctype html>
<html><head><meta charset="utf-8"><title>Connecting…</title></head>
<body>
<script nonce="{nonce}">
(function () {{
  var message = {message};
  if (window.opener) {{
    window.opener.postMessage(message, {origin});
  }}
  window.close();
}})();
</script>
</body></html>
"#,
        nonce = nonce,
        message = script_json(message)?,
        origin = script_json(&origin)?,
    );

    let csp = format!("default-src 'none'; script-src 'nonce-{nonce}'; frame-ancestors 'none'");
    Ok((
        [
            (header::CONTENT_SECURITY_POLICY, csp),
            (header::CACHE_CONTROL, "no-store".to_string()),
        ],
        Html(body),
    )
        .into_response())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frontend_origin_strips_path() {
        assert_eq!(
            frontend_origin("https://app.example.com/settings/apps").unwrap(),
            "https://app.example.com"
        );
        assert_eq!(
            frontend_origin("http://localhost:5173").unwrap(),
            "http://localhost:5173"
        );
        assert!(frontend_origin("not a url").is_err());
    }

    #[test]
    fn test_script_json_escapes_closing_tags() {
        let json = script_json(&"</script><script>alert(1)</script>").unwrap();
        assert!(!json.contains("</"));
        assert!(json.contains("<\\/script>"));
    }

    #[test]
    fn test_callback_page_posts_to_frontend_origin() {
        let message = CallbackMessage::failure(Some("github".to_string()), "invalid_token");
        let response = render_callback_page("http://localhost:5173/apps", &message).unwrap();

        let csp = response
            .headers()
            .get(header::CONTENT_SECURITY_POLICY)
            .unwrap()
            .to_str()
            .unwrap()
            .to_string();
        assert!(csp.contains("script-src 'nonce-"));
    }
}
