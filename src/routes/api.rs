// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! API routes for authenticated users.

use crate::error::{AppError, Result};
use crate::middleware::auth::{client_info, AuthUser};
use crate::models::{ConnectionHealthMetric, SecurityEvent, SecurityEventType, TrustedDevice};
use crate::routes::auth::expired_session_cookie;
use crate::services::auth::UserProfile;
use crate::services::mfa::MfaEnrollment;
use crate::services::oauth::{ConnectStart, ConnectionSummary, HealthCheckResult};
use crate::services::risk::NewSecurityEvent;
use crate::AppState;
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{delete, get, post},
    Extension, Json, Router,
};
use axum_extra::extract::cookie::CookieJar;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

const DEFAULT_METRICS_LIMIT: usize = 50;

/// API routes (require authentication).
/// The auth middleware is applied in routes/mod.rs for these routes.
pub fn routes() -> Router<Arc<AppState>> {
    Router::new()
        .route("/api/me", get(get_me))
        .route("/api/account", delete(delete_account))
        .route("/api/sessions", get(list_sessions))
        .route("/api/sessions/{id}", delete(revoke_session))
        .route("/api/mfa", get(mfa_status))
        .route("/api/mfa/setup", post(mfa_setup))
        .route("/api/mfa/enable", post(mfa_enable))
        .route("/api/mfa/disable", post(mfa_disable))
        .route("/api/mfa/backup-codes", get(backup_codes_status))
        .route("/api/mfa/backup-codes/regenerate", post(regenerate_backup_codes))
        .route("/api/apps", get(list_apps))
        .route("/api/apps/{app_id}/connect", post(begin_connect))
        .route("/api/apps/{app_id}/complete", post(complete_connect))
        .route("/api/connections", get(list_connections))
        .route("/api/connections/health", post(check_all_connections))
        .route("/api/connections/{id}", delete(revoke_connection))
        .route("/api/connections/{id}/health", post(check_connection))
        .route("/api/connections/{id}/metrics", get(connection_metrics))
        .route("/api/connections/{id}/usage", post(record_usage))
        .route("/api/security/events", get(list_security_events))
        .route("/api/security/events/{id}/resolve", post(resolve_security_event))
        .route("/api/devices", get(list_devices))
        .route(
            "/api/devices/{id}/trust",
            post(trust_device).delete(untrust_device),
        )
}

// ─── User Profile ────────────────────────────────────────────

async fn get_me(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<UserProfile>> {
    Ok(Json(state.auth.profile(user.user_id).await?))
}

/// Delete the caller's account.
///
/// Connections are revoked at their providers and every session ends
/// before the user record is soft-deleted, which frees its email and
/// username for a later registration.
async fn delete_account(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    jar: CookieJar,
) -> Result<(CookieJar, StatusCode)> {
    tracing::info!(user_id = %user.user_id, "User-initiated account deletion");

    let connections = state.connections.revoke_all(user.user_id).await?;
    let sessions = state.sessions.invalidate_all_for_user(user.user_id).await?;
    if !state.store.soft_delete_user(user.user_id, Utc::now()).await? {
        tracing::warn!(user_id = %user.user_id, "User already deleted");
    }

    tracing::info!(user_id = %user.user_id, connections, sessions, "Account deleted");
    Ok((jar.add(expired_session_cookie(&state)), StatusCode::NO_CONTENT))
}

// ─── Sessions ────────────────────────────────────────────────

/// A session as listed to its owner (without the bearer value).
#[derive(Serialize)]
pub struct SessionView {
    pub id: Uuid,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
    pub last_seen_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    /// The session this request was made with
    pub current: bool,
}

async fn list_sessions(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<SessionView>>> {
    let current = user.session.as_ref().map(|s| s.id);
    let sessions = state
        .sessions
        .list_active(user.user_id)
        .await?
        .into_iter()
        .map(|s| SessionView {
            current: Some(s.id) == current,
            id: s.id,
            ip_address: s.ip_address,
            user_agent: s.user_agent,
            created_at: s.created_at,
            last_seen_at: s.last_seen_at,
            expires_at: s.expires_at,
        })
        .collect();
    Ok(Json(sessions))
}

async fn revoke_session(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(session_id): Path<Uuid>,
) -> Result<StatusCode> {
    let session = state
        .sessions
        .list_active(user.user_id)
        .await?
        .into_iter()
        .find(|s| s.id == session_id)
        .ok_or_else(|| AppError::NotFound(format!("Session {}", session_id)))?;

    state.auth.logout(&session).await?;
    Ok(StatusCode::NO_CONTENT)
}

// ─── MFA ─────────────────────────────────────────────────────

#[derive(Debug, Deserialize, Validate)]
pub struct MfaCodeRequest {
    #[validate(length(min = 6, max = 6, message = "Code must be 6 digits"))]
    pub code: String,
}

#[derive(Serialize)]
pub struct MfaStatusResponse {
    pub configured: bool,
    pub enabled: bool,
    pub total_codes: usize,
    pub remaining_codes: usize,
}

async fn mfa_status(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<MfaStatusResponse>> {
    let response = match state.mfa.get_setup(user.user_id).await? {
        Some(view) => MfaStatusResponse {
            configured: true,
            enabled: view.setup.enabled,
            total_codes: view.total_codes,
            remaining_codes: view.total_codes - view.used_codes,
        },
        None => MfaStatusResponse {
            configured: false,
            enabled: false,
            total_codes: 0,
            remaining_codes: 0,
        },
    };
    Ok(Json(response))
}

/// Start (or restart) enrollment. Refused while MFA is on, so a stolen
/// session cannot swap the secret.
async fn mfa_setup(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<MfaEnrollment>> {
    if state.mfa.is_enabled(user.user_id).await? {
        return Err(AppError::Conflict("MFA is already enabled".to_string()));
    }
    let profile = state.auth.profile(user.user_id).await?;
    Ok(Json(
        state
            .mfa
            .begin_enrollment(user.user_id, &profile.email)
            .await?,
    ))
}

/// Verify a TOTP code or fail with `Unauthorized`, auditing the failure.
async fn require_totp(
    state: &AppState,
    user_id: Uuid,
    req: &MfaCodeRequest,
    headers: &HeaderMap,
) -> Result<()> {
    req.validate()
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;

    if state.mfa.verify_totp(user_id, &req.code).await? {
        return Ok(());
    }
    let client = client_info(headers);
    state
        .risk
        .record_event_quietly(
            NewSecurityEvent::new(user_id, SecurityEventType::FailedMfa)
                .with_score(3.0)
                .with_client(client.ip_address, client.user_agent),
        )
        .await;
    Err(AppError::Unauthorized)
}

async fn mfa_enable(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    Json(req): Json<MfaCodeRequest>,
) -> Result<Json<MfaStatusResponse>> {
    if state.mfa.get_setup(user.user_id).await?.is_none() {
        return Err(AppError::NotFound("MFA setup".to_string()));
    }
    require_totp(&state, user.user_id, &req, &headers).await?;
    state.mfa.enable(user.user_id).await?;

    let client = client_info(&headers);
    state
        .risk
        .record_event_quietly(
            NewSecurityEvent::new(user.user_id, SecurityEventType::MfaEnabled)
                .with_client(client.ip_address, client.user_agent),
        )
        .await;
    mfa_status(State(state), Extension(user)).await
}

async fn mfa_disable(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    Json(req): Json<MfaCodeRequest>,
) -> Result<Json<MfaStatusResponse>> {
    require_totp(&state, user.user_id, &req, &headers).await?;
    state.mfa.disable(user.user_id).await?;

    let client = client_info(&headers);
    state
        .risk
        .record_event_quietly(
            NewSecurityEvent::new(user.user_id, SecurityEventType::MfaDisabled)
                .with_score(5.0)
                .with_client(client.ip_address, client.user_agent),
        )
        .await;
    mfa_status(State(state), Extension(user)).await
}

#[derive(Serialize)]
pub struct BackupCodesResponse {
    pub remaining: usize,
}

async fn backup_codes_status(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<BackupCodesResponse>> {
    Ok(Json(BackupCodesResponse {
        remaining: state.mfa.backup_codes_count(user.user_id).await?,
    }))
}

#[derive(Serialize)]
pub struct RegeneratedCodesResponse {
    pub backup_codes: Vec<String>,
}

async fn regenerate_backup_codes(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    headers: HeaderMap,
    Json(req): Json<MfaCodeRequest>,
) -> Result<Json<RegeneratedCodesResponse>> {
    require_totp(&state, user.user_id, &req, &headers).await?;
    let backup_codes = state.mfa.regenerate_backup_codes(user.user_id).await?;
    Ok(Json(RegeneratedCodesResponse { backup_codes }))
}

// ─── Connections ─────────────────────────────────────────────

#[derive(Serialize)]
pub struct AppsResponse {
    pub apps: Vec<String>,
}

async fn list_apps(State(state): State<Arc<AppState>>) -> Json<AppsResponse> {
    Json(AppsResponse {
        apps: state.connections.app_ids(),
    })
}

async fn begin_connect(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(app_id): Path<String>,
) -> Result<Json<ConnectStart>> {
    Ok(Json(
        state
            .connections
            .begin_connect(user.user_id, &app_id.to_lowercase())
            .await?,
    ))
}

#[derive(Debug, Deserialize, Validate)]
pub struct CompleteConnectRequest {
    #[validate(length(min = 1, max = 2048, message = "Authorization code is required"))]
    pub code: String,
    #[validate(length(min = 1, max = 512, message = "State is required"))]
    pub state: String,
}

async fn complete_connect(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(app_id): Path<String>,
    Json(req): Json<CompleteConnectRequest>,
) -> Result<Json<ConnectionSummary>> {
    req.validate()
        .map_err(|e| AppError::InvalidInput(e.to_string()))?;

    let conn = state
        .connections
        .complete_connect(user.user_id, &app_id.to_lowercase(), &req.code, &req.state)
        .await?;
    Ok(Json(ConnectionSummary::from(&conn)))
}

async fn list_connections(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<ConnectionSummary>>> {
    Ok(Json(state.connections.list_connections(user.user_id).await?))
}

async fn check_connection(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(connection_id): Path<Uuid>,
) -> Result<Json<HealthCheckResult>> {
    state
        .connections
        .get_owned(user.user_id, connection_id)
        .await?;
    Ok(Json(state.connections.health_check(connection_id).await?))
}

async fn check_all_connections(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<HealthCheckResult>>> {
    Ok(Json(
        state.connections.check_all_for_user(user.user_id).await?,
    ))
}

#[derive(Debug, Deserialize)]
pub struct MetricsParams {
    #[serde(default)]
    pub limit: Option<usize>,
}

async fn connection_metrics(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(connection_id): Path<Uuid>,
    Query(params): Query<MetricsParams>,
) -> Result<Json<Vec<ConnectionHealthMetric>>> {
    Ok(Json(
        state
            .connections
            .health_history(
                user.user_id,
                connection_id,
                params.limit.unwrap_or(DEFAULT_METRICS_LIMIT),
            )
            .await?,
    ))
}

#[derive(Debug, Default, Deserialize)]
pub struct UsageRequest {
    #[serde(default)]
    pub bytes_transferred: u64,
}

async fn record_usage(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(connection_id): Path<Uuid>,
    Json(req): Json<UsageRequest>,
) -> Result<StatusCode> {
    state
        .connections
        .get_owned(user.user_id, connection_id)
        .await?;
    state
        .connections
        .record_usage(connection_id, req.bytes_transferred)
        .await;
    Ok(StatusCode::NO_CONTENT)
}

async fn revoke_connection(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(connection_id): Path<Uuid>,
) -> Result<Json<ConnectionSummary>> {
    let conn = state
        .connections
        .revoke(user.user_id, connection_id)
        .await?;
    Ok(Json(ConnectionSummary::from(&conn)))
}

// ─── Security Events & Devices ───────────────────────────────

#[derive(Debug, Deserialize)]
pub struct EventsParams {
    #[serde(default)]
    pub unresolved: bool,
}

async fn list_security_events(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Query(params): Query<EventsParams>,
) -> Result<Json<Vec<SecurityEvent>>> {
    Ok(Json(
        state
            .risk
            .list_events(user.user_id, params.unresolved)
            .await?,
    ))
}

async fn resolve_security_event(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(event_id): Path<Uuid>,
) -> Result<Json<SecurityEvent>> {
    Ok(Json(
        state.risk.resolve_for_user(user.user_id, event_id).await?,
    ))
}

async fn list_devices(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
) -> Result<Json<Vec<TrustedDevice>>> {
    Ok(Json(state.risk.list_devices(user.user_id).await?))
}

async fn trust_device(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(device_id): Path<Uuid>,
) -> Result<Json<TrustedDevice>> {
    Ok(Json(state.risk.trust_device(user.user_id, device_id).await?))
}

async fn untrust_device(
    State(state): State<Arc<AppState>>,
    Extension(user): Extension<AuthUser>,
    Path(device_id): Path<Uuid>,
) -> Result<Json<TrustedDevice>> {
    Ok(Json(
        state.risk.untrust_device(user.user_id, device_id).await?,
    ))
}
