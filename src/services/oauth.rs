// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Per-user OAuth connections to third-party applications.
//!
//! Handles:
//! - Authorization start with signed, single-use `state` tokens
//! - Code exchange and the connection upsert
//! - Provider access tokens (cached, refreshed under a per-connection lock)
//! - Health checks and usage accounting
//! - Revocation

use chrono::{DateTime, Duration, Utc};
use dashmap::DashMap;
use futures_util::stream::{self, StreamExt};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::{Config, OAuthAppConfig};
use crate::crypto;
use crate::db::SharedStore;
use crate::error::{AppError, Result};
use crate::models::{
    AppConnection, ConnectionHealthMetric, ConnectionStatus, HealthStatus, OAuthState,
    SecurityEventType, Severity,
};
use crate::services::provider::{OAuthProvider, ProviderTokens};
use crate::services::risk::{NewSecurityEvent, RiskService};

/// Refresh provider tokens this long before they expire.
const TOKEN_REFRESH_MARGIN_SECS: i64 = 300;
/// Checks slower than this are reported as `warning`.
const SLOW_RESPONSE_MS: u64 = 2000;
/// Window for the rolling uptime ratio.
const UPTIME_WINDOW: usize = 50;
const MAX_CONCURRENT_HEALTH_CHECKS: usize = 4;

/// Cached provider access token.
#[derive(Debug, Clone)]
struct CachedToken {
    access_token: String,
    /// `None` for tokens that do not expire
    expires_at: Option<DateTime<Utc>>,
}

impl CachedToken {
    fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at
            .map_or(true, |exp| now + Duration::seconds(TOKEN_REFRESH_MARGIN_SECS) < exp)
    }
}

/// Where to send the user to authorize, plus the state to expect back.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(ts_rs::TS))]
#[cfg_attr(feature = "binding-generation", ts(export))]
pub struct ConnectStart {
    pub auth_url: String,
    pub state: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub connection_id: Uuid,
    pub success: bool,
    pub response_time_ms: u64,
    pub health_status: HealthStatus,
    pub status: ConnectionStatus,
    pub uptime_percent: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A connection as shown to its owner. Provider tokens never leave the
/// service.
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionSummary {
    pub id: Uuid,
    pub app_id: String,
    pub provider: String,
    pub status: ConnectionStatus,
    pub account_email: Option<String>,
    pub scope: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_status: HealthStatus,
    pub response_time_ms: Option<u64>,
    pub error_count: u32,
    pub uptime_percent: f64,
    pub usage_count: u64,
    pub data_transferred: u64,
    pub last_used_at: Option<DateTime<Utc>>,
}

impl From<&AppConnection> for ConnectionSummary {
    fn from(c: &AppConnection) -> Self {
        Self {
            id: c.id,
            app_id: c.app_id.clone(),
            provider: c.provider.clone(),
            status: c.status,
            account_email: c.account_email.clone(),
            scope: c.scope.clone(),
            connected_at: c.connected_at,
            last_health_check: c.last_health_check,
            health_status: c.health_status,
            response_time_ms: c.response_time_ms,
            error_count: c.error_count,
            uptime_percent: c.uptime_percent,
            usage_count: c.usage_count,
            data_transferred: c.data_transferred,
            last_used_at: c.last_used_at,
        }
    }
}

pub struct OAuthConnectionManager {
    store: SharedStore,
    provider: Arc<dyn OAuthProvider>,
    risk: Arc<RiskService>,
    apps: HashMap<String, OAuthAppConfig>,
    state_key: Vec<u8>,
    state_ttl: Duration,
    redirect_uri: String,
    max_connections_per_user: usize,
    /// In-memory cache of provider access tokens, by connection id.
    token_cache: DashMap<Uuid, CachedToken>,
    /// Per-connection mutex to serialize token refresh.
    refresh_locks: DashMap<Uuid, Arc<Mutex<()>>>,
}

impl OAuthConnectionManager {
    pub fn new(
        config: &Config,
        store: SharedStore,
        provider: Arc<dyn OAuthProvider>,
        risk: Arc<RiskService>,
    ) -> Result<Self> {
        Ok(Self {
            store,
            provider,
            risk,
            apps: config.oauth_apps.clone(),
            state_key: crypto::derive_key(&config.jwt_signing_key, crypto::OAUTH_STATE_KEY_INFO)?,
            state_ttl: Duration::seconds(config.oauth_state_ttl_secs),
            redirect_uri: format!("{}/oauth/callback", config.api_url.trim_end_matches('/')),
            max_connections_per_user: config.max_connections_per_user,
            token_cache: DashMap::new(),
            refresh_locks: DashMap::new(),
        })
    }

    fn app(&self, app_id: &str) -> Result<&OAuthAppConfig> {
        self.apps
            .get(app_id)
            .ok_or_else(|| AppError::NotFound(format!("Application {}", app_id)))
    }

    pub fn app_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.apps.keys().cloned().collect();
        ids.sort();
        ids
    }

    // ─── Connect Flow ────────────────────────────────────────────────────────

    /// Start authorization for `(user_id, app_id)`.
    pub async fn begin_connect(&self, user_id: Uuid, app_id: &str) -> Result<ConnectStart> {
        let app = self.app(app_id)?;

        let existing = self.store.find_connection(user_id, app_id).await?;
        let counts_against_cap = existing
            .as_ref()
            .map_or(true, |c| c.status == ConnectionStatus::Revoked);
        if counts_against_cap {
            self.ensure_below_cap(user_id).await?;
        }

        // The row keeps its status until the callback succeeds.
        let nonce = crypto::random_token(24)?;
        let signature = sign_state(&self.state_key, &nonce, user_id, app_id)?;
        let state = format!("{}.{}", nonce, signature);

        let now = Utc::now();
        self.store
            .insert_oauth_state(OAuthState {
                state: state.clone(),
                user_id,
                app_id: app_id.to_string(),
                redirect_uri: self.redirect_uri.clone(),
                created_at: now,
                expires_at: now + self.state_ttl,
            })
            .await?;

        let mut auth_url = format!(
            "{}?client_id={}&redirect_uri={}&response_type=code&scope={}&state={}",
            app.auth_url,
            urlencoding::encode(&app.client_id),
            urlencoding::encode(&self.redirect_uri),
            urlencoding::encode(&app.scope),
            urlencoding::encode(&state),
        );
        if app.provider == "google" {
            // Google only issues refresh tokens for offline access with consent
            auth_url.push_str("&access_type=offline&prompt=consent");
        }

        tracing::info!(user_id = %user_id, app_id, "Starting OAuth connect flow");
        Ok(ConnectStart { auth_url, state })
    }

    async fn ensure_below_cap(&self, user_id: Uuid) -> Result<()> {
        let count = self.store.count_connections(user_id).await?;
        if count >= self.max_connections_per_user {
            return Err(AppError::Conflict(format!(
                "Connection limit of {} reached",
                self.max_connections_per_user
            )));
        }
        Ok(())
    }

    /// Finish authorization for a user who is already known to the caller.
    pub async fn complete_connect(
        &self,
        user_id: Uuid,
        app_id: &str,
        code: &str,
        state: &str,
    ) -> Result<AppConnection> {
        let app = self.app(app_id)?;
        let record = self.consume_state(state, Some(user_id), Some(app_id)).await?;
        self.finish_connect(record, app, code).await
    }

    /// Finish authorization from the provider redirect, where the user is
    /// identified only by the state token.
    pub async fn complete_callback(
        &self,
        app_id: Option<&str>,
        code: &str,
        state: &str,
    ) -> Result<AppConnection> {
        let record = self.consume_state(state, None, app_id).await?;
        let app = self.app(&record.app_id)?;
        self.finish_connect(record, app, code).await
    }

    /// Verify and consume a state token. The stored record is removed even
    /// when the caller turns out not to match it.
    async fn consume_state(
        &self,
        state: &str,
        expected_user: Option<Uuid>,
        expected_app: Option<&str>,
    ) -> Result<OAuthState> {
        let Some((nonce, signature)) = state.split_once('.') else {
            return Err(AppError::Conflict("Malformed OAuth state".to_string()));
        };

        let record = self
            .store
            .take_oauth_state(state)
            .await?
            .ok_or_else(|| AppError::Conflict("Unknown or already used OAuth state".to_string()))?;

        let user_matches = expected_user.map_or(true, |u| u == record.user_id);
        let app_matches = expected_app.map_or(true, |a| a == record.app_id);
        if !user_matches || !app_matches {
            tracing::warn!(
                user_id = %record.user_id,
                app_id = %record.app_id,
                "OAuth state presented for a different user or application"
            );
            return Err(AppError::Conflict("OAuth state mismatch".to_string()));
        }

        if !verify_state(&self.state_key, nonce, signature, record.user_id, &record.app_id) {
            tracing::error!("OAuth state signature mismatch! Potential tampering.");
            return Err(AppError::Conflict("OAuth state mismatch".to_string()));
        }

        if record.is_expired_at(Utc::now()) {
            return Err(AppError::Expired("OAuth state expired".to_string()));
        }
        Ok(record)
    }

    async fn finish_connect(
        &self,
        record: OAuthState,
        app: &OAuthAppConfig,
        code: &str,
    ) -> Result<AppConnection> {
        let user_id = record.user_id;
        let tokens = self
            .provider
            .exchange_code(app, code, &record.redirect_uri)
            .await?;

        let account_email = match self.provider.userinfo(app, &tokens.access_token).await {
            Ok(account) => account.email,
            Err(e) => {
                tracing::warn!(error = %e, app_id = %app.app_id, "Userinfo lookup failed after connect");
                None
            }
        };

        // The cap may have been reached by a concurrent flow since begin.
        let existing = self.store.find_connection(user_id, &app.app_id).await?;
        if existing.map_or(true, |c| c.status == ConnectionStatus::Revoked) {
            self.ensure_below_cap(user_id).await?;
        }

        let now = Utc::now();
        let expires_at = expiry_of(&tokens, now);
        let scope = tokens.scope.clone().unwrap_or_else(|| app.scope.clone());
        let access_token = tokens.access_token.clone();
        let refresh_token = tokens.refresh_token.clone();

        let conn = self
            .store
            .upsert_connection(
                user_id,
                &app.app_id,
                &app.provider,
                Box::new(move |c: &mut AppConnection| {
                    c.status = ConnectionStatus::Connected;
                    c.access_token = Some(access_token);
                    // Some providers only send a refresh token on first consent
                    if refresh_token.is_some() {
                        c.refresh_token = refresh_token;
                    }
                    c.scope = Some(scope);
                    c.token_expires_at = expires_at;
                    if account_email.is_some() {
                        c.account_email = account_email;
                    }
                    c.connected_at = Some(now);
                    c.error_count = 0;
                    c.health_status = HealthStatus::Unknown;
                }),
            )
            .await?;

        self.token_cache.insert(
            conn.id,
            CachedToken {
                access_token: tokens.access_token,
                expires_at,
            },
        );

        self.risk
            .record_event_quietly(
                NewSecurityEvent::new(user_id, SecurityEventType::OauthConnected)
                    .with_connection(conn.id)
                    .with_details(format!("Connected {}", app.app_id)),
            )
            .await;

        tracing::info!(
            user_id = %user_id,
            app_id = %app.app_id,
            connection_id = %conn.id,
            "OAuth connection established"
        );
        Ok(conn)
    }

    // ─── Token Management ────────────────────────────────────────────────────

    /// Get a non-expiring access token for a connection, refreshing it with
    /// the provider when it is within the refresh margin.
    pub async fn valid_access_token(&self, connection_id: Uuid) -> Result<String> {
        let now = Utc::now();

        if let Some(cached) = self.token_cache.get(&connection_id) {
            if cached.is_fresh(now) {
                return Ok(cached.access_token.clone());
            }
        }

        let lock = self
            .refresh_locks
            .entry(connection_id)
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();
        let _guard = lock.lock().await;

        // Another task may have refreshed while we were waiting.
        if let Some(cached) = self.token_cache.get(&connection_id) {
            if cached.is_fresh(now) {
                return Ok(cached.access_token.clone());
            }
        }

        let conn = self
            .store
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Connection {}", connection_id)))?;
        let access_token = conn.access_token.clone().ok_or_else(|| {
            AppError::UpstreamPermanent("Connection has no access token".to_string())
        })?;

        let current = CachedToken {
            access_token,
            expires_at: conn.token_expires_at,
        };
        if current.is_fresh(now) {
            self.token_cache.insert(connection_id, current.clone());
            return Ok(current.access_token);
        }

        let refresh_token = conn.refresh_token.clone().ok_or_else(|| {
            AppError::UpstreamPermanent("Access token expired and no refresh token".to_string())
        })?;
        let app = self.app(&conn.app_id)?;

        tracing::info!(connection_id = %connection_id, "Provider access token expiring, refreshing");
        let tokens = self.provider.refresh(app, &refresh_token).await?;

        let expires_at = expiry_of(&tokens, Utc::now());
        let new_access = tokens.access_token.clone();
        let new_refresh = tokens.refresh_token.clone();
        self.store
            .update_connection(
                connection_id,
                Box::new(move |c: &mut AppConnection| {
                    c.access_token = Some(new_access);
                    if new_refresh.is_some() {
                        c.refresh_token = new_refresh;
                    }
                    c.token_expires_at = expires_at;
                }),
            )
            .await?;

        self.token_cache.insert(
            connection_id,
            CachedToken {
                access_token: tokens.access_token.clone(),
                expires_at,
            },
        );
        tracing::info!(connection_id = %connection_id, "Provider token refreshed and cached");
        Ok(tokens.access_token)
    }

    // ─── Health & Usage ──────────────────────────────────────────────────────

    /// Probe the provider with the connection's token and record the result.
    ///
    /// Provider failures are recorded on the connection, not returned as
    /// errors.
    pub async fn health_check(&self, connection_id: Uuid) -> Result<HealthCheckResult> {
        let conn = self
            .store
            .get_connection(connection_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Connection {}", connection_id)))?;
        if !conn.is_usable() {
            return Err(AppError::Conflict(format!(
                "Connection {} is {:?}",
                connection_id, conn.status
            )));
        }
        let app = self.app(&conn.app_id)?;

        let started = Instant::now();
        let outcome = async {
            let token = self.valid_access_token(connection_id).await?;
            self.provider.userinfo(app, &token).await
        }
        .await;
        let elapsed_ms = started.elapsed().as_millis() as u64;

        let error = outcome.as_ref().err().map(|e| e.to_string());
        let success = error.is_none();
        if !success {
            // Next attempt must re-read the stored token.
            self.token_cache.remove(&connection_id);
        }

        self.store
            .append_health_metric(ConnectionHealthMetric::new(
                connection_id,
                success,
                elapsed_ms,
                error.clone(),
            ))
            .await?;
        let recent = self
            .store
            .recent_health_metrics(connection_id, UPTIME_WINDOW)
            .await?;
        let uptime = uptime_percent(&recent);

        let health_status = if !success {
            HealthStatus::Error
        } else if elapsed_ms >= SLOW_RESPONSE_MS {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        let now = Utc::now();
        let updated = self
            .store
            .update_connection(
                connection_id,
                Box::new(move |c: &mut AppConnection| {
                    c.last_health_check = Some(now);
                    c.response_time_ms = Some(elapsed_ms);
                    c.health_status = health_status;
                    c.uptime_percent = uptime;
                    // A concurrent revoke wins over the probe result.
                    if c.is_usable() {
                        if success {
                            c.status = ConnectionStatus::Connected;
                        } else {
                            c.error_count = c.error_count.saturating_add(1);
                            c.status = ConnectionStatus::Error;
                        }
                    }
                }),
            )
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Connection {}", connection_id)))?;

        if success {
            tracing::debug!(connection_id = %connection_id, elapsed_ms, "Health check passed");
        } else {
            tracing::warn!(
                connection_id = %connection_id,
                error = ?error,
                error_count = updated.error_count,
                "Health check failed"
            );
            if conn.status == ConnectionStatus::Connected {
                self.risk
                    .record_event_quietly(
                        NewSecurityEvent::new(conn.user_id, SecurityEventType::ConnectionError)
                            .with_connection(connection_id)
                            .with_severity(Severity::Medium)
                            .with_details(error.clone().unwrap_or_default()),
                    )
                    .await;
            }
        }

        Ok(HealthCheckResult {
            connection_id,
            success,
            response_time_ms: elapsed_ms,
            health_status,
            status: updated.status,
            uptime_percent: uptime,
            error,
        })
    }

    /// Health-check every usable connection of a user.
    pub async fn check_all_for_user(&self, user_id: Uuid) -> Result<Vec<HealthCheckResult>> {
        let ids: Vec<Uuid> = self
            .store
            .list_connections(user_id)
            .await?
            .into_iter()
            .filter(|c| c.is_usable())
            .map(|c| c.id)
            .collect();

        let results: Vec<Result<HealthCheckResult>> = stream::iter(ids)
            .map(|id| self.health_check(id))
            .buffer_unordered(MAX_CONCURRENT_HEALTH_CHECKS)
            .collect()
            .await;

        Ok(results
            .into_iter()
            .filter_map(|r| match r {
                Ok(result) => Some(result),
                Err(e) => {
                    tracing::warn!(user_id = %user_id, error = %e, "Health check skipped");
                    None
                }
            })
            .collect())
    }

    /// Count one API call through a connection. Never fails the caller.
    pub async fn record_usage(&self, connection_id: Uuid, bytes_transferred: u64) {
        let now = Utc::now();
        let result = self
            .store
            .update_connection(
                connection_id,
                Box::new(move |c: &mut AppConnection| {
                    c.usage_count = c.usage_count.saturating_add(1);
                    c.data_transferred = c.data_transferred.saturating_add(bytes_transferred);
                    c.last_used_at = Some(now);
                }),
            )
            .await;

        match result {
            Ok(Some(_)) => {}
            Ok(None) => {
                tracing::warn!(connection_id = %connection_id, "Usage recorded for unknown connection");
            }
            Err(e) => {
                tracing::warn!(connection_id = %connection_id, error = %e, "Failed to record usage");
            }
        }
    }

    // ─── Queries & Revocation ────────────────────────────────────────────────

    /// Fetch a connection, hiding other users' connections.
    pub async fn get_owned(&self, user_id: Uuid, connection_id: Uuid) -> Result<AppConnection> {
        match self.store.get_connection(connection_id).await? {
            Some(conn) if conn.user_id == user_id => Ok(conn),
            _ => Err(AppError::NotFound(format!("Connection {}", connection_id))),
        }
    }

    pub async fn list_connections(&self, user_id: Uuid) -> Result<Vec<ConnectionSummary>> {
        Ok(self
            .store
            .list_connections(user_id)
            .await?
            .iter()
            .map(ConnectionSummary::from)
            .collect())
    }

    /// Most recent health samples first.
    pub async fn health_history(
        &self,
        user_id: Uuid,
        connection_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ConnectionHealthMetric>> {
        self.get_owned(user_id, connection_id).await?;
        self.store
            .recent_health_metrics(connection_id, limit.clamp(1, 500))
            .await
    }

    /// Revoke a connection: clear its tokens locally and, best effort, at
    /// the provider. Revoking twice is a no-op.
    pub async fn revoke(&self, user_id: Uuid, connection_id: Uuid) -> Result<AppConnection> {
        let conn = self.get_owned(user_id, connection_id).await?;
        if conn.status == ConnectionStatus::Revoked {
            return Ok(conn);
        }

        let revoked = self
            .store
            .update_connection(
                connection_id,
                Box::new(|c: &mut AppConnection| {
                    c.status = ConnectionStatus::Revoked;
                    c.access_token = None;
                    c.refresh_token = None;
                    c.token_expires_at = None;
                    c.health_status = HealthStatus::Unknown;
                }),
            )
            .await?
            .ok_or_else(|| AppError::NotFound(format!("Connection {}", connection_id)))?;

        self.token_cache.remove(&connection_id);
        self.refresh_locks.remove(&connection_id);

        let provider_token = conn.refresh_token.as_deref().or(conn.access_token.as_deref());
        if let (Some(token), Ok(app)) = (provider_token, self.app(&conn.app_id)) {
            if let Err(e) = self.provider.revoke(app, token).await {
                tracing::warn!(
                    connection_id = %connection_id,
                    error = %e,
                    "Provider revocation failed, local tokens already cleared"
                );
            }
        }

        self.risk
            .record_event_quietly(
                NewSecurityEvent::new(user_id, SecurityEventType::OauthRevoked)
                    .with_connection(connection_id)
                    .with_details(format!("Revoked {}", conn.app_id)),
            )
            .await;

        tracing::info!(user_id = %user_id, connection_id = %connection_id, "Connection revoked");
        Ok(revoked)
    }

    /// Revoke every live connection of a user. Returns how many were revoked.
    pub async fn revoke_all(&self, user_id: Uuid) -> Result<usize> {
        let mut revoked = 0;
        for conn in self.store.list_connections(user_id).await? {
            if conn.status != ConnectionStatus::Revoked {
                self.revoke(user_id, conn.id).await?;
                revoked += 1;
            }
        }
        Ok(revoked)
    }
}

fn expiry_of(tokens: &ProviderTokens, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
    tokens
        .expires_in
        .filter(|secs| *secs > 0)
        .map(|secs| now + Duration::seconds(secs))
}

/// Success ratio of `samples` as a percentage; 100 with no samples.
pub fn uptime_percent(samples: &[ConnectionHealthMetric]) -> f64 {
    if samples.is_empty() {
        return 100.0;
    }
    let ok = samples.iter().filter(|m| m.success).count();
    ok as f64 * 100.0 / samples.len() as f64
}

/// HMAC over the nonce and the identity it was issued to.
pub fn sign_state(key: &[u8], nonce: &str, user_id: Uuid, app_id: &str) -> Result<String> {
    crypto::hmac_hex(key, &[nonce, &user_id.to_string(), app_id])
}

pub fn verify_state(key: &[u8], nonce: &str, signature: &str, user_id: Uuid, app_id: &str) -> bool {
    match sign_state(key, nonce, user_id, app_id) {
        Ok(expected) => crypto::constant_time_eq(&expected, signature),
        Err(_) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_verify_state_success() {
        let key = b"secret_key";
        let user_id = Uuid::new_v4();
        let sig = sign_state(key, "nonce123", user_id, "github").unwrap();
        assert!(verify_state(key, "nonce123", &sig, user_id, "github"));
    }

    #[test]
    fn test_verify_state_rejects_other_app_or_user() {
        let key = b"secret_key";
        let user_id = Uuid::new_v4();
        let sig = sign_state(key, "nonce123", user_id, "github").unwrap();
        assert!(!verify_state(key, "nonce123", &sig, user_id, "google"));
        assert!(!verify_state(key, "nonce123", &sig, Uuid::new_v4(), "github"));
        assert!(!verify_state(key, "nonce123", "invalid_signature", user_id, "github"));
    }

    #[test]
    fn test_uptime_percent() {
        let id = Uuid::new_v4();
        assert_eq!(uptime_percent(&[]), 100.0);
        let samples = vec![
            ConnectionHealthMetric::new(id, true, 10, None),
            ConnectionHealthMetric::new(id, false, 10, Some("boom".into())),
            ConnectionHealthMetric::new(id, true, 10, None),
            ConnectionHealthMetric::new(id, true, 10, None),
        ];
        assert_eq!(uptime_percent(&samples), 75.0);
    }

    #[test]
    fn test_cached_token_freshness() {
        let now = Utc::now();
        let never = CachedToken {
            access_token: "a".into(),
            expires_at: None,
        };
        let soon = CachedToken {
            access_token: "a".into(),
            expires_at: Some(now + Duration::seconds(60)),
        };
        let later = CachedToken {
            access_token: "a".into(),
            expires_at: Some(now + Duration::hours(1)),
        };
        assert!(never.is_fresh(now));
        assert!(!soon.is_fresh(now));
        assert!(later.is_fresh(now));
    }
}
