// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Third-party application connections (OAuth) and their health data.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Connection lifecycle.
///
/// `pending → connected → {error, revoked}`; `error → connected` after a
/// successful health check.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionStatus {
    Pending,
    Connected,
    Error,
    Revoked,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Error,
    Unknown,
}

/// A user's authorized link to one external application.
///
/// At most one row exists per `(user_id, app_id)`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConnection {
    pub id: Uuid,
    pub user_id: Uuid,
    pub app_id: String,
    pub provider: String,
    pub status: ConnectionStatus,

    // ─── Provider Tokens ─────────────────────────────────────────
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub scope: Option<String>,
    pub token_expires_at: Option<DateTime<Utc>>,
    /// Account email reported by the provider, when available
    pub account_email: Option<String>,
    pub connected_at: Option<DateTime<Utc>>,

    // ─── Health ──────────────────────────────────────────────────
    pub last_health_check: Option<DateTime<Utc>>,
    pub health_status: HealthStatus,
    pub response_time_ms: Option<u64>,
    pub error_count: u32,
    pub uptime_percent: f64,

    // ─── Usage ───────────────────────────────────────────────────
    pub usage_count: u64,
    pub data_transferred: u64,
    pub last_used_at: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl AppConnection {
    pub fn new(user_id: Uuid, app_id: impl Into<String>, provider: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            app_id: app_id.into(),
            provider: provider.into(),
            status: ConnectionStatus::Pending,
            access_token: None,
            refresh_token: None,
            scope: None,
            token_expires_at: None,
            account_email: None,
            connected_at: None,
            last_health_check: None,
            health_status: HealthStatus::Unknown,
            response_time_ms: None,
            error_count: 0,
            uptime_percent: 100.0,
            usage_count: 0,
            data_transferred: 0,
            last_used_at: None,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }

    /// Whether health checks and API calls may use this connection.
    pub fn is_usable(&self) -> bool {
        matches!(
            self.status,
            ConnectionStatus::Connected | ConnectionStatus::Error
        )
    }
}

/// One health-check sample (append-only time series).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionHealthMetric {
    pub id: Uuid,
    pub connection_id: Uuid,
    pub checked_at: DateTime<Utc>,
    pub success: bool,
    pub response_time_ms: u64,
    pub error: Option<String>,
}

impl ConnectionHealthMetric {
    pub fn new(
        connection_id: Uuid,
        success: bool,
        response_time_ms: u64,
        error: Option<String>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            connection_id,
            checked_at: Utc::now(),
            success,
            response_time_ms,
            error,
        }
    }
}

/// Server-side record behind an OAuth `state` token. Consumed exactly once.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct OAuthState {
    pub state: String,
    pub user_id: Uuid,
    pub app_id: String,
    pub redirect_uri: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl OAuthState {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}
