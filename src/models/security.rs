// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Security events and device trust records.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SecurityEventType {
    Login,
    LoginFailed,
    SuspiciousLocation,
    NewDevice,
    FailedMfa,
    BackupCodeUsed,
    MfaEnabled,
    MfaDisabled,
    TokenRefresh,
    SessionRevoked,
    OauthConnected,
    OauthRevoked,
    ConnectionError,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Map a 0–10 risk score onto a severity band.
    pub fn from_score(score: f64) -> Self {
        if score < 3.0 {
            Severity::Low
        } else if score < 6.0 {
            Severity::Medium
        } else if score < 8.5 {
            Severity::High
        } else {
            Severity::Critical
        }
    }
}

/// Audit record. Append-only apart from resolution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityEvent {
    pub id: Uuid,
    pub user_id: Uuid,
    pub connection_id: Option<Uuid>,
    pub event_type: SecurityEventType,
    pub severity: Severity,
    pub risk_score: f64,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub details: Option<String>,
    pub resolved: bool,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// A device fingerprint seen for a user.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct TrustedDevice {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Unique across all users
    pub fingerprint: String,
    pub trusted: bool,
    pub last_ip: Option<String>,
    pub user_agent: Option<String>,
    pub first_seen: DateTime<Utc>,
    pub last_seen: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl TrustedDevice {
    pub fn new(
        user_id: Uuid,
        fingerprint: impl Into<String>,
        last_ip: Option<String>,
        user_agent: Option<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            fingerprint: fingerprint.into(),
            trusted: false,
            last_ip,
            user_agent,
            first_seen: now,
            last_seen: now,
            deleted_at: None,
        }
    }
}
