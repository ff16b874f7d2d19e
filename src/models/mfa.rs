// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! MFA setup and backup code models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// TOTP enrollment for a user. At most one live setup exists per user.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct MfaSetup {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Base32 TOTP secret
    pub secret: String,
    pub enabled: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl MfaSetup {
    pub fn new(user_id: Uuid, secret: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            user_id,
            secret: secret.into(),
            enabled: false,
            created_at: now,
            updated_at: now,
            deleted_at: None,
        }
    }
}

/// One-time recovery code. Once `used` is set it stays set.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct BackupCode {
    pub id: Uuid,
    pub setup_id: Uuid,
    /// Keyed hash of the normalized code (unique)
    pub code_hash: String,
    pub used: bool,
    pub used_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub deleted_at: Option<DateTime<Utc>>,
}

impl BackupCode {
    pub fn new(setup_id: Uuid, code_hash: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            setup_id,
            code_hash,
            used: false,
            used_at: None,
            created_at: Utc::now(),
            deleted_at: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}
