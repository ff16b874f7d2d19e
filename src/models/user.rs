// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! User model for storage and API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Local user record linked to an identity in the external authority.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    /// Subject of the user in the external identity provider
    pub external_id: String,
    /// Unique, compared case-insensitively
    pub email: String,
    /// Unique, compared case-insensitively
    pub username: String,
    pub email_verified: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub last_login_at: Option<DateTime<Utc>>,
    /// Soft-delete marker; deleted users are invisible to lookups
    pub deleted_at: Option<DateTime<Utc>>,
}

impl User {
    pub fn new(
        external_id: impl Into<String>,
        email: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            external_id: external_id.into(),
            email: email.into(),
            username: username.into(),
            email_verified: false,
            is_active: true,
            created_at: now,
            updated_at: now,
            last_login_at: None,
            deleted_at: None,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted_at.is_some()
    }
}
