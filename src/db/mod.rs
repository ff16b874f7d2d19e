// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Credential store.
//!
//! Services receive an [`SharedStore`] in their constructors; there is no
//! ambient database handle. Every operation is scoped to the rows it names
//! (a user, a session token, a connection) and every single-use consumption
//! is one atomic call, so concurrent requests cannot both succeed.
//!
//! Soft-deleted rows (`deleted_at` set) are filtered here and never returned.

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PostgresStore;

use crate::error::AppError;
use crate::models::{
    AppConnection, BackupCode, ConnectionHealthMetric, MfaSetup, OAuthState, RefreshTokenRecord,
    SecurityEvent, SecurityEventType, Session, TrustedDevice, User,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use uuid::Uuid;

/// Row-scoped mutation applied to a connection while the store holds it.
pub type ConnectionMutation = Box<dyn FnOnce(&mut AppConnection) + Send>;

/// Shared handle passed to every service.
pub type SharedStore = Arc<dyn CredentialStore>;

#[async_trait]
pub trait CredentialStore: Send + Sync {
    // ─── Users ───────────────────────────────────────────────────

    /// Insert a user. Email, username and external id must be unused.
    async fn insert_user(&self, user: User) -> Result<User, AppError>;
    async fn get_user(&self, id: Uuid) -> Result<Option<User>, AppError>;
    async fn get_user_by_external_id(&self, external_id: &str) -> Result<Option<User>, AppError>;
    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, AppError>;
    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, AppError>;
    /// Overwrite mutable profile fields (flags, timestamps) of an existing user.
    async fn update_user(&self, user: &User) -> Result<(), AppError>;
    async fn soft_delete_user(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, AppError>;

    // ─── Sessions ────────────────────────────────────────────────

    async fn insert_session(&self, session: Session) -> Result<(), AppError>;
    async fn get_session(&self, token: &str) -> Result<Option<Session>, AppError>;
    async fn get_session_by_id(&self, id: Uuid) -> Result<Option<Session>, AppError>;
    /// Move `expires_at` forward and stamp `last_seen_at`.
    async fn extend_session(
        &self,
        token: &str,
        expires_at: DateTime<Utc>,
        seen_at: DateTime<Utc>,
    ) -> Result<Option<Session>, AppError>;
    /// Mark a session inactive. Returns the updated record, `None` if unknown.
    async fn deactivate_session(&self, token: &str) -> Result<Option<Session>, AppError>;
    /// Deactivate every active session of a user; returns their ids.
    async fn deactivate_user_sessions(&self, user_id: Uuid) -> Result<Vec<Uuid>, AppError>;
    async fn list_user_sessions(&self, user_id: Uuid) -> Result<Vec<Session>, AppError>;
    /// Hard-delete sessions with `expires_at < now`.
    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize, AppError>;

    // ─── Refresh Tokens ──────────────────────────────────────────

    async fn insert_refresh_token(&self, record: RefreshTokenRecord) -> Result<(), AppError>;
    /// Atomically remove and return a refresh record.
    async fn take_refresh_token(&self, jti: Uuid) -> Result<Option<RefreshTokenRecord>, AppError>;
    async fn delete_session_refresh_tokens(&self, session_id: Uuid) -> Result<usize, AppError>;
    async fn delete_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<usize, AppError>;

    // ─── MFA ─────────────────────────────────────────────────────

    /// Replace the user's setup and all its codes in one step.
    async fn replace_mfa_setup(
        &self,
        setup: MfaSetup,
        codes: Vec<BackupCode>,
    ) -> Result<(), AppError>;
    async fn get_mfa_setup(&self, user_id: Uuid) -> Result<Option<MfaSetup>, AppError>;
    async fn set_mfa_enabled(
        &self,
        user_id: Uuid,
        enabled: bool,
    ) -> Result<Option<MfaSetup>, AppError>;
    async fn list_backup_codes(&self, user_id: Uuid) -> Result<Vec<BackupCode>, AppError>;
    /// Mark the matching unused code as used. True only for the caller that
    /// flipped the flag.
    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError>;
    /// Discard all prior codes and install `codes`. False if there is no setup.
    async fn replace_backup_codes(
        &self,
        user_id: Uuid,
        codes: Vec<BackupCode>,
    ) -> Result<bool, AppError>;

    // ─── OAuth State ─────────────────────────────────────────────

    async fn insert_oauth_state(&self, state: OAuthState) -> Result<(), AppError>;
    /// Atomically remove and return a state record.
    async fn take_oauth_state(&self, state: &str) -> Result<Option<OAuthState>, AppError>;
    async fn delete_expired_oauth_states(&self, now: DateTime<Utc>) -> Result<usize, AppError>;

    // ─── Connections ─────────────────────────────────────────────

    async fn get_connection(&self, id: Uuid) -> Result<Option<AppConnection>, AppError>;
    async fn find_connection(
        &self,
        user_id: Uuid,
        app_id: &str,
    ) -> Result<Option<AppConnection>, AppError>;
    async fn list_connections(&self, user_id: Uuid) -> Result<Vec<AppConnection>, AppError>;
    /// Connections that count against the per-user cap (not revoked).
    async fn count_connections(&self, user_id: Uuid) -> Result<usize, AppError>;
    /// Create-or-update the single row for `(user_id, app_id)` and apply
    /// `mutate` while it is held.
    async fn upsert_connection(
        &self,
        user_id: Uuid,
        app_id: &str,
        provider: &str,
        mutate: ConnectionMutation,
    ) -> Result<AppConnection, AppError>;
    async fn update_connection(
        &self,
        id: Uuid,
        mutate: ConnectionMutation,
    ) -> Result<Option<AppConnection>, AppError>;
    async fn append_health_metric(&self, metric: ConnectionHealthMetric) -> Result<(), AppError>;
    /// Most recent samples first.
    async fn recent_health_metrics(
        &self,
        connection_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ConnectionHealthMetric>, AppError>;

    // ─── Security Events ─────────────────────────────────────────

    async fn insert_security_event(&self, event: SecurityEvent) -> Result<(), AppError>;
    async fn get_security_event(&self, id: Uuid) -> Result<Option<SecurityEvent>, AppError>;
    async fn resolve_security_event(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<SecurityEvent>, AppError>;
    /// Most recent events first.
    async fn list_security_events(&self, user_id: Uuid) -> Result<Vec<SecurityEvent>, AppError>;
    async fn count_security_events_since(
        &self,
        user_id: Uuid,
        event_type: SecurityEventType,
        since: DateTime<Utc>,
    ) -> Result<usize, AppError>;

    // ─── Devices ─────────────────────────────────────────────────

    async fn get_device_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<TrustedDevice>, AppError>;
    /// Insert a device; the fingerprint must be unused.
    async fn insert_device(&self, device: TrustedDevice) -> Result<(), AppError>;
    async fn touch_device(
        &self,
        id: Uuid,
        ip_address: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Option<TrustedDevice>, AppError>;
    async fn set_device_trusted(
        &self,
        user_id: Uuid,
        id: Uuid,
        trusted: bool,
    ) -> Result<Option<TrustedDevice>, AppError>;
    async fn list_devices(&self, user_id: Uuid) -> Result<Vec<TrustedDevice>, AppError>;
}
