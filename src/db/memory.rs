// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! In-process credential store backed by sharded concurrent maps.
//!
//! Each table is a `DashMap`; a write locks only the shard holding the row,
//! which gives the row-scoped atomicity the services rely on:
//! - backup codes live inside their user's MFA record, so consumption is a
//!   conditional update under that record's lock
//! - connections are keyed by `(user_id, app_id)`, so duplicates cannot exist
//! - refresh tokens and OAuth states are consumed by `remove`
//!
//! Never hold a map guard while touching the same map again.

use super::{ConnectionMutation, CredentialStore};
use crate::error::AppError;
use crate::models::{
    AppConnection, BackupCode, ConnectionHealthMetric, ConnectionStatus, MfaSetup, OAuthState,
    RefreshTokenRecord, SecurityEvent, SecurityEventType, Session, TrustedDevice, User,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::Arc;
use uuid::Uuid;

/// A user's MFA setup together with its backup codes.
#[derive(Debug, Clone)]
struct MfaRecord {
    setup: MfaSetup,
    codes: Vec<BackupCode>,
}

#[derive(Default)]
struct Tables {
    users: DashMap<Uuid, User>,
    users_by_email: DashMap<String, Uuid>,
    users_by_username: DashMap<String, Uuid>,
    users_by_external_id: DashMap<String, Uuid>,

    /// Keyed by session token
    sessions: DashMap<String, Session>,
    session_tokens: DashMap<Uuid, String>,
    refresh_tokens: DashMap<Uuid, RefreshTokenRecord>,

    /// Keyed by user id
    mfa: DashMap<Uuid, MfaRecord>,

    oauth_states: DashMap<String, OAuthState>,
    connections: DashMap<(Uuid, String), AppConnection>,
    connection_keys: DashMap<Uuid, (Uuid, String)>,
    health_metrics: DashMap<Uuid, Vec<ConnectionHealthMetric>>,

    security_events: DashMap<Uuid, SecurityEvent>,
    /// Keyed by fingerprint
    devices: DashMap<String, TrustedDevice>,
    device_fingerprints: DashMap<Uuid, String>,
}

/// In-memory [`CredentialStore`]. Cloning shares the same tables.
#[derive(Clone, Default)]
pub struct MemoryStore {
    tables: Arc<Tables>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn unique_key(value: &str) -> String {
    value.trim().to_lowercase()
}

#[async_trait]
impl CredentialStore for MemoryStore {
    // ─── Users ───────────────────────────────────────────────────

    async fn insert_user(&self, user: User) -> Result<User, AppError> {
        let t = &self.tables;

        // Reserve the unique keys in a fixed order; dropping a vacant entry
        // releases it without inserting anything.
        let Entry::Vacant(email_slot) = t.users_by_email.entry(unique_key(&user.email)) else {
            return Err(AppError::Conflict("email already registered".to_string()));
        };
        let Entry::Vacant(name_slot) = t.users_by_username.entry(unique_key(&user.username)) else {
            return Err(AppError::Conflict("username already taken".to_string()));
        };
        let Entry::Vacant(ext_slot) = t.users_by_external_id.entry(user.external_id.clone()) else {
            return Err(AppError::Conflict(
                "identity already linked to a user".to_string(),
            ));
        };

        email_slot.insert(user.id);
        name_slot.insert(user.id);
        ext_slot.insert(user.id);
        t.users.insert(user.id, user.clone());

        Ok(user)
    }

    async fn get_user(&self, id: Uuid) -> Result<Option<User>, AppError> {
        Ok(self
            .tables
            .users
            .get(&id)
            .filter(|u| !u.is_deleted())
            .map(|u| u.clone()))
    }

    async fn get_user_by_external_id(&self, external_id: &str) -> Result<Option<User>, AppError> {
        let id = self
            .tables
            .users_by_external_id
            .get(external_id)
            .map(|id| *id);
        match id {
            Some(id) => self.get_user(id).await,
            None => Ok(None),
        }
    }

    async fn get_user_by_email(&self, email: &str) -> Result<Option<User>, AppError> {
        let id = self
            .tables
            .users_by_email
            .get(&unique_key(email))
            .map(|id| *id);
        match id {
            Some(id) => self.get_user(id).await,
            None => Ok(None),
        }
    }

    async fn get_user_by_username(&self, username: &str) -> Result<Option<User>, AppError> {
        let id = self
            .tables
            .users_by_username
            .get(&unique_key(username))
            .map(|id| *id);
        match id {
            Some(id) => self.get_user(id).await,
            None => Ok(None),
        }
    }

    async fn update_user(&self, user: &User) -> Result<(), AppError> {
        let mut stored = self
            .tables
            .users
            .get_mut(&user.id)
            .filter(|u| !u.is_deleted())
            .ok_or_else(|| AppError::NotFound(format!("User {}", user.id)))?;

        stored.email_verified = user.email_verified;
        stored.is_active = user.is_active;
        stored.last_login_at = user.last_login_at;
        stored.updated_at = Utc::now();
        Ok(())
    }

    async fn soft_delete_user(&self, id: Uuid, at: DateTime<Utc>) -> Result<bool, AppError> {
        let t = &self.tables;
        let keys = {
            let Some(mut user) = t.users.get_mut(&id) else {
                return Ok(false);
            };
            if user.is_deleted() {
                return Ok(false);
            }
            user.deleted_at = Some(at);
            user.is_active = false;
            (
                unique_key(&user.email),
                unique_key(&user.username),
                user.external_id.clone(),
            )
        };

        // Free the unique keys so the identity can register again.
        t.users_by_email.remove(&keys.0);
        t.users_by_username.remove(&keys.1);
        t.users_by_external_id.remove(&keys.2);
        Ok(true)
    }

    // ─── Sessions ────────────────────────────────────────────────

    async fn insert_session(&self, session: Session) -> Result<(), AppError> {
        let t = &self.tables;
        match t.sessions.entry(session.session_token.clone()) {
            Entry::Occupied(_) => Err(AppError::Conflict("session token collision".to_string())),
            Entry::Vacant(slot) => {
                t.session_tokens
                    .insert(session.id, session.session_token.clone());
                slot.insert(session);
                Ok(())
            }
        }
    }

    async fn get_session(&self, token: &str) -> Result<Option<Session>, AppError> {
        Ok(self.tables.sessions.get(token).map(|s| s.clone()))
    }

    async fn get_session_by_id(&self, id: Uuid) -> Result<Option<Session>, AppError> {
        let token = self.tables.session_tokens.get(&id).map(|t| t.clone());
        match token {
            Some(token) => self.get_session(&token).await,
            None => Ok(None),
        }
    }

    async fn extend_session(
        &self,
        token: &str,
        expires_at: DateTime<Utc>,
        seen_at: DateTime<Utc>,
    ) -> Result<Option<Session>, AppError> {
        Ok(self.tables.sessions.get_mut(token).map(|mut s| {
            s.expires_at = expires_at;
            s.last_seen_at = seen_at;
            s.clone()
        }))
    }

    async fn deactivate_session(&self, token: &str) -> Result<Option<Session>, AppError> {
        Ok(self.tables.sessions.get_mut(token).map(|mut s| {
            s.is_active = false;
            s.clone()
        }))
    }

    async fn deactivate_user_sessions(&self, user_id: Uuid) -> Result<Vec<Uuid>, AppError> {
        let mut ids = Vec::new();
        for mut session in self.tables.sessions.iter_mut() {
            if session.user_id == user_id && session.is_active {
                session.is_active = false;
                ids.push(session.id);
            }
        }
        Ok(ids)
    }

    async fn list_user_sessions(&self, user_id: Uuid) -> Result<Vec<Session>, AppError> {
        let mut sessions: Vec<Session> = self
            .tables
            .sessions
            .iter()
            .filter(|s| s.user_id == user_id)
            .map(|s| s.clone())
            .collect();
        sessions.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(sessions)
    }

    async fn delete_expired_sessions(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        let t = &self.tables;
        let mut removed = Vec::new();
        t.sessions.retain(|_, s| {
            if s.expires_at < now {
                removed.push(s.id);
                false
            } else {
                true
            }
        });
        for id in &removed {
            t.session_tokens.remove(id);
        }
        Ok(removed.len())
    }

    // ─── Refresh Tokens ──────────────────────────────────────────

    async fn insert_refresh_token(&self, record: RefreshTokenRecord) -> Result<(), AppError> {
        self.tables.refresh_tokens.insert(record.jti, record);
        Ok(())
    }

    async fn take_refresh_token(&self, jti: Uuid) -> Result<Option<RefreshTokenRecord>, AppError> {
        Ok(self
            .tables
            .refresh_tokens
            .remove(&jti)
            .map(|(_, record)| record))
    }

    async fn delete_session_refresh_tokens(&self, session_id: Uuid) -> Result<usize, AppError> {
        let mut count = 0;
        self.tables.refresh_tokens.retain(|_, r| {
            if r.session_id == Some(session_id) {
                count += 1;
                false
            } else {
                true
            }
        });
        Ok(count)
    }

    async fn delete_expired_refresh_tokens(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        let before = self.tables.refresh_tokens.len();
        self.tables.refresh_tokens.retain(|_, r| r.expires_at >= now);
        Ok(before.saturating_sub(self.tables.refresh_tokens.len()))
    }

    // ─── MFA ─────────────────────────────────────────────────────

    async fn replace_mfa_setup(
        &self,
        setup: MfaSetup,
        codes: Vec<BackupCode>,
    ) -> Result<(), AppError> {
        // A single insert swaps setup and codes together; the prior record
        // (and every code it owned) is dropped.
        self.tables
            .mfa
            .insert(setup.user_id, MfaRecord { setup, codes });
        Ok(())
    }

    async fn get_mfa_setup(&self, user_id: Uuid) -> Result<Option<MfaSetup>, AppError> {
        Ok(self
            .tables
            .mfa
            .get(&user_id)
            .filter(|r| r.setup.deleted_at.is_none())
            .map(|r| r.setup.clone()))
    }

    async fn set_mfa_enabled(
        &self,
        user_id: Uuid,
        enabled: bool,
    ) -> Result<Option<MfaSetup>, AppError> {
        Ok(self
            .tables
            .mfa
            .get_mut(&user_id)
            .filter(|r| r.setup.deleted_at.is_none())
            .map(|mut r| {
                r.setup.enabled = enabled;
                r.setup.updated_at = Utc::now();
                r.setup.clone()
            }))
    }

    async fn list_backup_codes(&self, user_id: Uuid) -> Result<Vec<BackupCode>, AppError> {
        Ok(self
            .tables
            .mfa
            .get(&user_id)
            .filter(|r| r.setup.deleted_at.is_none())
            .map(|r| r.codes.iter().filter(|c| c.is_live()).cloned().collect())
            .unwrap_or_default())
    }

    async fn consume_backup_code(
        &self,
        user_id: Uuid,
        code_hash: &str,
        at: DateTime<Utc>,
    ) -> Result<bool, AppError> {
        let Some(mut record) = self.tables.mfa.get_mut(&user_id) else {
            return Ok(false);
        };
        if record.setup.deleted_at.is_some() {
            return Ok(false);
        }

        // Conditional update: only a live, unused code flips to used.
        match record
            .codes
            .iter_mut()
            .find(|c| c.is_live() && !c.used && c.code_hash == code_hash)
        {
            Some(code) => {
                code.used = true;
                code.used_at = Some(at);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn replace_backup_codes(
        &self,
        user_id: Uuid,
        codes: Vec<BackupCode>,
    ) -> Result<bool, AppError> {
        let Some(mut record) = self.tables.mfa.get_mut(&user_id) else {
            return Ok(false);
        };
        if record.setup.deleted_at.is_some() {
            return Ok(false);
        }

        let now = Utc::now();
        for code in record.codes.iter_mut().filter(|c| c.is_live()) {
            code.deleted_at = Some(now);
        }
        record.codes.extend(codes);
        record.setup.updated_at = now;
        Ok(true)
    }

    // ─── OAuth State ─────────────────────────────────────────────

    async fn insert_oauth_state(&self, state: OAuthState) -> Result<(), AppError> {
        match self.tables.oauth_states.entry(state.state.clone()) {
            Entry::Occupied(_) => Err(AppError::Conflict("state token collision".to_string())),
            Entry::Vacant(slot) => {
                slot.insert(state);
                Ok(())
            }
        }
    }

    async fn take_oauth_state(&self, state: &str) -> Result<Option<OAuthState>, AppError> {
        Ok(self
            .tables
            .oauth_states
            .remove(state)
            .map(|(_, record)| record))
    }

    async fn delete_expired_oauth_states(&self, now: DateTime<Utc>) -> Result<usize, AppError> {
        let before = self.tables.oauth_states.len();
        self.tables.oauth_states.retain(|_, s| !s.is_expired_at(now));
        Ok(before.saturating_sub(self.tables.oauth_states.len()))
    }

    // ─── Connections ─────────────────────────────────────────────

    async fn get_connection(&self, id: Uuid) -> Result<Option<AppConnection>, AppError> {
        let key = self.tables.connection_keys.get(&id).map(|k| k.clone());
        let Some(key) = key else {
            return Ok(None);
        };
        Ok(self
            .tables
            .connections
            .get(&key)
            .filter(|c| c.id == id && c.deleted_at.is_none())
            .map(|c| c.clone()))
    }

    async fn find_connection(
        &self,
        user_id: Uuid,
        app_id: &str,
    ) -> Result<Option<AppConnection>, AppError> {
        Ok(self
            .tables
            .connections
            .get(&(user_id, app_id.to_string()))
            .filter(|c| c.deleted_at.is_none())
            .map(|c| c.clone()))
    }

    async fn list_connections(&self, user_id: Uuid) -> Result<Vec<AppConnection>, AppError> {
        let mut connections: Vec<AppConnection> = self
            .tables
            .connections
            .iter()
            .filter(|c| c.user_id == user_id && c.deleted_at.is_none())
            .map(|c| c.clone())
            .collect();
        connections.sort_by(|a, b| a.app_id.cmp(&b.app_id));
        Ok(connections)
    }

    async fn count_connections(&self, user_id: Uuid) -> Result<usize, AppError> {
        Ok(self
            .tables
            .connections
            .iter()
            .filter(|c| {
                c.user_id == user_id
                    && c.deleted_at.is_none()
                    && c.status != ConnectionStatus::Revoked
            })
            .count())
    }

    async fn upsert_connection(
        &self,
        user_id: Uuid,
        app_id: &str,
        provider: &str,
        mutate: ConnectionMutation,
    ) -> Result<AppConnection, AppError> {
        let t = &self.tables;
        let key = (user_id, app_id.to_string());

        let snapshot = {
            let mut row = t
                .connections
                .entry(key.clone())
                .or_insert_with(|| AppConnection::new(user_id, app_id, provider));
            if row.deleted_at.is_some() {
                *row = AppConnection::new(user_id, app_id, provider);
            }
            mutate(&mut *row);
            row.updated_at = Utc::now();
            row.clone()
        };

        t.connection_keys.insert(snapshot.id, key);
        Ok(snapshot)
    }

    async fn update_connection(
        &self,
        id: Uuid,
        mutate: ConnectionMutation,
    ) -> Result<Option<AppConnection>, AppError> {
        let key = self.tables.connection_keys.get(&id).map(|k| k.clone());
        let Some(key) = key else {
            return Ok(None);
        };
        let Some(mut row) = self.tables.connections.get_mut(&key) else {
            return Ok(None);
        };
        if row.id != id || row.deleted_at.is_some() {
            return Ok(None);
        }
        mutate(&mut *row);
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn append_health_metric(&self, metric: ConnectionHealthMetric) -> Result<(), AppError> {
        self.tables
            .health_metrics
            .entry(metric.connection_id)
            .or_default()
            .push(metric);
        Ok(())
    }

    async fn recent_health_metrics(
        &self,
        connection_id: Uuid,
        limit: usize,
    ) -> Result<Vec<ConnectionHealthMetric>, AppError> {
        Ok(self
            .tables
            .health_metrics
            .get(&connection_id)
            .map(|m| m.iter().rev().take(limit).cloned().collect())
            .unwrap_or_default())
    }

    // ─── Security Events ─────────────────────────────────────────

    async fn insert_security_event(&self, event: SecurityEvent) -> Result<(), AppError> {
        self.tables.security_events.insert(event.id, event);
        Ok(())
    }

    async fn get_security_event(&self, id: Uuid) -> Result<Option<SecurityEvent>, AppError> {
        Ok(self
            .tables
            .security_events
            .get(&id)
            .filter(|e| e.deleted_at.is_none())
            .map(|e| e.clone()))
    }

    async fn resolve_security_event(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<SecurityEvent>, AppError> {
        Ok(self
            .tables
            .security_events
            .get_mut(&id)
            .filter(|e| e.deleted_at.is_none())
            .map(|mut e| {
                if !e.resolved {
                    e.resolved = true;
                    e.resolved_at = Some(at);
                }
                e.clone()
            }))
    }

    async fn list_security_events(&self, user_id: Uuid) -> Result<Vec<SecurityEvent>, AppError> {
        let mut events: Vec<SecurityEvent> = self
            .tables
            .security_events
            .iter()
            .filter(|e| e.user_id == user_id && e.deleted_at.is_none())
            .map(|e| e.clone())
            .collect();
        events.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(events)
    }

    async fn count_security_events_since(
        &self,
        user_id: Uuid,
        event_type: SecurityEventType,
        since: DateTime<Utc>,
    ) -> Result<usize, AppError> {
        Ok(self
            .tables
            .security_events
            .iter()
            .filter(|e| {
                e.user_id == user_id
                    && e.event_type == event_type
                    && e.created_at >= since
                    && e.deleted_at.is_none()
            })
            .count())
    }

    // ─── Devices ─────────────────────────────────────────────────

    async fn get_device_by_fingerprint(
        &self,
        fingerprint: &str,
    ) -> Result<Option<TrustedDevice>, AppError> {
        Ok(self
            .tables
            .devices
            .get(fingerprint)
            .filter(|d| d.deleted_at.is_none())
            .map(|d| d.clone()))
    }

    async fn insert_device(&self, device: TrustedDevice) -> Result<(), AppError> {
        let t = &self.tables;
        match t.devices.entry(device.fingerprint.clone()) {
            Entry::Occupied(_) => Err(AppError::Conflict(
                "device fingerprint already registered".to_string(),
            )),
            Entry::Vacant(slot) => {
                t.device_fingerprints
                    .insert(device.id, device.fingerprint.clone());
                slot.insert(device);
                Ok(())
            }
        }
    }

    async fn touch_device(
        &self,
        id: Uuid,
        ip_address: Option<String>,
        at: DateTime<Utc>,
    ) -> Result<Option<TrustedDevice>, AppError> {
        let fingerprint = self.tables.device_fingerprints.get(&id).map(|f| f.clone());
        let Some(fingerprint) = fingerprint else {
            return Ok(None);
        };
        Ok(self
            .tables
            .devices
            .get_mut(&fingerprint)
            .filter(|d| d.id == id && d.deleted_at.is_none())
            .map(|mut d| {
                d.last_seen = at;
                if ip_address.is_some() {
                    d.last_ip = ip_address;
                }
                d.clone()
            }))
    }

    async fn set_device_trusted(
        &self,
        user_id: Uuid,
        id: Uuid,
        trusted: bool,
    ) -> Result<Option<TrustedDevice>, AppError> {
        let fingerprint = self.tables.device_fingerprints.get(&id).map(|f| f.clone());
        let Some(fingerprint) = fingerprint else {
            return Ok(None);
        };
        Ok(self
            .tables
            .devices
            .get_mut(&fingerprint)
            .filter(|d| d.id == id && d.user_id == user_id && d.deleted_at.is_none())
            .map(|mut d| {
                d.trusted = trusted;
                d.clone()
            }))
    }

    async fn list_devices(&self, user_id: Uuid) -> Result<Vec<TrustedDevice>, AppError> {
        let mut devices: Vec<TrustedDevice> = self
            .tables
            .devices
            .iter()
            .filter(|d| d.user_id == user_id && d.deleted_at.is_none())
            .map(|d| d.clone())
            .collect();
        devices.sort_by(|a, b| b.last_seen.cmp(&a.last_seen));
        Ok(devices)
    }
}
