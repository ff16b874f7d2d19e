// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Server-side session lifecycle and the background reaper.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tokio::task::JoinHandle;
use uuid::Uuid;

use crate::config::Config;
use crate::crypto;
use crate::db::SharedStore;
use crate::error::{AppError, Result};
use crate::models::Session;
use crate::services::token::TokenService;

/// Why a session token was rejected.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found")]
    NotFound,

    /// The record is returned so callers can prompt re-authentication.
    #[error("session expired")]
    Expired(Session),

    #[error("session inactive")]
    Inactive(Session),

    #[error(transparent)]
    Store(#[from] AppError),
}

impl From<SessionError> for AppError {
    fn from(err: SessionError) -> Self {
        match err {
            SessionError::NotFound => AppError::Unauthorized,
            SessionError::Expired(_) => AppError::Expired("session expired".to_string()),
            SessionError::Inactive(_) => AppError::Inactive("session inactive".to_string()),
            SessionError::Store(e) => e,
        }
    }
}

/// What one reaper pass removed.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CleanupReport {
    pub sessions: usize,
    pub refresh_tokens: usize,
    pub oauth_states: usize,
}

pub struct SessionManager {
    store: SharedStore,
    tokens: Arc<TokenService>,
    ttl: Duration,
}

impl SessionManager {
    pub fn new(config: &Config, store: SharedStore, tokens: Arc<TokenService>) -> Self {
        Self {
            store,
            tokens,
            ttl: Duration::hours(config.session_ttl_hours),
        }
    }

    pub async fn create(
        &self,
        user_id: Uuid,
        ip_address: Option<String>,
        user_agent: Option<String>,
    ) -> Result<Session> {
        let token = crypto::random_token(32)?;
        let session = Session::new(user_id, token, ip_address, user_agent, self.ttl);
        self.store.insert_session(session.clone()).await?;

        tracing::info!(
            user_id = %user_id,
            session_id = %session.id,
            expires_at = %session.expires_at,
            "Session created"
        );
        Ok(session)
    }

    pub async fn validate(&self, token: &str) -> std::result::Result<Session, SessionError> {
        let session = self
            .store
            .get_session(token)
            .await?
            .ok_or(SessionError::NotFound)?;
        Self::check(session)
    }

    /// Validate the session a JWT is bound to.
    pub async fn validate_by_id(
        &self,
        session_id: Uuid,
    ) -> std::result::Result<Session, SessionError> {
        let session = self
            .store
            .get_session_by_id(session_id)
            .await?
            .ok_or(SessionError::NotFound)?;
        Self::check(session)
    }

    fn check(session: Session) -> std::result::Result<Session, SessionError> {
        if !session.is_active {
            return Err(SessionError::Inactive(session));
        }
        if session.is_expired() {
            return Err(SessionError::Expired(session));
        }
        Ok(session)
    }

    /// Extend an active session to `now + TTL`.
    pub async fn refresh(&self, token: &str) -> std::result::Result<Session, SessionError> {
        self.validate(token).await?;
        let now = Utc::now();
        self.store
            .extend_session(token, now + self.ttl, now)
            .await?
            .ok_or(SessionError::NotFound)
    }

    /// Deactivate a session and revoke its refresh tokens.
    ///
    /// Returns `false` when the token is unknown or already inactive.
    pub async fn invalidate(&self, token: &str) -> Result<bool> {
        let Some(existing) = self.store.get_session(token).await? else {
            return Ok(false);
        };
        let was_active = existing.is_active;

        self.store.deactivate_session(token).await?;
        self.tokens.revoke_session_tokens(existing.id).await?;

        if was_active {
            tracing::info!(
                user_id = %existing.user_id,
                session_id = %existing.id,
                "Session invalidated"
            );
        }
        Ok(was_active)
    }

    /// Deactivate every session of a user. Returns how many were active.
    pub async fn invalidate_all_for_user(&self, user_id: Uuid) -> Result<usize> {
        let ids = self.store.deactivate_user_sessions(user_id).await?;
        for id in &ids {
            self.tokens.revoke_session_tokens(*id).await?;
        }
        tracing::info!(user_id = %user_id, count = ids.len(), "All sessions invalidated");
        Ok(ids.len())
    }

    pub async fn list_active(&self, user_id: Uuid) -> Result<Vec<Session>> {
        let now = Utc::now();
        Ok(self
            .store
            .list_user_sessions(user_id)
            .await?
            .into_iter()
            .filter(|s| s.is_active && !s.is_expired_at(now))
            .collect())
    }

    /// Hard-delete expired sessions together with stale refresh records and
    /// OAuth states.
    pub async fn cleanup_expired(&self, now: DateTime<Utc>) -> Result<CleanupReport> {
        Ok(CleanupReport {
            sessions: self.store.delete_expired_sessions(now).await?,
            refresh_tokens: self.store.delete_expired_refresh_tokens(now).await?,
            oauth_states: self.store.delete_expired_oauth_states(now).await?,
        })
    }
}

/// Start the periodic session reaper.
///
/// One pass runs per `interval`; the first pass runs immediately. A failing
/// pass is logged and the next tick tries again.
pub fn spawn_session_reaper(
    manager: Arc<SessionManager>,
    interval: std::time::Duration,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            match manager.cleanup_expired(Utc::now()).await {
                Ok(report) => {
                    if report != CleanupReport::default() {
                        tracing::info!(
                            sessions = report.sessions,
                            refresh_tokens = report.refresh_tokens,
                            oauth_states = report.oauth_states,
                            "Reaper removed expired records"
                        );
                    } else {
                        tracing::debug!("Reaper pass found nothing to remove");
                    }
                }
                Err(e) => {
                    tracing::error!(error = %e, "Session cleanup failed, will retry next tick");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    fn manager() -> SessionManager {
        let config = Config::default();
        let store: SharedStore = Arc::new(MemoryStore::new());
        let tokens = Arc::new(TokenService::new(&config, store.clone()));
        SessionManager::new(&config, store, tokens)
    }

    #[tokio::test]
    async fn test_invalidate_is_idempotent() {
        let mgr = manager();
        let session = mgr.create(Uuid::new_v4(), None, None).await.unwrap();

        assert!(mgr.invalidate(&session.session_token).await.unwrap());
        assert!(!mgr.invalidate(&session.session_token).await.unwrap());
        assert!(!mgr.invalidate("unknown").await.unwrap());

        assert!(matches!(
            mgr.validate(&session.session_token).await,
            Err(SessionError::Inactive(_))
        ));
    }

    #[test]
    fn test_session_error_maps_to_app_error() {
        let err: AppError = SessionError::NotFound.into();
        assert!(matches!(err, AppError::Unauthorized));
    }
}
