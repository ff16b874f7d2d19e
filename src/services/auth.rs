// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Login, registration, token refresh and logout flows.
//!
//! Ties the identity authority to the local user table, device risk, MFA,
//! sessions and tokens.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use uuid::Uuid;
use validator::Validate;

use crate::db::SharedStore;
use crate::error::{AppError, Result};
use crate::models::{SecurityEventType, Session, User};
use crate::services::identity::{ExternalIdentity, IdentityProvider, Introspection};
use crate::services::mfa::MfaService;
use crate::services::risk::{DeviceAssessment, NewSecurityEvent, RiskService};
use crate::services::session::SessionManager;
use crate::services::token::{TokenPair, TokenService, TokenType};

#[derive(Debug, Deserialize, Validate)]
pub struct LoginRequest {
    /// Email or username
    #[validate(length(min = 1, max = 254, message = "Login is required"))]
    pub login: String,
    #[validate(length(min = 1, message = "Password is required"))]
    pub password: String,
    #[serde(default)]
    pub mfa_code: Option<String>,
    #[serde(default)]
    pub backup_code: Option<String>,
    #[serde(default)]
    #[validate(length(min = 8, max = 512, message = "Invalid device fingerprint"))]
    pub device_fingerprint: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct RegisterRequest {
    #[validate(email(message = "Invalid email format"))]
    pub email: String,
    #[validate(length(min = 3, max = 64, message = "Username must be 3-64 characters"))]
    pub username: String,
    #[validate(length(min = 8, message = "Password must be at least 8 characters"))]
    pub password: String,
}

/// Caller details taken from the HTTP request.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
}

/// Everything a successful login produces.
#[derive(Debug, Clone)]
pub struct LoginOutcome {
    pub user: User,
    pub session: Session,
    pub tokens: TokenPair,
    pub device: Option<DeviceAssessment>,
}

/// Public part of a user record.
#[derive(Debug, Clone, Serialize)]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub email_verified: bool,
    pub mfa_enabled: bool,
    pub created_at: chrono::DateTime<Utc>,
    pub last_login_at: Option<chrono::DateTime<Utc>>,
}

pub struct AuthService {
    store: SharedStore,
    identity: Arc<dyn IdentityProvider>,
    tokens: Arc<TokenService>,
    sessions: Arc<SessionManager>,
    mfa: Arc<MfaService>,
    risk: Arc<RiskService>,
}

impl AuthService {
    pub fn new(
        store: SharedStore,
        identity: Arc<dyn IdentityProvider>,
        tokens: Arc<TokenService>,
        sessions: Arc<SessionManager>,
        mfa: Arc<MfaService>,
        risk: Arc<RiskService>,
    ) -> Self {
        Self {
            store,
            identity,
            tokens,
            sessions,
            mfa,
            risk,
        }
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<User> {
        let identity = self
            .identity
            .register(req.email.trim(), req.username.trim(), &req.password)
            .await?;
        let user = self.link_user(identity).await?;
        tracing::info!(user_id = %user.id, "User registered");
        Ok(user)
    }

    pub async fn login(&self, req: &LoginRequest, client: &ClientInfo) -> Result<LoginOutcome> {
        let identity = match self.identity.authenticate(req.login.trim(), &req.password).await {
            Ok(identity) => identity,
            Err(AppError::Unauthorized) => {
                if let Some(user) = self.known_user(req.login.trim()).await {
                    self.risk
                        .record_event_quietly(
                            NewSecurityEvent::new(user.id, SecurityEventType::LoginFailed)
                                .with_client(client.ip_address.clone(), client.user_agent.clone()),
                        )
                        .await;
                }
                tracing::warn!("Login rejected by identity provider");
                return Err(AppError::Unauthorized);
            }
            Err(e) => return Err(e),
        };

        let mut user = self.link_user(identity).await?;
        if !user.is_active {
            return Err(AppError::Inactive("account disabled".to_string()));
        }

        let device = match req.device_fingerprint.as_deref() {
            Some(fp) => Some(
                self.risk
                    .assess_device(
                        user.id,
                        fp,
                        client.ip_address.clone(),
                        client.user_agent.clone(),
                    )
                    .await?,
            ),
            None => None,
        };

        if self.mfa.is_enabled(user.id).await? {
            self.check_second_factor(&user, req, client).await?;
        }

        let session = self
            .sessions
            .create(user.id, client.ip_address.clone(), client.user_agent.clone())
            .await?;
        let tokens = self.tokens.issue_for_session(user.id, session.id).await?;

        user.last_login_at = Some(Utc::now());
        self.store.update_user(&user).await?;

        let score = device.as_ref().map_or(0.0, |d| d.risk_score);
        self.risk
            .record_event_quietly(
                NewSecurityEvent::new(user.id, SecurityEventType::Login)
                    .with_score(score)
                    .with_client(client.ip_address.clone(), client.user_agent.clone()),
            )
            .await;

        tracing::info!(user_id = %user.id, session_id = %session.id, "Login succeeded");
        Ok(LoginOutcome {
            user,
            session,
            tokens,
            device,
        })
    }

    async fn check_second_factor(
        &self,
        user: &User,
        req: &LoginRequest,
        client: &ClientInfo,
    ) -> Result<()> {
        let passed = match (req.mfa_code.as_deref(), req.backup_code.as_deref()) {
            (Some(code), _) => self.mfa.verify_totp(user.id, code).await?,
            (None, Some(code)) => {
                let used = self.mfa.use_backup_code(user.id, code).await?;
                if used {
                    let remaining = self.mfa.backup_codes_count(user.id).await?;
                    self.risk
                        .record_event_quietly(
                            NewSecurityEvent::new(user.id, SecurityEventType::BackupCodeUsed)
                                .with_score(2.0)
                                .with_client(client.ip_address.clone(), client.user_agent.clone())
                                .with_details(format!("{} backup codes remaining", remaining)),
                        )
                        .await;
                }
                used
            }
            (None, None) => return Err(AppError::MfaRequired),
        };

        if !passed {
            self.risk
                .record_event_quietly(
                    NewSecurityEvent::new(user.id, SecurityEventType::FailedMfa)
                        .with_score(3.0)
                        .with_client(client.ip_address.clone(), client.user_agent.clone()),
                )
                .await;
            return Err(AppError::Unauthorized);
        }
        Ok(())
    }

    /// Local user named by a login identifier (email or username).
    async fn known_user(&self, login: &str) -> Option<User> {
        let by_email = self.store.get_user_by_email(login).await.ok().flatten();
        match by_email {
            Some(user) => Some(user),
            None => self.store.get_user_by_username(login).await.ok().flatten(),
        }
    }

    /// Find the local user for an external identity, creating it on first
    /// sight.
    async fn link_user(&self, identity: ExternalIdentity) -> Result<User> {
        if let Some(user) = self.store.get_user_by_external_id(&identity.subject).await? {
            return Ok(user);
        }

        let mut user = User::new(identity.subject, identity.email, identity.username);
        user.email_verified = identity.email_verified;
        let user = self.store.insert_user(user).await?;
        tracing::info!(user_id = %user.id, "Linked new external identity");
        Ok(user)
    }

    /// Rotate a refresh token and extend the session it is bound to.
    pub async fn refresh(&self, refresh_token: &str, client: &ClientInfo) -> Result<TokenPair> {
        let claims = self.tokens.redeem(refresh_token).await?;
        let user_id = claims.user_id()?;

        let pair = match claims.sid {
            Some(session_id) => {
                let session = self.sessions.validate_by_id(session_id).await?;
                self.sessions.refresh(&session.session_token).await?;
                self.tokens.issue_for_session(user_id, session_id).await?
            }
            None => self.tokens.issue(user_id).await?,
        };

        self.risk
            .record_event_quietly(
                NewSecurityEvent::new(user_id, SecurityEventType::TokenRefresh)
                    .with_client(client.ip_address.clone(), client.user_agent.clone()),
            )
            .await;
        Ok(pair)
    }

    /// End a session. Returns whether it was still active.
    pub async fn logout(&self, session: &Session) -> Result<bool> {
        self.sessions.invalidate(&session.session_token).await
    }

    /// Revoke every session of a user (e.g. "sign out everywhere").
    pub async fn logout_everywhere(&self, user_id: Uuid, client: &ClientInfo) -> Result<usize> {
        let count = self.sessions.invalidate_all_for_user(user_id).await?;
        self.risk
            .record_event_quietly(
                NewSecurityEvent::new(user_id, SecurityEventType::SessionRevoked)
                    .with_client(client.ip_address.clone(), client.user_agent.clone())
                    .with_details(format!("{} sessions revoked", count)),
            )
            .await;
        Ok(count)
    }

    /// Introspect a token: ours are answered locally, anything else is
    /// forwarded to the identity authority.
    pub async fn introspect(&self, token: &str) -> Result<Introspection> {
        let claims = match self.tokens.verify(token) {
            Ok(claims) => claims,
            Err(AppError::Expired(_)) => return Ok(Introspection::default()),
            Err(_) => return self.identity.introspect(token).await,
        };

        if claims.typ != TokenType::Access {
            return Ok(Introspection::default());
        }
        if let Some(session_id) = claims.sid {
            if self.sessions.validate_by_id(session_id).await.is_err() {
                return Ok(Introspection::default());
            }
        }
        let Some(user) = self.store.get_user(claims.user_id()?).await? else {
            return Ok(Introspection::default());
        };

        Ok(Introspection {
            active: user.is_active,
            sub: Some(user.id.to_string()),
            username: Some(user.username),
            email: Some(user.email),
            exp: Some(claims.exp as i64),
            scope: None,
            client_id: None,
        })
    }

    pub async fn profile(&self, user_id: Uuid) -> Result<UserProfile> {
        let user = self
            .store
            .get_user(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("User {}", user_id)))?;
        Ok(UserProfile {
            id: user.id,
            email: user.email,
            username: user.username,
            email_verified: user.email_verified,
            mfa_enabled: self.mfa.is_enabled(user_id).await?,
            created_at: user.created_at,
            last_login_at: user.last_login_at,
        })
    }
}
