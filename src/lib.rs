// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@kernel.org>

//! Identity Gateway: authentication and third-party connection broker
//!
//! This crate fronts an external identity authority with sessions, signed
//! tokens, TOTP/backup-code MFA, device risk scoring and an audit log, and
//! manages per-user OAuth connections to third-party applications.

pub mod config;
pub mod crypto;
pub mod db;
pub mod error;
pub mod middleware;
pub mod models;
pub mod routes;
pub mod services;

use std::sync::Arc;

use config::Config;
use db::SharedStore;
use services::{
    AuthService, IdentityProvider, MfaService, OAuthConnectionManager, OAuthProvider, RiskService,
    SessionManager, TokenService,
};

/// Shared application state.
pub struct AppState {
    pub config: Config,
    pub store: SharedStore,
    pub tokens: Arc<TokenService>,
    pub sessions: Arc<SessionManager>,
    pub mfa: Arc<MfaService>,
    pub risk: Arc<RiskService>,
    pub connections: Arc<OAuthConnectionManager>,
    pub auth: AuthService,
}

impl AppState {
    /// Wire every service on top of one store and the two upstream clients.
    pub fn build(
        config: Config,
        store: SharedStore,
        identity: Arc<dyn IdentityProvider>,
        provider: Arc<dyn OAuthProvider>,
    ) -> error::Result<Self> {
        let tokens = Arc::new(TokenService::new(&config, store.clone()));
        let sessions = Arc::new(SessionManager::new(&config, store.clone(), tokens.clone()));
        let mfa = Arc::new(MfaService::new(&config, store.clone())?);
        let risk = Arc::new(RiskService::new(store.clone()));
        let connections = Arc::new(OAuthConnectionManager::new(
            &config,
            store.clone(),
            provider,
            risk.clone(),
        )?);
        let auth = AuthService::new(
            store.clone(),
            identity,
            tokens.clone(),
            sessions.clone(),
            mfa.clone(),
            risk.clone(),
        );

        Ok(Self {
            config,
            store,
            tokens,
            sessions,
            mfa,
            risk,
            connections,
            auth,
        })
    }
}
