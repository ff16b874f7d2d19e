// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

#![allow(dead_code)]

use async_trait::async_trait;
use axum::body::Body;
use axum::http::{header, Request, Response, StatusCode};
use dashmap::DashMap;
use identity_gateway::config::{Config, OAuthAppConfig};
use identity_gateway::db::{MemoryStore, SharedStore};
use identity_gateway::error::{AppError, Result};
use identity_gateway::routes::create_router;
use identity_gateway::services::identity::{ExternalIdentity, IdentityProvider, Introspection};
use identity_gateway::services::provider::{OAuthProvider, ProviderAccount, ProviderTokens};
use identity_gateway::AppState;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use tower::ServiceExt;

pub const TEST_PASSWORD: &str = "correct horse battery";

/// In-process identity authority keyed by email and username.
#[derive(Default)]
pub struct FakeIdentityProvider {
    accounts: DashMap<String, (String, ExternalIdentity)>,
    pub unavailable: AtomicBool,
}

impl FakeIdentityProvider {
    /// Register an account directly with the authority.
    pub fn add_account(&self, email: &str, username: &str, password: &str) -> ExternalIdentity {
        let identity = ExternalIdentity {
            subject: format!("idp|{}", username),
            email: email.to_string(),
            username: username.to_string(),
            email_verified: true,
        };
        self.accounts.insert(
            email.to_lowercase(),
            (password.to_string(), identity.clone()),
        );
        self.accounts.insert(
            username.to_lowercase(),
            (password.to_string(), identity.clone()),
        );
        identity
    }
}

#[async_trait]
impl IdentityProvider for FakeIdentityProvider {
    async fn introspect(&self, _token: &str) -> Result<Introspection> {
        Ok(Introspection::default())
    }

    async fn authenticate(&self, login: &str, password: &str) -> Result<ExternalIdentity> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(AppError::UpstreamTransient("idp down".to_string()));
        }
        match self.accounts.get(&login.to_lowercase()) {
            Some(entry) if entry.0 == password => Ok(entry.1.clone()),
            _ => Err(AppError::Unauthorized),
        }
    }

    async fn register(
        &self,
        email: &str,
        username: &str,
        password: &str,
    ) -> Result<ExternalIdentity> {
        if self.accounts.contains_key(&email.to_lowercase())
            || self.accounts.contains_key(&username.to_lowercase())
        {
            return Err(AppError::Conflict("already registered".to_string()));
        }
        Ok(self.add_account(email, username, password))
    }
}

/// Scriptable OAuth provider.
#[derive(Default)]
pub struct FakeOAuthProvider {
    pub exchange_calls: AtomicU32,
    pub refresh_calls: AtomicU32,
    pub userinfo_calls: AtomicU32,
    /// Make userinfo (the health probe) fail
    pub failing: AtomicBool,
    /// Hand out tokens that are already inside the refresh margin
    pub short_lived: AtomicBool,
    pub revoked: Mutex<Vec<String>>,
}

impl FakeOAuthProvider {
    fn expires_in(&self) -> Option<i64> {
        if self.short_lived.load(Ordering::SeqCst) {
            Some(60)
        } else {
            Some(3600)
        }
    }
}

#[async_trait]
impl OAuthProvider for FakeOAuthProvider {
    async fn exchange_code(
        &self,
        _app: &OAuthAppConfig,
        code: &str,
        _redirect_uri: &str,
    ) -> Result<ProviderTokens> {
        self.exchange_calls.fetch_add(1, Ordering::SeqCst);
        if code == "bad-code" {
            return Err(AppError::UpstreamPermanent("invalid_grant".to_string()));
        }
        Ok(ProviderTokens {
            access_token: format!("access-{}", code),
            refresh_token: Some(format!("refresh-{}", code)),
            expires_in: self.expires_in(),
            scope: Some("read".to_string()),
        })
    }

    async fn refresh(&self, _app: &OAuthAppConfig, refresh_token: &str) -> Result<ProviderTokens> {
        let n = self.refresh_calls.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(ProviderTokens {
            access_token: format!("access-refreshed-{}", n),
            refresh_token: Some(refresh_token.to_string()),
            expires_in: Some(3600),
            scope: None,
        })
    }

    async fn userinfo(&self, _app: &OAuthAppConfig, _access_token: &str) -> Result<ProviderAccount> {
        self.userinfo_calls.fetch_add(1, Ordering::SeqCst);
        if self.failing.load(Ordering::SeqCst) {
            return Err(AppError::UpstreamTransient("provider timeout".to_string()));
        }
        Ok(ProviderAccount {
            id: "acct-1".to_string(),
            email: Some("owner@example.com".to_string()),
        })
    }

    async fn revoke(&self, _app: &OAuthAppConfig, token: &str) -> Result<()> {
        self.revoked.lock().unwrap().push(token.to_string());
        Ok(())
    }
}

pub struct TestApp {
    pub router: axum::Router,
    pub state: Arc<AppState>,
    pub identity: Arc<FakeIdentityProvider>,
    pub provider: Arc<FakeOAuthProvider>,
}

/// Create a test app with in-memory store and fake upstreams.
pub fn create_test_app() -> TestApp {
    create_test_app_with_config(Config::default())
}

pub fn create_test_app_with_config(config: Config) -> TestApp {
    let store: SharedStore = Arc::new(MemoryStore::new());
    let identity = Arc::new(FakeIdentityProvider::default());
    let provider = Arc::new(FakeOAuthProvider::default());

    let state = Arc::new(
        AppState::build(config, store, identity.clone(), provider.clone())
            .expect("Failed to build app state"),
    );

    TestApp {
        router: create_router(state.clone()),
        state,
        identity,
        provider,
    }
}

pub async fn body_json(response: Response<Body>) -> serde_json::Value {
    let body = axum::body::to_bytes(response.into_body(), 1024 * 1024)
        .await
        .unwrap();
    serde_json::from_slice(&body).unwrap()
}

pub async fn send(app: &TestApp, request: Request<Body>) -> Response<Body> {
    app.router.clone().oneshot(request).await.unwrap()
}

pub fn json_request(method: &str, uri: &str, body: serde_json::Value) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
        .body(Body::from(body.to_string()))
        .unwrap()
}

pub fn bearer_request(method: &str, uri: &str, token: &str) -> Request<Body> {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::AUTHORIZATION, format!("Bearer {}", token))
        .body(Body::empty())
        .unwrap()
}

/// Register `email` with the fake authority and log in over HTTP.
/// Returns the login response body.
pub async fn register_and_login(app: &TestApp, email: &str, username: &str) -> serde_json::Value {
    app.identity.add_account(email, username, TEST_PASSWORD);
    let response = send(
        app,
        json_request(
            "POST",
            "/auth/login",
            serde_json::json!({ "login": email, "password": TEST_PASSWORD }),
        ),
    )
    .await;
    assert_eq!(response.status(), StatusCode::OK);
    body_json(response).await
}

pub fn access_token(login: &serde_json::Value) -> String {
    login["tokens"]["access_token"].as_str().unwrap().to_string()
}
