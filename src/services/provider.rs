// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Client for third-party OAuth providers (code exchange, refresh, userinfo,
//! revocation).

use async_trait::async_trait;
use reqwest::header::ACCEPT;
use serde::Deserialize;

use crate::config::{Config, OAuthAppConfig};
use crate::error::{AppError, Result};
use crate::services::upstream::{self, with_retry};

/// Token endpoint response.
#[derive(Debug, Clone, Deserialize)]
pub struct ProviderTokens {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    /// Lifetime in seconds, when the provider reports one
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub scope: Option<String>,
}

/// The account behind an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderAccount {
    pub id: String,
    pub email: Option<String>,
}

impl ProviderAccount {
    /// Pull id and email out of the provider-specific userinfo shapes
    /// (GitHub `id`/`email`, OIDC `sub`/`email`, Microsoft Graph
    /// `id`/`mail`/`userPrincipalName`, Slack `user_id`).
    pub fn from_userinfo(value: &serde_json::Value) -> Option<Self> {
        let id = ["sub", "id", "user_id"]
            .iter()
            .filter_map(|k| value.get(*k))
            .find_map(|v| match v {
                serde_json::Value::String(s) => Some(s.clone()),
                serde_json::Value::Number(n) => Some(n.to_string()),
                _ => None,
            })?;
        let email = ["email", "mail", "userPrincipalName"]
            .iter()
            .filter_map(|k| value.get(*k))
            .find_map(|v| v.as_str().map(str::to_string));
        Some(Self { id, email })
    }
}

#[async_trait]
pub trait OAuthProvider: Send + Sync {
    async fn exchange_code(
        &self,
        app: &OAuthAppConfig,
        code: &str,
        redirect_uri: &str,
    ) -> Result<ProviderTokens>;

    async fn refresh(&self, app: &OAuthAppConfig, refresh_token: &str) -> Result<ProviderTokens>;

    /// Lightweight authenticated call, also used as the health probe.
    async fn userinfo(&self, app: &OAuthAppConfig, access_token: &str) -> Result<ProviderAccount>;

    /// Revoke a token at the provider. A no-op when the app has no
    /// revocation endpoint.
    async fn revoke(&self, app: &OAuthAppConfig, token: &str) -> Result<()>;
}

/// [`OAuthProvider`] over HTTP with timeouts and bounded retries.
pub struct HttpOAuthProvider {
    http: reqwest::Client,
    max_retry_attempts: u32,
}

impl HttpOAuthProvider {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            http: upstream::http_client(config)?,
            max_retry_attempts: config.max_retry_attempts,
        })
    }

    async fn token_request(
        &self,
        app: &OAuthAppConfig,
        context: &'static str,
        max_attempts: u32,
        form: &[(&str, &str)],
    ) -> Result<ProviderTokens> {
        with_retry(max_attempts, context, || async move {
            let response = self
                .http
                .post(&app.token_url)
                .header(ACCEPT, "application/json")
                .form(form)
                .send()
                .await
                .map_err(|e| upstream::send_error(context, e))?;
            upstream::check_response_json(context, response).await
        })
        .await
    }
}

#[async_trait]
impl OAuthProvider for HttpOAuthProvider {
    async fn exchange_code(
        &self,
        app: &OAuthAppConfig,
        code: &str,
        redirect_uri: &str,
    ) -> Result<ProviderTokens> {
        tracing::info!(app_id = %app.app_id, "Exchanging authorization code");
        // Authorization codes are single-use; never resend one.
        self.token_request(
            app,
            "Token exchange",
            1,
            &[
                ("client_id", app.client_id.as_str()),
                ("client_secret", app.client_secret.as_str()),
                ("code", code),
                ("redirect_uri", redirect_uri),
                ("grant_type", "authorization_code"),
            ],
        )
        .await
    }

    async fn refresh(&self, app: &OAuthAppConfig, refresh_token: &str) -> Result<ProviderTokens> {
        self.token_request(
            app,
            "Token refresh",
            self.max_retry_attempts,
            &[
                ("client_id", app.client_id.as_str()),
                ("client_secret", app.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ],
        )
        .await
    }

    async fn userinfo(&self, app: &OAuthAppConfig, access_token: &str) -> Result<ProviderAccount> {
        let value: serde_json::Value = with_retry(self.max_retry_attempts, "Userinfo", || async move {
            let response = self
                .http
                .get(&app.userinfo_url)
                .bearer_auth(access_token)
                .header(ACCEPT, "application/json")
                // GitHub rejects requests without a user agent
                .header(reqwest::header::USER_AGENT, "identity-gateway")
                .send()
                .await
                .map_err(|e| upstream::send_error("Userinfo", e))?;
            upstream::check_response_json("Userinfo", response).await
        })
        .await?;

        ProviderAccount::from_userinfo(&value).ok_or_else(|| {
            AppError::UpstreamPermanent("Userinfo response has no account id".to_string())
        })
    }

    async fn revoke(&self, app: &OAuthAppConfig, token: &str) -> Result<()> {
        let Some(revoke_url) = app.revoke_url.as_deref() else {
            return Ok(());
        };

        with_retry(self.max_retry_attempts, "Token revocation", || async move {
            let response = self
                .http
                .post(revoke_url)
                .form(&[
                    ("token", token),
                    ("client_id", app.client_id.as_str()),
                    ("client_secret", app.client_secret.as_str()),
                ])
                .send()
                .await
                .map_err(|e| upstream::send_error("Token revocation", e))?;
            upstream::check_response("Token revocation", response).await?;
            Ok(())
        })
        .await?;

        tracing::info!(app_id = %app.app_id, "Provider token revoked");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::StatusCode;
    use axum::routing::post;
    use axum::Router;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    /// Serve a token endpoint that always answers 503, counting requests.
    async fn unavailable_token_endpoint() -> (OAuthAppConfig, Arc<AtomicU32>) {
        let hits = Arc::new(AtomicU32::new(0));
        let counter = hits.clone();
        let router = Router::new().route(
            "/token",
            post(move || {
                counter.fetch_add(1, Ordering::SeqCst);
                async { StatusCode::SERVICE_UNAVAILABLE }
            }),
        );
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, router).await.unwrap();
        });

        let mut app = OAuthAppConfig::with_defaults("github", "github");
        app.client_id = "client".to_string();
        app.client_secret = "secret".to_string();
        app.token_url = format!("http://{}/token", addr);
        (app, hits)
    }

    fn provider_with_retries(max_retry_attempts: u32) -> HttpOAuthProvider {
        HttpOAuthProvider::new(&Config {
            max_retry_attempts,
            ..Config::default()
        })
        .unwrap()
    }

    #[tokio::test]
    async fn test_code_exchange_is_sent_once() {
        let (app, hits) = unavailable_token_endpoint().await;
        let provider = provider_with_retries(3);

        let result = provider
            .exchange_code(&app, "code", "http://localhost/callback")
            .await;

        assert!(matches!(result, Err(AppError::UpstreamTransient(_))));
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_refresh_is_retried() {
        let (app, hits) = unavailable_token_endpoint().await;
        let provider = provider_with_retries(3);

        let result = provider.refresh(&app, "refresh").await;

        assert!(matches!(result, Err(AppError::UpstreamTransient(_))));
        assert_eq!(hits.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_userinfo_github_shape() {
        let account =
            ProviderAccount::from_userinfo(&json!({"id": 583231, "email": "octo@example.com"}))
                .unwrap();
        assert_eq!(account.id, "583231");
        assert_eq!(account.email.as_deref(), Some("octo@example.com"));
    }

    #[test]
    fn test_userinfo_graph_shape() {
        let account = ProviderAccount::from_userinfo(
            &json!({"id": "abc", "mail": null, "userPrincipalName": "u@contoso.com"}),
        )
        .unwrap();
        assert_eq!(account.email.as_deref(), Some("u@contoso.com"));
    }

    #[test]
    fn test_userinfo_without_id_is_rejected() {
        assert!(ProviderAccount::from_userinfo(&json!({"email": "x@example.com"})).is_none());
    }

    #[test]
    fn test_token_response_defaults() {
        let tokens: ProviderTokens = serde_json::from_str(r#"{"access_token":"abc"}"#).unwrap();
        assert_eq!(tokens.access_token, "abc");
        assert!(tokens.refresh_token.is_none());
        assert!(tokens.expires_in.is_none());
    }
}
