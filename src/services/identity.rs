// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Client for the external identity authority (OIDC provider).

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};

use crate::config::{Config, IdentityConfig};
use crate::error::{AppError, Result};
use crate::services::upstream::{self, with_retry};

/// RFC 7662 introspection response (fields we use).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Introspection {
    pub active: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sub: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exp: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
}

/// An identity as known to the authority.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalIdentity {
    pub subject: String,
    pub email: String,
    pub username: String,
    pub email_verified: bool,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn introspect(&self, token: &str) -> Result<Introspection>;

    /// Check a login/password pair. Bad credentials are `Unauthorized`.
    async fn authenticate(&self, login: &str, password: &str) -> Result<ExternalIdentity>;

    async fn register(&self, email: &str, username: &str, password: &str)
        -> Result<ExternalIdentity>;
}

#[derive(Deserialize)]
struct PasswordGrantResponse {
    access_token: String,
}

#[derive(Deserialize)]
struct RegistrationResponse {
    #[serde(alias = "sub")]
    id: String,
    email: String,
    username: String,
    #[serde(default)]
    email_verified: bool,
}

/// [`IdentityProvider`] speaking OAuth2/OIDC over HTTP.
pub struct HttpIdentityProvider {
    http: reqwest::Client,
    config: IdentityConfig,
    max_retry_attempts: u32,
}

impl HttpIdentityProvider {
    pub fn new(config: &Config) -> Result<Self> {
        Ok(Self {
            http: upstream::http_client(config)?,
            config: config.identity.clone(),
            max_retry_attempts: config.max_retry_attempts,
        })
    }
}

#[async_trait]
impl IdentityProvider for HttpIdentityProvider {
    async fn introspect(&self, token: &str) -> Result<Introspection> {
        with_retry(self.max_retry_attempts, "Introspection", || async move {
            let response = self
                .http
                .post(&self.config.introspection_url)
                .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
                .form(&[("token", token)])
                .send()
                .await
                .map_err(|e| upstream::send_error("Introspection", e))?;
            upstream::check_response_json("Introspection", response).await
        })
        .await
    }

    async fn authenticate(&self, login: &str, password: &str) -> Result<ExternalIdentity> {
        let grant: PasswordGrantResponse =
            with_retry(self.max_retry_attempts, "Password grant", || async move {
                let response = self
                    .http
                    .post(&self.config.token_url)
                    .form(&[
                        ("grant_type", "password"),
                        ("client_id", self.config.client_id.as_str()),
                        ("client_secret", self.config.client_secret.as_str()),
                        ("username", login),
                        ("password", password),
                        ("scope", "openid email profile"),
                    ])
                    .send()
                    .await
                    .map_err(|e| upstream::send_error("Password grant", e))?;

                // invalid_grant comes back as 400 or 401
                if matches!(
                    response.status(),
                    StatusCode::BAD_REQUEST | StatusCode::UNAUTHORIZED
                ) {
                    return Err(AppError::Unauthorized);
                }
                upstream::check_response_json("Password grant", response).await
            })
            .await?;

        let info = self.introspect(&grant.access_token).await?;
        let (Some(subject), true) = (info.sub.clone(), info.active) else {
            return Err(AppError::UpstreamPermanent(
                "Identity provider issued an inactive token".to_string(),
            ));
        };

        let Some(email) = info.email else {
            return Err(AppError::UpstreamPermanent(
                "Identity has no email address".to_string(),
            ));
        };

        Ok(ExternalIdentity {
            subject,
            email,
            username: info.username.unwrap_or_else(|| login.to_string()),
            email_verified: false,
        })
    }

    async fn register(
        &self,
        email: &str,
        username: &str,
        password: &str,
    ) -> Result<ExternalIdentity> {
        // Registration is not idempotent, so it is not retried.
        let response = self
            .http
            .post(&self.config.registration_url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .json(&serde_json::json!({
                "email": email,
                "username": username,
                "password": password,
            }))
            .send()
            .await
            .map_err(|e| upstream::send_error("Registration", e))?;

        if response.status() == StatusCode::CONFLICT {
            return Err(AppError::Conflict(
                "Email or username already registered".to_string(),
            ));
        }
        let created: RegistrationResponse =
            upstream::check_response_json("Registration", response).await?;

        tracing::info!(subject = %created.id, "Identity registered with provider");
        Ok(ExternalIdentity {
            subject: created.id,
            email: created.email,
            username: created.username,
            email_verified: created.email_verified,
        })
    }
}
