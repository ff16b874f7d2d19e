// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Application configuration loaded from environment variables.
//!
//! Values are read once at startup. Sub-keys used for OAuth state signing and
//! backup-code hashing are derived from the JWT signing key, so only one
//! secret has to be provisioned.

use std::collections::HashMap;
use std::env;
use std::str::FromStr;

/// OAuth endpoints and credentials for one connectable application.
#[derive(Debug, Clone)]
pub struct OAuthAppConfig {
    /// Application identifier used in URLs and storage (e.g. "github").
    pub app_id: String,
    /// Provider family (e.g. "google" for a "gmail" app).
    pub provider: String,
    pub client_id: String,
    pub client_secret: String,
    /// Space-separated scope string sent on authorization.
    pub scope: String,
    pub auth_url: String,
    pub token_url: String,
    /// Lightweight authenticated endpoint used for health checks.
    pub userinfo_url: String,
    pub revoke_url: Option<String>,
}

/// External identity authority (OIDC provider) endpoints.
#[derive(Debug, Clone, Default)]
pub struct IdentityConfig {
    pub introspection_url: String,
    pub token_url: String,
    pub registration_url: String,
    pub client_id: String,
    pub client_secret: String,
}

/// Application configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    /// Frontend origin that receives OAuth callback messages
    pub frontend_url: String,
    /// Public base URL of this service (used for OAuth redirect URIs)
    pub api_url: String,
    /// Server port
    pub port: u16,

    /// JWT signing key for access/refresh tokens (raw bytes)
    pub jwt_signing_key: Vec<u8>,
    pub access_token_ttl_minutes: i64,
    pub refresh_token_ttl_hours: i64,
    pub session_ttl_hours: i64,
    pub session_cleanup_interval_secs: u64,
    pub oauth_state_ttl_secs: i64,

    /// Timeout for every outbound provider call
    pub request_timeout_secs: u64,
    pub max_retry_attempts: u32,
    pub max_connections_per_user: usize,

    /// Issuer shown in authenticator apps
    pub mfa_issuer: String,

    /// PostgreSQL URL; the in-memory store is used when unset
    pub database_url: Option<String>,
    pub database_max_connections: u32,

    pub identity: IdentityConfig,
    pub oauth_apps: HashMap<String, OAuthAppConfig>,
}

impl Default for Config {
    /// Default config for testing only.
    fn default() -> Self {
        let mut oauth_apps = HashMap::new();
        for app in ["github", "google"] {
            let mut cfg = OAuthAppConfig::with_defaults(app, app);
            cfg.client_id = format!("test_{app}_client");
            cfg.client_secret = "test_secret".to_string();
            oauth_apps.insert(app.to_string(), cfg);
        }

        Self {
            frontend_url: "http://localhost:5173".to_string(),
            api_url: "http://localhost:8080".to_string(),
            port: 8080,
            jwt_signing_key: b"test_jwt_key_32_bytes_minimum!!".to_vec(),
            access_token_ttl_minutes: 15,
            refresh_token_ttl_hours: 24,
            session_ttl_hours: 24,
            session_cleanup_interval_secs: 3600,
            oauth_state_ttl_secs: 600,
            request_timeout_secs: 30,
            max_retry_attempts: 3,
            max_connections_per_user: 20,
            mfa_issuer: "Identity Gateway".to_string(),
            database_url: None,
            database_max_connections: 10,
            identity: IdentityConfig {
                introspection_url: "http://localhost:8081/introspect".to_string(),
                token_url: "http://localhost:8081/token".to_string(),
                registration_url: "http://localhost:8081/users".to_string(),
                client_id: "gateway".to_string(),
                client_secret: "test_secret".to_string(),
            },
            oauth_apps,
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// A `.env` file is honored for local development.
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok(); // Load .env file if present

        let jwt_signing_key = env::var("JWT_SIGNING_KEY")
            .map_err(|_| ConfigError::Missing("JWT_SIGNING_KEY".to_string()))?
            .into_bytes();
        if jwt_signing_key.len() < 32 {
            return Err(ConfigError::Invalid(
                "JWT_SIGNING_KEY".to_string(),
                "must be at least 32 bytes".to_string(),
            ));
        }

        let mut oauth_apps = HashMap::new();
        let app_list = env::var("OAUTH_APPS").unwrap_or_default();
        for app_id in app_list
            .split(',')
            .map(|s| s.trim().to_lowercase())
            .filter(|s| !s.is_empty())
        {
            let app = OAuthAppConfig::from_env(&app_id)?;
            oauth_apps.insert(app_id, app);
        }

        Ok(Self {
            frontend_url: env::var("FRONTEND_URL")
                .unwrap_or_else(|_| "http://localhost:5173".to_string()),
            api_url: env::var("API_URL").unwrap_or_else(|_| "http://localhost:8080".to_string()),
            port: parse_or("PORT", 8080)?,
            jwt_signing_key,
            access_token_ttl_minutes: parse_or("ACCESS_TOKEN_TTL_MINUTES", 15)?,
            refresh_token_ttl_hours: parse_or("REFRESH_TOKEN_TTL_HOURS", 24)?,
            session_ttl_hours: parse_or("SESSION_TTL_HOURS", 24)?,
            session_cleanup_interval_secs: parse_or("SESSION_CLEANUP_INTERVAL_SECS", 3600)?,
            oauth_state_ttl_secs: parse_or("OAUTH_STATE_TTL_SECS", 600)?,
            request_timeout_secs: parse_or("REQUEST_TIMEOUT_SECS", 30)?,
            max_retry_attempts: parse_or("MAX_RETRY_ATTEMPTS", 3)?,
            max_connections_per_user: parse_or("MAX_CONNECTIONS_PER_USER", 20)?,
            mfa_issuer: env::var("MFA_ISSUER").unwrap_or_else(|_| "Identity Gateway".to_string()),
            database_url: env::var("DATABASE_URL")
                .ok()
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty()),
            database_max_connections: parse_or("DATABASE_MAX_CONNECTIONS", 10)?,
            identity: IdentityConfig {
                introspection_url: required("IDP_INTROSPECTION_URL")?,
                token_url: required("IDP_TOKEN_URL")?,
                registration_url: required("IDP_REGISTRATION_URL")?,
                client_id: required("IDP_CLIENT_ID")?,
                client_secret: required("IDP_CLIENT_SECRET").map(|v| v.trim().to_string())?,
            },
            oauth_apps,
        })
    }

    /// Look up a configured OAuth application.
    pub fn oauth_app(&self, app_id: &str) -> Option<&OAuthAppConfig> {
        self.oauth_apps.get(app_id)
    }
}

impl OAuthAppConfig {
    /// Well-known endpoints for a provider family; empty strings when unknown.
    pub fn with_defaults(app_id: &str, provider: &str) -> Self {
        let (auth_url, token_url, userinfo_url, revoke_url, scope) = match provider {
            "github" => (
                "https://github.com/login/oauth/authorize",
                "https://github.com/login/oauth/access_token",
                "https://api.github.com/user",
                None,
                "read:user user:email",
            ),
            "google" => (
                "https://accounts.google.com/o/oauth2/v2/auth",
                "https://oauth2.googleapis.com/token",
                "https://openidconnect.googleapis.com/v1/userinfo",
                Some("https://oauth2.googleapis.com/revoke"),
                "openid email profile",
            ),
            "slack" => (
                "https://slack.com/oauth/v2/authorize",
                "https://slack.com/api/oauth.v2.access",
                "https://slack.com/api/auth.test",
                Some("https://slack.com/api/auth.revoke"),
                "users:read",
            ),
            "microsoft" => (
                "https://login.microsoftonline.com/common/oauth2/v2.0/authorize",
                "https://login.microsoftonline.com/common/oauth2/v2.0/token",
                "https://graph.microsoft.com/v1.0/me",
                None,
                "openid email offline_access User.Read",
            ),
            _ => ("", "", "", None, ""),
        };

        Self {
            app_id: app_id.to_string(),
            provider: provider.to_string(),
            client_id: String::new(),
            client_secret: String::new(),
            scope: scope.to_string(),
            auth_url: auth_url.to_string(),
            token_url: token_url.to_string(),
            userinfo_url: userinfo_url.to_string(),
            revoke_url: revoke_url.map(str::to_string),
        }
    }

    /// Load `OAUTH_<APP>_*` variables on top of the provider defaults.
    fn from_env(app_id: &str) -> Result<Self, ConfigError> {
        let prefix = format!("OAUTH_{}_", app_id.to_uppercase().replace('-', "_"));
        let var = |name: &str| env::var(format!("{prefix}{name}")).ok();

        let provider = var("PROVIDER").unwrap_or_else(|| app_id.to_string());
        let mut app = Self::with_defaults(app_id, &provider);

        app.client_id = var("CLIENT_ID").ok_or_else(|| ConfigError::Missing(format!("{prefix}CLIENT_ID")))?;
        app.client_secret = var("CLIENT_SECRET")
            .map(|v| v.trim().to_string())
            .ok_or_else(|| ConfigError::Missing(format!("{prefix}CLIENT_SECRET")))?;
        if let Some(scope) = var("SCOPE") {
            app.scope = scope;
        }
        if let Some(url) = var("AUTH_URL") {
            app.auth_url = url;
        }
        if let Some(url) = var("TOKEN_URL") {
            app.token_url = url;
        }
        if let Some(url) = var("USERINFO_URL") {
            app.userinfo_url = url;
        }
        if let Some(url) = var("REVOKE_URL") {
            app.revoke_url = Some(url);
        }

        if app.auth_url.is_empty() || app.token_url.is_empty() || app.userinfo_url.is_empty() {
            return Err(ConfigError::Invalid(
                format!("{prefix}*"),
                format!("unknown provider '{provider}' requires explicit endpoint URLs"),
            ));
        }

        Ok(app)
    }
}

fn required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::Missing(name.to_string()))
}

fn parse_or<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map_err(|_| ConfigError::Invalid(name.to_string(), format!("cannot parse '{raw}'"))),
        Err(_) => Ok(default),
    }
}

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    Missing(String),

    #[error("Invalid value for {0}: {1}")]
    Invalid(String, String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_from_env() {
        // Set required env vars for test
        env::set_var("JWT_SIGNING_KEY", "test_jwt_key_32_bytes_minimum!!!");
        env::set_var("IDP_INTROSPECTION_URL", "http://idp/introspect");
        env::set_var("IDP_TOKEN_URL", "http://idp/token");
        env::set_var("IDP_REGISTRATION_URL", "http://idp/users");
        env::set_var("IDP_CLIENT_ID", "gateway");
        env::set_var("IDP_CLIENT_SECRET", " secret ");
        env::set_var("OAUTH_APPS", "github, gmail");
        env::set_var("OAUTH_GITHUB_CLIENT_ID", "gh_id");
        env::set_var("OAUTH_GITHUB_CLIENT_SECRET", "gh_secret");
        env::set_var("OAUTH_GMAIL_PROVIDER", "google");
        env::set_var("OAUTH_GMAIL_CLIENT_ID", "g_id");
        env::set_var("OAUTH_GMAIL_CLIENT_SECRET", "g_secret");
        env::set_var("OAUTH_GMAIL_SCOPE", "https://www.googleapis.com/auth/gmail.readonly");

        let config = Config::from_env().expect("Config should load");

        assert_eq!(config.identity.client_secret, "secret");
        assert_eq!(config.access_token_ttl_minutes, 15);
        assert_eq!(config.refresh_token_ttl_hours, 24);
        assert_eq!(config.request_timeout_secs, 30);
        assert_eq!(config.max_retry_attempts, 3);
        assert_eq!(config.database_max_connections, 10);

        let gmail = config.oauth_app("gmail").expect("gmail app configured");
        assert_eq!(gmail.provider, "google");
        assert_eq!(gmail.token_url, "https://oauth2.googleapis.com/token");
        assert_eq!(gmail.scope, "https://www.googleapis.com/auth/gmail.readonly");
        assert!(config.oauth_app("github").is_some());
    }

    #[test]
    fn test_unknown_provider_has_no_endpoints() {
        let app = OAuthAppConfig::with_defaults("acme", "acme");
        assert!(app.auth_url.is_empty());
        assert!(app.revoke_url.is_none());
    }
}
