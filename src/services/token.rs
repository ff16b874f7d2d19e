// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Access/refresh token issuance and verification (HS256 JWT).
//!
//! Refresh tokens are single-use: each one is backed by a
//! [`RefreshTokenRecord`] keyed by its `jti`, and redeeming it removes the
//! record. A replayed refresh token finds nothing and is rejected.

use chrono::{Duration, Utc};
use jsonwebtoken::{
    decode, encode, errors::ErrorKind, Algorithm, DecodingKey, EncodingKey, Header, Validation,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::Config;
use crate::db::SharedStore;
use crate::error::{AppError, Result};
use crate::models::RefreshTokenRecord;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

/// JWT claims structure.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Claims {
    /// Subject (local user id)
    pub sub: String,
    /// Session this token is bound to, if any
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<Uuid>,
    pub jti: Uuid,
    pub typ: TokenType,
    /// Issued at (Unix timestamp)
    pub iat: usize,
    /// Expiration time (Unix timestamp)
    pub exp: usize,
}

impl Claims {
    pub fn user_id(&self) -> Result<Uuid> {
        Uuid::parse_str(&self.sub).map_err(|_| AppError::InvalidToken)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[cfg_attr(feature = "binding-generation", derive(ts_rs::TS))]
#[cfg_attr(feature = "binding-generation", ts(export))]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    pub token_type: String,
    /// Access token lifetime in seconds
    pub expires_in: i64,
}

pub struct TokenService {
    store: SharedStore,
    encoding_key: EncodingKey,
    decoding_key: DecodingKey,
    access_ttl: Duration,
    refresh_ttl: Duration,
}

impl TokenService {
    pub fn new(config: &Config, store: SharedStore) -> Self {
        Self {
            store,
            encoding_key: EncodingKey::from_secret(&config.jwt_signing_key),
            decoding_key: DecodingKey::from_secret(&config.jwt_signing_key),
            access_ttl: Duration::minutes(config.access_token_ttl_minutes),
            refresh_ttl: Duration::hours(config.refresh_token_ttl_hours),
        }
    }

    /// Issue a token pair not bound to any session.
    pub async fn issue(&self, user_id: Uuid) -> Result<TokenPair> {
        self.issue_pair(user_id, None).await
    }

    pub async fn issue_for_session(&self, user_id: Uuid, session_id: Uuid) -> Result<TokenPair> {
        self.issue_pair(user_id, Some(session_id)).await
    }

    async fn issue_pair(&self, user_id: Uuid, session_id: Option<Uuid>) -> Result<TokenPair> {
        let now = Utc::now();
        let access = self.sign(user_id, session_id, TokenType::Access, self.access_ttl)?;
        let (refresh, refresh_jti) =
            self.sign_with_jti(user_id, session_id, TokenType::Refresh, self.refresh_ttl)?;

        self.store
            .insert_refresh_token(RefreshTokenRecord {
                jti: refresh_jti,
                user_id,
                session_id,
                issued_at: now,
                expires_at: now + self.refresh_ttl,
            })
            .await?;

        tracing::debug!(user_id = %user_id, session_id = ?session_id, "Issued token pair");

        Ok(TokenPair {
            access_token: access,
            refresh_token: refresh,
            token_type: "Bearer".to_string(),
            expires_in: self.access_ttl.num_seconds(),
        })
    }

    fn sign(
        &self,
        user_id: Uuid,
        session_id: Option<Uuid>,
        typ: TokenType,
        ttl: Duration,
    ) -> Result<String> {
        self.sign_with_jti(user_id, session_id, typ, ttl)
            .map(|(token, _)| token)
    }

    fn sign_with_jti(
        &self,
        user_id: Uuid,
        session_id: Option<Uuid>,
        typ: TokenType,
        ttl: Duration,
    ) -> Result<(String, Uuid)> {
        let now = Utc::now().timestamp();
        let jti = Uuid::new_v4();
        let claims = Claims {
            sub: user_id.to_string(),
            sid: session_id,
            jti,
            typ,
            iat: now.max(0) as usize,
            exp: (now + ttl.num_seconds()).max(0) as usize,
        };

        let token = encode(&Header::new(Algorithm::HS256), &claims, &self.encoding_key)
            .map_err(|e| AppError::Internal(anyhow::anyhow!("JWT creation failed: {}", e)))?;
        Ok((token, jti))
    }

    /// Check signature and expiry of any token we issued.
    pub fn verify(&self, token: &str) -> Result<Claims> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.leeway = 0;

        decode::<Claims>(token, &self.decoding_key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AppError::Expired("token expired".to_string()),
                _ => AppError::InvalidToken,
            })
    }

    /// Verify a token that must be an access token.
    pub fn verify_access(&self, token: &str) -> Result<Claims> {
        let claims = self.verify(token)?;
        if claims.typ != TokenType::Access {
            return Err(AppError::InvalidToken);
        }
        Ok(claims)
    }

    /// Verify a refresh token and consume its record.
    ///
    /// Returns the claims of the redeemed token; the token can never be
    /// redeemed again.
    pub async fn redeem(&self, refresh_token: &str) -> Result<Claims> {
        let claims = self.verify(refresh_token)?;
        if claims.typ != TokenType::Refresh {
            return Err(AppError::InvalidToken);
        }
        let user_id = claims.user_id()?;

        let Some(record) = self.store.take_refresh_token(claims.jti).await? else {
            tracing::warn!(
                user_id = %user_id,
                jti = %claims.jti,
                "Refresh token replayed or revoked"
            );
            return Err(AppError::InvalidToken);
        };

        if record.user_id != user_id || record.session_id != claims.sid {
            tracing::error!(jti = %claims.jti, "Refresh record does not match token claims");
            return Err(AppError::InvalidToken);
        }

        Ok(claims)
    }

    /// Rotate: redeem `refresh_token` and issue a new pair for the same
    /// user and session.
    pub async fn refresh(&self, refresh_token: &str) -> Result<TokenPair> {
        let claims = self.redeem(refresh_token).await?;
        self.issue_pair(claims.user_id()?, claims.sid).await
    }

    /// Drop every redeemable refresh token bound to a session.
    pub async fn revoke_session_tokens(&self, session_id: Uuid) -> Result<usize> {
        let revoked = self.store.delete_session_refresh_tokens(session_id).await?;
        if revoked > 0 {
            tracing::info!(session_id = %session_id, revoked, "Revoked refresh tokens");
        }
        Ok(revoked)
    }
}
