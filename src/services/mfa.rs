// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! TOTP enrollment and one-time backup codes.
//!
//! Backup codes are stored as a keyed hash of their normalized form; the
//! plaintext only ever leaves this module in the enrollment/regeneration
//! responses.

use chrono::Utc;
use serde::Serialize;
use totp_rs::{Algorithm, Secret, TOTP};
use uuid::Uuid;

use crate::config::Config;
use crate::crypto;
use crate::db::SharedStore;
use crate::error::{AppError, Result};
use crate::models::{BackupCode, MfaSetup};

const BACKUP_CODE_COUNT: usize = 10;
const BACKUP_CODE_LEN: usize = 8;
const BACKUP_CODE_GROUP_SIZE: usize = 4;
/// No 0/O or 1/I. 32 symbols, so a random byte maps without bias.
const BACKUP_CODE_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// An MFA setup with its backup-code usage.
#[derive(Debug, Clone, Serialize)]
pub struct MfaSetupView {
    pub setup: MfaSetup,
    pub total_codes: usize,
    pub used_codes: usize,
}

/// Returned once, at enrollment time.
#[derive(Debug, Clone, Serialize)]
#[cfg_attr(feature = "binding-generation", derive(ts_rs::TS))]
#[cfg_attr(feature = "binding-generation", ts(export))]
pub struct MfaEnrollment {
    pub secret: String,
    pub otpauth_url: String,
    pub backup_codes: Vec<String>,
}

pub struct MfaService {
    store: SharedStore,
    pepper: Vec<u8>,
    issuer: String,
}

impl MfaService {
    pub fn new(config: &Config, store: SharedStore) -> Result<Self> {
        Ok(Self {
            store,
            pepper: crypto::derive_key(&config.jwt_signing_key, crypto::BACKUP_CODE_KEY_INFO)?,
            issuer: config.mfa_issuer.clone(),
        })
    }

    /// Replace the user's setup and backup codes.
    ///
    /// `user_id` comes straight from the caller, so it is parsed here.
    pub async fn store_setup(
        &self,
        user_id: &str,
        secret: &str,
        backup_codes: &[String],
    ) -> Result<MfaSetup> {
        let user_id = Uuid::parse_str(user_id.trim())
            .map_err(|_| AppError::InvalidUser(format!("Malformed user id: {}", user_id)))?;
        if self.store.get_user(user_id).await?.is_none() {
            return Err(AppError::InvalidUser(format!("Unknown user {}", user_id)));
        }
        if secret.trim().is_empty() {
            return Err(AppError::InvalidInput("MFA secret is empty".to_string()));
        }

        let setup = MfaSetup::new(user_id, secret.trim());
        let codes = self.hash_codes(user_id, setup.id, backup_codes)?;
        let total = codes.len();

        self.store.replace_mfa_setup(setup.clone(), codes).await?;

        tracing::info!(user_id = %user_id, codes = total, "MFA setup stored");
        Ok(setup)
    }

    pub async fn get_setup(&self, user_id: Uuid) -> Result<Option<MfaSetupView>> {
        let Some(setup) = self.store.get_mfa_setup(user_id).await? else {
            return Ok(None);
        };
        let codes = self.store.list_backup_codes(user_id).await?;
        Ok(Some(MfaSetupView {
            setup,
            total_codes: codes.len(),
            used_codes: codes.iter().filter(|c| c.used).count(),
        }))
    }

    pub async fn enable(&self, user_id: Uuid) -> Result<MfaSetup> {
        self.set_enabled(user_id, true).await
    }

    pub async fn disable(&self, user_id: Uuid) -> Result<MfaSetup> {
        self.set_enabled(user_id, false).await
    }

    async fn set_enabled(&self, user_id: Uuid, enabled: bool) -> Result<MfaSetup> {
        let setup = self
            .store
            .set_mfa_enabled(user_id, enabled)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("MFA setup for user {}", user_id)))?;
        tracing::info!(user_id = %user_id, enabled, "MFA toggled");
        Ok(setup)
    }

    pub async fn is_enabled(&self, user_id: Uuid) -> Result<bool> {
        Ok(self
            .store
            .get_mfa_setup(user_id)
            .await?
            .is_some_and(|s| s.enabled))
    }

    /// Unused backup codes; 0 when there is no setup.
    pub async fn backup_codes_count(&self, user_id: Uuid) -> Result<usize> {
        Ok(self
            .store
            .list_backup_codes(user_id)
            .await?
            .iter()
            .filter(|c| !c.used)
            .count())
    }

    /// Consume a backup code.
    ///
    /// `true` exactly once per code. Unknown, used and malformed codes all
    /// return `false` so callers learn nothing about which part was wrong.
    pub async fn use_backup_code(&self, user_id: Uuid, code: &str) -> Result<bool> {
        let normalized = normalize_backup_code(code);
        if normalized.is_empty() {
            return Ok(false);
        }
        let hash = self.hash_code(user_id, &normalized)?;

        let consumed = self
            .store
            .consume_backup_code(user_id, &hash, Utc::now())
            .await?;
        if consumed {
            tracing::info!(user_id = %user_id, "Backup code consumed");
        } else {
            tracing::warn!(user_id = %user_id, "Backup code rejected");
        }
        Ok(consumed)
    }

    /// Discard every existing code and install `codes`.
    pub async fn replace_backup_codes(&self, user_id: Uuid, codes: &[String]) -> Result<()> {
        let setup = self
            .store
            .get_mfa_setup(user_id)
            .await?
            .ok_or_else(|| AppError::NotFound(format!("MFA setup for user {}", user_id)))?;
        let hashed = self.hash_codes(user_id, setup.id, codes)?;

        if !self.store.replace_backup_codes(user_id, hashed).await? {
            return Err(AppError::NotFound(format!(
                "MFA setup for user {}",
                user_id
            )));
        }
        tracing::info!(user_id = %user_id, codes = codes.len(), "Backup codes replaced");
        Ok(())
    }

    /// Generate a fresh secret and backup codes and store them as the
    /// user's (disabled) setup.
    pub async fn begin_enrollment(&self, user_id: Uuid, account_name: &str) -> Result<MfaEnrollment> {
        let secret = Secret::generate_secret();
        let secret_bytes = secret
            .to_bytes()
            .map_err(|e| AppError::Internal(anyhow::anyhow!("Secret gen error: {:?}", e)))?;
        let totp = self.totp(secret_bytes, account_name)?;
        let secret_base32 = totp.get_secret_base32();

        let backup_codes = generate_backup_codes()?;
        self.store_setup(&user_id.to_string(), &secret_base32, &backup_codes)
            .await?;

        Ok(MfaEnrollment {
            secret: secret_base32,
            otpauth_url: totp.get_url(),
            backup_codes,
        })
    }

    /// Check a 6-digit code against the stored secret.
    pub async fn verify_totp(&self, user_id: Uuid, code: &str) -> Result<bool> {
        let Some(setup) = self.store.get_mfa_setup(user_id).await? else {
            return Ok(false);
        };
        let secret_bytes = match Secret::Encoded(setup.secret.clone()).to_bytes() {
            Ok(bytes) => bytes,
            Err(e) => {
                tracing::error!(user_id = %user_id, error = ?e, "Stored MFA secret is not base32");
                return Ok(false);
            }
        };
        let totp = match self.totp(secret_bytes, "user") {
            Ok(totp) => totp,
            Err(e) => {
                tracing::error!(user_id = %user_id, error = %e, "Stored MFA secret unusable");
                return Ok(false);
            }
        };

        let valid = totp.check_current(code.trim()).unwrap_or(false);
        if !valid {
            tracing::warn!(user_id = %user_id, "TOTP code rejected");
        }
        Ok(valid)
    }

    /// Replace the user's backup codes with a freshly generated batch.
    pub async fn regenerate_backup_codes(&self, user_id: Uuid) -> Result<Vec<String>> {
        let codes = generate_backup_codes()?;
        self.replace_backup_codes(user_id, &codes).await?;
        Ok(codes)
    }

    fn totp(&self, secret_bytes: Vec<u8>, account_name: &str) -> Result<TOTP> {
        TOTP::new(
            Algorithm::SHA1,
            6,
            1,
            30,
            secret_bytes,
            Some(self.issuer.clone()),
            account_name.to_string(),
        )
        .map_err(|e| AppError::Internal(anyhow::anyhow!("TOTP init error: {}", e)))
    }

    fn hash_codes(
        &self,
        user_id: Uuid,
        setup_id: Uuid,
        codes: &[String],
    ) -> Result<Vec<BackupCode>> {
        let mut hashes = Vec::with_capacity(codes.len());
        for code in codes {
            let normalized = normalize_backup_code(code);
            if normalized.is_empty() {
                return Err(AppError::InvalidInput("Empty backup code".to_string()));
            }
            let hash = self.hash_code(user_id, &normalized)?;
            if hashes.contains(&hash) {
                return Err(AppError::InvalidInput("Duplicate backup code".to_string()));
            }
            hashes.push(hash);
        }
        Ok(hashes
            .into_iter()
            .map(|h| BackupCode::new(setup_id, h))
            .collect())
    }

    fn hash_code(&self, user_id: Uuid, normalized: &str) -> Result<String> {
        crypto::hmac_hex(&self.pepper, &[&user_id.to_string(), normalized])
    }
}

/// Trim, drop separators and whitespace, uppercase.
pub fn normalize_backup_code(input: &str) -> String {
    input
        .chars()
        .filter(|c| *c != '-' && !c.is_whitespace())
        .map(|c| c.to_ascii_uppercase())
        .collect()
}

/// A batch of random codes in `XXXX-XXXX` form.
pub fn generate_backup_codes() -> Result<Vec<String>> {
    let raw = crypto::random_bytes(BACKUP_CODE_COUNT * BACKUP_CODE_LEN)?;
    Ok(raw
        .chunks(BACKUP_CODE_LEN)
        .map(|chunk| {
            let mut out = String::with_capacity(BACKUP_CODE_LEN + 1);
            for (idx, byte) in chunk.iter().enumerate() {
                if idx > 0 && idx % BACKUP_CODE_GROUP_SIZE == 0 {
                    out.push('-');
                }
                let symbol = BACKUP_CODE_ALPHABET[usize::from(*byte) % BACKUP_CODE_ALPHABET.len()];
                out.push(symbol as char);
            }
            out
        })
        .collect())
}
