// SPDX-License-Identifier: MIT
// Copyright 2026 Roland Dreier <roland@rolandd.dev>

//! Small cryptographic helpers shared by the services.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use hkdf::Hkdf;
use hmac::{Hmac, Mac};
use ring::rand::{SecureRandom, SystemRandom};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

/// HKDF info label for the OAuth state signing key.
pub const OAUTH_STATE_KEY_INFO: &[u8] = b"identity-gateway oauth-state v1";
/// HKDF info label for the backup-code pepper.
pub const BACKUP_CODE_KEY_INFO: &[u8] = b"identity-gateway backup-code v1";

/// Fill `len` bytes from the system CSPRNG.
pub fn random_bytes(len: usize) -> Result<Vec<u8>, AppError> {
    let mut buf = vec![0u8; len];
    SystemRandom::new()
        .fill(&mut buf)
        .map_err(|_| AppError::Internal(anyhow::anyhow!("System RNG failure")))?;
    Ok(buf)
}

/// Random URL-safe token carrying `bytes` bytes of entropy.
pub fn random_token(bytes: usize) -> Result<String, AppError> {
    Ok(URL_SAFE_NO_PAD.encode(random_bytes(bytes)?))
}

/// Derive a 32-byte sub-key from `master` with HKDF-SHA256.
pub fn derive_key(master: &[u8], info: &[u8]) -> Result<Vec<u8>, AppError> {
    let hk = Hkdf::<Sha256>::new(None, master);
    let mut okm = vec![0u8; 32];
    hk.expand(info, &mut okm)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("HKDF expand failed: {}", e)))?;
    Ok(okm)
}

/// Hex HMAC-SHA256 of `parts` joined with `|`.
pub fn hmac_hex(key: &[u8], parts: &[&str]) -> Result<String, AppError> {
    let mut mac = HmacSha256::new_from_slice(key)
        .map_err(|e| AppError::Internal(anyhow::anyhow!("HMAC init failed: {}", e)))?;
    for (i, part) in parts.iter().enumerate() {
        if i > 0 {
            mac.update(b"|");
        }
        mac.update(part.as_bytes());
    }
    Ok(hex::encode(mac.finalize().into_bytes()))
}

pub fn constant_time_eq(a: &str, b: &str) -> bool {
    a.len() == b.len() && bool::from(a.as_bytes().ct_eq(b.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_random_token_is_unique_and_url_safe() {
        let a = random_token(32).unwrap();
        let b = random_token(32).unwrap();
        assert_ne!(a, b);
        // 32 bytes → 43 base64 characters without padding
        assert_eq!(a.len(), 43);
        assert!(!a.contains('+') && !a.contains('/') && !a.contains('='));
    }

    #[test]
    fn test_derived_keys_differ_by_label() {
        let master = b"master-secret-master-secret-1234";
        let k1 = derive_key(master, OAUTH_STATE_KEY_INFO).unwrap();
        let k2 = derive_key(master, BACKUP_CODE_KEY_INFO).unwrap();
        assert_eq!(k1.len(), 32);
        assert_ne!(k1, k2);
        assert_eq!(k1, derive_key(master, OAUTH_STATE_KEY_INFO).unwrap());
    }

    #[test]
    fn test_hmac_hex_depends_on_every_part() {
        let key = b"key";
        let a = hmac_hex(key, &["nonce", "user", "github"]).unwrap();
        let b = hmac_hex(key, &["nonce", "user", "google"]).unwrap();
        assert_eq!(a.len(), 64);
        assert_ne!(a, b);
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq("abc", "abc"));
        assert!(!constant_time_eq("abc", "abd"));
        assert!(!constant_time_eq("abc", "abcd"));
    }
}
