//! Scoped key management.
//!
//! Each scope owns a set of data encryption keys, one per [`KeyPurpose`].
//! Callers never see raw key material; they get a [`Wrapper`] that seals and
//! opens blobs with AES-256-GCM.

use crate::error::{AuthError, Result};
use crate::state::ScopeId;
use aes_gcm::{
    aead::{Aead, AeadCore, KeyInit, OsRng, Payload},
    Aes256Gcm, Nonce,
};
use std::fmt;
use std::sync::Arc;

/// AES-GCM nonce length in bytes.
const NONCE_LEN: usize = 12;

/// What a scope key is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyPurpose {
    /// Attempt state, token request ids.
    Database,
    /// Audit entries.
    Oplog,
}

impl KeyPurpose {
    /// Stable name, used when deriving keys.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Database => "database",
            Self::Oplog => "oplog",
        }
    }
}

/// Key manager.
///
/// Resolves the data encryption key for a scope and purpose.
pub trait KeyManager: Send + Sync {
    /// Get the wrapper for a scope's key.
    ///
    /// # Errors
    ///
    /// Returns error if the scope has no key for `purpose` or the key
    /// service is unavailable.
    fn wrapper(
        &self,
        scope_id: &ScopeId,
        purpose: KeyPurpose,
    ) -> impl std::future::Future<Output = Result<Wrapper>> + Send;
}

/// Authenticated encryption under a single scope key.
///
/// Output layout is `nonce (12 bytes) || ciphertext+tag`. A fresh random
/// nonce is generated for every call to [`Wrapper::encrypt`].
#[derive(Clone)]
pub struct Wrapper {
    key_id: String,
    cipher: Arc<Aes256Gcm>,
}

impl Wrapper {
    /// Create a wrapper from 32 bytes of key material.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::InternalError`] if the key is not 32 bytes.
    pub fn new(key_id: impl Into<String>, key: &[u8]) -> Result<Self> {
        if key.len() != 32 {
            return Err(AuthError::InternalError(
                "Encryption key must be exactly 32 bytes (256 bits) for AES-256-GCM".to_string(),
            ));
        }

        let cipher = Aes256Gcm::new_from_slice(key).map_err(|e| {
            AuthError::InternalError(format!("Failed to initialize AES-256-GCM cipher: {e}"))
        })?;

        Ok(Self {
            key_id: key_id.into(),
            cipher: Arc::new(cipher),
        })
    }

    /// Identifier of the key this wrapper seals with.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Encrypt `plaintext`, binding `aad` into the tag.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Encrypt`] if encryption fails.
    pub fn encrypt(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        let nonce = Aes256Gcm::generate_nonce(&mut OsRng);

        let ciphertext = self
            .cipher
            .encrypt(&nonce, Payload { msg: plaintext, aad })
            .map_err(|e| AuthError::Encrypt(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Decrypt a blob produced by [`Wrapper::encrypt`] with the same `aad`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Decrypt`] if the blob is truncated, was sealed
    /// under another key, or was tampered with.
    pub fn decrypt(&self, blob: &[u8], aad: &[u8]) -> Result<Vec<u8>> {
        if blob.len() < NONCE_LEN {
            return Err(AuthError::Decrypt(
                "ciphertext shorter than nonce".to_string(),
            ));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        let nonce = Nonce::from_slice(nonce_bytes);

        self.cipher
            .decrypt(nonce, Payload { msg: ciphertext, aad })
            .map_err(|e| AuthError::Decrypt(e.to_string()))
    }
}

impl fmt::Debug for Wrapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Wrapper")
            .field("key_id", &self.key_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn test_encrypt_decrypt() {
        let wrapper = Wrapper::new("k1", &[7u8; 32]).unwrap();
        let blob = wrapper.encrypt(b"hello", b"amoidc_1").unwrap();

        assert_eq!(wrapper.decrypt(&blob, b"amoidc_1").unwrap(), b"hello");
    }

    #[test]
    fn test_fresh_nonce_per_call() {
        let wrapper = Wrapper::new("k1", &[7u8; 32]).unwrap();
        let a = wrapper.encrypt(b"hello", b"").unwrap();
        let b = wrapper.encrypt(b"hello", b"").unwrap();

        assert_ne!(a, b);
    }

    #[test]
    fn test_wrong_aad_fails() {
        let wrapper = Wrapper::new("k1", &[7u8; 32]).unwrap();
        let blob = wrapper.encrypt(b"hello", b"amoidc_1").unwrap();

        let err = wrapper.decrypt(&blob, b"amoidc_2").unwrap_err();
        assert!(matches!(err, AuthError::Decrypt(_)));
    }

    #[test]
    fn test_wrong_key_fails() {
        let a = Wrapper::new("k1", &[7u8; 32]).unwrap();
        let b = Wrapper::new("k2", &[8u8; 32]).unwrap();
        let blob = a.encrypt(b"hello", b"").unwrap();

        assert!(matches!(b.decrypt(&blob, b""), Err(AuthError::Decrypt(_))));
    }

    #[test]
    fn test_truncated_blob_fails() {
        let wrapper = Wrapper::new("k1", &[7u8; 32]).unwrap();
        assert!(matches!(
            wrapper.decrypt(&[1, 2, 3], b""),
            Err(AuthError::Decrypt(_))
        ));
    }

    #[test]
    fn test_rejects_short_key() {
        assert!(Wrapper::new("k1", &[7u8; 16]).is_err());
    }

    #[test]
    fn test_debug_hides_key() {
        let wrapper = Wrapper::new("k1", &[7u8; 32]).unwrap();
        let debug = format!("{wrapper:?}");
        assert!(debug.contains("k1"));
        assert!(!debug.contains("cipher"));
    }
}
