//! Opaque, tamper-evident encoding of in-flight attempt state.
//!
//! The `state` parameter round-trips through the identity provider and the
//! caller's browser, so it is sealed rather than signed:
//!
//! ```text
//! AuthAttempt ──bincode──▶ plaintext
//!                             │  AES-256-GCM, scope Database key,
//!                             │  AAD = "<context>:<auth method id>"
//!                             ▼
//! StateEnvelope { version, auth_method_id, key_id, ciphertext }
//!                             │  bincode
//!                             ▼
//!                      base64url (no padding)
//! ```
//!
//! Decoding is split in two stages. [`decode`] parses the envelope without
//! any key material and fails with [`AuthError::Decode`] on malformed input.
//! [`StateEnvelope::decrypt`] then authenticates the payload against the
//! auth method the callback was addressed to; any mismatch (wrong scope key,
//! a different auth method id, a flipped bit) fails with
//! [`AuthError::Decrypt`].

use crate::error::{AuthError, Result};
use crate::providers::Wrapper;
use crate::state::{AuthAttempt, AuthMethodId};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use bincode::Options;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

/// Envelope format version.
const ENVELOPE_VERSION: u8 = 1;

/// Upper bound on decoded envelope and payload sizes.
const MAX_ENCODED_BYTES: u64 = 16 * 1024;

/// AAD context for authentication attempts.
const ATTEMPT_CONTEXT: &str = "attempt";

fn codec() -> impl Options {
    bincode::DefaultOptions::new().with_limit(MAX_ENCODED_BYTES)
}

/// Parsed, still-encrypted state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateEnvelope {
    version: u8,
    auth_method_id: String,
    key_id: String,
    ciphertext: Vec<u8>,
}

impl StateEnvelope {
    /// Auth method id the envelope claims to belong to.
    ///
    /// Unauthenticated until [`StateEnvelope::decrypt`] succeeds.
    #[must_use]
    pub fn auth_method_id(&self) -> &str {
        &self.auth_method_id
    }

    /// Key id the payload was sealed with.
    #[must_use]
    pub fn key_id(&self) -> &str {
        &self.key_id
    }

    /// Authenticate and decrypt an attempt for `auth_method_id`.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Decrypt`] if the envelope was not sealed for this
    /// auth method with `wrapper`'s key.
    pub fn decrypt(&self, auth_method_id: &AuthMethodId, wrapper: &Wrapper) -> Result<AuthAttempt> {
        self.open(ATTEMPT_CONTEXT, auth_method_id, wrapper)
    }

    pub(crate) fn open<T: DeserializeOwned>(
        &self,
        context: &str,
        auth_method_id: &AuthMethodId,
        wrapper: &Wrapper,
    ) -> Result<T> {
        if self.auth_method_id != auth_method_id.as_str() {
            return Err(AuthError::Decrypt(
                "auth method id does not match".to_string(),
            ));
        }
        if self.key_id != wrapper.key_id() {
            return Err(AuthError::Decrypt("key id does not match".to_string()));
        }

        let plaintext = wrapper.decrypt(&self.ciphertext, aad(context, auth_method_id).as_bytes())?;

        codec()
            .deserialize(&plaintext)
            .map_err(|e| AuthError::SerializationError(e.to_string()))
    }
}

/// Encode an attempt as an opaque state token.
///
/// # Errors
///
/// Returns error if serialization or encryption fails.
pub fn encode(attempt: &AuthAttempt, auth_method_id: &AuthMethodId, wrapper: &Wrapper) -> Result<String> {
    seal(attempt, ATTEMPT_CONTEXT, auth_method_id, wrapper)
}

/// Parse a state token into its envelope.
///
/// # Errors
///
/// Returns [`AuthError::Decode`] if the token is not valid base64url or not
/// a well-formed envelope.
pub fn decode(token: &str) -> Result<StateEnvelope> {
    let bytes = URL_SAFE_NO_PAD
        .decode(token)
        .map_err(|e| AuthError::Decode(e.to_string()))?;

    let envelope: StateEnvelope = codec()
        .deserialize(&bytes)
        .map_err(|e| AuthError::Decode(e.to_string()))?;

    if envelope.version != ENVELOPE_VERSION {
        return Err(AuthError::Decode(format!(
            "unsupported envelope version {}",
            envelope.version
        )));
    }

    Ok(envelope)
}

pub(crate) fn seal<T: Serialize>(
    payload: &T,
    context: &str,
    auth_method_id: &AuthMethodId,
    wrapper: &Wrapper,
) -> Result<String> {
    let plaintext = codec()
        .serialize(payload)
        .map_err(|e| AuthError::SerializationError(e.to_string()))?;

    let envelope = StateEnvelope {
        version: ENVELOPE_VERSION,
        auth_method_id: auth_method_id.to_string(),
        key_id: wrapper.key_id().to_string(),
        ciphertext: wrapper.encrypt(&plaintext, aad(context, auth_method_id).as_bytes())?,
    };

    let bytes = codec()
        .serialize(&envelope)
        .map_err(|e| AuthError::SerializationError(e.to_string()))?;

    Ok(URL_SAFE_NO_PAD.encode(bytes))
}

fn aad(context: &str, auth_method_id: &AuthMethodId) -> String {
    format!("{context}:{auth_method_id}")
}
