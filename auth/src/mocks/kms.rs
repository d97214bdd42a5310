//! In-memory key manager.

use crate::error::{AuthError, Result};
use crate::providers::{KeyManager, KeyPurpose, Wrapper};
use crate::state::ScopeId;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::{Digest, Sha256};
use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};

/// Mock key manager.
///
/// Derives each scope key from a root key with HKDF-SHA256, using the scope
/// id and purpose as the info string. Same root, scope and purpose always
/// give the same key; different scopes never share one.
#[derive(Debug, Clone)]
pub struct MockKeyManager {
    root_key: [u8; 32],
    disabled: Arc<Mutex<HashSet<ScopeId>>>,
}

impl MockKeyManager {
    /// Create a key manager with a fixed root key.
    #[must_use]
    pub fn new(root_key: [u8; 32]) -> Self {
        Self {
            root_key,
            disabled: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Create a key manager with a random root key.
    #[must_use]
    pub fn random() -> Self {
        let mut root_key = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut root_key);
        Self::new(root_key)
    }

    /// Make key lookups for `scope_id` fail.
    pub fn disable_scope(&self, scope_id: &ScopeId) {
        self.disabled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(scope_id.clone());
    }

    fn derive(&self, scope_id: &ScopeId, purpose: KeyPurpose) -> Result<Wrapper> {
        let disabled = self
            .disabled
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(scope_id);
        if disabled {
            return Err(AuthError::InternalError(format!(
                "no {} key for scope {scope_id}",
                purpose.as_str()
            )));
        }

        let info = format!("{}:{scope_id}", purpose.as_str());
        let mut key = [0u8; 32];
        Hkdf::<Sha256>::new(None, &self.root_key)
            .expand(info.as_bytes(), &mut key)
            .map_err(|e| AuthError::InternalError(format!("key derivation failed: {e}")))?;

        let fingerprint = Sha256::digest(key);
        let key_id: String = fingerprint[..8].iter().map(|b| format!("{b:02x}")).collect();

        Wrapper::new(format!("{}_{key_id}", purpose.as_str()), &key)
    }
}

impl Default for MockKeyManager {
    fn default() -> Self {
        Self::random()
    }
}

impl KeyManager for MockKeyManager {
    fn wrapper(
        &self,
        scope_id: &ScopeId,
        purpose: KeyPurpose,
    ) -> impl Future<Output = Result<Wrapper>> + Send {
        let result = self.derive(scope_id, purpose);
        async move { result }
    }
}
