//! Federation environment.
//!
//! Long-lived collaborators shared by every request. Repositories are not
//! part of the environment: each operation receives repository factories so
//! it gets fresh handles per request.

use crate::config::FederationConfig;
use crate::providers::{IdentityProvider, KeyManager};

/// Federation environment.
///
/// # Type Parameters
///
/// - `P`: Identity provider
/// - `K`: Key manager
#[derive(Clone)]
pub struct FederationEnvironment<P, K>
where
    P: IdentityProvider + Clone,
    K: KeyManager + Clone,
{
    /// OIDC identity provider.
    pub provider: P,

    /// Per-scope key manager.
    pub keys: K,

    /// Flow configuration.
    pub config: FederationConfig,
}

impl<P, K> FederationEnvironment<P, K>
where
    P: IdentityProvider + Clone,
    K: KeyManager + Clone,
{
    /// Create a new federation environment.
    #[must_use]
    pub const fn new(provider: P, keys: K, config: FederationConfig) -> Self {
        Self {
            provider,
            keys,
            config,
        }
    }
}
