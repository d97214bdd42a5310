//! Session token issuance.
//!
//! After a successful callback the session token exists in `Pending` state.
//! The caller that started the attempt polls `Token` with the sealed token
//! request it received from `StartAuth`; the first call after the callback
//! completes issues the token and returns its bearer secret exactly once.

use crate::environment::FederationEnvironment;
use crate::error::{AuthError, Result};
use crate::providers::{
    AuthTokenRepository, IdentityProvider, IssueOutcome, KeyManager, KeyPurpose, OidcRepository,
    RepoFactory, Wrapper,
};
use crate::state::{AuthMethodId, AuthToken, AuthTokenId, AuthTokenStatus};
use crate::state_codec;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};

/// AAD context for token requests.
const TOKEN_REQUEST_CONTEXT: &str = "token-request";

/// Bearer secret length in bytes.
const SECRET_LEN: usize = 32;

/// Token request handed back by `StartAuth`, sealed like attempt state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenRequest {
    /// Request id the session token is bound to.
    pub token_request_id: AuthTokenId,
    /// After this instant the request can no longer be redeemed.
    pub expires_at: DateTime<Utc>,
}

impl TokenRequest {
    /// Create a token request.
    #[must_use]
    pub const fn new(token_request_id: AuthTokenId, expires_at: DateTime<Utc>) -> Self {
        Self {
            token_request_id,
            expires_at,
        }
    }

    /// Seal the request for `auth_method_id`.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or encryption fails.
    pub fn seal(&self, auth_method_id: &AuthMethodId, wrapper: &Wrapper) -> Result<String> {
        state_codec::seal(self, TOKEN_REQUEST_CONTEXT, auth_method_id, wrapper)
    }

    /// Decode and authenticate a sealed request.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Decode`] for malformed input and
    /// [`AuthError::Decrypt`] if it was not sealed for `auth_method_id`.
    pub fn open(token_id: &str, auth_method_id: &AuthMethodId, wrapper: &Wrapper) -> Result<Self> {
        state_codec::decode(token_id)?.open(TOKEN_REQUEST_CONTEXT, auth_method_id, wrapper)
    }
}

/// An issued session token and its bearer secret.
///
/// The secret is not stored; only its SHA-256 digest is.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IssuedToken {
    /// The token, now `Issued`.
    pub token: AuthToken,
    /// Bearer secret.
    pub secret: String,
}

/// SHA-256 hex digest of a bearer secret.
#[must_use]
pub fn token_digest(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    digest.iter().map(|b| format!("{b:02x}")).collect()
}

fn generate_secret() -> String {
    let mut bytes = [0u8; SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Redeem a token request.
pub struct Token<O: OidcRepository, T: AuthTokenRepository> {
    oidc_repo: Option<RepoFactory<O>>,
    token_repo: Option<RepoFactory<T>>,
    auth_method_id: String,
    token_id: String,
}

impl<O: OidcRepository, T: AuthTokenRepository> Token<O, T> {
    /// Redeem `token_id` against `auth_method_id`.
    #[must_use]
    pub fn new(auth_method_id: impl Into<String>, token_id: impl Into<String>) -> Self {
        Self {
            oidc_repo: None,
            token_repo: None,
            auth_method_id: auth_method_id.into(),
            token_id: token_id.into(),
        }
    }

    /// Set the auth method repository factory.
    #[must_use]
    pub fn oidc_repo(mut self, factory: RepoFactory<O>) -> Self {
        self.oidc_repo = Some(factory);
        self
    }

    /// Set the auth token repository factory.
    #[must_use]
    pub fn token_repo(mut self, factory: RepoFactory<T>) -> Self {
        self.token_repo = Some(factory);
        self
    }

    /// Run the operation.
    ///
    /// Returns `Ok(None)` while the callback has not completed.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - A required input is missing ([`AuthError::InvalidParameter`])
    /// - The auth method does not exist ([`AuthError::RecordNotFound`])
    /// - The token id is malformed or not sealed for this method
    /// - The request or the pending token expired ([`AuthError::AttemptExpired`])
    /// - The token was already issued ([`AuthError::Forbidden`])
    #[instrument(skip(self, env), fields(auth_method_id = %self.auth_method_id))]
    pub async fn run<P, K>(self, env: &FederationEnvironment<P, K>) -> Result<Option<IssuedToken>>
    where
        P: IdentityProvider + Clone,
        K: KeyManager + Clone,
    {
        let auth_method_id = self.auth_method_id.clone();
        let result = self.execute(env).await;

        match &result {
            Ok(Some(issued)) => info!(
                auth_method_id = %auth_method_id,
                token_id = %issued.token.id,
                user_id = %issued.token.user_id,
                "Session token issued"
            ),
            Ok(None) => {}
            Err(e) => warn!(
                auth_method_id = %auth_method_id,
                error_kind = ?e.kind(),
                error = %e,
                "Failed to issue session token"
            ),
        }

        result
    }

    async fn execute<P, K>(self, env: &FederationEnvironment<P, K>) -> Result<Option<IssuedToken>>
    where
        P: IdentityProvider + Clone,
        K: KeyManager + Clone,
    {
        let oidc_factory = self
            .oidc_repo
            .ok_or_else(|| AuthError::InvalidParameter("missing oidc repository".to_string()))?;
        let token_factory = self.token_repo.ok_or_else(|| {
            AuthError::InvalidParameter("missing auth token repository".to_string())
        })?;
        if self.auth_method_id.is_empty() {
            return Err(AuthError::InvalidParameter(
                "missing auth method id".to_string(),
            ));
        }
        if self.token_id.is_empty() {
            return Err(AuthError::InvalidParameter("missing token id".to_string()));
        }

        let oidc = oidc_factory()?;
        let tokens = token_factory()?;

        let method_id = AuthMethodId::from(self.auth_method_id.as_str());
        let method = oidc
            .lookup_auth_method(&method_id)
            .await?
            .ok_or_else(|| AuthError::RecordNotFound(format!("auth method {method_id} not found")))?;

        let wrapper = env.keys.wrapper(&method.scope_id, KeyPurpose::Database).await?;
        let request = TokenRequest::open(&self.token_id, &method.id, &wrapper)?;

        let now = Utc::now();
        if now >= request.expires_at {
            return Err(AuthError::AttemptExpired(
                "token request has expired".to_string(),
            ));
        }

        let secret = generate_secret();
        let outcome = tokens
            .issue_auth_token(&method.id, &request.token_request_id, &token_digest(&secret), now)
            .await?;

        match outcome {
            IssueOutcome::Issued(token) => Ok(Some(IssuedToken { token, secret })),
            IssueOutcome::NotFound => Ok(None),
            IssueOutcome::NotPending(token) => match token.status {
                AuthTokenStatus::Pending if token.is_expired(now) => Err(AuthError::AttemptExpired(
                    "pending token has expired".to_string(),
                )),
                AuthTokenStatus::Failed => Err(AuthError::Forbidden(
                    "token request failed".to_string(),
                )),
                _ => Err(AuthError::Forbidden("token already issued".to_string())),
            },
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_token_digest_is_hex_sha256() {
        let digest = token_digest("secret");
        assert_eq!(digest.len(), 64);
        assert_eq!(
            digest,
            "2bb80d537b1da3e38bd30361aa855686bde0eacd7162fef6a25fe97bf527a25b"
        );
    }

    #[test]
    fn test_generate_secret_is_random() {
        assert_ne!(generate_secret(), generate_secret());
    }

    #[test]
    fn test_token_request_round_trip() {
        let wrapper = Wrapper::new("k1", &[4u8; 32]).unwrap();
        let method_id = AuthMethodId::from("amoidc_1");
        let request = TokenRequest::new(AuthTokenId::new(), Utc::now() + Duration::minutes(5));

        let sealed = request.seal(&method_id, &wrapper).unwrap();
        assert_eq!(TokenRequest::open(&sealed, &method_id, &wrapper).unwrap(), request);
    }

    #[test]
    fn test_token_request_bound_to_method() {
        let wrapper = Wrapper::new("k1", &[4u8; 32]).unwrap();
        let request = TokenRequest::new(AuthTokenId::new(), Utc::now());
        let sealed = request.seal(&AuthMethodId::from("amoidc_1"), &wrapper).unwrap();

        let err = TokenRequest::open(&sealed, &AuthMethodId::from("amoidc_2"), &wrapper).unwrap_err();
        assert!(matches!(err, AuthError::Decrypt(_)));
    }
}
