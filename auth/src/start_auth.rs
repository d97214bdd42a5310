//! Attempt initiation.
//!
//! `StartAuth` builds the provider authorization URL and the encrypted
//! attempt state that will come back on the callback. Nothing is persisted:
//! the attempt lives only in the `state` parameter held by the browser.

use crate::constants::oidc;
use crate::environment::FederationEnvironment;
use crate::error::{AuthError, Result};
use crate::providers::{IdentityProvider, KeyManager, KeyPurpose, OidcRepository, RepoFactory};
use crate::state::{AuthAttempt, AuthMethod, AuthMethodId, AuthTokenId};
use crate::state_codec;
use crate::token::TokenRequest;
use chrono::Utc;
use openidconnect::{Nonce, PkceCodeChallenge};
use tracing::{info, instrument, warn};

/// Result of a successful `StartAuth`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationRequest {
    /// URL the caller redirects the browser to.
    pub authorization_url: String,
    /// Request id the eventual session token is bound to.
    pub token_request_id: AuthTokenId,
    /// Sealed token request the caller later presents to `Token`.
    pub token_id: String,
}

/// Start an authentication attempt.
///
/// # Examples
///
/// ```no_run
/// # use federated_auth::{StartAuth, FederationEnvironment};
/// # use federated_auth::mocks::{MockFederationStore, MockIdentityProvider, MockKeyManager};
/// # use federated_auth::providers::factory;
/// # async fn example(env: FederationEnvironment<MockIdentityProvider, MockKeyManager>, store: MockFederationStore) -> federated_auth::Result<()> {
/// let request = StartAuth::new("amoidc_1234")
///     .oidc_repo(factory(store))
///     .api_addr("https://api.example.com")
///     .run(&env)
///     .await?;
/// println!("redirect to {}", request.authorization_url);
/// # Ok(())
/// # }
/// ```
pub struct StartAuth<O: OidcRepository> {
    oidc_repo: Option<RepoFactory<O>>,
    auth_method_id: String,
    api_addr: Option<String>,
    final_redirect_url: Option<String>,
}

impl<O: OidcRepository> StartAuth<O> {
    /// Start an attempt against `auth_method_id`.
    #[must_use]
    pub fn new(auth_method_id: impl Into<String>) -> Self {
        Self {
            oidc_repo: None,
            auth_method_id: auth_method_id.into(),
            api_addr: None,
            final_redirect_url: None,
        }
    }

    /// Set the auth method repository factory.
    #[must_use]
    pub fn oidc_repo(mut self, factory: RepoFactory<O>) -> Self {
        self.oidc_repo = Some(factory);
        self
    }

    /// Set the API base address the provider redirects back to.
    ///
    /// Defaults to the method's configured API URL.
    #[must_use]
    pub fn api_addr(mut self, api_addr: impl Into<String>) -> Self {
        self.api_addr = Some(api_addr.into());
        self
    }

    /// Set where the caller is sent after a successful callback.
    ///
    /// Defaults to the configured final redirect endpoint.
    #[must_use]
    pub fn final_redirect_url(mut self, url: impl Into<String>) -> Self {
        self.final_redirect_url = Some(url.into());
        self
    }

    /// Run the operation.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - A required input is missing ([`AuthError::InvalidParameter`])
    /// - The auth method does not exist ([`AuthError::RecordNotFound`])
    /// - The auth method is inactive ([`AuthError::AuthMethodInactive`])
    /// - Discovery, key lookup or encryption fails
    #[instrument(skip(self, env), fields(auth_method_id = %self.auth_method_id))]
    pub async fn run<P, K>(self, env: &FederationEnvironment<P, K>) -> Result<AuthorizationRequest>
    where
        P: IdentityProvider + Clone,
        K: KeyManager + Clone,
    {
        let auth_method_id = self.auth_method_id.clone();
        let result = self.execute(env).await;

        match &result {
            Ok(request) => info!(
                auth_method_id = %auth_method_id,
                token_request_id = %request.token_request_id,
                "Authentication attempt started"
            ),
            Err(e) => warn!(
                auth_method_id = %auth_method_id,
                error_kind = ?e.kind(),
                error = %e,
                "Failed to start authentication attempt"
            ),
        }

        result
    }

    async fn execute<P, K>(self, env: &FederationEnvironment<P, K>) -> Result<AuthorizationRequest>
    where
        P: IdentityProvider + Clone,
        K: KeyManager + Clone,
    {
        let oidc_factory = self
            .oidc_repo
            .ok_or_else(|| AuthError::InvalidParameter("missing oidc repository".to_string()))?;
        if self.auth_method_id.is_empty() {
            return Err(AuthError::InvalidParameter(
                "missing auth method id".to_string(),
            ));
        }

        let oidc = oidc_factory()?;
        let method_id = AuthMethodId::from(self.auth_method_id.as_str());
        let method = oidc
            .lookup_auth_method(&method_id)
            .await?
            .ok_or_else(|| AuthError::RecordNotFound(format!("auth method {method_id} not found")))?;

        if !method.state.is_active() {
            return Err(AuthError::AuthMethodInactive(format!(
                "auth method {method_id} is inactive"
            )));
        }

        let api_addr = self
            .api_addr
            .filter(|addr| !addr.is_empty())
            .or_else(|| Some(method.api_url.clone()).filter(|addr| !addr.is_empty()))
            .ok_or_else(|| AuthError::InvalidParameter("missing api address".to_string()))?;

        let config = &env.config;
        let callback_url = config.callback_url(&api_addr, method.id.as_str());
        let final_redirect_url = self
            .final_redirect_url
            .filter(|url| !url.is_empty())
            .unwrap_or_else(|| config.final_redirect_url(&api_addr));

        let metadata = env
            .provider
            .discover(&method)
            .await
            .map_err(upstream)?;

        let nonce = Nonce::new_random();
        let (pkce_challenge, pkce_verifier) = PkceCodeChallenge::new_random_sha256();
        let now = Utc::now();

        let attempt = AuthAttempt {
            token_request_id: AuthTokenId::new(),
            created_at: now,
            expires_at: now + config.attempt_ttl,
            config_hash: method.config_hash(),
            final_redirect_url,
            callback_url,
            nonce: nonce.secret().clone(),
            pkce_verifier: pkce_verifier.secret().clone(),
        };

        let wrapper = env.keys.wrapper(&method.scope_id, KeyPurpose::Database).await?;
        let state = state_codec::encode(&attempt, &method.id, &wrapper)?;
        let token_id = TokenRequest::new(attempt.token_request_id.clone(), attempt.expires_at)
            .seal(&method.id, &wrapper)?;

        let query = authorization_query(
            &method,
            &config.default_scopes,
            &attempt,
            &state,
            pkce_challenge.as_str(),
        )?;
        let separator = if metadata.authorization_endpoint.contains('?') {
            '&'
        } else {
            '?'
        };

        Ok(AuthorizationRequest {
            authorization_url: format!("{}{separator}{query}", metadata.authorization_endpoint),
            token_request_id: attempt.token_request_id,
            token_id,
        })
    }
}

fn upstream(e: AuthError) -> AuthError {
    match e {
        AuthError::Upstream(_) => e,
        other => AuthError::Upstream(other.to_string()),
    }
}

/// Requested scopes: defaults first, then the method's claims scopes, without
/// duplicates.
fn requested_scopes(defaults: &[String], claims_scopes: &[String]) -> String {
    let mut scopes: Vec<&str> = Vec::with_capacity(defaults.len() + claims_scopes.len());
    for scope in defaults.iter().chain(claims_scopes) {
        if !scope.is_empty() && !scopes.contains(&scope.as_str()) {
            scopes.push(scope);
        }
    }
    scopes.join(" ")
}

fn authorization_query(
    method: &AuthMethod,
    default_scopes: &[String],
    attempt: &AuthAttempt,
    state: &str,
    code_challenge: &str,
) -> Result<String> {
    let mut params: Vec<(&str, String)> = vec![
        ("response_type", oidc::RESPONSE_TYPE_CODE.to_string()),
        ("client_id", method.client_id.clone()),
        ("redirect_uri", attempt.callback_url.clone()),
        ("scope", requested_scopes(default_scopes, &method.claims_scopes)),
        ("state", state.to_string()),
        ("nonce", attempt.nonce.clone()),
        ("code_challenge", code_challenge.to_string()),
        ("code_challenge_method", oidc::PKCE_METHOD_S256.to_string()),
    ];
    if let Some(max_age) = method.effective_max_age() {
        params.push(("max_age", max_age.to_string()));
    }

    serde_urlencoded::to_string(&params).map_err(|e| AuthError::SerializationError(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_requested_scopes_dedup() {
        let defaults = vec!["openid".to_string()];
        let claims = vec!["email".to_string(), "openid".to_string(), "profile".to_string()];

        assert_eq!(requested_scopes(&defaults, &claims), "openid email profile");
    }

    #[test]
    fn test_requested_scopes_defaults_only() {
        assert_eq!(requested_scopes(&["openid".to_string()], &[]), "openid");
    }
}
