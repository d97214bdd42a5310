//! Mock OIDC identity provider for testing.

use crate::error::{AuthError, Result};
use crate::providers::{
    ExchangeRequest, IdTokenClaims, IdentityProvider, ProviderMetadata, ProviderTokens,
    UserInfoClaims,
};
use crate::state::AuthMethod;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{Duration, Utc};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Clone, Default)]
struct ProviderState {
    failing: bool,
    expected_code: Option<String>,
    expected_nonce: Option<String>,
    expected_pkce_challenge: Option<String>,
    subject: String,
    issuer: Option<String>,
    custom_audiences: Vec<String>,
    user_info: HashMap<String, String>,
    client_credentials: Option<(String, String)>,
    allowed_redirects: Vec<String>,
    access_tokens: Vec<String>,
    exchanges: Vec<ExchangeRequest>,
}

/// Mock OIDC identity provider.
///
/// Scriptable stand-in for a real provider: tests set the code it accepts,
/// the nonce it echoes into the ID token, the subject and the userinfo
/// claims. Clones share configuration, so a provider moved into an
/// environment can still be reconfigured by the test.
#[derive(Debug, Clone)]
pub struct MockIdentityProvider {
    state: Arc<Mutex<ProviderState>>,
}

impl MockIdentityProvider {
    /// Create a provider that accepts any code for subject `alice`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(ProviderState {
                subject: "alice".to_string(),
                ..ProviderState::default()
            })),
        }
    }

    /// Create a provider that fails every request.
    #[must_use]
    pub fn failing() -> Self {
        let provider = Self::new();
        provider.lock().failing = true;
        provider
    }

    fn lock(&self) -> MutexGuard<'_, ProviderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Only accept `code` in the exchange.
    pub fn set_expected_code(&self, code: impl Into<String>) {
        self.lock().expected_code = Some(code.into());
    }

    /// Nonce echoed into ID tokens.
    pub fn set_expected_auth_nonce(&self, nonce: impl Into<String>) {
        self.lock().expected_nonce = Some(nonce.into());
    }

    /// Require the exchange's PKCE verifier to match `challenge` (S256).
    pub fn set_expected_pkce_challenge(&self, challenge: impl Into<String>) {
        self.lock().expected_pkce_challenge = Some(challenge.into());
    }

    /// Subject of issued ID tokens.
    pub fn set_expected_subject(&self, subject: impl Into<String>) {
        self.lock().subject = subject.into();
    }

    /// Issuer of ID tokens. Defaults to the method's issuer.
    pub fn set_issuer(&self, issuer: impl Into<String>) {
        self.lock().issuer = Some(issuer.into());
    }

    /// Extra audiences added to ID tokens.
    pub fn set_custom_audience(&self, audiences: Vec<String>) {
        self.lock().custom_audiences = audiences;
    }

    /// Claims returned from userinfo (and copied into ID tokens).
    ///
    /// A `sub` entry overrides the subject in the userinfo reply only.
    pub fn set_user_info_reply(&self, claims: HashMap<String, String>) {
        self.lock().user_info = claims;
    }

    /// Require the method's client credentials to match.
    pub fn set_client_creds(&self, client_id: impl Into<String>, client_secret: impl Into<String>) {
        self.lock().client_credentials = Some((client_id.into(), client_secret.into()));
    }

    /// Only accept these redirect URIs.
    pub fn set_allowed_redirect_uris(&self, uris: Vec<String>) {
        self.lock().allowed_redirects = uris;
    }

    /// Code exchanges received so far.
    #[must_use]
    pub fn exchanges(&self) -> Vec<ExchangeRequest> {
        self.lock().exchanges.clone()
    }

    fn exchange(&self, method: &AuthMethod, request: &ExchangeRequest) -> Result<ProviderTokens> {
        let mut state = self.lock();
        if state.failing {
            return Err(AuthError::Upstream("provider unavailable".to_string()));
        }

        if state
            .client_credentials
            .as_ref()
            .is_some_and(|(id, secret)| *id != method.client_id || *secret != method.client_secret)
        {
            return Err(AuthError::Upstream("invalid_client".to_string()));
        }

        if state
            .expected_code
            .as_ref()
            .is_some_and(|expected| *expected != request.code)
        {
            return Err(AuthError::Upstream(
                "invalid_grant: unexpected authorization code".to_string(),
            ));
        }

        if !state.allowed_redirects.is_empty()
            && !state.allowed_redirects.contains(&request.redirect_url)
        {
            return Err(AuthError::Upstream(format!(
                "invalid_request: redirect_uri {} not allowed",
                request.redirect_url
            )));
        }

        let pkce_challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(request.pkce_verifier.as_bytes()));
        if state
            .expected_pkce_challenge
            .as_ref()
            .is_some_and(|challenge| *challenge != pkce_challenge)
        {
            return Err(AuthError::Upstream(
                "invalid_grant: pkce verification failed".to_string(),
            ));
        }

        let now = Utc::now();
        let mut aud = vec![method.client_id.clone()];
        aud.extend(state.custom_audiences.iter().cloned());

        let id_token = IdTokenClaims {
            iss: state.issuer.clone().unwrap_or_else(|| method.issuer.clone()),
            sub: state.subject.clone(),
            aud,
            exp: (now + Duration::hours(1)).timestamp(),
            iat: now.timestamp(),
            auth_time: Some(now.timestamp()),
            nonce: state.expected_nonce.clone(),
            email: state.user_info.get("email").cloned(),
            name: state.user_info.get("name").cloned(),
        };
        let access_token = format!("mock-access-token-{}", uuid::Uuid::new_v4().simple());

        state.access_tokens.push(access_token.clone());
        state.exchanges.push(request.clone());

        Ok(ProviderTokens {
            access_token,
            id_token,
        })
    }

    fn claims(&self, access_token: &str) -> Result<UserInfoClaims> {
        let state = self.lock();
        if state.failing {
            return Err(AuthError::Upstream("provider unavailable".to_string()));
        }
        if !state.access_tokens.iter().any(|t| t == access_token) {
            return Err(AuthError::Upstream("invalid access token".to_string()));
        }

        let mut additional = state.user_info.clone();
        let sub = additional
            .remove("sub")
            .unwrap_or_else(|| state.subject.clone());

        Ok(UserInfoClaims {
            sub,
            email: additional.remove("email"),
            name: additional.remove("name"),
            additional: additional
                .into_iter()
                .map(|(claim, value)| (claim, serde_json::Value::String(value)))
                .collect(),
        })
    }
}

impl Default for MockIdentityProvider {
    fn default() -> Self {
        Self::new()
    }
}

impl IdentityProvider for MockIdentityProvider {
    fn discover(&self, method: &AuthMethod) -> impl Future<Output = Result<ProviderMetadata>> + Send {
        let failing = self.lock().failing;
        let issuer = method.issuer.trim_end_matches('/').to_string();

        async move {
            if failing {
                return Err(AuthError::Upstream("provider unavailable".to_string()));
            }

            Ok(ProviderMetadata {
                authorization_endpoint: format!("{issuer}/authorize"),
                issuer,
            })
        }
    }

    fn exchange_code(
        &self,
        method: &AuthMethod,
        request: &ExchangeRequest,
    ) -> impl Future<Output = Result<ProviderTokens>> + Send {
        let result = self.exchange(method, request);
        async move { result }
    }

    fn user_info(
        &self,
        _method: &AuthMethod,
        access_token: &str,
    ) -> impl Future<Output = Result<UserInfoClaims>> + Send {
        let result = self.claims(access_token);
        async move { result }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::state::{AuthMethodState, ScopeId};

    fn method() -> AuthMethod {
        AuthMethod::new(
            ScopeId::new(),
            AuthMethodState::ActivePublic,
            "https://idp.example.com",
            "client",
            "secret",
        )
    }

    fn request(code: &str) -> ExchangeRequest {
        ExchangeRequest {
            code: code.into(),
            redirect_url: "https://api.example.com/callback".into(),
            pkce_verifier: "verifier".into(),
        }
    }

    #[tokio::test]
    async fn test_exchange_and_user_info() {
        let provider = MockIdentityProvider::new();
        provider.set_expected_code("simple");
        provider.set_expected_auth_nonce("nonce");
        provider.set_user_info_reply(HashMap::from([
            ("email".to_string(), "alice@example.com".to_string()),
            ("locale".to_string(), "en".to_string()),
        ]));

        let tokens = provider.exchange_code(&method(), &request("simple")).await.unwrap();
        assert_eq!(tokens.id_token.sub, "alice");
        assert_eq!(tokens.id_token.nonce.as_deref(), Some("nonce"));
        assert_eq!(tokens.id_token.aud, vec!["client"]);

        let info = provider.user_info(&method(), &tokens.access_token).await.unwrap();
        assert_eq!(info.sub, "alice");
        assert_eq!(info.email.as_deref(), Some("alice@example.com"));
        assert_eq!(
            info.additional.get("locale").and_then(serde_json::Value::as_str),
            Some("en")
        );
    }

    #[tokio::test]
    async fn test_rejects_wrong_code() {
        let provider = MockIdentityProvider::new();
        provider.set_expected_code("simple");

        let err = provider.exchange_code(&method(), &request("other")).await.unwrap_err();
        assert!(matches!(err, AuthError::Upstream(_)));
    }

    #[tokio::test]
    async fn test_rejects_unknown_access_token() {
        let provider = MockIdentityProvider::new();
        assert!(provider.user_info(&method(), "forged").await.is_err());
    }

    #[tokio::test]
    async fn test_pkce_verification() {
        let provider = MockIdentityProvider::new();
        provider.set_expected_pkce_challenge(URL_SAFE_NO_PAD.encode(Sha256::digest(b"verifier")));
        assert!(provider.exchange_code(&method(), &request("c")).await.is_ok());

        provider.set_expected_pkce_challenge("wrong");
        assert!(provider.exchange_code(&method(), &request("c")).await.is_err());
    }

    #[tokio::test]
    async fn test_failing_provider() {
        let provider = MockIdentityProvider::failing();
        assert!(provider.discover(&method()).await.is_err());
        assert!(provider.exchange_code(&method(), &request("c")).await.is_err());
    }
}
