//! Shared fixtures for the federated login integration tests.

#![allow(dead_code)]
#![allow(clippy::unwrap_used)]

use chrono::{Duration, Utc};
use federated_auth::mocks::{MockFederationStore, MockIdentityProvider, MockKeyManager};
use federated_auth::providers::{factory, KeyManager, KeyPurpose};
use federated_auth::{
    state_codec, AuthAttempt, AuthMethod, AuthMethodState, AuthTokenId, Callback,
    FederationConfig, FederationEnvironment, Scope, StartAuth, Token,
};
use std::collections::HashMap;

/// API base address used throughout the tests.
pub const API_ADDR: &str = "https://api.example.com";

/// Final redirect requested by the tests.
pub const FINAL_REDIRECT: &str = "https://app.example.com/authentication-complete";

/// Callback with every repository backed by the mock store.
pub type TestCallback = Callback<MockFederationStore, MockFederationStore, MockFederationStore>;

/// Token redemption backed by the mock store.
pub type TestToken = Token<MockFederationStore, MockFederationStore>;

/// Environment over the mock provider and key manager.
pub type TestEnv = FederationEnvironment<MockIdentityProvider, MockKeyManager>;

/// A scope with one active-public primary auth method.
pub struct Harness {
    pub store: MockFederationStore,
    pub provider: MockIdentityProvider,
    pub keys: MockKeyManager,
    pub env: TestEnv,
    pub scope: Scope,
    pub method: AuthMethod,
}

impl Harness {
    pub async fn new() -> Self {
        Self::with_config(FederationConfig::new()).await
    }

    pub async fn with_config(config: FederationConfig) -> Self {
        Self::with_store(MockFederationStore::new(), config).await
    }

    pub async fn with_store(store: MockFederationStore, config: FederationConfig) -> Self {
        init_tracing();

        let provider = MockIdentityProvider::new();
        let keys = MockKeyManager::random();
        let env = FederationEnvironment::new(provider.clone(), keys.clone(), config);

        let scope = Scope::new();
        store.create_scope(scope.clone()).await;

        let method = test_method(&scope, AuthMethodState::ActivePublic);
        store.create_auth_method(method.clone()).await;
        store
            .set_primary_auth_method(&scope.id, &method.id)
            .await
            .unwrap();

        provider.set_expected_code("simple");
        provider.set_expected_subject("alice@example.com");
        provider.set_user_info_reply(HashMap::from([
            ("email".to_string(), "alice@example.com".to_string()),
            ("name".to_string(), "Alice Doe".to_string()),
        ]));

        Self {
            store,
            provider,
            keys,
            env,
            scope,
            method,
        }
    }

    /// Add another auth method to the harness scope.
    pub async fn add_method(&self, state: AuthMethodState) -> AuthMethod {
        let method = test_method(&self.scope, state);
        self.store.create_auth_method(method.clone()).await;
        method
    }

    /// Callback with all repository factories set.
    pub fn callback(&self, auth_method_id: &str, state: &str, code: &str) -> TestCallback {
        TestCallback::new(auth_method_id, state, code)
            .oidc_repo(factory(self.store.clone()))
            .iam_repo(factory(self.store.clone()))
            .token_repo(factory(self.store.clone()))
    }

    /// `StartAuth` with the repository factory and API address set.
    pub fn start(&self, auth_method_id: &str) -> StartAuth<MockFederationStore> {
        StartAuth::new(auth_method_id)
            .oidc_repo(factory(self.store.clone()))
            .api_addr(API_ADDR)
            .final_redirect_url(FINAL_REDIRECT)
    }

    /// `Token` with both repository factories set.
    pub fn token(&self, auth_method_id: &str, token_id: &str) -> TestToken {
        TestToken::new(auth_method_id, token_id)
            .oidc_repo(factory(self.store.clone()))
            .token_repo(factory(self.store.clone()))
    }

    /// Build and seal an attempt for `method` directly, and prime the
    /// provider to echo its nonce.
    pub async fn sealed_attempt(
        &self,
        method: &AuthMethod,
        adjust: impl FnOnce(&mut AuthAttempt),
    ) -> (String, AuthAttempt) {
        let now = Utc::now();
        let mut attempt = AuthAttempt {
            token_request_id: AuthTokenId::new(),
            created_at: now,
            expires_at: now + Duration::minutes(5),
            config_hash: method.config_hash(),
            final_redirect_url: FINAL_REDIRECT.to_string(),
            callback_url: self
                .env
                .config
                .callback_url(API_ADDR, method.id.as_str()),
            nonce: format!("nonce-{}", uuid::Uuid::new_v4().simple()),
            pkce_verifier: "test-verifier".to_string(),
        };
        adjust(&mut attempt);

        let wrapper = self
            .keys
            .wrapper(&method.scope_id, KeyPurpose::Database)
            .await
            .unwrap();
        let state = state_codec::encode(&attempt, &method.id, &wrapper).unwrap();

        self.provider.set_expected_auth_nonce(attempt.nonce.clone());
        (state, attempt)
    }

    /// Assert the store holds no rows of any kind written by a callback.
    pub async fn assert_nothing_persisted(&self) {
        assert!(self.store.auth_tokens().await.is_empty(), "tokens persisted");
        assert!(self.store.accounts().await.is_empty(), "accounts persisted");
        assert!(self.store.users().await.is_empty(), "users persisted");
        assert!(self.store.audit_entries().await.is_empty(), "audit persisted");
    }
}

/// Install a test-writer subscriber once; `RUST_LOG` controls the filter.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// An auth method in `scope` pointing at the test issuer.
pub fn test_method(scope: &Scope, state: AuthMethodState) -> AuthMethod {
    AuthMethod::new(
        scope.id.clone(),
        state,
        "https://idp.example.com",
        "test-client-id",
        "test-client-secret",
    )
    .with_api_url(API_ADDR)
}

/// Query parameters of an authorization URL.
pub fn query_params(url: &str) -> HashMap<String, String> {
    let (_, query) = url.split_once('?').unwrap();
    serde_urlencoded::from_str(query).unwrap()
}
