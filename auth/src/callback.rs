//! Callback handling.
//!
//! `Callback` is the state machine run when the provider redirects back.
//! Every gate before the commit is read-only; all writes happen in a single
//! unit of work at the end:
//!
//! ```text
//!  validate inputs ─▶ lookup method ─▶ decode state ─▶ decrypt state
//!        │                                                  │
//!        ▼                                                  ▼
//!  method active? ─▶ config unchanged? ─▶ not expired? ─▶ exchange code
//!                                                           │ + verify claims
//!                                                           ▼
//!  ┌──────────────────── unit of work ─────────────────────────────┐
//!  │ upsert account ─▶ resolve identity ─▶ insert pending token    │
//!  │   (unique per method + request id) ─▶ audit entry ─▶ commit   │
//!  └───────────────────────────────────────────────────────────────┘
//!        │
//!        ▼
//!  final redirect URL
//! ```
//!
//! Replay protection rests on the token insert: a second callback carrying
//! the same attempt hits the (auth method, request id) uniqueness guard and
//! the whole unit of work is discarded.

use crate::audit::{self, AuditEntry};
use crate::constants::messages;
use crate::environment::FederationEnvironment;
use crate::error::{AuthError, Result};
use crate::federation;
use crate::providers::{
    AuthTokenRepository, ExchangeRequest, IamRepository, IdTokenClaims, IdentityProvider,
    KeyManager, KeyPurpose, OidcRepository, RepoFactory, UnitOfWork,
};
use crate::state::{AuthAttempt, AuthMethod, AuthMethodId};
use crate::state_codec;
use chrono::{DateTime, Utc};
use constant_time_eq::constant_time_eq;
use tracing::{debug, info, instrument, warn};

/// Allowed clock skew when checking `max_age`, in seconds.
const MAX_AGE_LEEWAY_SECS: i64 = 60;

/// Handle the provider's redirect back to the callback endpoint.
///
/// # Examples
///
/// ```no_run
/// # use federated_auth::{Callback, FederationEnvironment};
/// # use federated_auth::mocks::{MockFederationStore, MockIdentityProvider, MockKeyManager};
/// # use federated_auth::providers::factory;
/// # async fn example(env: FederationEnvironment<MockIdentityProvider, MockKeyManager>, store: MockFederationStore, state: String, code: String) -> federated_auth::Result<()> {
/// let final_redirect = Callback::new("amoidc_1234", state, code)
///     .oidc_repo(factory(store.clone()))
///     .iam_repo(factory(store.clone()))
///     .token_repo(factory(store))
///     .run(&env)
///     .await?;
/// # Ok(())
/// # }
/// ```
pub struct Callback<O, I, T>
where
    O: OidcRepository,
    I: IamRepository,
    T: AuthTokenRepository,
{
    oidc_repo: Option<RepoFactory<O>>,
    iam_repo: Option<RepoFactory<I>>,
    token_repo: Option<RepoFactory<T>>,
    auth_method_id: String,
    state: String,
    code: String,
}

impl<O, I, T> Callback<O, I, T>
where
    O: OidcRepository,
    I: IamRepository,
    T: AuthTokenRepository,
{
    /// Handle a callback for `auth_method_id` with the provider's `state`
    /// and `code` parameters.
    #[must_use]
    pub fn new(
        auth_method_id: impl Into<String>,
        state: impl Into<String>,
        code: impl Into<String>,
    ) -> Self {
        Self {
            oidc_repo: None,
            iam_repo: None,
            token_repo: None,
            auth_method_id: auth_method_id.into(),
            state: state.into(),
            code: code.into(),
        }
    }

    /// Set the auth method repository factory.
    #[must_use]
    pub fn oidc_repo(mut self, factory: RepoFactory<O>) -> Self {
        self.oidc_repo = Some(factory);
        self
    }

    /// Set the scope repository factory.
    #[must_use]
    pub fn iam_repo(mut self, factory: RepoFactory<I>) -> Self {
        self.iam_repo = Some(factory);
        self
    }

    /// Set the auth token repository factory.
    #[must_use]
    pub fn token_repo(mut self, factory: RepoFactory<T>) -> Self {
        self.token_repo = Some(factory);
        self
    }

    /// Run the callback.
    ///
    /// Returns the attempt's final redirect URL.
    ///
    /// # Errors
    ///
    /// Returns error if any gate fails; nothing is persisted in that case:
    /// - Missing input ([`AuthError::InvalidParameter`])
    /// - Unknown auth method ([`AuthError::RecordNotFound`])
    /// - Malformed state ([`AuthError::Decode`])
    /// - State not sealed for this method ([`AuthError::Decrypt`])
    /// - Inactive or reconfigured method ([`AuthError::AuthMethodInactive`])
    /// - Expired attempt ([`AuthError::AttemptExpired`])
    /// - Provider failure or unverifiable claims ([`AuthError::Upstream`])
    /// - Replayed attempt ([`AuthError::Forbidden`])
    #[instrument(skip(self, env), fields(auth_method_id = %self.auth_method_id))]
    pub async fn run<P, K>(self, env: &FederationEnvironment<P, K>) -> Result<String>
    where
        P: IdentityProvider + Clone,
        K: KeyManager + Clone,
    {
        let auth_method_id = self.auth_method_id.clone();
        let result = self.execute(env).await;

        if let Err(e) = &result {
            warn!(
                auth_method_id = %auth_method_id,
                error_kind = ?e.kind(),
                error = %e,
                "Authentication callback failed"
            );
        }

        result
    }

    async fn execute<P, K>(self, env: &FederationEnvironment<P, K>) -> Result<String>
    where
        P: IdentityProvider + Clone,
        K: KeyManager + Clone,
    {
        // ═══════════════════════════════════════════════════════════
        // Input Validation
        // ═══════════════════════════════════════════════════════════

        let oidc_factory = self
            .oidc_repo
            .ok_or_else(|| AuthError::InvalidParameter("missing oidc repository".to_string()))?;
        let iam_factory = self
            .iam_repo
            .ok_or_else(|| AuthError::InvalidParameter("missing iam repository".to_string()))?;
        let token_factory = self.token_repo.ok_or_else(|| {
            AuthError::InvalidParameter("missing auth token repository".to_string())
        })?;
        if self.auth_method_id.is_empty() {
            return Err(AuthError::InvalidParameter(
                "missing auth method id".to_string(),
            ));
        }
        if self.state.is_empty() {
            return Err(AuthError::InvalidParameter("missing state".to_string()));
        }
        if self.code.is_empty() {
            return Err(AuthError::InvalidParameter("missing code".to_string()));
        }

        let oidc = oidc_factory()?;
        let iam = iam_factory()?;
        let tokens = token_factory()?;

        // ═══════════════════════════════════════════════════════════
        // Attempt Verification
        // ═══════════════════════════════════════════════════════════

        let method_id = AuthMethodId::from(self.auth_method_id.as_str());
        let method = oidc
            .lookup_auth_method(&method_id)
            .await?
            .ok_or_else(|| AuthError::RecordNotFound(format!("auth method {method_id} not found")))?;

        let envelope = state_codec::decode(&self.state)?;
        let db_wrapper = env.keys.wrapper(&method.scope_id, KeyPurpose::Database).await?;
        let attempt = envelope.decrypt(&method.id, &db_wrapper)?;

        if !method.state.is_active() {
            return Err(AuthError::AuthMethodInactive(format!(
                "auth method {} is inactive",
                method.id
            )));
        }

        if attempt.config_hash != method.config_hash() {
            return Err(AuthError::AuthMethodInactive(
                messages::CONFIG_CHANGED.to_string(),
            ));
        }

        let now = Utc::now();
        if attempt.is_expired(now) {
            return Err(AuthError::AttemptExpired(
                messages::STATE_EXPIRED.to_string(),
            ));
        }

        // ═══════════════════════════════════════════════════════════
        // Provider Exchange
        // ═══════════════════════════════════════════════════════════

        let exchange = ExchangeRequest {
            code: self.code,
            redirect_url: attempt.callback_url.clone(),
            pkce_verifier: attempt.pkce_verifier.clone(),
        };
        let provider_tokens = env
            .provider
            .exchange_code(&method, &exchange)
            .await
            .map_err(upstream)?;
        let id_token = provider_tokens.id_token;
        verify_id_token(&method, &attempt, &id_token, now)?;

        let user_info = env
            .provider
            .user_info(&method, &provider_tokens.access_token)
            .await
            .map_err(upstream)?;
        if user_info.sub != id_token.sub {
            return Err(AuthError::Upstream(format!(
                "userinfo subject {} does not match id token subject {}",
                user_info.sub, id_token.sub
            )));
        }

        debug!(auth_method_id = %method.id, subject = %id_token.sub, "Provider claims verified");

        let scope = iam.lookup_scope(&method.scope_id).await?.ok_or_else(|| {
            AuthError::RecordNotFound(format!("scope {} not found", method.scope_id))
        })?;
        let is_primary = scope.is_primary(&method.id);
        let oplog_wrapper = env.keys.wrapper(&method.scope_id, KeyPurpose::Oplog).await?;

        // ═══════════════════════════════════════════════════════════
        // Commit
        // ═══════════════════════════════════════════════════════════

        let mut uow = oidc.begin().await?;

        let resolved = federation::resolve_account(&mut uow, &method, &id_token, &user_info).await?;
        let identity = if is_primary {
            federation::resolve_identity(&mut uow, &resolved.account, &method, &scope).await?
        } else {
            federation::linked_identity(&mut uow, &resolved.account).await?
        };

        let token = tokens.new_pending_token(
            &attempt.token_request_id,
            &method.id,
            &identity.account.id,
            &identity.user.id,
        );
        uow.insert_auth_token(&token).await?;

        let created_user = identity.created.then_some(&identity.user);
        let audit_messages =
            audit::callback_messages(&identity.account, resolved.created, created_user)?;
        let entry = AuditEntry::seal(&method.scope_id, &oplog_wrapper, &audit_messages)?;
        uow.append_audit(&entry).await?;

        uow.commit().await?;

        info!(
            auth_method_id = %method.id,
            account_id = %identity.account.id,
            user_id = %identity.user.id,
            user_created = identity.created,
            "Authentication callback completed"
        );

        Ok(attempt.final_redirect_url)
    }
}

fn upstream(e: AuthError) -> AuthError {
    match e {
        AuthError::Upstream(_) => e,
        other => AuthError::Upstream(other.to_string()),
    }
}

/// Check the ID token claims the flow is responsible for.
fn verify_id_token(
    method: &AuthMethod,
    attempt: &AuthAttempt,
    claims: &IdTokenClaims,
    now: DateTime<Utc>,
) -> Result<()> {
    if claims.iss != method.issuer {
        return Err(AuthError::Upstream(format!(
            "id token issuer {} does not match {}",
            claims.iss, method.issuer
        )));
    }

    if claims.sub.is_empty() {
        return Err(AuthError::Upstream("id token missing subject".to_string()));
    }

    if !claims.aud.iter().any(|aud| *aud == method.client_id) {
        return Err(AuthError::Upstream(
            "id token audience does not include client id".to_string(),
        ));
    }
    if !method.audiences.is_empty() && !claims.aud.iter().any(|aud| method.audiences.contains(aud))
    {
        return Err(AuthError::Upstream(
            "id token audience does not include a configured audience".to_string(),
        ));
    }

    match &claims.nonce {
        Some(nonce) if constant_time_eq(nonce.as_bytes(), attempt.nonce.as_bytes()) => {}
        _ => return Err(AuthError::Upstream("id token nonce does not match".to_string())),
    }

    if claims.exp <= now.timestamp() {
        return Err(AuthError::Upstream("id token has expired".to_string()));
    }

    if let Some(max_age) = method.effective_max_age() {
        let auth_time = claims
            .auth_time
            .ok_or_else(|| AuthError::Upstream("id token missing auth_time".to_string()))?;
        if now.timestamp() - auth_time > i64::from(max_age) + MAX_AGE_LEEWAY_SECS {
            return Err(AuthError::Upstream(format!(
                "authentication is older than max_age {max_age}"
            )));
        }
    }

    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::state::{AuthMethodState, AuthTokenId, ScopeId};
    use chrono::Duration;

    fn fixture() -> (AuthMethod, AuthAttempt, IdTokenClaims) {
        let method = AuthMethod::new(
            ScopeId::new(),
            AuthMethodState::ActivePublic,
            "https://idp.example.com",
            "client",
            "secret",
        );
        let now = Utc::now();
        let attempt = AuthAttempt {
            token_request_id: AuthTokenId::new(),
            created_at: now,
            expires_at: now + Duration::minutes(5),
            config_hash: method.config_hash(),
            final_redirect_url: "https://app.example.com/done".into(),
            callback_url: "https://api.example.com/callback".into(),
            nonce: "expected-nonce".into(),
            pkce_verifier: "verifier".into(),
        };
        let claims = IdTokenClaims {
            iss: "https://idp.example.com".into(),
            sub: "alice".into(),
            aud: vec!["client".into()],
            exp: (now + Duration::minutes(5)).timestamp(),
            iat: now.timestamp(),
            auth_time: Some(now.timestamp()),
            nonce: Some("expected-nonce".into()),
            email: None,
            name: None,
        };
        (method, attempt, claims)
    }

    #[test]
    fn test_valid_claims() {
        let (method, attempt, claims) = fixture();
        assert!(verify_id_token(&method, &attempt, &claims, Utc::now()).is_ok());
    }

    #[test]
    fn test_wrong_issuer() {
        let (method, attempt, mut claims) = fixture();
        claims.iss = "https://evil.example.com".into();

        let err = verify_id_token(&method, &attempt, &claims, Utc::now()).unwrap_err();
        assert!(matches!(err, AuthError::Upstream(_)));
    }

    #[test]
    fn test_wrong_audience() {
        let (method, attempt, mut claims) = fixture();
        claims.aud = vec!["other-client".into()];
        assert!(verify_id_token(&method, &attempt, &claims, Utc::now()).is_err());
    }

    #[test]
    fn test_configured_audiences() {
        let (method, attempt, mut claims) = fixture();
        let method = method.with_audiences(vec!["api".into()]);
        assert!(verify_id_token(&method, &attempt, &claims, Utc::now()).is_err());

        claims.aud.push("api".into());
        assert!(verify_id_token(&method, &attempt, &claims, Utc::now()).is_ok());
    }

    #[test]
    fn test_nonce_mismatch() {
        let (method, attempt, mut claims) = fixture();
        claims.nonce = Some("other-nonce".into());
        assert!(verify_id_token(&method, &attempt, &claims, Utc::now()).is_err());

        claims.nonce = None;
        assert!(verify_id_token(&method, &attempt, &claims, Utc::now()).is_err());
    }

    #[test]
    fn test_expired_id_token() {
        let (method, attempt, mut claims) = fixture();
        claims.exp = (Utc::now() - Duration::seconds(1)).timestamp();
        assert!(verify_id_token(&method, &attempt, &claims, Utc::now()).is_err());
    }

    #[test]
    fn test_max_age() {
        let (method, attempt, mut claims) = fixture();
        let method = method.with_max_age(300);
        assert!(verify_id_token(&method, &attempt, &claims, Utc::now()).is_ok());

        claims.auth_time = Some((Utc::now() - Duration::hours(1)).timestamp());
        assert!(verify_id_token(&method, &attempt, &claims, Utc::now()).is_err());

        claims.auth_time = None;
        assert!(verify_id_token(&method, &attempt, &claims, Utc::now()).is_err());
    }

    #[test]
    fn test_negative_max_age_forces_fresh_authentication() {
        let (method, attempt, mut claims) = fixture();
        let method = method.with_max_age(-1);
        let now = Utc::now();

        claims.auth_time = Some((now - Duration::seconds(30)).timestamp());
        assert!(verify_id_token(&method, &attempt, &claims, now).is_ok());

        claims.auth_time = Some((now - Duration::seconds(MAX_AGE_LEEWAY_SECS + 5)).timestamp());
        let err = verify_id_token(&method, &attempt, &claims, now).unwrap_err();
        assert!(err.to_string().contains("older than max_age 0"));
    }
}
