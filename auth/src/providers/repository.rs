//! Repository traits.
//!
//! Operations receive repository *factories* rather than repositories, so a
//! fresh handle (connection, pool checkout) is produced per request. Every
//! write performed by a successful callback goes through one [`UnitOfWork`],
//! which either commits as a whole or leaves nothing behind.

use crate::audit::AuditEntry;
use crate::error::Result;
use crate::state::{
    Account, AccountDraft, AccountId, AuthMethod, AuthMethodId, AuthToken, AuthTokenId,
    AuthTokenStatus, Scope, ScopeId, User, UserId,
};
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

/// Produces a repository handle.
pub type RepoFactory<R> = Arc<dyn Fn() -> Result<R> + Send + Sync>;

/// Wrap a cloneable repository in a factory that hands out clones.
///
/// # Examples
///
/// ```
/// # use federated_auth::providers::repository::factory;
/// # use federated_auth::mocks::MockFederationStore;
/// let store = MockFederationStore::new();
/// let make = factory(store);
/// assert!(make().is_ok());
/// ```
pub fn factory<R>(repo: R) -> RepoFactory<R>
where
    R: Clone + Send + Sync + 'static,
{
    Arc::new(move || Ok(repo.clone()))
}

/// Auth method lookup and the transaction boundary.
pub trait OidcRepository: Send + Sync {
    /// Transaction type returned by [`OidcRepository::begin`].
    type UnitOfWork: UnitOfWork;

    /// Look up an auth method by id.
    ///
    /// Returns `Ok(None)` if no such method exists.
    ///
    /// # Errors
    ///
    /// Returns error if the lookup fails.
    fn lookup_auth_method(
        &self,
        id: &AuthMethodId,
    ) -> impl std::future::Future<Output = Result<Option<AuthMethod>>> + Send;

    /// Begin a unit of work.
    ///
    /// # Errors
    ///
    /// Returns error if the transaction cannot be started.
    fn begin(&self) -> impl std::future::Future<Output = Result<Self::UnitOfWork>> + Send;
}

/// Scope lookup.
pub trait IamRepository: Send + Sync {
    /// Look up a scope by id.
    ///
    /// # Errors
    ///
    /// Returns error if the lookup fails.
    fn lookup_scope(
        &self,
        id: &ScopeId,
    ) -> impl std::future::Future<Output = Result<Option<Scope>>> + Send;
}

/// Session token storage.
///
/// Tokens are inserted inside a callback's [`UnitOfWork`]; this trait covers
/// construction, lookup and issuance.
pub trait AuthTokenRepository: Send + Sync {
    /// Lifetime stamped on new pending tokens.
    fn token_time_to_live(&self) -> Duration;

    /// Build a pending token for a completed callback.
    ///
    /// Pure: nothing is persisted.
    fn new_pending_token(
        &self,
        request_id: &AuthTokenId,
        auth_method_id: &AuthMethodId,
        account_id: &AccountId,
        user_id: &UserId,
    ) -> AuthToken {
        let now = Utc::now();
        AuthToken {
            id: AuthTokenId::new(),
            request_id: request_id.clone(),
            auth_method_id: auth_method_id.clone(),
            account_id: account_id.clone(),
            user_id: user_id.clone(),
            status: AuthTokenStatus::Pending,
            token_digest: None,
            created_at: now,
            expires_at: now + self.token_time_to_live(),
        }
    }

    /// Look up a token by id.
    ///
    /// # Errors
    ///
    /// Returns error if the lookup fails.
    fn lookup_auth_token(
        &self,
        id: &AuthTokenId,
    ) -> impl std::future::Future<Output = Result<Option<AuthToken>>> + Send;

    /// Look up the token minted for a token request.
    ///
    /// # Errors
    ///
    /// Returns error if the lookup fails.
    fn lookup_token_request(
        &self,
        auth_method_id: &AuthMethodId,
        request_id: &AuthTokenId,
    ) -> impl std::future::Future<Output = Result<Option<AuthToken>>> + Send;

    /// Atomically move an unexpired pending token to issued.
    ///
    /// At most one concurrent caller observes [`IssueOutcome::Issued`] for a
    /// given request.
    ///
    /// # Errors
    ///
    /// Returns error if the update fails.
    fn issue_auth_token(
        &self,
        auth_method_id: &AuthMethodId,
        request_id: &AuthTokenId,
        token_digest: &str,
        now: DateTime<Utc>,
    ) -> impl std::future::Future<Output = Result<IssueOutcome>> + Send;
}

/// Result of [`AuthTokenRepository::issue_auth_token`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IssueOutcome {
    /// The token moved from pending to issued.
    Issued(AuthToken),
    /// A token exists but was not pending (or had expired).
    NotPending(AuthToken),
    /// No token exists for the request yet.
    NotFound,
}

/// Transactional writes for a single callback.
///
/// Dropping a unit of work without calling [`UnitOfWork::commit`] rolls it
/// back.
pub trait UnitOfWork: Send {
    /// Insert or update the account keyed by (auth method, subject).
    ///
    /// Returns the stored account and whether it was created.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    fn upsert_account(
        &mut self,
        draft: &AccountDraft,
    ) -> impl std::future::Future<Output = Result<(Account, bool)>> + Send;

    /// Look up the identity linked to an account.
    ///
    /// # Errors
    ///
    /// Returns error if the lookup fails.
    fn lookup_user_for_account(
        &mut self,
        account_id: &AccountId,
    ) -> impl std::future::Future<Output = Result<Option<User>>> + Send;

    /// Insert `user` and link it to the account.
    ///
    /// Returns the updated account.
    ///
    /// # Errors
    ///
    /// Returns error if the account does not exist or the write fails.
    fn create_user_for_account(
        &mut self,
        user: &User,
        account_id: &AccountId,
    ) -> impl std::future::Future<Output = Result<Account>> + Send;

    /// Insert a session token.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Forbidden`](crate::AuthError::Forbidden) with
    /// "not a unique request" if a token already exists for the token's
    /// (auth method, request id).
    fn insert_auth_token(
        &mut self,
        token: &AuthToken,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Append a sealed audit entry.
    ///
    /// # Errors
    ///
    /// Returns error if the write fails.
    fn append_audit(
        &mut self,
        entry: &AuditEntry,
    ) -> impl std::future::Future<Output = Result<()>> + Send;

    /// Commit every write made through this unit of work.
    ///
    /// # Errors
    ///
    /// Returns error if the commit fails; nothing is persisted in that case.
    fn commit(self) -> impl std::future::Future<Output = Result<()>> + Send;
}
