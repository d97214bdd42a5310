//! In-memory federation store.

use crate::audit::AuditEntry;
use crate::constants::messages;
use crate::error::{AuthError, Result};
use crate::providers::{
    AuthTokenRepository, IamRepository, IssueOutcome, OidcRepository, UnitOfWork,
};
use crate::state::{
    Account, AccountDraft, AccountId, AuthMethod, AuthMethodId, AuthToken, AuthTokenId,
    AuthTokenStatus, Scope, ScopeId, User, UserId,
};
use chrono::{DateTime, Duration, Utc};
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Debug, Clone, Default)]
struct Tables {
    scopes: HashMap<ScopeId, Scope>,
    auth_methods: HashMap<AuthMethodId, AuthMethod>,
    accounts: HashMap<AccountId, Account>,
    users: HashMap<UserId, User>,
    auth_tokens: HashMap<AuthTokenId, AuthToken>,
    audit: Vec<AuditEntry>,
}

/// Mock federation store.
///
/// Implements every repository trait over one set of in-memory tables. A
/// unit of work holds the table lock until it is committed or dropped and
/// stages its writes on a copy, so concurrent callbacks are serialized and a
/// dropped unit of work leaves nothing behind.
#[derive(Debug, Clone)]
pub struct MockFederationStore {
    tables: Arc<Mutex<Tables>>,
    token_ttl: Duration,
}

impl MockFederationStore {
    /// Create an empty store with a 24 hour token lifetime.
    #[must_use]
    pub fn new() -> Self {
        Self {
            tables: Arc::new(Mutex::new(Tables::default())),
            token_ttl: Duration::hours(24),
        }
    }

    /// Set the lifetime stamped on new pending tokens.
    #[must_use]
    pub fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    // ═══════════════════════════════════════════════════════════
    // Seeding
    // ═══════════════════════════════════════════════════════════

    /// Insert a scope.
    pub async fn create_scope(&self, scope: Scope) {
        self.tables.lock().await.scopes.insert(scope.id.clone(), scope);
    }

    /// Insert an auth method.
    pub async fn create_auth_method(&self, method: AuthMethod) {
        self.tables
            .lock()
            .await
            .auth_methods
            .insert(method.id.clone(), method);
    }

    /// Replace an existing auth method, bumping its version.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RecordNotFound`] if the method does not exist.
    pub async fn update_auth_method(&self, mut method: AuthMethod) -> Result<AuthMethod> {
        let mut tables = self.tables.lock().await;
        let current = tables.auth_methods.get(&method.id).ok_or_else(|| {
            AuthError::RecordNotFound(format!("auth method {} not found", method.id))
        })?;

        method.version = current.version + 1;
        method.updated_at = Utc::now();
        tables
            .auth_methods
            .insert(method.id.clone(), method.clone());
        Ok(method)
    }

    /// Make `auth_method_id` the scope's primary auth method.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RecordNotFound`] if the scope does not exist.
    pub async fn set_primary_auth_method(
        &self,
        scope_id: &ScopeId,
        auth_method_id: &AuthMethodId,
    ) -> Result<()> {
        let mut tables = self.tables.lock().await;
        let scope = tables
            .scopes
            .get_mut(scope_id)
            .ok_or_else(|| AuthError::RecordNotFound(format!("scope {scope_id} not found")))?;
        scope.primary_auth_method_id = Some(auth_method_id.clone());
        Ok(())
    }

    /// Insert a local identity.
    pub async fn create_user(&self, user: User) {
        self.tables.lock().await.users.insert(user.id.clone(), user);
    }

    /// Insert a federated account.
    pub async fn create_account(&self, account: Account) {
        self.tables
            .lock()
            .await
            .accounts
            .insert(account.id.clone(), account);
    }

    /// Link an account to an existing identity.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RecordNotFound`] if the account or the user does
    /// not exist.
    pub async fn link_account(&self, account_id: &AccountId, user_id: &UserId) -> Result<()> {
        let mut tables = self.tables.lock().await;
        if !tables.users.contains_key(user_id) {
            return Err(AuthError::RecordNotFound(format!("user {user_id} not found")));
        }
        let account = tables
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| AuthError::RecordNotFound(format!("account {account_id} not found")))?;
        account.iam_user_id = Some(user_id.clone());
        account.version += 1;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════
    // Inspection
    // ═══════════════════════════════════════════════════════════

    /// All accounts.
    pub async fn accounts(&self) -> Vec<Account> {
        self.tables.lock().await.accounts.values().cloned().collect()
    }

    /// All users.
    pub async fn users(&self) -> Vec<User> {
        self.tables.lock().await.users.values().cloned().collect()
    }

    /// All auth tokens.
    pub async fn auth_tokens(&self) -> Vec<AuthToken> {
        self.tables
            .lock()
            .await
            .auth_tokens
            .values()
            .cloned()
            .collect()
    }

    /// All audit entries, in append order.
    pub async fn audit_entries(&self) -> Vec<AuditEntry> {
        self.tables.lock().await.audit.clone()
    }
}

impl Default for MockFederationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl OidcRepository for MockFederationStore {
    type UnitOfWork = MockUnitOfWork;

    fn lookup_auth_method(
        &self,
        id: &AuthMethodId,
    ) -> impl Future<Output = Result<Option<AuthMethod>>> + Send {
        let tables = Arc::clone(&self.tables);
        let id = id.clone();

        async move { Ok(tables.lock().await.auth_methods.get(&id).cloned()) }
    }

    fn begin(&self) -> impl Future<Output = Result<MockUnitOfWork>> + Send {
        let tables = Arc::clone(&self.tables);

        async move {
            let guard = tables.lock_owned().await;
            let staged = guard.clone();
            Ok(MockUnitOfWork { guard, staged })
        }
    }
}

impl IamRepository for MockFederationStore {
    fn lookup_scope(&self, id: &ScopeId) -> impl Future<Output = Result<Option<Scope>>> + Send {
        let tables = Arc::clone(&self.tables);
        let id = id.clone();

        async move { Ok(tables.lock().await.scopes.get(&id).cloned()) }
    }
}

impl AuthTokenRepository for MockFederationStore {
    fn token_time_to_live(&self) -> Duration {
        self.token_ttl
    }

    fn lookup_auth_token(
        &self,
        id: &AuthTokenId,
    ) -> impl Future<Output = Result<Option<AuthToken>>> + Send {
        let tables = Arc::clone(&self.tables);
        let id = id.clone();

        async move { Ok(tables.lock().await.auth_tokens.get(&id).cloned()) }
    }

    fn lookup_token_request(
        &self,
        auth_method_id: &AuthMethodId,
        request_id: &AuthTokenId,
    ) -> impl Future<Output = Result<Option<AuthToken>>> + Send {
        let tables = Arc::clone(&self.tables);
        let auth_method_id = auth_method_id.clone();
        let request_id = request_id.clone();

        async move {
            Ok(tables
                .lock()
                .await
                .auth_tokens
                .values()
                .find(|t| t.auth_method_id == auth_method_id && t.request_id == request_id)
                .cloned())
        }
    }

    fn issue_auth_token(
        &self,
        auth_method_id: &AuthMethodId,
        request_id: &AuthTokenId,
        token_digest: &str,
        now: DateTime<Utc>,
    ) -> impl Future<Output = Result<IssueOutcome>> + Send {
        let tables = Arc::clone(&self.tables);
        let auth_method_id = auth_method_id.clone();
        let request_id = request_id.clone();
        let token_digest = token_digest.to_string();

        async move {
            let mut tables = tables.lock().await;
            let Some(token) = tables
                .auth_tokens
                .values_mut()
                .find(|t| t.auth_method_id == auth_method_id && t.request_id == request_id)
            else {
                return Ok(IssueOutcome::NotFound);
            };

            if token.status != AuthTokenStatus::Pending || token.is_expired(now) {
                return Ok(IssueOutcome::NotPending(token.clone()));
            }

            token.status = AuthTokenStatus::Issued;
            token.token_digest = Some(token_digest);
            Ok(IssueOutcome::Issued(token.clone()))
        }
    }
}

/// Unit of work over [`MockFederationStore`].
#[derive(Debug)]
pub struct MockUnitOfWork {
    guard: OwnedMutexGuard<Tables>,
    staged: Tables,
}

impl UnitOfWork for MockUnitOfWork {
    async fn upsert_account(&mut self, draft: &AccountDraft) -> Result<(Account, bool)> {
        let now = Utc::now();
        let existing = self.staged.accounts.values_mut().find(|a| {
            a.auth_method_id == draft.auth_method_id && a.subject == draft.subject
        });

        if let Some(account) = existing {
            account.issuer.clone_from(&draft.issuer);
            account.full_name.clone_from(&draft.full_name);
            account.email.clone_from(&draft.email);
            account.version += 1;
            account.updated_at = now;
            return Ok((account.clone(), false));
        }

        let account = draft.clone().into_account(now);
        self.staged
            .accounts
            .insert(account.id.clone(), account.clone());
        Ok((account, true))
    }

    async fn lookup_user_for_account(&mut self, account_id: &AccountId) -> Result<Option<User>> {
        let Some(account) = self.staged.accounts.get(account_id) else {
            return Ok(None);
        };

        Ok(account
            .iam_user_id
            .as_ref()
            .and_then(|user_id| self.staged.users.get(user_id))
            .cloned())
    }

    async fn create_user_for_account(
        &mut self,
        user: &User,
        account_id: &AccountId,
    ) -> Result<Account> {
        let account = self
            .staged
            .accounts
            .get_mut(account_id)
            .ok_or_else(|| AuthError::RecordNotFound(format!("account {account_id} not found")))?;

        account.iam_user_id = Some(user.id.clone());
        account.version += 1;
        account.updated_at = Utc::now();
        let account = account.clone();

        self.staged.users.insert(user.id.clone(), user.clone());
        Ok(account)
    }

    async fn insert_auth_token(&mut self, token: &AuthToken) -> Result<()> {
        let duplicate = self.staged.auth_tokens.contains_key(&token.id)
            || self.staged.auth_tokens.values().any(|t| {
                t.auth_method_id == token.auth_method_id && t.request_id == token.request_id
            });
        if duplicate {
            return Err(AuthError::Forbidden(messages::NOT_UNIQUE_REQUEST.to_string()));
        }

        self.staged
            .auth_tokens
            .insert(token.id.clone(), token.clone());
        Ok(())
    }

    async fn append_audit(&mut self, entry: &AuditEntry) -> Result<()> {
        self.staged.audit.push(entry.clone());
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        let Self { mut guard, staged } = self;
        *guard = staged;
        Ok(())
    }
}
