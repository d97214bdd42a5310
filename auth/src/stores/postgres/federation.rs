//! PostgreSQL federation store.
//!
//! Auth methods, scopes, federated accounts, local identities, session
//! tokens and audit entries in one database. A callback's writes run in a
//! single `sqlx` transaction; the replay guard is the unique index on
//! `auth_token (auth_method_id, request_id)`.
//!
//! # Example
//!
//! ```no_run
//! use federated_auth::stores::postgres::PostgresFederationStore;
//! use sqlx::PgPool;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let pool = PgPool::connect("postgresql://localhost/auth").await?;
//! let store = PostgresFederationStore::new(pool);
//! store.migrate().await?;
//! # Ok(())
//! # }
//! ```

use crate::audit::AuditEntry;
use crate::constants::messages;
use crate::error::{AuthError, Result};
use crate::providers::{
    AuthTokenRepository, IamRepository, IssueOutcome, OidcRepository, UnitOfWork,
};
use crate::state::{
    Account, AccountDraft, AccountId, AuditEntryId, AuthMethod, AuthMethodId, AuthMethodState,
    AuthToken, AuthTokenId, AuthTokenStatus, Scope, ScopeId, User, UserId,
};
use chrono::{DateTime, Duration, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::debug;

const AUTH_METHOD_COLUMNS: &str = "auth_method_id, scope_id, name, state, issuer, client_id, \
     client_secret, max_age, signing_algs, api_url, audiences, certificates, claims_scopes, \
     version, created_at, updated_at";

const ACCOUNT_COLUMNS: &str = "account_id, auth_method_id, scope_id, issuer, subject, \
     full_name, email, iam_user_id, version, created_at, updated_at";

const AUTH_TOKEN_COLUMNS: &str = "auth_token_id, request_id, auth_method_id, account_id, \
     iam_user_id, status, token_digest, created_at, expiration_time";

fn db_error(context: &str) -> impl FnOnce(sqlx::Error) -> AuthError + '_ {
    move |e| AuthError::DatabaseError(format!("{context}: {e}"))
}

fn auth_method_from_row(row: &PgRow) -> Result<AuthMethod> {
    let state: String = row.try_get("state").map_err(db_error("auth method state"))?;
    let state = AuthMethodState::parse(&state)
        .ok_or_else(|| AuthError::DatabaseError(format!("unknown auth method state {state}")))?;

    let read = |e: sqlx::Error| AuthError::DatabaseError(format!("Failed to read auth method: {e}"));
    Ok(AuthMethod {
        id: AuthMethodId(row.try_get("auth_method_id").map_err(read)?),
        scope_id: ScopeId(row.try_get("scope_id").map_err(read)?),
        name: row.try_get("name").map_err(read)?,
        state,
        issuer: row.try_get("issuer").map_err(read)?,
        client_id: row.try_get("client_id").map_err(read)?,
        client_secret: row.try_get("client_secret").map_err(read)?,
        max_age: row.try_get("max_age").map_err(read)?,
        signing_algs: row.try_get("signing_algs").map_err(read)?,
        api_url: row.try_get("api_url").map_err(read)?,
        audiences: row.try_get("audiences").map_err(read)?,
        certificates: row.try_get("certificates").map_err(read)?,
        claims_scopes: row.try_get("claims_scopes").map_err(read)?,
        version: row.try_get("version").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
        updated_at: row.try_get("updated_at").map_err(read)?,
    })
}

fn account_from_row(row: &PgRow) -> Result<Account> {
    let read = |e: sqlx::Error| AuthError::DatabaseError(format!("Failed to read account: {e}"));
    Ok(Account {
        id: AccountId(row.try_get("account_id").map_err(read)?),
        auth_method_id: AuthMethodId(row.try_get("auth_method_id").map_err(read)?),
        scope_id: ScopeId(row.try_get("scope_id").map_err(read)?),
        issuer: row.try_get("issuer").map_err(read)?,
        subject: row.try_get("subject").map_err(read)?,
        full_name: row.try_get("full_name").map_err(read)?,
        email: row.try_get("email").map_err(read)?,
        iam_user_id: row
            .try_get::<Option<String>, _>("iam_user_id")
            .map_err(read)?
            .map(UserId),
        version: row.try_get("version").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
        updated_at: row.try_get("updated_at").map_err(read)?,
    })
}

fn auth_token_from_row(row: &PgRow) -> Result<AuthToken> {
    let status: String = row.try_get("status").map_err(db_error("auth token status"))?;
    let status = AuthTokenStatus::parse(&status)
        .ok_or_else(|| AuthError::DatabaseError(format!("unknown auth token status {status}")))?;

    let read = |e: sqlx::Error| AuthError::DatabaseError(format!("Failed to read auth token: {e}"));
    Ok(AuthToken {
        id: AuthTokenId(row.try_get("auth_token_id").map_err(read)?),
        request_id: AuthTokenId(row.try_get("request_id").map_err(read)?),
        auth_method_id: AuthMethodId(row.try_get("auth_method_id").map_err(read)?),
        account_id: AccountId(row.try_get("account_id").map_err(read)?),
        user_id: UserId(row.try_get("iam_user_id").map_err(read)?),
        status,
        token_digest: row.try_get("token_digest").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
        expires_at: row.try_get("expiration_time").map_err(read)?,
    })
}

/// `PostgreSQL` federation store.
#[derive(Clone)]
pub struct PostgresFederationStore {
    /// `PostgreSQL` connection pool.
    pool: PgPool,
    /// Lifetime stamped on new pending tokens.
    token_ttl: Duration,
}

impl PostgresFederationStore {
    /// Create a new `PostgreSQL` federation store with a 24 hour token
    /// lifetime.
    ///
    /// # Arguments
    ///
    /// * `pool` - `PostgreSQL` connection pool
    #[must_use]
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            token_ttl: Duration::hours(24),
        }
    }

    /// Set the lifetime stamped on new pending tokens.
    #[must_use]
    pub const fn with_token_ttl(mut self, ttl: Duration) -> Self {
        self.token_ttl = ttl;
        self
    }

    /// Run database migrations.
    ///
    /// # Errors
    ///
    /// Returns error if migrations fail.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AuthError::DatabaseError(format!("Migration failed: {e}")))?;
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════
    // Seeding
    // ═══════════════════════════════════════════════════════════

    /// Insert a scope.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create_scope(&self, scope: &Scope) -> Result<()> {
        sqlx::query("INSERT INTO iam_scope (scope_id, primary_auth_method_id) VALUES ($1, $2)")
            .bind(scope.id.as_str())
            .bind(scope.primary_auth_method_id.as_ref().map(AuthMethodId::as_str))
            .execute(&self.pool)
            .await
            .map_err(db_error("Failed to create scope"))?;
        Ok(())
    }

    /// Insert an auth method.
    ///
    /// # Errors
    ///
    /// Returns error if the insert fails.
    pub async fn create_auth_method(&self, method: &AuthMethod) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO auth_oidc_method ({AUTH_METHOD_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
        ))
        .bind(method.id.as_str())
        .bind(method.scope_id.as_str())
        .bind(&method.name)
        .bind(method.state.as_str())
        .bind(&method.issuer)
        .bind(&method.client_id)
        .bind(&method.client_secret)
        .bind(method.max_age)
        .bind(&method.signing_algs)
        .bind(&method.api_url)
        .bind(&method.audiences)
        .bind(&method.certificates)
        .bind(&method.claims_scopes)
        .bind(method.version)
        .bind(method.created_at)
        .bind(method.updated_at)
        .execute(&self.pool)
        .await
        .map_err(db_error("Failed to create auth method"))?;
        Ok(())
    }

    /// Replace an auth method's configuration, bumping its version.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::RecordNotFound`] if the method does not exist.
    pub async fn update_auth_method(&self, method: &AuthMethod) -> Result<AuthMethod> {
        let row = sqlx::query(&format!(
            "UPDATE auth_oidc_method SET \
                 name = $2, state = $3, issuer = $4, client_id = $5, client_secret = $6, \
                 max_age = $7, signing_algs = $8, api_url = $9, audiences = $10, \
                 certificates = $11, claims_scopes = $12, version = version + 1, \
                 updated_at = NOW() \
             WHERE auth_method_id = $1 \
             RETURNING {AUTH_METHOD_COLUMNS}"
        ))
        .bind(method.id.as_str())
        .bind(&method.name)
        .bind(method.state.as_str())
        .bind(&method.issuer)
        .bind(&method.client_id)
        .bind(&method.client_secret)
        .bind(method.max_age)
        .bind(&method.signing_algs)
        .bind(&method.api_url)
        .bind(&method.audiences)
        .bind(&method.certificates)
        .bind(&method.claims_scopes)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to update auth method"))?
        .ok_or_else(|| AuthError::RecordNotFound(format!("auth method {} not found", method.id)))?;

        auth_method_from_row(&row)
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
        let result =
            sqlx::query("UPDATE iam_scope SET primary_auth_method_id = $2 WHERE scope_id = $1")
                .bind(scope_id.as_str())
                .bind(auth_method_id.as_str())
                .execute(&self.pool)
                .await
                .map_err(db_error("Failed to set primary auth method"))?;

        if result.rows_affected() == 0 {
            return Err(AuthError::RecordNotFound(format!("scope {scope_id} not found")));
        }
        Ok(())
    }

    // ═══════════════════════════════════════════════════════════
    // Inspection
    // ═══════════════════════════════════════════════════════════

    /// Accounts belonging to an auth method.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn accounts_for_auth_method(&self, auth_method_id: &AuthMethodId) -> Result<Vec<Account>> {
        let rows = sqlx::query(&format!(
            "SELECT {ACCOUNT_COLUMNS} FROM auth_oidc_account WHERE auth_method_id = $1"
        ))
        .bind(auth_method_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list accounts"))?;

        rows.iter().map(account_from_row).collect()
    }

    /// Audit entries written for a scope, oldest first.
    ///
    /// # Errors
    ///
    /// Returns error if the query fails.
    pub async fn audit_entries(&self, scope_id: &ScopeId) -> Result<Vec<AuditEntry>> {
        let rows = sqlx::query(
            "SELECT entry_id, scope_id, key_id, created_at, data \
             FROM oplog_entry WHERE scope_id = $1 ORDER BY created_at",
        )
        .bind(scope_id.as_str())
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list audit entries"))?;

        rows.iter()
            .map(|row| -> Result<AuditEntry> {
                let read = |e: sqlx::Error| AuthError::DatabaseError(format!("Failed to read audit entry: {e}"));
                Ok(AuditEntry {
                    id: AuditEntryId(row.try_get("entry_id").map_err(read)?),
                    scope_id: ScopeId(row.try_get("scope_id").map_err(read)?),
                    key_id: row.try_get("key_id").map_err(read)?,
                    created_at: row.try_get("created_at").map_err(read)?,
                    data: row.try_get("data").map_err(read)?,
                })
            })
            .collect()
    }
}

impl OidcRepository for PostgresFederationStore {
    type UnitOfWork = PostgresUnitOfWork;

    async fn lookup_auth_method(&self, id: &AuthMethodId) -> Result<Option<AuthMethod>> {
        let row = sqlx::query(&format!(
            "SELECT {AUTH_METHOD_COLUMNS} FROM auth_oidc_method WHERE auth_method_id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get auth method"))?;

        row.as_ref().map(auth_method_from_row).transpose()
    }

    async fn begin(&self) -> Result<PostgresUnitOfWork> {
        let tx = self
            .pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))?;
        Ok(PostgresUnitOfWork { tx })
    }
}

impl IamRepository for PostgresFederationStore {
    async fn lookup_scope(&self, id: &ScopeId) -> Result<Option<Scope>> {
        let row = sqlx::query("SELECT scope_id, primary_auth_method_id FROM iam_scope WHERE scope_id = $1")
            .bind(id.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to get scope"))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let read = |e: sqlx::Error| AuthError::DatabaseError(format!("Failed to read scope: {e}"));
        Ok(Some(Scope {
            id: ScopeId(row.try_get("scope_id").map_err(read)?),
            primary_auth_method_id: row
                .try_get::<Option<String>, _>("primary_auth_method_id")
                .map_err(read)?
                .map(AuthMethodId),
        }))
    }
}

impl AuthTokenRepository for PostgresFederationStore {
    fn token_time_to_live(&self) -> Duration {
        self.token_ttl
    }

    async fn lookup_auth_token(&self, id: &AuthTokenId) -> Result<Option<AuthToken>> {
        let row = sqlx::query(&format!(
            "SELECT {AUTH_TOKEN_COLUMNS} FROM auth_token WHERE auth_token_id = $1"
        ))
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get auth token"))?;

        row.as_ref().map(auth_token_from_row).transpose()
    }

    async fn lookup_token_request(
        &self,
        auth_method_id: &AuthMethodId,
        request_id: &AuthTokenId,
    ) -> Result<Option<AuthToken>> {
        let row = sqlx::query(&format!(
            "SELECT {AUTH_TOKEN_COLUMNS} FROM auth_token \
             WHERE auth_method_id = $1 AND request_id = $2"
        ))
        .bind(auth_method_id.as_str())
        .bind(request_id.as_str())
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to get auth token"))?;

        row.as_ref().map(auth_token_from_row).transpose()
    }

    async fn issue_auth_token(
        &self,
        auth_method_id: &AuthMethodId,
        request_id: &AuthTokenId,
        token_digest: &str,
        now: DateTime<Utc>,
    ) -> Result<IssueOutcome> {
        // Conditional update: only one concurrent caller matches a pending row.
        let row = sqlx::query(&format!(
            "UPDATE auth_token SET status = 'issued', token_digest = $3 \
             WHERE auth_method_id = $1 AND request_id = $2 \
               AND status = 'pending' AND expiration_time > $4 \
             RETURNING {AUTH_TOKEN_COLUMNS}"
        ))
        .bind(auth_method_id.as_str())
        .bind(request_id.as_str())
        .bind(token_digest)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to issue auth token"))?;

        if let Some(row) = row {
            return Ok(IssueOutcome::Issued(auth_token_from_row(&row)?));
        }

        Ok(self
            .lookup_token_request(auth_method_id, request_id)
            .await?
            .map_or(IssueOutcome::NotFound, IssueOutcome::NotPending))
    }
}

/// Unit of work over one `PostgreSQL` transaction.
///
/// Dropping it without committing rolls the transaction back.
pub struct PostgresUnitOfWork {
    tx: Transaction<'static, Postgres>,
}

impl UnitOfWork for PostgresUnitOfWork {
    async fn upsert_account(&mut self, draft: &AccountDraft) -> Result<(Account, bool)> {
        let now = Utc::now();
        let row = sqlx::query(&format!(
            "INSERT INTO auth_oidc_account \
                 (account_id, auth_method_id, scope_id, issuer, subject, full_name, email, \
                  version, created_at, updated_at) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, 1, $8, $8) \
             ON CONFLICT (auth_method_id, subject) DO UPDATE SET \
                 issuer = EXCLUDED.issuer, \
                 full_name = EXCLUDED.full_name, \
                 email = EXCLUDED.email, \
                 version = auth_oidc_account.version + 1, \
                 updated_at = EXCLUDED.updated_at \
             RETURNING {ACCOUNT_COLUMNS}, (xmax = 0) AS inserted"
        ))
        .bind(AccountId::new().as_str())
        .bind(draft.auth_method_id.as_str())
        .bind(draft.scope_id.as_str())
        .bind(&draft.issuer)
        .bind(&draft.subject)
        .bind(&draft.full_name)
        .bind(&draft.email)
        .bind(now)
        .fetch_one(&mut *self.tx)
        .await
        .map_err(db_error("Failed to upsert account"))?;

        let inserted: bool = row.try_get("inserted").map_err(db_error("Failed to read account"))?;
        let account = account_from_row(&row)?;

        debug!(account_id = %account.id, inserted, "Upserted account");
        Ok((account, inserted))
    }

    async fn lookup_user_for_account(&mut self, account_id: &AccountId) -> Result<Option<User>> {
        let row = sqlx::query(
            "SELECT u.user_id, u.scope_id, u.created_at \
             FROM auth_oidc_account a JOIN iam_user u ON u.user_id = a.iam_user_id \
             WHERE a.account_id = $1",
        )
        .bind(account_id.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error("Failed to get user for account"))?;

        let Some(row) = row else {
            return Ok(None);
        };

        let read = |e: sqlx::Error| AuthError::DatabaseError(format!("Failed to read user: {e}"));
        Ok(Some(User {
            id: UserId(row.try_get("user_id").map_err(read)?),
            scope_id: ScopeId(row.try_get("scope_id").map_err(read)?),
            created_at: row.try_get("created_at").map_err(read)?,
        }))
    }

    async fn create_user_for_account(
        &mut self,
        user: &User,
        account_id: &AccountId,
    ) -> Result<Account> {
        sqlx::query("INSERT INTO iam_user (user_id, scope_id, created_at) VALUES ($1, $2, $3)")
            .bind(user.id.as_str())
            .bind(user.scope_id.as_str())
            .bind(user.created_at)
            .execute(&mut *self.tx)
            .await
            .map_err(db_error("Failed to create user"))?;

        let row = sqlx::query(&format!(
            "UPDATE auth_oidc_account SET iam_user_id = $2, version = version + 1, \
                 updated_at = NOW() \
             WHERE account_id = $1 \
             RETURNING {ACCOUNT_COLUMNS}"
        ))
        .bind(account_id.as_str())
        .bind(user.id.as_str())
        .fetch_optional(&mut *self.tx)
        .await
        .map_err(db_error("Failed to link user to account"))?
        .ok_or_else(|| AuthError::RecordNotFound(format!("account {account_id} not found")))?;

        account_from_row(&row)
    }

    async fn insert_auth_token(&mut self, token: &AuthToken) -> Result<()> {
        sqlx::query(&format!(
            "INSERT INTO auth_token ({AUTH_TOKEN_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)"
        ))
        .bind(token.id.as_str())
        .bind(token.request_id.as_str())
        .bind(token.auth_method_id.as_str())
        .bind(token.account_id.as_str())
        .bind(token.user_id.as_str())
        .bind(token.status.as_str())
        .bind(&token.token_digest)
        .bind(token.created_at)
        .bind(token.expires_at)
        .execute(&mut *self.tx)
        .await
        .map_err(|e| {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.is_unique_violation() {
                    return AuthError::Forbidden(messages::NOT_UNIQUE_REQUEST.to_string());
                }
            }
            AuthError::DatabaseError(format!("Failed to insert auth token: {e}"))
        })?;
        Ok(())
    }

    async fn append_audit(&mut self, entry: &AuditEntry) -> Result<()> {
        sqlx::query(
            "INSERT INTO oplog_entry (entry_id, scope_id, key_id, created_at, data) \
             VALUES ($1, $2, $3, $4, $5)",
        )
        .bind(entry.id.as_str())
        .bind(entry.scope_id.as_str())
        .bind(&entry.key_id)
        .bind(entry.created_at)
        .bind(&entry.data)
        .execute(&mut *self.tx)
        .await
        .map_err(db_error("Failed to append audit entry"))?;
        Ok(())
    }

    async fn commit(self) -> Result<()> {
        self.tx.commit().await.map_err(|e| {
            if let sqlx::Error::Database(db_err) = &e {
                if db_err.is_unique_violation() {
                    return AuthError::Forbidden(messages::NOT_UNIQUE_REQUEST.to_string());
                }
            }
            AuthError::DatabaseError(format!("Failed to commit transaction: {e}"))
        })
    }
}
