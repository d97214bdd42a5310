//! Domain types for federated login.
//!
//! Auth methods, scopes, federated accounts, local identities, session tokens
//! and the in-flight authentication attempt. All types are `Clone`.

use crate::constants::prefixes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

// ═══════════════════════════════════════════════════════════════════════
// ID Types
// ═══════════════════════════════════════════════════════════════════════

macro_rules! public_id {
    ($(#[$meta:meta])* $name:ident, $prefix:expr) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        pub struct $name(pub String);

        impl $name {
            /// Generate a new random id carrying this type's prefix.
            #[must_use]
            pub fn new() -> Self {
                Self(format!("{}_{}", $prefix, uuid::Uuid::new_v4().simple()))
            }

            /// Borrow the id as a string slice.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

public_id!(
    /// Unique identifier for an OIDC auth method.
    AuthMethodId,
    prefixes::AUTH_METHOD
);
public_id!(
    /// Unique identifier for a scope (the owner of auth methods, users and keys).
    ScopeId,
    prefixes::SCOPE
);
public_id!(
    /// Unique identifier for a federated account.
    AccountId,
    prefixes::ACCOUNT
);
public_id!(
    /// Unique identifier for a local identity.
    UserId,
    prefixes::USER
);
public_id!(
    /// Unique identifier for an auth token, and for the token request an
    /// attempt is bound to.
    AuthTokenId,
    prefixes::AUTH_TOKEN
);
public_id!(
    /// Unique identifier for an audit entry.
    AuditEntryId,
    prefixes::AUDIT_ENTRY
);

// ═══════════════════════════════════════════════════════════════════════
// Auth Methods
// ═══════════════════════════════════════════════════════════════════════

/// Lifecycle state of an auth method.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthMethodState {
    /// Disabled; no attempt may start or complete.
    Inactive,
    /// Usable, but not listed to unauthenticated callers.
    ActivePrivate,
    /// Usable and publicly listed.
    ActivePublic,
}

impl AuthMethodState {
    /// Convert state to its storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Inactive => "inactive",
            Self::ActivePrivate => "active-private",
            Self::ActivePublic => "active-public",
        }
    }

    /// Parse state from its storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "inactive" => Some(Self::Inactive),
            "active-private" => Some(Self::ActivePrivate),
            "active-public" => Some(Self::ActivePublic),
            _ => None,
        }
    }

    /// Returns `true` for either active state.
    #[must_use]
    pub const fn is_active(&self) -> bool {
        !matches!(self, Self::Inactive)
    }
}

/// Stable digest of an auth method's security-relevant configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ConfigHash(pub [u8; 32]);

impl fmt::Display for ConfigHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

/// OIDC auth method configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthMethod {
    /// Public id.
    pub id: AuthMethodId,

    /// Owning scope.
    pub scope_id: ScopeId,

    /// Display name.
    pub name: Option<String>,

    /// Lifecycle state.
    pub state: AuthMethodState,

    /// Expected `iss` of ID tokens; also the discovery base.
    pub issuer: String,

    /// OAuth client id registered with the provider.
    pub client_id: String,

    /// OAuth client secret.
    #[serde(skip_serializing, default)]
    pub client_secret: String,

    /// Maximum age (seconds) of the provider-side authentication.
    pub max_age: Option<i32>,

    /// Accepted ID token signing algorithms.
    pub signing_algs: Vec<String>,

    /// Public API address the provider redirects back to, when the caller
    /// does not supply one.
    pub api_url: String,

    /// Additional accepted `aud` values.
    pub audiences: Vec<String>,

    /// PEM certificates trusted for the provider's TLS endpoints.
    pub certificates: Vec<String>,

    /// Extra scopes requested on authorization.
    pub claims_scopes: Vec<String>,

    /// Optimistic-locking version.
    pub version: i32,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

impl AuthMethod {
    /// Create an auth method with the required provider settings.
    #[must_use]
    pub fn new(
        scope_id: ScopeId,
        state: AuthMethodState,
        issuer: impl Into<String>,
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: AuthMethodId::new(),
            scope_id,
            name: None,
            state,
            issuer: issuer.into(),
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            max_age: None,
            signing_algs: vec!["RS256".to_string()],
            api_url: String::new(),
            audiences: Vec::new(),
            certificates: Vec::new(),
            claims_scopes: Vec::new(),
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }

    /// Set the API address.
    #[must_use]
    pub fn with_api_url(mut self, api_url: impl Into<String>) -> Self {
        self.api_url = api_url.into();
        self
    }

    /// Set additional audiences.
    #[must_use]
    pub fn with_audiences(mut self, audiences: Vec<String>) -> Self {
        self.audiences = audiences;
        self
    }

    /// Set the max age.
    #[must_use]
    pub const fn with_max_age(mut self, max_age: i32) -> Self {
        self.max_age = Some(max_age);
        self
    }

    /// Max age as sent to the provider and enforced on `auth_time`.
    ///
    /// A negative configured value means zero: force re-authentication.
    #[must_use]
    pub fn effective_max_age(&self) -> Option<i32> {
        self.max_age.map(|max_age| max_age.max(0))
    }

    /// Set the signing algorithms.
    #[must_use]
    pub fn with_signing_algs(mut self, algs: Vec<String>) -> Self {
        self.signing_algs = algs;
        self
    }

    /// Set trusted certificates.
    #[must_use]
    pub fn with_certificates(mut self, certificates: Vec<String>) -> Self {
        self.certificates = certificates;
        self
    }

    /// Set extra claims scopes.
    #[must_use]
    pub fn with_claims_scopes(mut self, scopes: Vec<String>) -> Self {
        self.claims_scopes = scopes;
        self
    }

    /// Compute the config hash.
    ///
    /// Covers issuer, client credentials, max age, API address, signing
    /// algorithms, audiences, certificates and claims scopes. Lists are
    /// sorted first, so reordering them is not a change. State, name,
    /// version and timestamps are not covered.
    #[must_use]
    pub fn config_hash(&self) -> ConfigHash {
        fn field(hasher: &mut Sha256, value: &[u8]) {
            hasher.update((value.len() as u64).to_be_bytes());
            hasher.update(value);
        }

        fn list(hasher: &mut Sha256, values: &[String]) {
            let mut sorted: Vec<&str> = values.iter().map(String::as_str).collect();
            sorted.sort_unstable();
            hasher.update((sorted.len() as u64).to_be_bytes());
            for value in sorted {
                field(hasher, value.as_bytes());
            }
        }

        let mut hasher = Sha256::new();
        field(&mut hasher, self.issuer.as_bytes());
        field(&mut hasher, self.client_id.as_bytes());
        field(&mut hasher, self.client_secret.as_bytes());
        match self.max_age {
            Some(max_age) => field(&mut hasher, &max_age.to_be_bytes()),
            None => field(&mut hasher, &[]),
        }
        field(&mut hasher, self.api_url.as_bytes());
        list(&mut hasher, &self.signing_algs);
        list(&mut hasher, &self.audiences);
        list(&mut hasher, &self.certificates);
        list(&mut hasher, &self.claims_scopes);

        ConfigHash(hasher.finalize().into())
    }
}

/// A scope: owner of auth methods, identities and encryption keys.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Scope {
    /// Public id.
    pub id: ScopeId,

    /// The auth method allowed to auto-provision local identities.
    pub primary_auth_method_id: Option<AuthMethodId>,
}

impl Scope {
    /// Create a scope with no primary auth method.
    #[must_use]
    pub fn new() -> Self {
        Self {
            id: ScopeId::new(),
            primary_auth_method_id: None,
        }
    }

    /// Returns `true` if `auth_method_id` is this scope's primary method.
    #[must_use]
    pub fn is_primary(&self, auth_method_id: &AuthMethodId) -> bool {
        self.primary_auth_method_id.as_ref() == Some(auth_method_id)
    }
}

impl Default for Scope {
    fn default() -> Self {
        Self::new()
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Accounts and Identities
// ═══════════════════════════════════════════════════════════════════════

/// A federated account: an external subject at a specific auth method.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Public id.
    pub id: AccountId,

    /// Auth method the subject authenticated against.
    pub auth_method_id: AuthMethodId,

    /// Owning scope (the auth method's scope).
    pub scope_id: ScopeId,

    /// Issuer that asserted the subject.
    pub issuer: String,

    /// External subject identifier (`sub`).
    pub subject: String,

    /// Full name, refreshed on every login.
    pub full_name: Option<String>,

    /// Email, refreshed on every login.
    pub email: Option<String>,

    /// Linked local identity.
    pub iam_user_id: Option<UserId>,

    /// Optimistic-locking version.
    pub version: i32,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Last update timestamp.
    pub updated_at: DateTime<Utc>,
}

/// Input for the account upsert keyed by (auth method, subject).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountDraft {
    /// Auth method.
    pub auth_method_id: AuthMethodId,

    /// Owning scope.
    pub scope_id: ScopeId,

    /// Issuer.
    pub issuer: String,

    /// Subject.
    pub subject: String,

    /// Full name from claims.
    pub full_name: Option<String>,

    /// Email from claims.
    pub email: Option<String>,
}

impl AccountDraft {
    /// Materialize a brand-new account from this draft.
    #[must_use]
    pub fn into_account(self, now: DateTime<Utc>) -> Account {
        Account {
            id: AccountId::new(),
            auth_method_id: self.auth_method_id,
            scope_id: self.scope_id,
            issuer: self.issuer,
            subject: self.subject,
            full_name: self.full_name,
            email: self.email,
            iam_user_id: None,
            version: 1,
            created_at: now,
            updated_at: now,
        }
    }
}

/// A local identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct User {
    /// Public id.
    pub id: UserId,

    /// Owning scope.
    pub scope_id: ScopeId,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,
}

impl User {
    /// Create a user in `scope_id`.
    #[must_use]
    pub fn new(scope_id: ScopeId) -> Self {
        Self {
            id: UserId::new(),
            scope_id,
            created_at: Utc::now(),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Session Tokens
// ═══════════════════════════════════════════════════════════════════════

/// Status of a session token.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AuthTokenStatus {
    /// Created by a successful callback; not yet handed to the caller.
    Pending,
    /// Redeemed by the caller.
    Issued,
    /// Abandoned.
    Failed,
}

impl AuthTokenStatus {
    /// Convert status to its storage representation.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Issued => "issued",
            Self::Failed => "failed",
        }
    }

    /// Parse status from its storage representation.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "issued" => Some(Self::Issued),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A session token.
///
/// `(auth_method_id, request_id)` is unique: it is the replay guard for the
/// attempt that produced the token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthToken {
    /// Public id.
    pub id: AuthTokenId,

    /// Token request id of the attempt that created this token.
    pub request_id: AuthTokenId,

    /// Auth method of the attempt.
    pub auth_method_id: AuthMethodId,

    /// Federated account that authenticated.
    pub account_id: AccountId,

    /// Local identity the token grants.
    pub user_id: UserId,

    /// Status.
    pub status: AuthTokenStatus,

    /// SHA-256 digest (hex) of the bearer secret, set on issuance.
    pub token_digest: Option<String>,

    /// Creation timestamp.
    pub created_at: DateTime<Utc>,

    /// Expiration timestamp.
    pub expires_at: DateTime<Utc>,
}

impl AuthToken {
    /// Returns `true` once `expires_at` has passed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

// ═══════════════════════════════════════════════════════════════════════
// Attempt State
// ═══════════════════════════════════════════════════════════════════════

/// An in-flight authentication attempt.
///
/// Never persisted; it travels encrypted inside the `state` parameter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthAttempt {
    /// Request id; becomes the replay-guarded `request_id` of the token.
    pub token_request_id: AuthTokenId,

    /// When the attempt started.
    pub created_at: DateTime<Utc>,

    /// When the attempt stops being accepted.
    pub expires_at: DateTime<Utc>,

    /// Config hash of the target method at attempt start.
    pub config_hash: ConfigHash,

    /// Where the caller is sent once the callback succeeds.
    pub final_redirect_url: String,

    /// Redirect URI sent to the provider (repeated during code exchange).
    pub callback_url: String,

    /// Nonce bound into the ID token.
    pub nonce: String,

    /// PKCE verifier for the code exchange.
    pub pkce_verifier: String,
}

impl AuthAttempt {
    /// Returns `true` once the attempt's lifetime has elapsed.
    #[must_use]
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}
