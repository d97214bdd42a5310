//! Account and identity resolution.
//!
//! Maps verified provider claims to a federated account, and a federated
//! account to a local identity. Both run inside the callback's unit of work.

use crate::error::{AuthError, Result};
use crate::providers::{IdTokenClaims, UnitOfWork, UserInfoClaims};
use crate::state::{Account, AccountDraft, AuthMethod, Scope, User};
use tracing::debug;

/// A federated account after upsert.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedAccount {
    /// Stored account.
    pub account: Account,
    /// Whether the account was created by this upsert.
    pub created: bool,
}

/// A local identity linked to an account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedIdentity {
    /// The identity.
    pub user: User,
    /// Whether the identity was created (and linked) by this call.
    pub created: bool,
    /// The account, with `iam_user_id` set.
    pub account: Account,
}

/// Build the account record for a set of verified claims.
///
/// Userinfo values take precedence over ID token values.
#[must_use]
pub fn account_draft(
    method: &AuthMethod,
    id_token: &IdTokenClaims,
    user_info: &UserInfoClaims,
) -> AccountDraft {
    AccountDraft {
        auth_method_id: method.id.clone(),
        scope_id: method.scope_id.clone(),
        issuer: id_token.iss.clone(),
        subject: id_token.sub.clone(),
        full_name: user_info.name.clone().or_else(|| id_token.name.clone()),
        email: user_info.email.clone().or_else(|| id_token.email.clone()),
    }
}

/// Create or refresh the account keyed by (auth method, subject).
///
/// # Errors
///
/// Returns error if the write fails.
pub async fn resolve_account<U: UnitOfWork>(
    uow: &mut U,
    method: &AuthMethod,
    id_token: &IdTokenClaims,
    user_info: &UserInfoClaims,
) -> Result<ResolvedAccount> {
    let draft = account_draft(method, id_token, user_info);
    let (account, created) = uow.upsert_account(&draft).await?;

    debug!(account_id = %account.id, created, "Resolved federated account");

    Ok(ResolvedAccount { account, created })
}

/// Find or create the local identity for an account.
///
/// Only the scope's primary auth method may create identities.
///
/// # Errors
///
/// Returns [`AuthError::InvalidParameter`] if `method` is not the scope's
/// primary auth method, or error if a write fails.
pub async fn resolve_identity<U: UnitOfWork>(
    uow: &mut U,
    account: &Account,
    method: &AuthMethod,
    scope: &Scope,
) -> Result<ResolvedIdentity> {
    if !scope.is_primary(&method.id) {
        return Err(AuthError::InvalidParameter(format!(
            "auth method {} is not the primary auth method for scope {}",
            method.id, scope.id
        )));
    }

    if let Some(user) = uow.lookup_user_for_account(&account.id).await? {
        return Ok(ResolvedIdentity {
            user,
            created: false,
            account: account.clone(),
        });
    }

    let user = User::new(scope.id.clone());
    let account = uow.create_user_for_account(&user, &account.id).await?;

    debug!(account_id = %account.id, user_id = %user.id, "Created identity for account");

    Ok(ResolvedIdentity {
        user,
        created: true,
        account,
    })
}

/// Find the identity already linked to an account.
///
/// Used for non-primary auth methods, which never create identities.
///
/// # Errors
///
/// Returns [`AuthError::RecordNotFound`] if the account has no identity.
pub async fn linked_identity<U: UnitOfWork>(
    uow: &mut U,
    account: &Account,
) -> Result<ResolvedIdentity> {
    let user = uow
        .lookup_user_for_account(&account.id)
        .await?
        .ok_or_else(|| {
            AuthError::RecordNotFound(format!("account {} is not linked to a user", account.id))
        })?;

    Ok(ResolvedIdentity {
        user,
        created: false,
        account: account.clone(),
    })
}
