//! Encrypted audit records.
//!
//! A successful callback appends exactly one [`AuditEntry`] describing the
//! records it wrote. Messages are serialized as JSON and sealed under the
//! scope's oplog key, with the entry id bound in as associated data.

use crate::constants::audit_types;
use crate::error::{AuthError, Result};
use crate::providers::Wrapper;
use crate::state::{Account, AccountId, AuditEntryId, AuthMethodId, ScopeId, User, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of write a message records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AuditOperation {
    /// Record inserted.
    Create,
    /// Record updated.
    Update,
}

/// One record's post-image.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditMessage {
    /// Logical type name (see [`audit_types`]).
    pub type_name: String,
    /// Operation performed.
    pub operation: AuditOperation,
    /// Post-image of the record.
    pub data: serde_json::Value,
}

impl AuditMessage {
    /// Build a message from a record's post-image.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::SerializationError`] if the record cannot be
    /// represented as JSON.
    pub fn new<T: Serialize>(
        type_name: impl Into<String>,
        operation: AuditOperation,
        post_image: &T,
    ) -> Result<Self> {
        Ok(Self {
            type_name: type_name.into(),
            operation,
            data: serde_json::to_value(post_image)
                .map_err(|e| AuthError::SerializationError(e.to_string()))?,
        })
    }
}

/// Generic account view: the account's link to a local identity.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GenericAccount {
    /// Account id.
    pub id: AccountId,
    /// Owning auth method.
    pub auth_method_id: AuthMethodId,
    /// Owning scope.
    pub scope_id: ScopeId,
    /// Linked identity.
    pub iam_user_id: Option<UserId>,
}

impl From<&Account> for GenericAccount {
    fn from(account: &Account) -> Self {
        Self {
            id: account.id.clone(),
            auth_method_id: account.auth_method_id.clone(),
            scope_id: account.scope_id.clone(),
            iam_user_id: account.iam_user_id.clone(),
        }
    }
}

/// Messages recording a callback's writes.
///
/// The federated and generic account views are always present; the
/// identity is recorded only when it was created by this callback.
///
/// # Errors
///
/// Returns error if a post-image cannot be serialized.
pub fn callback_messages(
    account: &Account,
    account_created: bool,
    created_user: Option<&User>,
) -> Result<Vec<AuditMessage>> {
    let account_op = if account_created {
        AuditOperation::Create
    } else {
        AuditOperation::Update
    };

    let mut messages = vec![
        AuditMessage::new(audit_types::FEDERATED_ACCOUNT, account_op, account)?,
        AuditMessage::new(
            audit_types::GENERIC_ACCOUNT,
            account_op,
            &GenericAccount::from(account),
        )?,
    ];

    if let Some(user) = created_user {
        messages.push(AuditMessage::new(
            audit_types::IDENTITY,
            AuditOperation::Create,
            user,
        )?);
    }

    Ok(messages)
}

/// Sealed audit entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditEntry {
    /// Entry id (also the associated data of the ciphertext).
    pub id: AuditEntryId,
    /// Scope whose oplog key sealed the entry.
    pub scope_id: ScopeId,
    /// Key id used.
    pub key_id: String,
    /// When the entry was written.
    pub created_at: DateTime<Utc>,
    /// Encrypted JSON array of [`AuditMessage`].
    pub data: Vec<u8>,
}

impl AuditEntry {
    /// Seal `messages` under `wrapper`.
    ///
    /// # Errors
    ///
    /// Returns error if serialization or encryption fails.
    pub fn seal(scope_id: &ScopeId, wrapper: &Wrapper, messages: &[AuditMessage]) -> Result<Self> {
        let id = AuditEntryId::new();
        let plaintext = serde_json::to_vec(messages)
            .map_err(|e| AuthError::SerializationError(e.to_string()))?;
        let data = wrapper.encrypt(&plaintext, id.as_str().as_bytes())?;

        Ok(Self {
            id,
            scope_id: scope_id.clone(),
            key_id: wrapper.key_id().to_string(),
            created_at: Utc::now(),
            data,
        })
    }

    /// Decrypt the entry's messages.
    ///
    /// # Errors
    ///
    /// Returns [`AuthError::Decrypt`] if `wrapper` does not hold the key the
    /// entry was sealed with.
    pub fn open(&self, wrapper: &Wrapper) -> Result<Vec<AuditMessage>> {
        let plaintext = wrapper.decrypt(&self.data, self.id.as_str().as_bytes())?;
        serde_json::from_slice(&plaintext).map_err(|e| AuthError::SerializationError(e.to_string()))
    }
}
