//! Error types for federated authentication operations.

use thiserror::Error;

/// Result type alias for federated authentication operations.
pub type Result<T> = std::result::Result<T, AuthError>;

/// Classification of an [`AuthError`].
///
/// Callers (an HTTP front end, a CLI) map these to transport-level responses;
/// the crate only guarantees the kind and a human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Missing or empty required input.
    InvalidParameter,
    /// A referenced record does not exist.
    RecordNotFound,
    /// Input could not be parsed (e.g. a malformed state token).
    Unknown,
    /// Authenticated decryption failed.
    Decrypt,
    /// Encryption failed.
    Encrypt,
    /// The auth method is disabled or was reconfigured mid-attempt.
    AuthMethodInactive,
    /// The authentication attempt outlived its lifetime.
    AuthAttemptExpired,
    /// The identity provider rejected the exchange or returned unverifiable claims.
    Upstream,
    /// The request was refused (replayed attempt, double redemption).
    Forbidden,
    /// The persistence layer failed.
    Database,
    /// Serialization of an internal structure failed.
    Serialization,
    /// Anything else.
    Internal,
}

/// Error taxonomy for the federated login flow.
///
/// Every variant carries a message describing the specific cause; use
/// [`AuthError::kind`] to classify.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AuthError {
    // ═══════════════════════════════════════════════════════════
    // Input Errors
    // ═══════════════════════════════════════════════════════════

    /// A required parameter was missing or empty.
    #[error("invalid parameter: {0}")]
    InvalidParameter(String),

    /// A referenced record was not found.
    #[error("{0}")]
    RecordNotFound(String),

    /// The state token is not well-formed.
    #[error("unable to decode message: {0}")]
    Decode(String),

    // ═══════════════════════════════════════════════════════════
    // Security Errors
    // ═══════════════════════════════════════════════════════════

    /// Authenticated decryption failed.
    #[error("unable to decrypt message: {0}")]
    Decrypt(String),

    /// Encryption failed.
    #[error("unable to encrypt message: {0}")]
    Encrypt(String),

    /// The request was refused.
    #[error("forbidden: {0}")]
    Forbidden(String),

    // ═══════════════════════════════════════════════════════════
    // Attempt Lifecycle Errors
    // ═══════════════════════════════════════════════════════════

    /// The auth method is inactive or its configuration changed.
    #[error("auth method inactive: {0}")]
    AuthMethodInactive(String),

    /// The attempt expired before the callback arrived.
    #[error("authentication attempt expired: {0}")]
    AttemptExpired(String),

    /// The identity provider failed or returned claims that did not verify.
    #[error("identity provider error: {0}")]
    Upstream(String),

    // ═══════════════════════════════════════════════════════════
    // System Errors
    // ═══════════════════════════════════════════════════════════

    /// Database operation failed.
    #[error("Database error: {0}")]
    DatabaseError(String),

    /// Serialization failed.
    #[error("Serialization error: {0}")]
    SerializationError(String),

    /// Internal error (should not be exposed to users).
    #[error("Internal error: {0}")]
    InternalError(String),
}

impl AuthError {
    /// Returns the classification of this error.
    ///
    /// # Examples
    ///
    /// ```
    /// # use federated_auth::{AuthError, ErrorKind};
    /// let err = AuthError::Forbidden("not a unique request".into());
    /// assert_eq!(err.kind(), ErrorKind::Forbidden);
    /// ```
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::InvalidParameter(_) => ErrorKind::InvalidParameter,
            Self::RecordNotFound(_) => ErrorKind::RecordNotFound,
            Self::Decode(_) => ErrorKind::Unknown,
            Self::Decrypt(_) => ErrorKind::Decrypt,
            Self::Encrypt(_) => ErrorKind::Encrypt,
            Self::Forbidden(_) => ErrorKind::Forbidden,
            Self::AuthMethodInactive(_) => ErrorKind::AuthMethodInactive,
            Self::AttemptExpired(_) => ErrorKind::AuthAttemptExpired,
            Self::Upstream(_) => ErrorKind::Upstream,
            Self::DatabaseError(_) => ErrorKind::Database,
            Self::SerializationError(_) => ErrorKind::Serialization,
            Self::InternalError(_) => ErrorKind::Internal,
        }
    }

    /// Returns `true` if this error is due to invalid user input.
    ///
    /// # Examples
    ///
    /// ```
    /// # use federated_auth::AuthError;
    /// assert!(AuthError::Decode("bad".into()).is_user_error());
    /// assert!(!AuthError::InternalError("boom".into()).is_user_error());
    /// ```
    #[must_use]
    pub const fn is_user_error(&self) -> bool {
        matches!(
            self,
            Self::InvalidParameter(_)
                | Self::RecordNotFound(_)
                | Self::Decode(_)
                | Self::AttemptExpired(_)
        )
    }

    /// Returns `true` if this error indicates a security issue.
    ///
    /// A malformed state token is not one; a well-formed token that fails
    /// authentication, or a replayed attempt, is.
    ///
    /// # Examples
    ///
    /// ```
    /// # use federated_auth::AuthError;
    /// assert!(AuthError::Decrypt("bad tag".into()).is_security_issue());
    /// assert!(!AuthError::Decode("bad base64".into()).is_security_issue());
    /// ```
    #[must_use]
    pub const fn is_security_issue(&self) -> bool {
        matches!(self, Self::Decrypt(_) | Self::Forbidden(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping() {
        assert_eq!(AuthError::Decode(String::new()).kind(), ErrorKind::Unknown);
        assert_eq!(
            AuthError::AttemptExpired(String::new()).kind(),
            ErrorKind::AuthAttemptExpired
        );
        assert_eq!(
            AuthError::DatabaseError(String::new()).kind(),
            ErrorKind::Database
        );
    }

    #[test]
    fn test_messages_carry_fixed_fragments() {
        let err = AuthError::Decode("invalid base64".into());
        assert!(err.to_string().contains("unable to decode message"));

        let err = AuthError::Decrypt("aead::Error".into());
        assert!(err.to_string().contains("unable to decrypt message"));

        let err = AuthError::Forbidden("not a unique request".into());
        assert!(err.to_string().contains("not a unique request"));
    }
}
