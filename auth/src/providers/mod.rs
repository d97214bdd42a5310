//! Collaborator traits.
//!
//! The flow depends on three kinds of external collaborators, each behind a
//! trait so tests can use in-memory mocks and production can use real
//! services:
//!
//! - [`IdentityProvider`]: the OIDC provider (discovery, code exchange, userinfo)
//! - [`KeyManager`]: per-scope data encryption keys
//! - Repositories: auth methods and the transaction boundary
//!   ([`OidcRepository`]), scopes ([`IamRepository`]) and session tokens
//!   ([`AuthTokenRepository`])

pub mod identity;
pub mod kms;
pub mod repository;

pub use identity::{
    ExchangeRequest, IdTokenClaims, IdentityProvider, ProviderMetadata, ProviderTokens,
    UserInfoClaims,
};
pub use kms::{KeyManager, KeyPurpose, Wrapper};
pub use repository::{
    factory, AuthTokenRepository, IamRepository, IssueOutcome, OidcRepository, RepoFactory,
    UnitOfWork,
};
