//! # Federated Authentication
//!
//! OIDC federated login: the state machine that carries a browser from "log
//! in with my identity provider" to a pending session token bound to a local
//! identity.
//!
//! ## Features
//!
//! - **Stateless attempts**: in-flight state travels encrypted in the OAuth
//!   `state` parameter; nothing is stored until the callback succeeds
//! - **Fail closed**: every callback gate is read-only, and all writes commit
//!   in one unit of work
//! - **Replay-proof**: a database uniqueness guard on (auth method, request
//!   id) rejects a second callback for the same attempt
//! - **Audited**: each successful callback appends one encrypted audit entry
//! - **Testable**: in-memory provider, key manager and store in [`mocks`]
//!
//! ## Flow
//!
//! ```text
//! StartAuth ──▶ authorization URL (state, nonce, PKCE) ──▶ provider
//!                                                            │
//! Token ◀── pending session token ◀── Callback(state, code) ◀┘
//! ```
//!
//! ## Example
//!
//! ```rust,ignore
//! use federated_auth::*;
//! use federated_auth::providers::factory;
//!
//! // 1. Start the attempt and redirect the browser
//! let request = StartAuth::new(method_id)
//!     .oidc_repo(factory(store.clone()))
//!     .api_addr("https://api.example.com")
//!     .run(&env)
//!     .await?;
//!
//! // 2. Handle the provider's redirect back
//! let final_redirect = Callback::new(method_id, state, code)
//!     .oidc_repo(factory(store.clone()))
//!     .iam_repo(factory(store.clone()))
//!     .token_repo(factory(store.clone()))
//!     .run(&env)
//!     .await?;
//!
//! // 3. Redeem the session token
//! let issued = Token::new(method_id, request.token_id)
//!     .oidc_repo(factory(store.clone()))
//!     .token_repo(factory(store))
//!     .run(&env)
//!     .await?;
//! ```

#![deny(missing_docs)]
#![deny(clippy::unwrap_used)]
#![deny(clippy::expect_used)]
#![deny(clippy::panic)]
#![deny(clippy::todo)]
#![deny(clippy::unimplemented)]

// Public modules
pub mod audit;
pub mod callback;
pub mod config;
pub mod constants;
pub mod environment;
pub mod error;
pub mod federation;
pub mod providers;
pub mod start_auth;
pub mod state;
pub mod state_codec;
pub mod stores;
pub mod token;

#[cfg(any(test, feature = "test-utils"))]
pub mod mocks;

// Re-export main types for convenience
pub use callback::Callback;
pub use config::FederationConfig;
pub use environment::FederationEnvironment;
pub use error::{AuthError, ErrorKind, Result};
pub use start_auth::{AuthorizationRequest, StartAuth};
pub use state::{
    Account, AuthAttempt, AuthMethod, AuthMethodId, AuthMethodState, AuthToken, AuthTokenId,
    AuthTokenStatus, Scope, ScopeId, User, UserId,
};
pub use token::{IssuedToken, Token};
