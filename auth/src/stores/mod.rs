//! Persistent storage implementations.
//!
//! - **Federation Store** (PostgreSQL) - auth methods, accounts, identities,
//!   session tokens and audit entries, with one transaction per callback

#[cfg(feature = "postgres")]
pub mod postgres;

// Re-exports
#[cfg(feature = "postgres")]
pub use postgres::{PostgresFederationStore, PostgresUnitOfWork};
