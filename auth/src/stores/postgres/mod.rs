//! PostgreSQL storage implementations.
//!
//! Schema lives in `auth/migrations/` and is applied with
//! [`PostgresFederationStore::migrate`].

pub mod federation;

// Re-exports
pub use federation::{PostgresFederationStore, PostgresUnitOfWork};
