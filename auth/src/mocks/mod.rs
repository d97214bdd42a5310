//! Mock collaborator implementations for testing.
//!
//! This module provides simple, in-memory implementations of all provider
//! traits for use in unit and integration tests.

pub mod identity_provider;
pub mod kms;
pub mod store;

pub use identity_provider::MockIdentityProvider;
pub use kms::MockKeyManager;
pub use store::{MockFederationStore, MockUnitOfWork};
