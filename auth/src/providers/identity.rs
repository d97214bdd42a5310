//! OIDC identity provider trait.

use crate::error::Result;
use crate::state::AuthMethod;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashMap;

/// OIDC identity provider.
///
/// Abstracts discovery, the authorization code exchange and the userinfo
/// call. Implementations are expected to validate the ID token signature
/// against the method's signing algorithms and certificates before
/// returning [`IdTokenClaims`]; the flow checks the claims themselves.
///
/// Errors are reported as [`AuthError::Upstream`](crate::AuthError::Upstream).
pub trait IdentityProvider: Send + Sync {
    /// Discover the provider's endpoints for `method`.
    ///
    /// # Errors
    ///
    /// Returns error if discovery fails.
    fn discover(
        &self,
        method: &AuthMethod,
    ) -> impl std::future::Future<Output = Result<ProviderMetadata>> + Send;

    /// Exchange an authorization code for tokens.
    ///
    /// # Errors
    ///
    /// Returns error if:
    /// - Network request fails
    /// - Provider rejects the code, redirect URI or PKCE verifier
    /// - ID token signature does not verify
    fn exchange_code(
        &self,
        method: &AuthMethod,
        request: &ExchangeRequest,
    ) -> impl std::future::Future<Output = Result<ProviderTokens>> + Send;

    /// Fetch the userinfo claims for an access token.
    ///
    /// # Errors
    ///
    /// Returns error if the request fails or the token is rejected.
    fn user_info(
        &self,
        method: &AuthMethod,
        access_token: &str,
    ) -> impl std::future::Future<Output = Result<UserInfoClaims>> + Send;
}

/// Provider endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderMetadata {
    /// Issuer the metadata was discovered for.
    pub issuer: String,
    /// Authorization endpoint the caller is redirected to.
    pub authorization_endpoint: String,
}

/// Authorization code exchange request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExchangeRequest {
    /// Authorization code returned by the provider.
    pub code: String,
    /// Redirect URI used in the authorization request.
    pub redirect_url: String,
    /// PKCE verifier generated at `StartAuth`.
    pub pkce_verifier: String,
}

/// Tokens returned by a successful exchange.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProviderTokens {
    /// Access token for the userinfo call.
    pub access_token: String,
    /// Verified ID token claims.
    pub id_token: IdTokenClaims,
}

/// ID token claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IdTokenClaims {
    /// Issuer.
    pub iss: String,
    /// Subject.
    pub sub: String,
    /// Audiences. Providers may send a single string.
    #[serde(deserialize_with = "one_or_many")]
    pub aud: Vec<String>,
    /// Expiration (unix seconds).
    pub exp: i64,
    /// Issued at (unix seconds).
    pub iat: i64,
    /// Time of the end-user authentication (unix seconds).
    #[serde(default)]
    pub auth_time: Option<i64>,
    /// Nonce echoed from the authorization request.
    #[serde(default)]
    pub nonce: Option<String>,
    /// Email.
    #[serde(default)]
    pub email: Option<String>,
    /// Full name.
    #[serde(default)]
    pub name: Option<String>,
}

/// Userinfo claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserInfoClaims {
    /// Subject.
    pub sub: String,
    /// Email.
    #[serde(default)]
    pub email: Option<String>,
    /// Full name.
    #[serde(default)]
    pub name: Option<String>,
    /// Any other claims (`email_verified`, `updated_at`, `address`, ...).
    #[serde(flatten)]
    pub additional: HashMap<String, serde_json::Value>,
}

fn one_or_many<'de, D>(deserializer: D) -> std::result::Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum OneOrMany {
        One(String),
        Many(Vec<String>),
    }

    Ok(match OneOrMany::deserialize(deserializer)? {
        OneOrMany::One(aud) => vec![aud],
        OneOrMany::Many(aud) => aud,
    })
}
