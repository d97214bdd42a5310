//! Federated login configuration.
//!
//! Attempt lifetime and endpoint templates are provided by the application,
//! not hardcoded into the flow. Session token lifetime belongs to the token
//! repository.

use chrono::Duration;

/// Placeholder for the API base address in endpoint templates.
pub const API_PLACEHOLDER: &str = "{api}";

/// Placeholder for the auth method id in endpoint templates.
pub const AUTH_METHOD_PLACEHOLDER: &str = "{id}";

/// Configuration for `StartAuth`, `Callback` and `Token`.
#[derive(Debug, Clone)]
pub struct FederationConfig {
    /// Lifetime of an authentication attempt (and of the token request id
    /// returned by `StartAuth`).
    ///
    /// Default: 5 minutes
    pub attempt_ttl: Duration,

    /// Callback endpoint registered with the provider.
    ///
    /// `{api}` is replaced with the API base address and `{id}` with the
    /// (URL-encoded) auth method id.
    ///
    /// Default: `{api}/v1/auth-methods/{id}:authenticate:callback`
    pub callback_endpoint: String,

    /// Final redirect used when the caller does not request one.
    ///
    /// Default: `{api}/authentication-complete`
    pub final_redirect_endpoint: String,

    /// Scopes requested on every authorization request, ahead of the
    /// method's own claims scopes.
    ///
    /// Default: `["openid"]`
    pub default_scopes: Vec<String>,
}

impl FederationConfig {
    /// Create a configuration with default policy values.
    #[must_use]
    pub fn new() -> Self {
        Self {
            attempt_ttl: Duration::minutes(5),
            callback_endpoint: "{api}/v1/auth-methods/{id}:authenticate:callback".to_string(),
            final_redirect_endpoint: "{api}/authentication-complete".to_string(),
            default_scopes: vec!["openid".to_string()],
        }
    }

    /// Set the attempt lifetime.
    #[must_use]
    pub const fn with_attempt_ttl(mut self, ttl: Duration) -> Self {
        self.attempt_ttl = ttl;
        self
    }

    /// Set the callback endpoint template.
    #[must_use]
    pub fn with_callback_endpoint(mut self, template: impl Into<String>) -> Self {
        self.callback_endpoint = template.into();
        self
    }

    /// Set the default final redirect template.
    #[must_use]
    pub fn with_final_redirect_endpoint(mut self, template: impl Into<String>) -> Self {
        self.final_redirect_endpoint = template.into();
        self
    }

    /// Set the default scopes.
    #[must_use]
    pub fn with_default_scopes(mut self, scopes: Vec<String>) -> Self {
        self.default_scopes = scopes;
        self
    }

    /// Build the callback URL for an auth method.
    ///
    /// Each method gets a distinct redirect target, so the provider-side
    /// allow-list cannot be satisfied by substituting another method's id.
    ///
    /// # Examples
    ///
    /// ```
    /// # use federated_auth::config::FederationConfig;
    /// let config = FederationConfig::new();
    /// assert_eq!(
    ///     config.callback_url("https://api.example.com/", "amoidc_1234"),
    ///     "https://api.example.com/v1/auth-methods/amoidc_1234:authenticate:callback"
    /// );
    /// ```
    #[must_use]
    pub fn callback_url(&self, api_addr: &str, auth_method_id: &str) -> String {
        self.callback_endpoint
            .replace(API_PLACEHOLDER, api_addr.trim_end_matches('/'))
            .replace(
                AUTH_METHOD_PLACEHOLDER,
                &urlencoding::encode(auth_method_id),
            )
    }

    /// Build the default final redirect URL.
    #[must_use]
    pub fn final_redirect_url(&self, api_addr: &str) -> String {
        self.final_redirect_endpoint
            .replace(API_PLACEHOLDER, api_addr.trim_end_matches('/'))
    }
}

impl Default for FederationConfig {
    fn default() -> Self {
        Self::new()
    }
}
