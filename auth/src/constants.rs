//! Federated login constants.

/// Public id prefixes.
pub mod prefixes {
    /// OIDC auth method.
    pub const AUTH_METHOD: &str = "amoidc";

    /// Federated (OIDC) account.
    pub const ACCOUNT: &str = "acctoidc";

    /// Local identity.
    pub const USER: &str = "u";

    /// Scope (organization).
    pub const SCOPE: &str = "o";

    /// Auth token and token request.
    pub const AUTH_TOKEN: &str = "at";

    /// Audit entry.
    pub const AUDIT_ENTRY: &str = "oe";
}

/// Logical type names recorded in audit messages.
pub mod audit_types {
    /// Post-image of the OIDC-specific account record.
    pub const FEDERATED_ACCOUNT: &str = "federated-account";

    /// Post-image of the generic account (its identity link).
    pub const GENERIC_ACCOUNT: &str = "generic-account";

    /// Post-image of a local identity.
    pub const IDENTITY: &str = "identity";
}

/// Error messages the flow guarantees.
pub mod messages {
    /// The attempt's request id has already been consumed.
    pub const NOT_UNIQUE_REQUEST: &str = "not a unique request";

    /// The method's configuration hash changed since `StartAuth`.
    pub const CONFIG_CHANGED: &str =
        "configuration changed during in-flight authentication attempt";

    /// The attempt outlived its lifetime.
    pub const STATE_EXPIRED: &str = "request state has expired";
}

/// Authorization request parameters.
pub mod oidc {
    /// Response type for the authorization code flow.
    pub const RESPONSE_TYPE_CODE: &str = "code";

    /// PKCE challenge method.
    pub const PKCE_METHOD_S256: &str = "S256";
}
