//! Integration tests for session token redemption.

#![allow(clippy::unwrap_used)]

mod common;

use chrono::Duration;
use common::{Harness, TestToken};
use federated_auth::mocks::MockFederationStore;
use federated_auth::providers::factory;
use federated_auth::token::token_digest;
use federated_auth::{AuthMethodState, AuthTokenStatus, ErrorKind, FederationConfig};

/// Start an attempt and complete its callback. Returns the token id.
async fn complete_login(h: &Harness) -> String {
    let request = h.start(h.method.id.as_str()).run(&h.env).await.unwrap();
    let params = common::query_params(&request.authorization_url);
    h.provider.set_expected_auth_nonce(params["nonce"].clone());

    h.callback(h.method.id.as_str(), &params["state"], "simple")
        .run(&h.env)
        .await
        .unwrap();

    request.token_id
}

#[tokio::test]
async fn test_not_ready_before_callback() {
    let h = Harness::new().await;
    let request = h.start(h.method.id.as_str()).run(&h.env).await.unwrap();

    let result = h
        .token(h.method.id.as_str(), &request.token_id)
        .run(&h.env)
        .await
        .unwrap();
    assert!(result.is_none());
}

#[tokio::test]
async fn test_issue_after_callback() {
    let h = Harness::new().await;
    let token_id = complete_login(&h).await;

    let issued = h
        .token(h.method.id.as_str(), &token_id)
        .run(&h.env)
        .await
        .unwrap()
        .unwrap();

    assert_eq!(issued.token.status, AuthTokenStatus::Issued);
    assert!(!issued.secret.is_empty());

    let stored = h.store.auth_tokens().await;
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].status, AuthTokenStatus::Issued);
    assert_eq!(
        stored[0].token_digest.as_deref(),
        Some(token_digest(&issued.secret).as_str())
    );
    assert_ne!(stored[0].token_digest.as_deref(), Some(issued.secret.as_str()));
}

#[tokio::test]
async fn test_second_redemption_is_forbidden() {
    let h = Harness::new().await;
    let token_id = complete_login(&h).await;

    h.token(h.method.id.as_str(), &token_id)
        .run(&h.env)
        .await
        .unwrap()
        .unwrap();

    let err = h
        .token(h.method.id.as_str(), &token_id)
        .run(&h.env)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Forbidden);
    assert!(err.to_string().contains("token already issued"));
}

#[tokio::test]
async fn test_expired_pending_token() {
    let store = MockFederationStore::new().with_token_ttl(Duration::seconds(-1));
    let h = Harness::with_store(store, FederationConfig::new()).await;
    let token_id = complete_login(&h).await;

    let err = h
        .token(h.method.id.as_str(), &token_id)
        .run(&h.env)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::AuthAttemptExpired);
    assert!(err.to_string().contains("pending token has expired"));
    assert_eq!(h.store.auth_tokens().await[0].status, AuthTokenStatus::Pending);
}

#[tokio::test]
async fn test_expired_token_request() {
    let h = Harness::with_config(FederationConfig::new().with_attempt_ttl(Duration::seconds(-1)))
        .await;
    let request = h.start(h.method.id.as_str()).run(&h.env).await.unwrap();

    let err = h
        .token(h.method.id.as_str(), &request.token_id)
        .run(&h.env)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::AuthAttemptExpired);
    assert!(err.to_string().contains("token request has expired"));
}

#[tokio::test]
async fn test_token_id_bound_to_method() {
    let h = Harness::new().await;
    let other = h.add_method(AuthMethodState::ActivePublic).await;
    let token_id = complete_login(&h).await;

    let err = h
        .token(other.id.as_str(), &token_id)
        .run(&h.env)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Decrypt);
    assert_eq!(h.store.auth_tokens().await[0].status, AuthTokenStatus::Pending);
}

#[tokio::test]
async fn test_malformed_token_id() {
    let h = Harness::new().await;

    let err = h
        .token(h.method.id.as_str(), "not a token id")
        .run(&h.env)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Unknown);
}

#[tokio::test]
async fn test_unknown_method() {
    let h = Harness::new().await;
    let token_id = complete_login(&h).await;

    let err = h.token("amoidc_missing", &token_id).run(&h.env).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::RecordNotFound);
}

#[tokio::test]
async fn test_missing_inputs() {
    let h = Harness::new().await;

    let cases: Vec<(&str, TestToken)> = vec![
        (
            "missing oidc repository",
            TestToken::new(h.method.id.as_str(), "t").token_repo(factory(h.store.clone())),
        ),
        (
            "missing auth token repository",
            TestToken::new(h.method.id.as_str(), "t").oidc_repo(factory(h.store.clone())),
        ),
        ("missing auth method id", h.token("", "t")),
        ("missing token id", h.token(h.method.id.as_str(), "")),
    ];

    for (message, token) in cases {
        let err = token.run(&h.env).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter, "{message}");
        assert!(err.to_string().contains(message), "{message}: {err}");
    }
}
