//! Integration tests for the callback state machine.

#![allow(clippy::unwrap_used)]

mod common;

use chrono::Duration;
use common::{Harness, TestCallback, FINAL_REDIRECT};
use federated_auth::audit::AuditOperation;
use federated_auth::mocks::MockKeyManager;
use federated_auth::providers::{factory, KeyManager, KeyPurpose};
use federated_auth::state::AccountDraft;
use federated_auth::{
    AuthError, AuthMethodState, AuthTokenStatus, ErrorKind, FederationConfig,
    FederationEnvironment, Scope, User,
};
use std::collections::HashMap;

#[tokio::test]
async fn test_callback_simple() {
    let h = Harness::new().await;
    let (state, attempt) = h.sealed_attempt(&h.method, |_| {}).await;

    let redirect = h
        .callback(h.method.id.as_str(), &state, "simple")
        .run(&h.env)
        .await
        .unwrap();
    assert_eq!(redirect, FINAL_REDIRECT);

    let tokens = h.store.auth_tokens().await;
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].status, AuthTokenStatus::Pending);
    assert_eq!(tokens[0].request_id, attempt.token_request_id);
    assert_eq!(tokens[0].auth_method_id, h.method.id);

    let accounts = h.store.accounts().await;
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].subject, "alice@example.com");
    assert_eq!(accounts[0].email.as_deref(), Some("alice@example.com"));
    assert_eq!(accounts[0].full_name.as_deref(), Some("Alice Doe"));

    let users = h.store.users().await;
    assert_eq!(users.len(), 1);
    assert_eq!(accounts[0].iam_user_id.as_ref(), Some(&users[0].id));
    assert_eq!(tokens[0].user_id, users[0].id);
    assert_eq!(tokens[0].account_id, accounts[0].id);
}

#[tokio::test]
async fn test_callback_writes_one_sealed_audit_entry() {
    let h = Harness::new().await;
    let (state, _) = h.sealed_attempt(&h.method, |_| {}).await;
    h.callback(h.method.id.as_str(), &state, "simple")
        .run(&h.env)
        .await
        .unwrap();

    let entries = h.store.audit_entries().await;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].scope_id, h.scope.id);

    // Sealed under the oplog key, not the database key.
    let db = h.keys.wrapper(&h.scope.id, KeyPurpose::Database).await.unwrap();
    assert!(entries[0].open(&db).is_err());

    let oplog = h.keys.wrapper(&h.scope.id, KeyPurpose::Oplog).await.unwrap();
    let messages = entries[0].open(&oplog).unwrap();
    let types: Vec<&str> = messages.iter().map(|m| m.type_name.as_str()).collect();
    assert_eq!(types, vec!["federated-account", "generic-account", "identity"]);
    assert!(messages.iter().all(|m| m.operation == AuditOperation::Create));
}

#[tokio::test]
async fn test_callback_returning_account() {
    let h = Harness::new().await;

    let (first, _) = h.sealed_attempt(&h.method, |_| {}).await;
    h.callback(h.method.id.as_str(), &first, "simple")
        .run(&h.env)
        .await
        .unwrap();

    h.provider.set_user_info_reply(HashMap::from([
        ("email".to_string(), "alice@example.com".to_string()),
        ("name".to_string(), "Alice Q. Doe".to_string()),
    ]));
    let (second, _) = h.sealed_attempt(&h.method, |_| {}).await;
    h.callback(h.method.id.as_str(), &second, "simple")
        .run(&h.env)
        .await
        .unwrap();

    let accounts = h.store.accounts().await;
    assert_eq!(accounts.len(), 1);
    assert_eq!(accounts[0].full_name.as_deref(), Some("Alice Q. Doe"));
    assert_eq!(h.store.users().await.len(), 1);
    assert_eq!(h.store.auth_tokens().await.len(), 2);

    let oplog = h.keys.wrapper(&h.scope.id, KeyPurpose::Oplog).await.unwrap();
    let entries = h.store.audit_entries().await;
    assert_eq!(entries.len(), 2);
    let messages = entries[1].open(&oplog).unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages.iter().all(|m| m.operation == AuditOperation::Update));
}

#[tokio::test]
async fn test_missing_inputs() {
    let h = Harness::new().await;
    let (state, _) = h.sealed_attempt(&h.method, |_| {}).await;
    let id = h.method.id.as_str();

    let cases: Vec<(&str, TestCallback)> = vec![
        (
            "missing oidc repository",
            TestCallback::new(id, state.as_str(), "simple")
                .iam_repo(factory(h.store.clone()))
                .token_repo(factory(h.store.clone())),
        ),
        (
            "missing iam repository",
            TestCallback::new(id, state.as_str(), "simple")
                .oidc_repo(factory(h.store.clone()))
                .token_repo(factory(h.store.clone())),
        ),
        (
            "missing auth token repository",
            TestCallback::new(id, state.as_str(), "simple")
                .oidc_repo(factory(h.store.clone()))
                .iam_repo(factory(h.store.clone())),
        ),
        ("missing auth method id", h.callback("", &state, "simple")),
        ("missing state", h.callback(id, "", "simple")),
        ("missing code", h.callback(id, &state, "")),
    ];

    for (message, callback) in cases {
        let err = callback.run(&h.env).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidParameter, "{message}");
        assert!(err.to_string().contains(message), "{message}: {err}");
    }

    h.assert_nothing_persisted().await;
}

#[tokio::test]
async fn test_validation_order() {
    let h = Harness::new().await;

    // Everything missing: the oidc repository is reported first.
    let err = TestCallback::new("", "", "").run(&h.env).await.unwrap_err();
    assert_eq!(
        err,
        AuthError::InvalidParameter("missing oidc repository".to_string())
    );
}

#[tokio::test]
async fn test_bad_auth_method_id() {
    let h = Harness::new().await;
    let (state, _) = h.sealed_attempt(&h.method, |_| {}).await;

    let err = h
        .callback("not-valid", &state, "simple")
        .run(&h.env)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RecordNotFound);
    assert!(err.to_string().contains("auth method not-valid not found"));
    h.assert_nothing_persisted().await;
}

#[tokio::test]
async fn test_bad_state_encoding() {
    let h = Harness::new().await;

    let err = h
        .callback(h.method.id.as_str(), "unable to decode message", "simple")
        .run(&h.env)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Unknown);
    assert!(err.to_string().contains("unable to decode message"));
    assert!(!err.is_security_issue());
    h.assert_nothing_persisted().await;
}

#[tokio::test]
async fn test_state_from_other_scope_fails_decrypt() {
    let h = Harness::new().await;

    let other_scope = Scope::new();
    h.store.create_scope(other_scope.clone()).await;
    let other_method = common::test_method(&other_scope, AuthMethodState::ActivePublic);
    h.store.create_auth_method(other_method.clone()).await;
    let (state, _) = h.sealed_attempt(&other_method, |_| {}).await;

    let err = h
        .callback(h.method.id.as_str(), &state, "simple")
        .run(&h.env)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Decrypt);
    assert!(err.to_string().contains("unable to decrypt message"));
    assert!(err.is_security_issue());
    h.assert_nothing_persisted().await;
}

#[tokio::test]
async fn test_state_from_other_method_in_scope_fails_decrypt() {
    let h = Harness::new().await;
    let sibling = h.add_method(AuthMethodState::ActivePublic).await;
    let (state, _) = h.sealed_attempt(&sibling, |_| {}).await;

    let err = h
        .callback(h.method.id.as_str(), &state, "simple")
        .run(&h.env)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Decrypt);
    h.assert_nothing_persisted().await;
}

#[tokio::test]
async fn test_state_sealed_with_other_root_key_fails_decrypt() {
    let h = Harness::new().await;
    let (state, _) = h.sealed_attempt(&h.method, |_| {}).await;

    let other_env = FederationEnvironment::new(
        h.provider.clone(),
        MockKeyManager::random(),
        FederationConfig::new(),
    );
    let err = h
        .callback(h.method.id.as_str(), &state, "simple")
        .run(&other_env)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Decrypt);
}

#[tokio::test]
async fn test_inactive_method() {
    let h = Harness::new().await;
    let (state, _) = h.sealed_attempt(&h.method, |_| {}).await;

    let mut inactive = h.method.clone();
    inactive.state = AuthMethodState::Inactive;
    h.store.update_auth_method(inactive).await.unwrap();

    let err = h
        .callback(h.method.id.as_str(), &state, "simple")
        .run(&h.env)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::AuthMethodInactive);
    assert!(err.to_string().contains("is inactive"));
    h.assert_nothing_persisted().await;
}

#[tokio::test]
async fn test_inactive_with_config_change_reports_inactive() {
    let h = Harness::new().await;
    let (state, _) = h.sealed_attempt(&h.method, |_| {}).await;

    let mut changed = h.method.clone();
    changed.state = AuthMethodState::Inactive;
    changed.client_secret = "rotated-secret".to_string();
    h.store.update_auth_method(changed).await.unwrap();

    let err = h
        .callback(h.method.id.as_str(), &state, "simple")
        .run(&h.env)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::AuthMethodInactive);
    assert!(err.to_string().contains("is inactive"));
}

#[tokio::test]
async fn test_config_change_during_attempt() {
    let h = Harness::new().await;
    let (state, _) = h.sealed_attempt(&h.method, |_| {}).await;

    let changed = h
        .method
        .clone()
        .with_audiences(vec!["new-audience".to_string()]);
    h.store.update_auth_method(changed).await.unwrap();

    let err = h
        .callback(h.method.id.as_str(), &state, "simple")
        .run(&h.env)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::AuthMethodInactive);
    assert!(err
        .to_string()
        .contains("configuration changed during in-flight authentication attempt"));
    h.assert_nothing_persisted().await;
}

#[tokio::test]
async fn test_activation_toggle_is_not_config_change() {
    let h = Harness::new().await;
    let (state, _) = h.sealed_attempt(&h.method, |_| {}).await;

    let mut private = h.method.clone();
    private.state = AuthMethodState::ActivePrivate;
    h.store.update_auth_method(private).await.unwrap();

    let redirect = h
        .callback(h.method.id.as_str(), &state, "simple")
        .run(&h.env)
        .await
        .unwrap();
    assert_eq!(redirect, FINAL_REDIRECT);
}

#[tokio::test]
async fn test_expired_attempt() {
    let h = Harness::new().await;
    let (state, _) = h
        .sealed_attempt(&h.method, |attempt| {
            attempt.created_at -= Duration::minutes(5) + Duration::seconds(20);
            attempt.expires_at = attempt.created_at + Duration::minutes(5);
        })
        .await;

    let err = h
        .callback(h.method.id.as_str(), &state, "simple")
        .run(&h.env)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::AuthAttemptExpired);
    assert!(err.to_string().contains("request state has expired"));
    h.assert_nothing_persisted().await;
}

#[tokio::test]
async fn test_provider_rejects_code() {
    let h = Harness::new().await;
    let (state, _) = h.sealed_attempt(&h.method, |_| {}).await;

    let err = h
        .callback(h.method.id.as_str(), &state, "not-the-code")
        .run(&h.env)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Upstream);
    h.assert_nothing_persisted().await;
}

#[tokio::test]
async fn test_exchange_carries_attempt_redirect_and_verifier() {
    let h = Harness::new().await;
    let (state, attempt) = h.sealed_attempt(&h.method, |_| {}).await;
    h.callback(h.method.id.as_str(), &state, "simple")
        .run(&h.env)
        .await
        .unwrap();

    let exchanges = h.provider.exchanges();
    assert_eq!(exchanges.len(), 1);
    assert_eq!(exchanges[0].code, "simple");
    assert_eq!(exchanges[0].redirect_url, attempt.callback_url);
    assert_eq!(exchanges[0].pkce_verifier, attempt.pkce_verifier);
}

#[tokio::test]
async fn test_nonce_mismatch() {
    let h = Harness::new().await;
    let (state, _) = h.sealed_attempt(&h.method, |_| {}).await;
    h.provider.set_expected_auth_nonce("some-other-nonce");

    let err = h
        .callback(h.method.id.as_str(), &state, "simple")
        .run(&h.env)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Upstream);
    assert!(err.to_string().contains("nonce"));
    h.assert_nothing_persisted().await;
}

#[tokio::test]
async fn test_issuer_mismatch() {
    let h = Harness::new().await;
    let (state, _) = h.sealed_attempt(&h.method, |_| {}).await;
    h.provider.set_issuer("https://evil.example.com");

    let err = h
        .callback(h.method.id.as_str(), &state, "simple")
        .run(&h.env)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Upstream);
    h.assert_nothing_persisted().await;
}

#[tokio::test]
async fn test_user_info_subject_mismatch() {
    let h = Harness::new().await;
    let (state, _) = h.sealed_attempt(&h.method, |_| {}).await;
    h.provider.set_user_info_reply(HashMap::from([(
        "sub".to_string(),
        "mallory@example.com".to_string(),
    )]));

    let err = h
        .callback(h.method.id.as_str(), &state, "simple")
        .run(&h.env)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Upstream);
    h.assert_nothing_persisted().await;
}

#[tokio::test]
async fn test_non_primary_method_without_linked_user() {
    let h = Harness::new().await;
    let secondary = h.add_method(AuthMethodState::ActivePublic).await;
    let (state, _) = h.sealed_attempt(&secondary, |_| {}).await;

    let err = h
        .callback(secondary.id.as_str(), &state, "simple")
        .run(&h.env)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::RecordNotFound);
    assert!(err.to_string().contains("is not linked to a user"));
    h.assert_nothing_persisted().await;
}

#[tokio::test]
async fn test_non_primary_method_with_linked_user() {
    let h = Harness::new().await;
    let secondary = h.add_method(AuthMethodState::ActivePublic).await;

    let user = User::new(h.scope.id.clone());
    h.store.create_user(user.clone()).await;
    let mut account = AccountDraft {
        auth_method_id: secondary.id.clone(),
        scope_id: h.scope.id.clone(),
        issuer: secondary.issuer.clone(),
        subject: "alice@example.com".to_string(),
        full_name: None,
        email: None,
    }
    .into_account(chrono::Utc::now());
    account.iam_user_id = Some(user.id.clone());
    h.store.create_account(account.clone()).await;

    let (state, _) = h.sealed_attempt(&secondary, |_| {}).await;
    h.callback(secondary.id.as_str(), &state, "simple")
        .run(&h.env)
        .await
        .unwrap();

    assert_eq!(h.store.users().await.len(), 1);
    let tokens = h.store.auth_tokens().await;
    assert_eq!(tokens.len(), 1);
    assert_eq!(tokens[0].user_id, user.id);
    assert_eq!(tokens[0].account_id, account.id);

    let oplog = h.keys.wrapper(&h.scope.id, KeyPurpose::Oplog).await.unwrap();
    let messages = h.store.audit_entries().await[0].open(&oplog).unwrap();
    assert_eq!(messages.len(), 2);
}

#[tokio::test]
async fn test_key_lookup_failure_persists_nothing() {
    let h = Harness::new().await;
    let (state, _) = h.sealed_attempt(&h.method, |_| {}).await;
    h.keys.disable_scope(&h.scope.id);

    let err = h
        .callback(h.method.id.as_str(), &state, "simple")
        .run(&h.env)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::Internal);
    h.assert_nothing_persisted().await;
}
