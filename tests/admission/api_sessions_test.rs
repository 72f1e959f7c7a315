//! Tests for `src/api_sessions.rs`: api session lifecycle.

use chrono::{Duration, Utc};
use edgeward::types::{new_id, ApiSessionCertificate, EntityKind, Identity};
use edgeward::Env;

fn certificate(fingerprint: &str, valid: bool) -> ApiSessionCertificate {
    let now = Utc::now();
    let (valid_after, valid_before) = if valid {
        (now - Duration::hours(1), now + Duration::hours(1))
    } else {
        (now - Duration::hours(3), now - Duration::hours(2))
    };
    ApiSessionCertificate {
        id: new_id(),
        fingerprint: fingerprint.to_owned(),
        subject: "CN=client".to_owned(),
        valid_after,
        valid_before,
    }
}

async fn env_with_identity() -> (Env, Identity) {
    let env = Env::in_memory().await.expect("env");
    let identity = Identity::new("frank", vec!["ops".to_owned()]);
    env.create(identity.clone()).await.expect("identity");
    (env, identity)
}

#[tokio::test]
async fn create_and_read_by_token() {
    let (env, identity) = env_with_identity().await;

    let (id, token) = env
        .api_sessions
        .create(&identity.id, vec![certificate("aa11", true)])
        .await
        .expect("create");

    let by_id = env.api_sessions.read(&id).await.expect("read");
    assert_eq!(by_id.identity_id, identity.id);
    assert_eq!(by_id.certificates.len(), 1);

    let by_token = env.api_sessions.read_by_token(&token).await.expect("by token");
    assert_eq!(by_token.id, id);
    assert!(env.api_sessions.read_by_token("bogus").await.is_err());
}

#[tokio::test]
async fn create_for_unknown_identity_is_not_found() {
    let env = Env::in_memory().await.expect("env");
    let err = env
        .api_sessions
        .create("missing", Vec::new())
        .await
        .expect_err("unknown identity");
    assert_eq!(err.code().as_str(), "NOT_FOUND");
}

#[tokio::test]
async fn only_valid_fingerprints_are_visited() {
    let (env, identity) = env_with_identity().await;
    let (id, _) = env
        .api_sessions
        .create(
            &identity.id,
            vec![certificate("current", true), certificate("expired", false)],
        )
        .await
        .expect("create");

    let fingerprints = env
        .api_sessions
        .visit_fingerprints(&id)
        .await
        .expect("fingerprints");
    assert_eq!(fingerprints, vec!["current".to_owned()]);
}

#[tokio::test]
async fn mfa_completion_sets_flag_and_posture() {
    let (env, identity) = env_with_identity().await;
    let (id, _) = env
        .api_sessions
        .create(&identity.id, Vec::new())
        .await
        .expect("create");

    env.api_sessions.mfa_completed(&id).await.expect("mfa");

    assert!(env.api_sessions.read(&id).await.expect("read").mfa_complete);
    let posture = env.posture.posture_data(&identity.id).expect("posture");
    assert!(posture.api_sessions[&id].mfa.passed_at.is_some());
}

#[tokio::test]
async fn delete_removes_certificates_and_queues_cascade() {
    let (env, identity) = env_with_identity().await;
    let (id, _) = env
        .api_sessions
        .create(&identity.id, vec![certificate("aa11", true)])
        .await
        .expect("create");

    env.api_sessions.delete(&id).await.expect("delete");

    let certs: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM api_session_certificates")
        .fetch_one(env.db.pool())
        .await
        .expect("count");
    let events: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM eventual_events")
        .fetch_one(env.db.pool())
        .await
        .expect("count");
    assert_eq!(certs, 0);
    assert_eq!(events, 1);
    assert!(env.api_sessions.read(&id).await.is_err());
    assert!(env.api_sessions.delete(&id).await.is_err(), "second delete is not found");
}

#[tokio::test]
async fn delete_by_identity_removes_every_api_session() {
    let (env, identity) = env_with_identity().await;
    for _ in 0..3 {
        env.api_sessions
            .create(&identity.id, Vec::new())
            .await
            .expect("create");
    }

    let deleted = env
        .api_sessions
        .delete_by_identity(&identity.id)
        .await
        .expect("delete by identity");
    assert_eq!(deleted, 3);

    let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM api_sessions")
        .fetch_one(env.db.pool())
        .await
        .expect("count");
    assert_eq!(remaining, 0);
}

#[tokio::test]
async fn deleting_identity_deletes_its_api_sessions() {
    let (env, identity) = env_with_identity().await;
    let (id, _) = env
        .api_sessions
        .create(&identity.id, Vec::new())
        .await
        .expect("create");

    env.delete(EntityKind::Identity, &identity.id)
        .await
        .expect("delete identity");
    assert!(env.api_sessions.read(&id).await.is_err());
}

#[tokio::test]
async fn activity_by_tokens_reports_unknown_tokens() {
    let (env, identity) = env_with_identity().await;
    let (id, token) = env
        .api_sessions
        .create(&identity.id, Vec::new())
        .await
        .expect("create");

    let missing = env
        .api_sessions
        .mark_activity_by_tokens(&[token.clone(), "stale".to_owned(), token])
        .await
        .expect("mark");
    assert_eq!(missing, vec!["stale".to_owned()]);
    assert_eq!(env.heartbeats.pending(), 1);

    assert_eq!(env.heartbeats.flush().await.expect("flush"), 1);
    let read = env.api_sessions.read(&id).await.expect("read");
    assert!(read.last_activity_at >= read.created_at);
}
