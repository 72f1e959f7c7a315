//! Tests for `PostureEnforcer`: revocation of sessions whose posture fails.

use std::time::Duration;

use edgeward::posture::PostureResponse;
use edgeward::roles::Semantic;
use edgeward::types::{
    EdgeRouter, EdgeRouterPolicy, Identity, PostureCheck, PostureCheckKind, Service,
    ServiceEdgeRouterPolicy, ServicePolicy, SessionType,
};
use edgeward::Env;
use tokio::sync::watch;

fn roles(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_owned()).collect()
}

fn domain(value: &str) -> Vec<PostureResponse> {
    vec![PostureResponse::Domain {
        domain: value.to_owned(),
    }]
}

struct Fixture {
    env: Env,
    identity: Identity,
    api_session_id: String,
    session_id: String,
}

/// One admitted dial session gated by a domain check.
async fn setup() -> Fixture {
    let env = Env::in_memory().await.expect("env");
    let identity = Identity::new("hank", roles(&["eng"]));
    let service = Service::new("builds", roles(&["ci"]));
    env.create(identity.clone()).await.expect("identity");
    env.create(service.clone()).await.expect("service");
    env.create(EdgeRouter::new("edge", roles(&["edge"])))
        .await
        .expect("router");
    env.create(PostureCheck::new(
        "corp",
        roles(&["corp"]),
        PostureCheckKind::Domain {
            domains: roles(&["corp.example"]),
        },
    ))
    .await
    .expect("check");

    let mut policy = ServicePolicy::new(
        "eng-dial-ci",
        SessionType::Dial,
        Semantic::AnyOf,
        roles(&["#eng"]),
        roles(&["#ci"]),
    );
    policy.posture_check_roles = roles(&["#corp"]);
    env.create(policy).await.expect("policy");
    env.create(EdgeRouterPolicy::new(
        "erp",
        Semantic::AnyOf,
        roles(&["#all"]),
        roles(&["#all"]),
    ))
    .await
    .expect("erp");
    env.create(ServiceEdgeRouterPolicy::new(
        "serp",
        Semantic::AnyOf,
        roles(&["#all"]),
        roles(&["#all"]),
    ))
    .await
    .expect("serp");

    let (api_session_id, _) = env
        .api_sessions
        .create(&identity.id, Vec::new())
        .await
        .expect("api session");
    env.posture
        .add_responses(&identity.id, &api_session_id, domain("corp.example"));
    let session_id = env
        .admission
        .create_session(&api_session_id, &service.id, SessionType::Dial)
        .await
        .expect("admitted");

    Fixture {
        env,
        identity,
        api_session_id,
        session_id,
    }
}

#[tokio::test]
async fn passing_sessions_are_kept() {
    let f = setup().await;
    let revoked = f
        .env
        .enforcer
        .enforce_identity(&f.identity.id)
        .await
        .expect("enforce");
    assert_eq!(revoked, 0);
    f.env.admission.read(&f.session_id).await.expect("still present");
}

#[tokio::test]
async fn identity_enforcement_revokes_failing_sessions() {
    let f = setup().await;
    f.env
        .posture
        .add_responses(&f.identity.id, &f.api_session_id, domain("home.lan"));

    let revoked = f
        .env
        .enforcer
        .enforce_identity(&f.identity.id)
        .await
        .expect("enforce");
    assert_eq!(revoked, 1);
    assert!(f.env.admission.read(&f.session_id).await.is_err());
    assert!(
        f.env.posture.session_request_failures(&f.identity.id).is_empty(),
        "enforcement does not record request failures"
    );
}

#[tokio::test]
async fn sweep_revokes_once() {
    let f = setup().await;
    f.env
        .posture
        .add_responses(&f.identity.id, &f.api_session_id, domain("home.lan"));

    assert_eq!(f.env.enforcer.sweep().await.expect("sweep"), 1);
    assert_eq!(f.env.enforcer.sweep().await.expect("sweep"), 0);
}

#[tokio::test]
async fn posture_change_triggers_background_revocation() {
    let f = setup().await;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = f.env.spawn_background(shutdown_rx);

    f.env
        .posture
        .add_responses(&f.identity.id, &f.api_session_id, domain("home.lan"));

    let mut revoked = false;
    for _ in 0..100 {
        if f.env.admission.read(&f.session_id).await.is_err() {
            revoked = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(revoked, "session should be revoked after posture change");

    shutdown_tx.send(true).expect("signal shutdown");
    for handle in handles {
        tokio::time::timeout(Duration::from_secs(5), handle)
            .await
            .expect("task should stop")
            .expect("task should not panic");
    }
}
