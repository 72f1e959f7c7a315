//! Tests for `PostureEvaluator` against stored policies.

use edgeward::posture::PostureResponse;
use edgeward::roles::Semantic;
use edgeward::types::posture_check::MfaCheck;
use edgeward::types::{Identity, PostureCheck, PostureCheckKind, Service, ServicePolicy, SessionType};
use edgeward::Env;

fn roles(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_owned()).collect()
}

fn domain_check(name: &str, attrs: &[&str]) -> PostureCheck {
    PostureCheck::new(
        name,
        roles(attrs),
        PostureCheckKind::Domain {
            domains: roles(&["corp.example"]),
        },
    )
}

struct Fixture {
    env: Env,
    identity: Identity,
    service: Service,
    api_session_id: String,
}

async fn setup() -> Fixture {
    let env = Env::in_memory().await.expect("env");
    let identity = Identity::new("gina", roles(&["eng"]));
    let service = Service::new("vault", roles(&["secure"]));
    env.create(identity.clone()).await.expect("identity");
    env.create(service.clone()).await.expect("service");
    let (api_session_id, _) = env
        .api_sessions
        .create(&identity.id, Vec::new())
        .await
        .expect("api session");
    Fixture {
        env,
        identity,
        service,
        api_session_id,
    }
}

fn dial_policy(name: &str, posture_roles: &[&str]) -> ServicePolicy {
    let mut policy = ServicePolicy::new(
        name,
        SessionType::Dial,
        Semantic::AnyOf,
        roles(&["#eng"]),
        roles(&["#secure"]),
    );
    policy.posture_check_roles = roles(posture_roles);
    policy
}

#[tokio::test]
async fn passing_policies_are_ored_and_checks_anded() {
    let f = setup().await;

    f.env.create(domain_check("c1-domain", &["p1"])).await.expect("c1");
    f.env
        .create(PostureCheck::new(
            "c2-mac",
            roles(&["p1"]),
            PostureCheckKind::Mac {
                mac_addresses: roles(&["AA:BB:CC:DD:EE:FF"]),
            },
        ))
        .await
        .expect("c2");
    f.env.create(domain_check("c3-domain", &["p2"])).await.expect("c3");

    let p1 = f.env.create(dial_policy("p1", &["#p1"])).await.expect("p1");
    let p2 = f.env.create(dial_policy("p2", &["#p2"])).await.expect("p2");

    f.env.posture.add_responses(
        &f.identity.id,
        &f.api_session_id,
        vec![PostureResponse::Domain {
            domain: "corp.example".to_owned(),
        }],
    );

    let result = f
        .env
        .evaluator
        .evaluate_posture_for_service(
            &f.identity.id,
            &f.api_session_id,
            SessionType::Dial,
            &f.service.id,
            &f.service.name,
        )
        .await
        .expect("evaluate");
    assert!(result.passed);
    assert_eq!(result.passing_policy_ids, vec![p2.clone()]);
    assert!(!result.passing_policy_ids.contains(&p1));

    f.env.posture.add_responses(
        &f.identity.id,
        &f.api_session_id,
        vec![PostureResponse::Mac {
            mac_addresses: roles(&["aabb.ccdd.eeff"]),
        }],
    );
    let result = f
        .env
        .evaluator
        .evaluate_posture_for_service(
            &f.identity.id,
            &f.api_session_id,
            SessionType::Dial,
            &f.service.id,
            &f.service.name,
        )
        .await
        .expect("evaluate");
    let mut expected = vec![p1, p2];
    expected.sort();
    assert_eq!(result.passing_policy_ids, expected);
}

#[tokio::test]
async fn no_applicable_policy_passes_with_no_policies() {
    let f = setup().await;
    let result = f
        .env
        .evaluator
        .evaluate_posture_for_service(
            &f.identity.id,
            &f.api_session_id,
            SessionType::Bind,
            &f.service.id,
            &f.service.name,
        )
        .await
        .expect("evaluate");
    assert!(result.passed);
    assert!(result.passing_policy_ids.is_empty());
    assert!(result.failure.is_none());
}

#[tokio::test]
async fn policy_without_checks_passes() {
    let f = setup().await;
    let id = f.env.create(dial_policy("open", &[])).await.expect("policy");

    let result = f
        .env
        .evaluator
        .evaluate_posture_for_service(
            &f.identity.id,
            &f.api_session_id,
            SessionType::Dial,
            &f.service.id,
            &f.service.name,
        )
        .await
        .expect("evaluate");
    assert!(result.passed);
    assert_eq!(result.passing_policy_ids, vec![id]);
}

#[tokio::test]
async fn mfa_without_timeout_passes_once_completed() {
    let f = setup().await;
    f.env
        .create(PostureCheck::new(
            "mfa",
            roles(&["mfa"]),
            PostureCheckKind::Mfa(MfaCheck::default()),
        ))
        .await
        .expect("mfa check");
    f.env.create(dial_policy("mfa-required", &["#mfa"])).await.expect("policy");

    let before = f
        .env
        .evaluator
        .evaluate_posture_for_service(
            &f.identity.id,
            &f.api_session_id,
            SessionType::Dial,
            &f.service.id,
            &f.service.name,
        )
        .await
        .expect("evaluate");
    assert!(!before.passed);
    let failure = before.failure.expect("failure payload");
    assert_eq!(failure.policy_failures[0].checks[0].actual["passedMfa"], false);

    f.env
        .api_sessions
        .mfa_completed(&f.api_session_id)
        .await
        .expect("mfa");
    let after = f
        .env
        .evaluator
        .evaluate_posture_for_service(
            &f.identity.id,
            &f.api_session_id,
            SessionType::Dial,
            &f.service.id,
            &f.service.name,
        )
        .await
        .expect("evaluate");
    assert!(after.passed);
}

#[tokio::test]
async fn out_of_range_mfa_timeout_does_not_break_other_checks() {
    let f = setup().await;
    f.env
        .create(PostureCheck::new(
            "mfa-forever",
            roles(&["mfa"]),
            PostureCheckKind::Mfa(MfaCheck {
                timeout_seconds: i64::MAX,
                ..MfaCheck::default()
            }),
        ))
        .await
        .expect("mfa check accepted");
    f.env.create(domain_check("domain", &["managed"])).await.expect("check");
    f.env.create(dial_policy("mfa-required", &["#mfa"])).await.expect("policy");
    f.env
        .api_sessions
        .mfa_completed(&f.api_session_id)
        .await
        .expect("mfa");

    let mfa = f
        .env
        .evaluator
        .evaluate_posture_for_service(
            &f.identity.id,
            &f.api_session_id,
            SessionType::Dial,
            &f.service.id,
            &f.service.name,
        )
        .await
        .expect("evaluate");
    assert!(mfa.passed);

    // Posture reporting and other checks keep working afterwards.
    f.env.create(dial_policy("domain-required", &["#managed"])).await.expect("policy");
    f.env.posture.add_responses(
        &f.identity.id,
        &f.api_session_id,
        vec![PostureResponse::Domain {
            domain: "corp.example".to_owned(),
        }],
    );
    let both = f
        .env
        .evaluator
        .evaluate_posture_for_service(
            &f.identity.id,
            &f.api_session_id,
            SessionType::Dial,
            &f.service.id,
            &f.service.name,
        )
        .await
        .expect("evaluate");
    assert!(both.passed);
    assert_eq!(both.passing_policy_ids.len(), 2);
}

#[tokio::test]
async fn failures_are_kept_in_bounded_history() {
    let f = setup().await;
    f.env.create(domain_check("domain", &["d"])).await.expect("check");
    f.env.create(dial_policy("needs-domain", &["#d"])).await.expect("policy");

    for _ in 0..3 {
        let result = f
            .env
            .evaluator
            .evaluate_posture_for_service(
                &f.identity.id,
                &f.api_session_id,
                SessionType::Dial,
                &f.service.id,
                &f.service.name,
            )
            .await
            .expect("evaluate");
        assert!(!result.passed);
    }

    let history = f.env.posture.session_request_failures(&f.identity.id);
    assert_eq!(history.len(), 3);
    assert!(history.iter().all(|h| h.service_name == "vault"));
    assert!(history[0].cause_message().contains("needs-domain"));
}
