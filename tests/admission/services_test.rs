//! Tests for `src/services.rs`: service visibility and config merging.

use edgeward::roles::Semantic;
use edgeward::services;
use edgeward::types::{Config, Identity, Service, ServiceConfigOverride, ServicePolicy, SessionType};
use edgeward::Env;
use serde_json::json;

fn roles(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_owned()).collect()
}

#[tokio::test]
async fn permissions_come_from_linking_policies() {
    let env = Env::in_memory().await.expect("env");
    let identity = Identity::new("sam", roles(&["eng"]));
    let service = Service::new("git", roles(&["scm"]));
    let hidden = Service::new("payroll", roles(&["hr"]));
    env.create(identity.clone()).await.expect("identity");
    env.create(service.clone()).await.expect("service");
    env.create(hidden.clone()).await.expect("service");
    for (name, kind) in [("eng-dial-scm", SessionType::Dial), ("eng-bind-scm", SessionType::Bind)] {
        env.create(ServicePolicy::new(
            name,
            kind,
            Semantic::AnyOf,
            roles(&["#eng"]),
            roles(&["#scm"]),
        ))
        .await
        .expect("policy");
    }

    let mut tx = env.db.view().await.expect("view");
    let detail = services::read_for_identity(&mut tx, &service.id, &identity)
        .await
        .expect("read")
        .expect("visible");
    assert_eq!(detail.permissions, vec![SessionType::Dial, SessionType::Bind]);
    assert!(detail.allows(SessionType::Bind));

    assert!(services::read_for_identity(&mut tx, &hidden.id, &identity)
        .await
        .expect("read")
        .is_none());
    assert!(services::read_for_identity(&mut tx, "missing", &identity)
        .await
        .expect("read")
        .is_none());
}

#[tokio::test]
async fn identity_overrides_replace_service_configs_of_the_same_type() {
    let env = Env::in_memory().await.expect("env");
    let intercept = Config::new("intercept", "intercept.v1", json!({"port": 22}));
    let host = Config::new("host", "host.v1", json!({"address": "10.0.0.5"}));
    let custom = Config::new("custom-intercept", "intercept.v1", json!({"port": 2222}));
    for config in [&intercept, &host, &custom] {
        env.create(config.clone()).await.expect("config");
    }

    let mut service = Service::new("ssh", roles(&["scm"]));
    service.configs = vec![intercept.id.clone(), host.id.clone()];
    env.create(service.clone()).await.expect("service");

    let plain = Identity::new("tom", roles(&["eng"]));
    let mut tuned = Identity::new("uma", roles(&["eng"]));
    tuned.service_configs = vec![ServiceConfigOverride {
        service_id: service.id.clone(),
        config_id: custom.id.clone(),
    }];
    env.create(plain.clone()).await.expect("identity");
    env.create(tuned.clone()).await.expect("identity");

    let mut tx = env.db.view().await.expect("view");
    let base = services::effective_config(&mut tx, &service, &plain)
        .await
        .expect("config");
    assert_eq!(base["intercept.v1"], json!({"port": 22}));
    assert_eq!(base["host.v1"], json!({"address": "10.0.0.5"}));

    let merged = services::effective_config(&mut tx, &service, &tuned)
        .await
        .expect("config");
    assert_eq!(merged["intercept.v1"], json!({"port": 2222}));
    assert_eq!(merged["host.v1"], json!({"address": "10.0.0.5"}));
}
