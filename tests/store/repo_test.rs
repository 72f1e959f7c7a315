//! Tests for entity validation and persistence rules.

use edgeward::roles::Semantic;
use edgeward::store::repo::{self, SessionFilter};
use edgeward::store::{FieldSet, Repository};
use edgeward::types::{
    Config, EdgeRouter, EdgeRouterPolicy, EntityKind, Identity, PostureCheck, PostureCheckKind,
    Service, ServiceEdgeRouterPolicy, ServicePolicy, SessionType,
};
use edgeward::{Env, ReplicationError, StoreError};
use serde_json::json;

fn roles(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_owned()).collect()
}

#[tokio::test]
async fn names_are_unique_per_kind() {
    let env = Env::in_memory().await.expect("env");
    env.create(Identity::new("dup", Vec::new()))
        .await
        .expect("first");
    let err = env
        .create(Identity::new("dup", Vec::new()))
        .await
        .expect_err("second");
    assert!(matches!(
        err,
        ReplicationError::Rejected(StoreError::Conflict { field: "name", .. })
    ));

    env.create(Service::new("dup", Vec::new()))
        .await
        .expect("other kinds may reuse the name");
}

#[tokio::test]
async fn prefixed_role_attributes_are_rejected() {
    let env = Env::in_memory().await.expect("env");
    let err = env
        .create(EdgeRouter::new("edge", roles(&["#edge"])))
        .await
        .expect_err("attribute with #");
    match err {
        ReplicationError::Rejected(StoreError::Field(field)) => {
            assert_eq!(field.field, "roleAttributes");
        }
        other => panic!("expected field error, got {other:?}"),
    }
}

#[tokio::test]
async fn posture_check_kind_is_immutable() {
    let env = Env::in_memory().await.expect("env");
    let check = PostureCheck::new(
        "domain",
        Vec::new(),
        PostureCheckKind::Domain {
            domains: roles(&["corp.example"]),
        },
    );
    env.create(check.clone()).await.expect("create");

    let mut changed = check.clone();
    changed.kind = PostureCheckKind::Mac {
        mac_addresses: roles(&["aa:bb:cc:dd:ee:ff"]),
    };
    let err = env
        .update(changed, FieldSet::of(["kind"]))
        .await
        .expect_err("kind change");
    assert!(matches!(err, ReplicationError::Rejected(StoreError::Field(_))));

    let mut widened = check.clone();
    widened.kind = PostureCheckKind::Domain {
        domains: roles(&["corp.example", "lab.example"]),
    };
    env.update(widened, FieldSet::of(["kind"]))
        .await
        .expect("same kind, new payload");

    let mut tx = env.db.view().await.expect("view");
    let stored = repo::load_required::<PostureCheck>(&mut tx, &check.id)
        .await
        .expect("load");
    assert_eq!(stored.version, 2);
    assert_eq!(
        stored.kind,
        PostureCheckKind::Domain {
            domains: roles(&["corp.example", "lab.example"]),
        }
    );
}

#[tokio::test]
async fn referenced_configs_cannot_be_deleted() {
    let env = Env::in_memory().await.expect("env");
    let config = Config::new("intercept", "intercept.v1", json!({"port": 443}));
    env.create(config.clone()).await.expect("config");
    let mut service = Service::new("portal", Vec::new());
    service.configs = vec![config.id.clone()];
    env.create(service.clone()).await.expect("service");

    let err = env
        .delete(EntityKind::Config, &config.id)
        .await
        .expect_err("still referenced");
    assert!(matches!(err, ReplicationError::Rejected(StoreError::Field(_))));

    service.configs.clear();
    env.update(service, FieldSet::of(["configs"]))
        .await
        .expect("detach config");
    env.delete(EntityKind::Config, &config.id)
        .await
        .expect("config is free");
}

#[tokio::test]
async fn service_configs_must_exist_and_differ_in_type() {
    let env = Env::in_memory().await.expect("env");
    let mut service = Service::new("portal", Vec::new());
    service.configs = vec!["missing".to_owned()];
    assert!(env.create(service).await.is_err());

    let a = Config::new("a", "host.v1", json!({}));
    let b = Config::new("b", "host.v1", json!({}));
    env.create(a.clone()).await.expect("config");
    env.create(b.clone()).await.expect("config");
    let mut service = Service::new("portal", Vec::new());
    service.configs = vec![a.id, b.id];
    let err = env.create(service).await.expect_err("duplicate type");
    assert!(matches!(err, ReplicationError::Rejected(StoreError::Field(_))));
}

#[tokio::test]
async fn deleting_a_service_removes_its_sessions() {
    let env = Env::in_memory().await.expect("env");
    let identity = Identity::new("mo", roles(&["eng"]));
    let service = Service::new("shell", roles(&["ssh"]));
    env.create(identity.clone()).await.expect("identity");
    env.create(service.clone()).await.expect("service");
    env.create(EdgeRouter::new("edge", Vec::new()))
        .await
        .expect("router");
    env.create(ServicePolicy::new(
        "eng-ssh",
        SessionType::Dial,
        Semantic::AnyOf,
        roles(&["#eng"]),
        roles(&["#ssh"]),
    ))
    .await
    .expect("policy");
    env.create(EdgeRouterPolicy::new(
        "all",
        Semantic::AnyOf,
        roles(&["#all"]),
        roles(&["#all"]),
    ))
    .await
    .expect("erp");
    env.create(ServiceEdgeRouterPolicy::new(
        "all",
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
    env.admission
        .create_session(&api_session_id, &service.id, SessionType::Dial)
        .await
        .expect("session");

    let filter = SessionFilter {
        service_id: Some(service.id.clone()),
        ..SessionFilter::default()
    };
    {
        let mut tx = env.db.view().await.expect("view");
        assert_eq!(repo::list_sessions(&mut tx, &filter).await.expect("list").len(), 1);
    }

    env.delete(EntityKind::Service, &service.id)
        .await
        .expect("delete service");
    let mut tx = env.db.view().await.expect("view");
    assert!(repo::list_sessions(&mut tx, &filter)
        .await
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn session_filter_with_no_service_ids_matches_nothing() {
    let env = Env::in_memory().await.expect("env");
    let mut tx = env.db.view().await.expect("view");
    let filter = SessionFilter {
        service_ids: Some(Vec::new()),
        ..SessionFilter::default()
    };
    assert!(repo::list_sessions(&mut tx, &filter)
        .await
        .expect("list")
        .is_empty());
}

#[tokio::test]
async fn partial_updates_leave_other_fields_alone() {
    let env = Env::in_memory().await.expect("env");
    let identity = Identity::new("nia", roles(&["eng"]));
    env.create(identity.clone()).await.expect("identity");

    let mut update = identity.clone();
    update.name = "nia-renamed".to_owned();
    update.role_attributes = roles(&["ignored"]);
    env.update(update, FieldSet::of(["name"]))
        .await
        .expect("rename");

    let mut tx = env.db.view().await.expect("view");
    let stored = Identity::load(&mut tx, &identity.id)
        .await
        .expect("load")
        .expect("present");
    assert_eq!(stored.name, "nia-renamed");
    assert_eq!(stored.role_attributes, roles(&["eng"]));
}
