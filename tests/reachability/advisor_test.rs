//! Tests for `PolicyAdvisor` diagnostics.

use edgeward::roles::Semantic;
use edgeward::types::{
    EdgeRouter, EdgeRouterPolicy, Identity, Service, ServiceEdgeRouterPolicy, ServicePolicy,
    SessionType,
};
use edgeward::Env;

fn roles(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_owned()).collect()
}

#[tokio::test]
async fn analysis_reports_permissions_counts_and_connectivity() {
    let env = Env::in_memory().await.expect("env");
    let identity = Identity::new("jules", roles(&["ops"]));
    let service = Service::new("grafana", roles(&["monitoring"]));
    let near = EdgeRouter::new("near", roles(&["dc1"]));
    let far = EdgeRouter::new("far", roles(&["dc2"]));
    env.create(identity.clone()).await.expect("identity");
    env.create(service.clone()).await.expect("service");
    env.create(near.clone()).await.expect("router");
    env.create(far.clone()).await.expect("router");

    env.create(ServicePolicy::new(
        "ops-dial-monitoring",
        SessionType::Dial,
        Semantic::AnyOf,
        roles(&["#ops"]),
        roles(&["#monitoring"]),
    ))
    .await
    .expect("policy");
    let erp = env
        .create(EdgeRouterPolicy::new(
            "ops-routers",
            Semantic::AnyOf,
            roles(&["#ops"]),
            roles(&["#dc1", "#dc2"]),
        ))
        .await
        .expect("erp");
    let serp = env
        .create(ServiceEdgeRouterPolicy::new(
            "monitoring-dc1",
            Semantic::AnyOf,
            roles(&["#monitoring"]),
            roles(&["#dc1"]),
        ))
        .await
        .expect("serp");

    env.online_routers.set_online(&near.id, true);

    let report = env
        .advisor
        .analyze_service_reachability(&identity.id, &service.id)
        .await
        .expect("analysis");
    assert!(report.is_dial_allowed);
    assert!(!report.is_bind_allowed);
    assert_eq!(report.identity_router_count, 2);
    assert_eq!(report.service_router_count, 1);
    assert_eq!(report.common_routers.len(), 1);

    let common = &report.common_routers[0];
    assert_eq!(common.router.id, near.id);
    assert!(common.is_online);
    assert_eq!(common.identity_policies, vec![erp]);
    assert_eq!(common.service_policies, vec![serp]);
}

#[tokio::test]
async fn offline_routers_are_still_listed() {
    let env = Env::in_memory().await.expect("env");
    let identity = Identity::new("kim", roles(&["ops"]));
    let service = Service::new("logs", roles(&["monitoring"]));
    let router = EdgeRouter::new("edge", Vec::new());
    env.create(identity.clone()).await.expect("identity");
    env.create(service.clone()).await.expect("service");
    env.create(router.clone()).await.expect("router");
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

    let report = env
        .advisor
        .analyze_service_reachability(&identity.id, &service.id)
        .await
        .expect("analysis");
    assert!(!report.is_dial_allowed);
    assert_eq!(report.common_routers.len(), 1);
    assert!(!report.common_routers[0].is_online);
}

#[tokio::test]
async fn link_inspection_lists_policies_and_rejects_unknown_entities() {
    let env = Env::in_memory().await.expect("env");
    let identity = Identity::new("lee", roles(&["ops"]));
    let service = Service::new("pager", roles(&["alerts"]));
    let router = EdgeRouter::new("edge", roles(&["dc1"]));
    env.create(identity.clone()).await.expect("identity");
    env.create(service.clone()).await.expect("service");
    env.create(router.clone()).await.expect("router");

    let bind = env
        .create(ServicePolicy::new(
            "ops-bind-alerts",
            SessionType::Bind,
            Semantic::AllOf,
            roles(&["#ops"]),
            roles(&["#alerts"]),
        ))
        .await
        .expect("policy");

    let links = env
        .advisor
        .inspect_identity_service_links(&identity.id, &service.id)
        .await
        .expect("inspect");
    assert_eq!(links.from_id, identity.id);
    assert_eq!(links.to_id, service.id);
    assert_eq!(links.policies, vec![bind]);

    let none = env
        .advisor
        .inspect_identity_edge_router_links(&identity.id, &router.id)
        .await
        .expect("inspect");
    assert!(none.policies.is_empty());

    let err = env
        .advisor
        .inspect_service_edge_router_links(&service.id, "missing-router")
        .await
        .expect_err("unknown router");
    assert!(err.is_not_found());
    let err = env
        .advisor
        .analyze_service_reachability("missing-identity", &service.id)
        .await
        .expect_err("unknown identity");
    assert!(err.is_not_found());
}

#[tokio::test]
async fn admins_share_every_router_with_any_service() {
    let env = Env::in_memory().await.expect("env");
    let mut admin = Identity::new("ops-admin", Vec::new());
    admin.is_admin = true;
    let service = Service::new("billing", roles(&["finance"]));
    let router = EdgeRouter::new("edge", Vec::new());
    env.create(admin.clone()).await.expect("admin");
    env.create(service.clone()).await.expect("service");
    env.create(router.clone()).await.expect("router");

    let report = env
        .advisor
        .analyze_service_reachability(&admin.id, &service.id)
        .await
        .expect("analysis");
    assert!(report.is_dial_allowed);
    assert!(report.is_bind_allowed);
    assert_eq!(report.identity_router_count, 1);
    assert_eq!(report.service_router_count, 0);
    assert_eq!(report.common_routers.len(), 1);
    assert!(report.common_routers[0].service_policies.is_empty());
}
