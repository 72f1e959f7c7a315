//! Tests for the policy link index.

use edgeward::roles::Semantic;
use edgeward::store::links::{self, LinkDiscrepancy};
use edgeward::store::{FieldSet, Repository};
use edgeward::types::{EdgeRouter, EdgeRouterPolicy, EntityKind, Identity};
use edgeward::{Env, ReplicationError, StoreError};

fn roles(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_owned()).collect()
}

async fn linked_identities(env: &Env, policy_id: &str) -> Vec<String> {
    let mut tx = env.db.view().await.expect("view");
    links::related_entities(&mut tx, policy_id, EntityKind::Identity)
        .await
        .expect("related entities")
}

async fn two_identities(env: &Env) -> (Identity, Identity) {
    let eng = Identity::new("eng-prod", roles(&["eng", "prod"]));
    let sales = Identity::new("sales", roles(&["sales"]));
    env.create(eng.clone()).await.expect("identity");
    env.create(sales.clone()).await.expect("identity");
    (eng, sales)
}

#[tokio::test]
async fn empty_expression_depends_on_semantic() {
    let env = Env::in_memory().await.expect("env");
    two_identities(&env).await;

    let all_of = env
        .create(EdgeRouterPolicy::new("all-of-empty", Semantic::AllOf, Vec::new(), Vec::new()))
        .await
        .expect("policy");
    let any_of = env
        .create(EdgeRouterPolicy::new("any-of-empty", Semantic::AnyOf, Vec::new(), Vec::new()))
        .await
        .expect("policy");

    assert_eq!(linked_identities(&env, &all_of).await.len(), 2);
    assert!(linked_identities(&env, &any_of).await.is_empty());
}

#[tokio::test]
async fn all_of_requires_every_attribute() {
    let env = Env::in_memory().await.expect("env");
    let (eng, _) = two_identities(&env).await;

    let both = env
        .create(EdgeRouterPolicy::new(
            "eng-and-prod",
            Semantic::AllOf,
            roles(&["#eng", "#prod"]),
            Vec::new(),
        ))
        .await
        .expect("policy");
    let either = env
        .create(EdgeRouterPolicy::new(
            "eng-or-sales",
            Semantic::AnyOf,
            roles(&["#eng", "#sales"]),
            Vec::new(),
        ))
        .await
        .expect("policy");

    assert_eq!(linked_identities(&env, &both).await, vec![eng.id]);
    assert_eq!(linked_identities(&env, &either).await.len(), 2);
}

#[tokio::test]
async fn all_role_dominates_other_terms() {
    let env = Env::in_memory().await.expect("env");
    two_identities(&env).await;

    let policy = env
        .create(EdgeRouterPolicy::new(
            "everyone",
            Semantic::AllOf,
            roles(&["#all", "#nobody-has-this"]),
            Vec::new(),
        ))
        .await
        .expect("policy");
    assert_eq!(linked_identities(&env, &policy).await.len(), 2);

    let late = Identity::new("late", Vec::new());
    env.create(late.clone()).await.expect("identity");
    assert!(linked_identities(&env, &policy).await.contains(&late.id));
}

#[tokio::test]
async fn entity_reference_must_exist() {
    let env = Env::in_memory().await.expect("env");
    let (eng, sales) = two_identities(&env).await;

    let err = env
        .create(EdgeRouterPolicy::new(
            "dangling",
            Semantic::AnyOf,
            roles(&["@no-such-identity"]),
            Vec::new(),
        ))
        .await
        .expect_err("reference to a missing identity");
    assert!(matches!(err, ReplicationError::Rejected(StoreError::Field(_))));

    let policy = env
        .create(EdgeRouterPolicy::new(
            "by-id",
            Semantic::AnyOf,
            vec![format!("@{}", sales.id)],
            Vec::new(),
        ))
        .await
        .expect("policy");
    let linked = linked_identities(&env, &policy).await;
    assert_eq!(linked, vec![sales.id]);
    assert!(!linked.contains(&eng.id));
}

#[tokio::test]
async fn deleting_entities_and_policies_drops_links() {
    let env = Env::in_memory().await.expect("env");
    let (eng, _) = two_identities(&env).await;
    let router = EdgeRouter::new("edge", roles(&["edge"]));
    env.create(router.clone()).await.expect("router");
    let policy = env
        .create(EdgeRouterPolicy::new(
            "eng-edge",
            Semantic::AnyOf,
            roles(&["#eng"]),
            roles(&["#edge"]),
        ))
        .await
        .expect("policy");

    env.delete(EntityKind::Identity, &eng.id).await.expect("delete identity");
    assert!(linked_identities(&env, &policy).await.is_empty());

    env.delete(EntityKind::EdgeRouterPolicy, &policy)
        .await
        .expect("delete policy");
    let rows: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM policy_links")
        .fetch_one(env.db.pool())
        .await
        .expect("count");
    assert_eq!(rows, 0);
}

#[tokio::test]
async fn deleted_entity_is_removed_from_policy_roles() {
    let env = Env::in_memory().await.expect("env");
    let (eng, _) = two_identities(&env).await;
    let temp = Identity::new("temp", Vec::new());
    env.create(temp.clone()).await.expect("identity");
    let policy_id = env
        .create(EdgeRouterPolicy::new(
            "temp-and-eng",
            Semantic::AnyOf,
            vec![format!("@{}", temp.id), "#eng".to_owned()],
            roles(&["#edge"]),
        ))
        .await
        .expect("policy");

    env.delete(EntityKind::Identity, &temp.id).await.expect("delete identity");

    let mut stored = {
        let mut tx = env.db.view().await.expect("view");
        EdgeRouterPolicy::load(&mut tx, &policy_id)
            .await
            .expect("load")
            .expect("policy kept")
    };
    assert_eq!(stored.identity_roles, roles(&["#eng"]));
    assert_eq!(linked_identities(&env, &policy_id).await, vec![eng.id.clone()]);

    stored.edge_router_roles = roles(&["#core"]);
    env.update(stored, FieldSet::of(["edgeRouterRoles"]))
        .await
        .expect("other side still updatable");
    assert_eq!(linked_identities(&env, &policy_id).await, vec![eng.id]);

    let mut tx = env.db.view().await.expect("view");
    assert!(links::check_integrity(&mut tx, false)
        .await
        .expect("check")
        .is_empty());
}

#[tokio::test]
async fn references_by_name_are_stored_as_ids() {
    let env = Env::in_memory().await.expect("env");
    let (_, sales) = two_identities(&env).await;

    let policy_id = env
        .create(EdgeRouterPolicy::new(
            "sales-by-name",
            Semantic::AnyOf,
            roles(&["@sales"]),
            Vec::new(),
        ))
        .await
        .expect("policy");

    let mut tx = env.db.view().await.expect("view");
    let stored = EdgeRouterPolicy::load(&mut tx, &policy_id)
        .await
        .expect("load")
        .expect("policy");
    drop(tx);
    assert_eq!(stored.identity_roles, vec![format!("@{}", sales.id)]);
    assert_eq!(linked_identities(&env, &policy_id).await, vec![sales.id]);
}

#[tokio::test]
async fn integrity_check_finds_and_repairs_tampering() {
    let env = Env::in_memory().await.expect("env");
    let (eng, sales) = two_identities(&env).await;
    let policy = env
        .create(EdgeRouterPolicy::new(
            "eng-only",
            Semantic::AnyOf,
            roles(&["#eng"]),
            Vec::new(),
        ))
        .await
        .expect("policy");

    {
        let mut tx = env.db.view().await.expect("view");
        let clean = links::check_integrity(&mut tx, false).await.expect("check");
        assert!(clean.is_empty());
    }

    sqlx::query("DELETE FROM policy_links WHERE entity_id = ?")
        .bind(&eng.id)
        .execute(env.db.pool())
        .await
        .expect("remove link");
    sqlx::query(
        "INSERT INTO policy_links (policy_kind, policy_id, entity_kind, entity_id) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(EntityKind::EdgeRouterPolicy.as_str())
    .bind(&policy)
    .bind(EntityKind::Identity.as_str())
    .bind(&sales.id)
    .execute(env.db.pool())
    .await
    .expect("add bogus link");

    let mut txn = env.db.update().await.expect("update");
    let found = links::check_integrity(&mut txn, true).await.expect("check");
    txn.commit().await.expect("commit");
    assert_eq!(found.len(), 2);
    assert!(found
        .iter()
        .any(|d| matches!(d, LinkDiscrepancy::Missing(l) if l.entity_id == eng.id)));
    assert!(found
        .iter()
        .any(|d| matches!(d, LinkDiscrepancy::Stale(l) if l.entity_id == sales.id)));

    assert_eq!(linked_identities(&env, &policy).await, vec![eng.id]);
    let mut tx = env.db.view().await.expect("view");
    assert!(links::check_integrity(&mut tx, false)
        .await
        .expect("check")
        .is_empty());
}
