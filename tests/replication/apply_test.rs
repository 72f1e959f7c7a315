//! Tests for command dispatch and log replay.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use edgeward::admission::SessionAdmissionController;
use edgeward::config::PostureConfig;
use edgeward::posture::{PostureCache, PostureEvaluator};
use edgeward::replication::{wire, Applier, Command, Replicator};
use edgeward::roles::Semantic;
use edgeward::store::Db;
use edgeward::types::{
    ApiSession, EdgeRouter, EdgeRouterPolicy, EntityKind, Identity, Service,
    ServiceEdgeRouterPolicy, ServicePolicy, SessionType,
};
use edgeward::{Env, ErrorCode, ReplicationError};
use tokio::sync::Notify;

fn roles(values: &[&str]) -> Vec<String> {
    values.iter().map(|v| (*v).to_owned()).collect()
}

fn applier(db: &Db) -> Applier {
    let posture = Arc::new(PostureCache::new(&PostureConfig::default()));
    Applier::new(db.clone(), posture, Arc::new(Notify::new()))
}

/// Applies locally and keeps every encoded entry.
struct RecordingReplicator {
    applier: Applier,
    log: Mutex<Vec<Vec<u8>>>,
}

#[async_trait]
impl Replicator for RecordingReplicator {
    async fn dispatch(&self, command: Command) -> Result<String, ReplicationError> {
        let entry = wire::marshal(&command)?;
        let id = self.applier.apply(wire::unmarshal(&entry)?).await?;
        if let Ok(mut log) = self.log.lock() {
            log.push(entry);
        }
        Ok(id)
    }
}

/// Never reaches a quorum.
struct NoQuorum;

#[async_trait]
impl Replicator for NoQuorum {
    async fn dispatch(&self, _command: Command) -> Result<String, ReplicationError> {
        Err(ReplicationError::Unavailable("no leader".to_owned()))
    }
}

async fn table_rows(db: &Db, sql: &str) -> Vec<(String, String)> {
    sqlx::query_as::<_, (String, String)>(sql)
        .fetch_all(db.pool())
        .await
        .expect("query")
}

#[tokio::test]
async fn replaying_the_log_reproduces_state() {
    let leader = Db::open_in_memory().await.expect("leader db");
    let replicator = RecordingReplicator {
        applier: applier(&leader),
        log: Mutex::new(Vec::new()),
    };

    let identity = Identity::new("olga", roles(&["eng"]));
    let service = Service::new("api", roles(&["web"]));
    let api_session = ApiSession::new(identity.id.clone());
    let commands = vec![
        Command::create(identity.clone()),
        Command::create(service.clone()),
        Command::create(EdgeRouter::new("edge", roles(&["edge"]))),
        Command::create(ServicePolicy::new(
            "eng-web",
            SessionType::Dial,
            Semantic::AnyOf,
            roles(&["#eng"]),
            roles(&["#web"]),
        )),
        Command::create(EdgeRouterPolicy::new(
            "eng-edge",
            Semantic::AnyOf,
            roles(&["#eng"]),
            roles(&["#edge"]),
        )),
        Command::create(ServiceEdgeRouterPolicy::new(
            "web-edge",
            Semantic::AnyOf,
            roles(&["#web"]),
            roles(&["#edge"]),
        )),
        Command::create(api_session.clone()),
        Command::create(ApiSession::new(identity.id.clone())),
    ];
    for command in commands {
        replicator.dispatch(command).await.expect("dispatch");
    }
    replicator
        .dispatch(Command::delete(EntityKind::Service, service.id.clone()))
        .await
        .expect("delete service");
    replicator
        .dispatch(Command::delete(EntityKind::ApiSession, api_session.id.clone()))
        .await
        .expect("delete api session");

    let follower = Db::open_in_memory().await.expect("follower db");
    let follower_applier = applier(&follower);
    let entries = replicator.log.lock().expect("log").clone();
    for entry in &entries {
        let command = wire::unmarshal(entry).expect("decode");
        follower_applier.apply(command).await.expect("replay");
    }

    let links = "SELECT policy_id, entity_id FROM policy_links ORDER BY policy_id, entity_id";
    assert_eq!(table_rows(&leader, links).await, table_rows(&follower, links).await);
    let sessions = "SELECT id, identity_id FROM api_sessions ORDER BY id";
    assert_eq!(
        table_rows(&leader, sessions).await,
        table_rows(&follower, sessions).await
    );
    let events = "SELECT event_type, data FROM eventual_events ORDER BY id";
    assert_eq!(table_rows(&leader, events).await, table_rows(&follower, events).await);
}

#[tokio::test]
async fn rejected_commands_write_nothing() {
    let env = Env::in_memory().await.expect("env");
    let err = env
        .create(EdgeRouterPolicy::new(
            "bad",
            Semantic::AnyOf,
            roles(&["@missing"]),
            Vec::new(),
        ))
        .await
        .expect_err("rejected");
    assert!(matches!(err, ReplicationError::Rejected(_)));

    let policies: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM edge_router_policies")
        .fetch_one(env.db.pool())
        .await
        .expect("count");
    assert_eq!(policies, 0);
}

#[tokio::test]
async fn unavailable_replication_surfaces_as_retryable() {
    let env = Env::in_memory().await.expect("env");
    let identity = Identity::new("pat", roles(&["eng"]));
    let service = Service::new("web", roles(&["web"]));
    env.create(identity.clone()).await.expect("identity");
    env.create(service.clone()).await.expect("service");
    env.create(EdgeRouter::new("edge", Vec::new()))
        .await
        .expect("router");
    env.create(ServicePolicy::new(
        "eng-web",
        SessionType::Dial,
        Semantic::AnyOf,
        roles(&["#eng"]),
        roles(&["#web"]),
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

    let evaluator = PostureEvaluator::new(env.db.clone(), Arc::clone(&env.posture));
    let partitioned = SessionAdmissionController::new(env.db.clone(), Arc::new(NoQuorum), evaluator);
    let err = partitioned
        .create_session(&api_session_id, &service.id, SessionType::Dial)
        .await
        .expect_err("no quorum");
    assert_eq!(err.code(), ErrorCode::Unavailable);

    let sessions: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM sessions")
        .fetch_one(env.db.pool())
        .await
        .expect("count");
    assert_eq!(sessions, 0);

    env.admission
        .create_session(&api_session_id, &service.id, SessionType::Dial)
        .await
        .expect("retry on a healthy node succeeds");
}
