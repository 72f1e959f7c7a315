//! Component wiring.
//!
//! [`Env`] owns one instance of every component, all sharing the same
//! database, posture cache and replicator.

use std::path::Path;
use std::sync::Arc;

use tokio::sync::{watch, Notify};
use tokio::task::JoinHandle;
use tracing::info;

use crate::activity::HeartbeatCollector;
use crate::admission::SessionAdmissionController;
use crate::advisor::{OnlineRouterRegistry, PolicyAdvisor, RouterStatus};
use crate::api_sessions::ApiSessionManager;
use crate::cascade::CascadeProcessor;
use crate::config::EdgewardConfig;
use crate::error::{ReplicationError, StoreError};
use crate::posture::{PostureCache, PostureEnforcer, PostureEvaluator};
use crate::reachability::EdgeRouterResolver;
use crate::replication::apply::Applier;
use crate::replication::{Command, EntityPayload, LocalReplicator, Replicator};
use crate::store::{Db, FieldSet};
use crate::types::EntityKind;

/// Every component of a controller node.
pub struct Env {
    /// Storage.
    pub db: Db,
    /// Endpoint posture.
    pub posture: Arc<PostureCache>,
    /// Mutation path for replicated entities.
    pub replicator: Arc<dyn Replicator>,
    /// Posture evaluation.
    pub evaluator: PostureEvaluator,
    /// Session issuance.
    pub admission: SessionAdmissionController,
    /// Api session lifecycle.
    pub api_sessions: ApiSessionManager,
    /// Router reachability.
    pub routers: EdgeRouterResolver,
    /// Reachability diagnosis.
    pub advisor: PolicyAdvisor,
    /// Router connectivity reported by the data plane.
    pub online_routers: Arc<OnlineRouterRegistry>,
    /// Api session heartbeats.
    pub heartbeats: Arc<HeartbeatCollector>,
    /// Deferred cascades.
    pub cascade: Arc<CascadeProcessor>,
    /// Posture revocation.
    pub enforcer: PostureEnforcer,
}

impl std::fmt::Debug for Env {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Env").field("db", &self.db).finish_non_exhaustive()
    }
}

impl Env {
    /// Open storage as configured and wire every component.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the database cannot be opened.
    pub async fn open(config: &EdgewardConfig) -> Result<Self, StoreError> {
        let db = match &config.database.path {
            Some(path) => Db::open(Path::new(path), &config.database).await?,
            None => Db::open_in_memory().await?,
        };
        Ok(Self::with_db(db, config))
    }

    /// In-memory node with default settings.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if the schema cannot be created.
    pub async fn in_memory() -> Result<Self, StoreError> {
        let db = Db::open_in_memory().await?;
        Ok(Self::with_db(db, &EdgewardConfig::default()))
    }

    /// Wire every component around an open database.
    pub fn with_db(db: Db, config: &EdgewardConfig) -> Self {
        let posture = Arc::new(PostureCache::new(&config.posture));
        let cascade_signal = Arc::new(Notify::new());
        let applier = Applier::new(db.clone(), Arc::clone(&posture), Arc::clone(&cascade_signal));
        let replicator: Arc<dyn Replicator> = Arc::new(LocalReplicator::new(applier));

        let evaluator = PostureEvaluator::new(db.clone(), Arc::clone(&posture));
        let heartbeats = Arc::new(HeartbeatCollector::new(db.clone(), &config.activity));
        let online_routers = Arc::new(OnlineRouterRegistry::new());

        Self {
            admission: SessionAdmissionController::new(
                db.clone(),
                Arc::clone(&replicator),
                evaluator.clone(),
            ),
            api_sessions: ApiSessionManager::new(
                db.clone(),
                Arc::clone(&replicator),
                Arc::clone(&posture),
                Arc::clone(&heartbeats),
            ),
            routers: EdgeRouterResolver::new(
                db.clone(),
                Arc::clone(&online_routers) as Arc<dyn RouterStatus>,
            ),
            advisor: PolicyAdvisor::new(db.clone(), Arc::clone(&online_routers) as Arc<dyn RouterStatus>),
            cascade: Arc::new(CascadeProcessor::new(db.clone(), cascade_signal, &config.cascade)),
            enforcer: PostureEnforcer::new(
                db.clone(),
                evaluator.clone(),
                Arc::clone(&replicator),
                &config.posture,
            ),
            online_routers,
            heartbeats,
            evaluator,
            replicator,
            posture,
            db,
        }
    }

    /// Create an entity. Returns its id.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError`] if the command is rejected or not
    /// replicated.
    pub async fn create(&self, entity: impl Into<EntityPayload>) -> Result<String, ReplicationError> {
        self.replicator.dispatch(Command::create(entity)).await
    }

    /// Update the given fields of an entity.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError`] if the command is rejected or not
    /// replicated.
    pub async fn update(
        &self,
        entity: impl Into<EntityPayload>,
        fields: FieldSet,
    ) -> Result<String, ReplicationError> {
        self.replicator.dispatch(Command::update(entity, fields)).await
    }

    /// Delete an entity.
    ///
    /// # Errors
    ///
    /// Returns [`ReplicationError`] if the command is rejected or not
    /// replicated.
    pub async fn delete(&self, kind: EntityKind, id: &str) -> Result<(), ReplicationError> {
        self.replicator.dispatch(Command::delete(kind, id)).await?;
        Ok(())
    }

    /// Start the activity flusher, cascade processor and posture enforcer.
    /// They stop when `shutdown_rx` turns true.
    pub fn spawn_background(&self, shutdown_rx: watch::Receiver<bool>) -> Vec<JoinHandle<()>> {
        info!("starting background tasks");
        vec![
            tokio::spawn(Arc::clone(&self.heartbeats).run(shutdown_rx.clone())),
            tokio::spawn(Arc::clone(&self.cascade).run(shutdown_rx.clone())),
            tokio::spawn(
                self.enforcer
                    .clone()
                    .run(self.posture.subscribe(), shutdown_rx),
            ),
        ]
    }
}
