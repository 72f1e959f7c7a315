//! Apply step: the only place replicated entities are written.
//!
//! Each command runs in one write transaction together with its link-index
//! maintenance and cascade bookkeeping. In-memory side effects (posture data
//! cleanup, waking the cascade processor) run after commit.

use std::sync::Arc;

use sqlx::SqliteConnection;
use tokio::sync::Notify;
use tracing::{debug, info};

use super::{Command, EntityPayload};
use crate::cascade;
use crate::error::{FieldError, StoreError};
use crate::posture::PostureCache;
use crate::store::repo::{self, load_required};
use crate::store::{links, Db, FieldSet, Repository};
use crate::types::policy::Policy;
use crate::types::{
    ApiSession, Config, EdgeRouter, EdgeRouterPolicy, EntityKind, Identity, PostureCheck, Service,
    ServiceEdgeRouterPolicy, ServicePolicy, Session,
};

/// Side effects to run once the transaction committed.
#[derive(Debug, Default)]
struct AfterCommit {
    deleted_api_sessions: Vec<(String, String)>,
    deleted_identities: Vec<String>,
    cascade_queued: bool,
}

/// Applies replicated commands to local storage.
pub struct Applier {
    db: Db,
    posture: Arc<PostureCache>,
    cascade_signal: Arc<Notify>,
}

impl Applier {
    /// New applier writing to `db`.
    pub fn new(db: Db, posture: Arc<PostureCache>, cascade_signal: Arc<Notify>) -> Self {
        Self {
            db,
            posture,
            cascade_signal,
        }
    }

    /// Apply one command in its own write transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if validation, a lookup or the write fails; the
    /// transaction is rolled back.
    pub async fn apply(&self, command: Command) -> Result<String, StoreError> {
        let mut txn = self.db.update().await?;
        let mut after = AfterCommit::default();

        let id = match command {
            Command::Create { entity } => create(&mut txn, entity).await?,
            Command::Update { entity, fields } => update(&mut txn, entity, &fields).await?,
            Command::Delete { kind, id } => {
                delete(&mut txn, kind, &id, &mut after).await?;
                id
            }
        };

        txn.commit().await?;
        self.after_commit(after);
        Ok(id)
    }

    fn after_commit(&self, after: AfterCommit) {
        for (identity_id, api_session_id) in &after.deleted_api_sessions {
            self.posture.api_session_deleted(identity_id, api_session_id);
        }
        for identity_id in &after.deleted_identities {
            self.posture.identity_deleted(identity_id);
        }
        if after.cascade_queued {
            self.cascade_signal.notify_one();
        }
    }
}

// ---------------------------------------------------------------------------
// Create
// ---------------------------------------------------------------------------

async fn create(conn: &mut SqliteConnection, entity: EntityPayload) -> Result<String, StoreError> {
    entity.validate()?;

    match entity {
        EntityPayload::Identity(e) => {
            e.insert(conn).await?;
            links::entity_changed(conn, EntityKind::Identity, &e.id, &e.role_attributes).await?;
            Ok(e.id)
        }
        EntityPayload::Service(e) => {
            check_service_configs(conn, &e).await?;
            e.insert(conn).await?;
            links::entity_changed(conn, EntityKind::Service, &e.id, &e.role_attributes).await?;
            Ok(e.id)
        }
        EntityPayload::EdgeRouter(e) => {
            e.insert(conn).await?;
            links::entity_changed(conn, EntityKind::EdgeRouter, &e.id, &e.role_attributes).await?;
            Ok(e.id)
        }
        EntityPayload::PostureCheck(e) => {
            e.insert(conn).await?;
            links::entity_changed(conn, EntityKind::PostureCheck, &e.id, &e.role_attributes)
                .await?;
            Ok(e.id)
        }
        EntityPayload::Config(e) => {
            e.insert(conn).await?;
            Ok(e.id)
        }
        EntityPayload::ServicePolicy(mut p) => {
            links::resolve_entity_names(conn, &mut p).await?;
            p.insert(conn).await?;
            links::policy_changed(conn, &p).await?;
            Ok(p.id)
        }
        EntityPayload::EdgeRouterPolicy(mut p) => {
            links::resolve_entity_names(conn, &mut p).await?;
            p.insert(conn).await?;
            links::policy_changed(conn, &p).await?;
            Ok(p.id)
        }
        EntityPayload::ServiceEdgeRouterPolicy(mut p) => {
            links::resolve_entity_names(conn, &mut p).await?;
            p.insert(conn).await?;
            links::policy_changed(conn, &p).await?;
            Ok(p.id)
        }
        EntityPayload::ApiSession(s) => {
            load_required::<Identity>(conn, &s.identity_id).await?;
            s.insert(conn).await?;
            Ok(s.id)
        }
        EntityPayload::Session(s) => create_session(conn, s).await,
    }
}

/// Insert a session unless its (api session, type, service) tuple already
/// has one, in which case the existing id wins.
async fn create_session(conn: &mut SqliteConnection, session: Session) -> Result<String, StoreError> {
    if let Some(existing) = crate::store::repo::find_session_for_tuple(
        conn,
        &session.api_session_id,
        session.session_type,
        &session.service_id,
    )
    .await?
    {
        debug!(
            session_id = %existing,
            api_session_id = %session.api_session_id,
            "session already exists for tuple"
        );
        return Ok(existing);
    }

    load_required::<ApiSession>(conn, &session.api_session_id).await?;
    load_required::<Service>(conn, &session.service_id).await?;
    session.insert(conn).await?;
    Ok(session.id)
}

async fn check_service_configs(conn: &mut SqliteConnection, service: &Service) -> Result<(), StoreError> {
    let mut seen_types: Vec<String> = Vec::with_capacity(service.configs.len());
    for config_id in &service.configs {
        let Some(config) = Config::load(conn, config_id).await? else {
            return Err(FieldError::new("config not found", "configs", config_id.as_str()).into());
        };
        if seen_types.contains(&config.config_type) {
            return Err(FieldError::new(
                format!("multiple configs of type {}", config.config_type),
                "configs",
                config_id.as_str(),
            )
            .into());
        }
        seen_types.push(config.config_type);
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Update
// ---------------------------------------------------------------------------

/// Load, check, patch, validate and save one entity.
async fn patch_entity<E: Repository>(
    conn: &mut SqliteConnection,
    update: &E,
    fields: &FieldSet,
) -> Result<E, StoreError> {
    let mut current = load_required::<E>(conn, update.id()).await?;
    current.check_update(update, fields)?;
    current.patch(update, fields);
    current.validate()?;
    current.save(conn).await?;
    Ok(current)
}

/// [`patch_entity`] for policies: `@<name>` terms become `@<id>` before
/// the save.
async fn patch_policy<P: Repository + Policy>(
    conn: &mut SqliteConnection,
    update: &P,
    fields: &FieldSet,
) -> Result<P, StoreError> {
    let mut current = load_required::<P>(conn, update.id()).await?;
    current.check_update(update, fields)?;
    current.patch(update, fields);
    links::resolve_entity_names(conn, &mut current).await?;
    current.validate()?;
    current.save(conn).await?;
    Ok(current)
}

const POLICY_LINK_FIELDS: &[&str] = &[
    "semantic",
    "identityRoles",
    "serviceRoles",
    "edgeRouterRoles",
    "postureCheckRoles",
];

async fn update(
    conn: &mut SqliteConnection,
    entity: EntityPayload,
    fields: &FieldSet,
) -> Result<String, StoreError> {
    let attrs_changed = fields.contains("roleAttributes");
    let policy_changed = fields.contains_any(POLICY_LINK_FIELDS);

    match entity {
        EntityPayload::Identity(e) => {
            let saved = patch_entity(conn, &e, fields).await?;
            if attrs_changed {
                links::entity_changed(conn, EntityKind::Identity, &saved.id, &saved.role_attributes)
                    .await?;
            }
            Ok(saved.id)
        }
        EntityPayload::Service(e) => {
            let saved = patch_entity(conn, &e, fields).await?;
            if fields.contains("configs") {
                check_service_configs(conn, &saved).await?;
            }
            if attrs_changed {
                links::entity_changed(conn, EntityKind::Service, &saved.id, &saved.role_attributes)
                    .await?;
            }
            Ok(saved.id)
        }
        EntityPayload::EdgeRouter(e) => {
            let saved = patch_entity(conn, &e, fields).await?;
            if attrs_changed {
                links::entity_changed(
                    conn,
                    EntityKind::EdgeRouter,
                    &saved.id,
                    &saved.role_attributes,
                )
                .await?;
            }
            Ok(saved.id)
        }
        EntityPayload::PostureCheck(e) => {
            let saved = patch_entity(conn, &e, fields).await?;
            if attrs_changed {
                links::entity_changed(
                    conn,
                    EntityKind::PostureCheck,
                    &saved.id,
                    &saved.role_attributes,
                )
                .await?;
            }
            Ok(saved.id)
        }
        EntityPayload::Config(e) => Ok(patch_entity(conn, &e, fields).await?.id),
        EntityPayload::ServicePolicy(p) => {
            let saved = patch_policy(conn, &p, fields).await?;
            if policy_changed {
                links::policy_changed(conn, &saved).await?;
            }
            Ok(saved.id)
        }
        EntityPayload::EdgeRouterPolicy(p) => {
            let saved = patch_policy(conn, &p, fields).await?;
            if policy_changed {
                links::policy_changed(conn, &saved).await?;
            }
            Ok(saved.id)
        }
        EntityPayload::ServiceEdgeRouterPolicy(p) => {
            let saved = patch_policy(conn, &p, fields).await?;
            if policy_changed {
                links::policy_changed(conn, &saved).await?;
            }
            Ok(saved.id)
        }
        EntityPayload::ApiSession(s) => Ok(patch_entity(conn, &s, fields).await?.id),
        EntityPayload::Session(s) => Ok(patch_entity(conn, &s, fields).await?.id),
    }
}

// ---------------------------------------------------------------------------
// Delete
// ---------------------------------------------------------------------------

async fn delete_required<E: Repository>(conn: &mut SqliteConnection, id: &str) -> Result<(), StoreError> {
    if E::delete(conn, id).await? {
        Ok(())
    } else {
        Err(StoreError::not_found(E::KIND.as_str(), id))
    }
}

/// Delete an api session and queue the deferred delete of its sessions.
async fn delete_api_session(
    conn: &mut SqliteConnection,
    api_session: &ApiSession,
    after: &mut AfterCommit,
) -> Result<(), StoreError> {
    delete_required::<ApiSession>(conn, &api_session.id).await?;
    cascade::enqueue_api_session_delete(conn, &api_session.id).await?;
    after
        .deleted_api_sessions
        .push((api_session.identity_id.clone(), api_session.id.clone()));
    after.cascade_queued = true;
    Ok(())
}

async fn delete(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    id: &str,
    after: &mut AfterCommit,
) -> Result<(), StoreError> {
    match kind {
        EntityKind::Identity => {
            for api_session in repo::api_sessions_for_identity(conn, id).await? {
                delete_api_session(conn, &api_session, after).await?;
            }
            delete_required::<Identity>(conn, id).await?;
            links::remove_entity(conn, kind, id).await?;
            links::remove_entity_references(conn, kind, id).await?;
            after.deleted_identities.push(id.to_owned());
            info!(identity_id = %id, "identity deleted");
        }
        EntityKind::Service => {
            delete_required::<Service>(conn, id).await?;
            let removed = repo::delete_sessions_for_service(conn, id).await?;
            links::remove_entity(conn, kind, id).await?;
            links::remove_entity_references(conn, kind, id).await?;
            debug!(service_id = %id, sessions_removed = removed, "service deleted");
        }
        EntityKind::EdgeRouter => {
            delete_required::<EdgeRouter>(conn, id).await?;
            links::remove_entity(conn, kind, id).await?;
            links::remove_entity_references(conn, kind, id).await?;
        }
        EntityKind::PostureCheck => {
            delete_required::<PostureCheck>(conn, id).await?;
            links::remove_entity(conn, kind, id).await?;
            links::remove_entity_references(conn, kind, id).await?;
        }
        EntityKind::Config => {
            let users = repo::services_using_config(conn, id).await?;
            if let Some(service_id) = users.first() {
                return Err(FieldError::new(
                    "config is still referenced by a service",
                    "id",
                    format!("{id} (service {service_id})"),
                )
                .into());
            }
            delete_required::<Config>(conn, id).await?;
        }
        EntityKind::ServicePolicy => {
            delete_required::<ServicePolicy>(conn, id).await?;
            links::remove_policy(conn, id).await?;
        }
        EntityKind::EdgeRouterPolicy => {
            delete_required::<EdgeRouterPolicy>(conn, id).await?;
            links::remove_policy(conn, id).await?;
        }
        EntityKind::ServiceEdgeRouterPolicy => {
            delete_required::<ServiceEdgeRouterPolicy>(conn, id).await?;
            links::remove_policy(conn, id).await?;
        }
        EntityKind::ApiSession => {
            let api_session = load_required::<ApiSession>(conn, id).await?;
            delete_api_session(conn, &api_session, after).await?;
        }
        EntityKind::Session => delete_required::<Session>(conn, id).await?,
    }
    Ok(())
}
