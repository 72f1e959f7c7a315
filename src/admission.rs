//! Session admission.
//!
//! A session is issued for an (api session, service, type) tuple when the
//! identity may use the service with that type, passes posture, and shares at
//! least one edge router with the service. Issuance is idempotent per tuple:
//! concurrent requests all receive the id of the one stored session.

use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::error::AdmissionError;
use crate::posture::PostureEvaluator;
use crate::reachability;
use crate::replication::{Command, Replicator};
use crate::services;
use crate::store::repo::{self, Repository, SessionFilter};
use crate::store::{links, Db};
use crate::types::{new_id, new_token, ApiSession, EntityKind, Identity, Session, SessionType};

/// Issues and manages sessions.
#[derive(Clone)]
pub struct SessionAdmissionController {
    db: Db,
    replicator: Arc<dyn Replicator>,
    evaluator: PostureEvaluator,
}

impl std::fmt::Debug for SessionAdmissionController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionAdmissionController")
            .field("evaluator", &self.evaluator)
            .finish_non_exhaustive()
    }
}

impl SessionAdmissionController {
    /// New controller.
    pub fn new(db: Db, replicator: Arc<dyn Replicator>, evaluator: PostureEvaluator) -> Self {
        Self {
            db,
            replicator,
            evaluator,
        }
    }

    /// Issue (or return the existing) session for a tuple.
    ///
    /// # Errors
    ///
    /// - [`AdmissionError::NotFound`]: unknown api session (or disabled
    ///   identity), or a service the identity may not use with `session_type`.
    /// - [`AdmissionError::PostureFailure`]: no applicable policy passed.
    /// - [`AdmissionError::NoEdgeRoutersAvailable`]: no shared router.
    /// - [`AdmissionError::Unavailable`]: replication failed; retry is safe.
    pub async fn create_session(
        &self,
        api_session_id: &str,
        service_id: &str,
        session_type: SessionType,
    ) -> Result<String, AdmissionError> {
        let (identity_id, policies) = {
            let mut tx = self.db.view().await?;

            if let Some(existing) =
                repo::find_session_for_tuple(&mut tx, api_session_id, session_type, service_id)
                    .await?
            {
                debug!(api_session_id, service_id, session_id = %existing, "session exists");
                return Ok(existing);
            }

            let identity = active_identity(&mut tx, api_session_id).await?;

            let detail = services::read_for_identity(&mut tx, service_id, &identity)
                .await?
                .filter(|d| d.allows(session_type))
                .ok_or_else(|| AdmissionError::not_found("service", service_id))?;

            let posture = self
                .evaluator
                .evaluate_in(
                    &mut tx,
                    &identity.id,
                    api_session_id,
                    session_type,
                    service_id,
                    &detail.service.name,
                )
                .await?;
            if !posture.passed {
                let failure = posture.failure.ok_or_else(|| {
                    AdmissionError::Internal("posture failed without a failure record".to_owned())
                })?;
                return Err(AdmissionError::PostureFailure(Box::new(failure)));
            }

            if !reachability::is_shared_edge_router_present(&mut tx, &identity, service_id).await? {
                info!(
                    identity_id = %identity.id,
                    service_id,
                    "no edge routers available for session"
                );
                return Err(AdmissionError::NoEdgeRoutersAvailable {
                    service_id: service_id.to_owned(),
                });
            }

            (identity.id, posture.passing_policy_ids)
        };

        let session = Session {
            id: new_id(),
            api_session_id: api_session_id.to_owned(),
            identity_id,
            service_id: service_id.to_owned(),
            session_type,
            token: new_token(),
            service_policies: policies,
            created_at: Utc::now(),
        };
        let id = self.replicator.dispatch(Command::create(session)).await?;
        debug!(api_session_id, service_id, session_type = %session_type, session_id = %id, "session issued");
        Ok(id)
    }

    /// Session by id.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::NotFound`] when missing.
    pub async fn read(&self, id: &str) -> Result<Session, AdmissionError> {
        let mut tx = self.db.view().await?;
        Ok(repo::load_required::<Session>(&mut tx, id).await?)
    }

    /// Session by bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::NotFound`] when no session holds the token.
    pub async fn read_by_token(&self, token: &str) -> Result<Session, AdmissionError> {
        let mut tx = self.db.view().await?;
        repo::session_by_token(&mut tx, token)
            .await?
            .ok_or_else(|| AdmissionError::not_found("session", token))
    }

    /// Session by id as seen by an identity. Non-admins only see sessions of
    /// their own api sessions.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::NotFound`] when missing or not visible.
    pub async fn read_for_identity(
        &self,
        id: &str,
        identity_id: &str,
    ) -> Result<Session, AdmissionError> {
        let mut tx = self.db.view().await?;
        let identity = repo::load_required::<Identity>(&mut tx, identity_id).await?;
        let session = Session::load(&mut tx, id)
            .await?
            .ok_or_else(|| AdmissionError::not_found("session", id))?;
        if identity.is_admin || session.identity_id == identity.id {
            Ok(session)
        } else {
            Err(AdmissionError::not_found("session", id))
        }
    }

    /// Sessions owned by an identity, in id order.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::Internal`] on storage failure.
    pub async fn list_for_identity(&self, identity_id: &str) -> Result<Vec<Session>, AdmissionError> {
        let mut tx = self.db.view().await?;
        let filter = SessionFilter {
            identity_id: Some(identity_id.to_owned()),
            ..SessionFilter::default()
        };
        Ok(repo::list_sessions(&mut tx, &filter).await?)
    }

    /// Sessions whose service is reachable through a router.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::NotFound`] for an unknown router.
    pub async fn list_sessions_for_edge_router(
        &self,
        router_id: &str,
    ) -> Result<Vec<Session>, AdmissionError> {
        let mut tx = self.db.view().await?;
        if !repo::exists(&mut tx, EntityKind::EdgeRouter, router_id).await? {
            return Err(AdmissionError::not_found("edgeRouter", router_id));
        }
        let service_ids: Vec<String> = links::linked_through(
            &mut tx,
            EntityKind::EdgeRouter,
            router_id,
            EntityKind::ServiceEdgeRouterPolicy,
            EntityKind::Service,
        )
        .await?
        .into_keys()
        .collect();

        let filter = SessionFilter {
            service_ids: Some(service_ids),
            ..SessionFilter::default()
        };
        Ok(repo::list_sessions(&mut tx, &filter).await?)
    }

    /// Delete a session.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::NotFound`] when missing.
    pub async fn delete(&self, id: &str) -> Result<(), AdmissionError> {
        self.replicator
            .dispatch(Command::delete(EntityKind::Session, id))
            .await?;
        Ok(())
    }

    /// Delete a session owned by an identity.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::NotFound`] when missing or not visible.
    pub async fn delete_for_identity(&self, id: &str, identity_id: &str) -> Result<(), AdmissionError> {
        self.read_for_identity(id, identity_id).await?;
        self.delete(id).await
    }
}

/// Api session and its enabled identity. Disabled identities are reported as
/// a missing api session.
async fn active_identity(
    conn: &mut sqlx::SqliteConnection,
    api_session_id: &str,
) -> Result<Identity, AdmissionError> {
    let api_session = ApiSession::load(conn, api_session_id)
        .await?
        .ok_or_else(|| AdmissionError::not_found("apiSession", api_session_id))?;
    match Identity::load(conn, &api_session.identity_id).await? {
        Some(identity) if !identity.disabled => Ok(identity),
        _ => {
            debug!(api_session_id, "api session identity missing or disabled");
            Err(AdmissionError::not_found("apiSession", api_session_id))
        }
    }
}
