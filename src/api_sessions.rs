//! Api session lifecycle.
//!
//! Creation and deletion go through the replicator. Deleting an api session
//! removes its certificates immediately and its sessions eventually, through
//! the cascade processor.

use std::collections::BTreeSet;
use std::sync::Arc;

use chrono::Utc;
use tracing::{debug, info};

use crate::activity::HeartbeatCollector;
use crate::error::AdmissionError;
use crate::posture::PostureCache;
use crate::replication::{Command, Replicator};
use crate::store::repo::{self, Repository};
use crate::store::{Db, FieldSet};
use crate::types::{ApiSession, ApiSessionCertificate, EntityKind, Identity};

/// Creates, reads and deletes api sessions.
#[derive(Clone)]
pub struct ApiSessionManager {
    db: Db,
    replicator: Arc<dyn Replicator>,
    posture: Arc<PostureCache>,
    heartbeats: Arc<HeartbeatCollector>,
}

impl std::fmt::Debug for ApiSessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ApiSessionManager").finish_non_exhaustive()
    }
}

impl ApiSessionManager {
    /// New manager.
    pub fn new(
        db: Db,
        replicator: Arc<dyn Replicator>,
        posture: Arc<PostureCache>,
        heartbeats: Arc<HeartbeatCollector>,
    ) -> Self {
        Self {
            db,
            replicator,
            posture,
            heartbeats,
        }
    }

    /// Open an api session for an identity. Returns `(id, token)`.
    ///
    /// # Errors
    ///
    /// - [`AdmissionError::NotFound`]: unknown identity.
    /// - [`AdmissionError::Unavailable`]: replication failed.
    pub async fn create(
        &self,
        identity_id: &str,
        certificates: Vec<ApiSessionCertificate>,
    ) -> Result<(String, String), AdmissionError> {
        let mut api_session = ApiSession::new(identity_id);
        api_session.certificates = certificates;
        let token = api_session.token.clone();
        let id = self.replicator.dispatch(Command::create(api_session)).await?;
        info!(identity_id, api_session_id = %id, "api session created");
        Ok((id, token))
    }

    /// Api session by id, with certificates.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::NotFound`] when missing.
    pub async fn read(&self, id: &str) -> Result<ApiSession, AdmissionError> {
        let mut tx = self.db.view().await?;
        Ok(repo::load_required::<ApiSession>(&mut tx, id).await?)
    }

    /// Api session by bearer token.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::NotFound`] when no api session holds the
    /// token.
    pub async fn read_by_token(&self, token: &str) -> Result<ApiSession, AdmissionError> {
        let mut tx = self.db.view().await?;
        repo::api_session_by_token(&mut tx, token)
            .await?
            .ok_or_else(|| AdmissionError::not_found("apiSession", "<token>"))
    }

    /// Record a completed MFA: sets the flag and the MFA posture of the api
    /// session.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::NotFound`] when missing.
    pub async fn mfa_completed(&self, id: &str) -> Result<(), AdmissionError> {
        let mut api_session = self.read(id).await?;
        api_session.mfa_complete = true;
        let identity_id = api_session.identity_id.clone();
        self.replicator
            .dispatch(Command::update(api_session, FieldSet::of(["mfaComplete"])))
            .await?;
        self.posture.set_mfa_passed(&identity_id, id, Some(Utc::now()));
        debug!(api_session_id = id, identity_id = %identity_id, "mfa completed");
        Ok(())
    }

    /// Delete an api session. Its sessions are removed eventually.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::NotFound`] when missing.
    pub async fn delete(&self, id: &str) -> Result<(), AdmissionError> {
        self.replicator
            .dispatch(Command::delete(EntityKind::ApiSession, id))
            .await?;
        info!(api_session_id = id, "api session deleted");
        Ok(())
    }

    /// Delete every api session of an identity. Returns how many were
    /// deleted.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::NotFound`] for an unknown identity.
    pub async fn delete_by_identity(&self, identity_id: &str) -> Result<usize, AdmissionError> {
        let ids: Vec<String> = {
            let mut tx = self.db.view().await?;
            repo::load_required::<Identity>(&mut tx, identity_id).await?;
            repo::api_sessions_for_identity(&mut tx, identity_id)
                .await?
                .into_iter()
                .map(|s| s.id)
                .collect()
        };

        let mut deleted = 0usize;
        for id in &ids {
            match self.delete(id).await {
                Ok(()) => deleted = deleted.saturating_add(1),
                // Raced with another delete.
                Err(AdmissionError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }
        Ok(deleted)
    }

    /// Mark activity for the api sessions holding `tokens`. Returns the
    /// tokens that match no api session.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::Internal`] on storage failure.
    pub async fn mark_activity_by_tokens(
        &self,
        tokens: &[String],
    ) -> Result<Vec<String>, AdmissionError> {
        let mut tx = self.db.view().await?;
        let mut not_found = Vec::new();
        let unique: BTreeSet<&String> = tokens.iter().collect();
        for token in unique {
            match repo::api_session_by_token(&mut tx, token).await? {
                Some(api_session) => self.heartbeats.mark(&api_session.id),
                None => not_found.push(token.clone()),
            }
        }
        Ok(not_found)
    }

    /// Fingerprints of the api session's currently valid certificates.
    ///
    /// # Errors
    ///
    /// Returns [`AdmissionError::NotFound`] when missing.
    pub async fn visit_fingerprints(&self, api_session_id: &str) -> Result<Vec<String>, AdmissionError> {
        let mut tx = self.db.view().await?;
        let api_session = ApiSession::load(&mut tx, api_session_id)
            .await?
            .ok_or_else(|| AdmissionError::not_found("apiSession", api_session_id))?;
        let now = Utc::now();
        Ok(api_session
            .certificates
            .iter()
            .filter(|c| c.is_valid_at(now))
            .map(|c| c.fingerprint.clone())
            .collect())
    }
}
