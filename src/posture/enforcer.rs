//! Revokes sessions whose posture no longer passes.
//!
//! Runs when an identity's posture changes and on a periodic sweep over all
//! sessions. Revocation goes through the replicator like any other delete.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::PostureEvaluator;
use crate::config::PostureConfig;
use crate::error::StoreError;
use crate::replication::{Command, Replicator};
use crate::store::repo::{self, SessionFilter};
use crate::store::Db;
use crate::types::{EntityKind, Session};

/// Background posture enforcement.
#[derive(Clone)]
pub struct PostureEnforcer {
    db: Db,
    evaluator: PostureEvaluator,
    replicator: Arc<dyn Replicator>,
    interval: Duration,
    chunk: u32,
}

impl std::fmt::Debug for PostureEnforcer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PostureEnforcer")
            .field("interval", &self.interval)
            .field("chunk", &self.chunk)
            .finish_non_exhaustive()
    }
}

impl PostureEnforcer {
    /// New enforcer.
    pub fn new(
        db: Db,
        evaluator: PostureEvaluator,
        replicator: Arc<dyn Replicator>,
        config: &PostureConfig,
    ) -> Self {
        Self {
            db,
            evaluator,
            replicator,
            interval: config.enforcement_interval(),
            chunk: config.sweep_chunk.max(1),
        }
    }

    /// Ids of the given sessions whose posture fails.
    async fn failing(&self, sessions: &[Session]) -> Result<Vec<String>, StoreError> {
        let mut tx = self.db.view().await?;
        let mut failing = Vec::new();
        for session in sessions {
            let passes = self
                .evaluator
                .passes_in(
                    &mut tx,
                    &session.identity_id,
                    &session.api_session_id,
                    session.session_type,
                    &session.service_id,
                )
                .await?;
            if !passes {
                failing.push(session.id.clone());
            }
        }
        Ok(failing)
    }

    async fn revoke(&self, ids: Vec<String>) -> usize {
        let mut revoked = 0usize;
        for id in ids {
            match self
                .replicator
                .dispatch(Command::delete(EntityKind::Session, id.clone()))
                .await
            {
                Ok(_) => {
                    info!(session_id = %id, "session revoked: posture no longer passes");
                    revoked = revoked.saturating_add(1);
                }
                Err(crate::error::ReplicationError::Rejected(e)) if e.is_not_found() => {}
                Err(e) => warn!(session_id = %id, error = %e, "failed to revoke session"),
            }
        }
        revoked
    }

    /// Re-check every session of one identity. Returns the number revoked.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if sessions or policies cannot be loaded.
    pub async fn enforce_identity(&self, identity_id: &str) -> Result<usize, StoreError> {
        let sessions = {
            let mut tx = self.db.view().await?;
            let filter = SessionFilter {
                identity_id: Some(identity_id.to_owned()),
                ..SessionFilter::default()
            };
            repo::list_sessions(&mut tx, &filter).await?
        };
        let failing = self.failing(&sessions).await?;
        Ok(self.revoke(failing).await)
    }

    /// Re-check every session, one chunk at a time. Returns the number
    /// revoked.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if sessions or policies cannot be loaded.
    pub async fn sweep(&self) -> Result<usize, StoreError> {
        let mut failing = Vec::new();
        let mut offset = 0i64;
        let chunk = i64::from(self.chunk);
        loop {
            let page = {
                let mut tx = self.db.view().await?;
                let filter = SessionFilter {
                    limit: Some(chunk),
                    offset: Some(offset),
                    ..SessionFilter::default()
                };
                repo::list_sessions(&mut tx, &filter).await?
            };
            if page.is_empty() {
                break;
            }
            failing.extend(self.failing(&page).await?);
            let len = i64::try_from(page.len()).unwrap_or(i64::MAX);
            if len < chunk {
                break;
            }
            offset = offset.saturating_add(len);
        }
        Ok(self.revoke(failing).await)
    }

    /// Enforce on posture changes and on every interval, until shutdown.
    pub async fn run(
        self,
        mut changes: broadcast::Receiver<String>,
        mut shutdown_rx: watch::Receiver<bool>,
    ) {
        info!(
            interval_secs = self.interval.as_secs(),
            chunk = self.chunk,
            "posture enforcer started"
        );
        let mut interval = tokio::time::interval(self.interval);

        // Skip the first immediate tick.
        interval.tick().await;

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    match self.sweep().await {
                        Ok(revoked) => debug!(revoked, "posture sweep finished"),
                        Err(e) => warn!(error = %e, "posture sweep failed"),
                    }
                }
                change = changes.recv() => match change {
                    Ok(identity_id) => {
                        if let Err(e) = self.enforce_identity(&identity_id).await {
                            warn!(identity_id, error = %e, "posture enforcement failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "posture changes lagged, sweeping");
                        if let Err(e) = self.sweep().await {
                            warn!(error = %e, "posture sweep failed");
                        }
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                result = shutdown_rx.changed() => {
                    if result.is_err() || *shutdown_rx.borrow() {
                        break;
                    }
                }
            }
        }
        info!("posture enforcer stopped");
    }
}
