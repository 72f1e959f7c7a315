//! Session-request posture evaluation.
//!
//! Checks are ANDed within a policy, policies are ORed. Every check is
//! evaluated at most once per request through a [`CheckResultCache`].

use std::sync::Arc;

use chrono::Utc;
use sqlx::SqliteConnection;
use tracing::{debug, info};

use super::checks::CheckResultCache;
use super::{PolicyFailure, PostureCache, PostureSessionRequestFailure, SessionPostureResult};
use crate::error::StoreError;
use crate::services;
use crate::store::Db;
use crate::types::SessionType;

/// Evaluates posture for session requests against stored policies.
#[derive(Debug, Clone)]
pub struct PostureEvaluator {
    db: Db,
    posture: Arc<PostureCache>,
}

impl PostureEvaluator {
    /// New evaluator.
    pub fn new(db: Db, posture: Arc<PostureCache>) -> Self {
        Self { db, posture }
    }

    /// The posture data this evaluator reads.
    pub fn cache(&self) -> &Arc<PostureCache> {
        &self.posture
    }

    /// Evaluate posture for a session request in a fresh read transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if policies or checks cannot be loaded. A
    /// posture failure is not an error; see [`SessionPostureResult::passed`].
    pub async fn evaluate_posture_for_service(
        &self,
        identity_id: &str,
        api_session_id: &str,
        session_type: SessionType,
        service_id: &str,
        service_name: &str,
    ) -> Result<SessionPostureResult, StoreError> {
        let mut tx = self.db.view().await?;
        self.evaluate_in(
            &mut tx,
            identity_id,
            api_session_id,
            session_type,
            service_id,
            service_name,
        )
        .await
    }

    /// Same as [`Self::evaluate_posture_for_service`] inside the caller's
    /// transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if policies or checks cannot be loaded.
    pub async fn evaluate_in(
        &self,
        conn: &mut SqliteConnection,
        identity_id: &str,
        api_session_id: &str,
        session_type: SessionType,
        service_id: &str,
        service_name: &str,
    ) -> Result<SessionPostureResult, StoreError> {
        let outcome = self
            .evaluate_policies(conn, identity_id, api_session_id, session_type, service_id)
            .await?;
        let Some(PolicyOutcome { passing, failures }) = outcome else {
            return Ok(SessionPostureResult {
                passed: true,
                passing_policy_ids: Vec::new(),
                failure: None,
            });
        };

        if !passing.is_empty() {
            return Ok(SessionPostureResult {
                passed: true,
                passing_policy_ids: passing,
                failure: None,
            });
        }

        let failure = PostureSessionRequestFailure {
            when: Utc::now(),
            service_id: service_id.to_owned(),
            service_name: service_name.to_owned(),
            api_session_id: api_session_id.to_owned(),
            session_type,
            policy_failures: failures,
        };
        info!(
            identity_id,
            api_session_id,
            service_id,
            cause = %failure.cause_message(),
            "session request failed posture"
        );
        self.posture
            .add_session_request_failure(identity_id, failure.clone());

        Ok(SessionPostureResult {
            passed: false,
            passing_policy_ids: Vec::new(),
            failure: Some(failure),
        })
    }

    /// True when the session's posture still passes. Failures are not
    /// recorded in the identity's history.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] if policies or checks cannot be loaded.
    pub async fn passes_in(
        &self,
        conn: &mut SqliteConnection,
        identity_id: &str,
        api_session_id: &str,
        session_type: SessionType,
        service_id: &str,
    ) -> Result<bool, StoreError> {
        let outcome = self
            .evaluate_policies(conn, identity_id, api_session_id, session_type, service_id)
            .await?;
        Ok(outcome.is_none_or(|o| !o.passing.is_empty()))
    }

    /// Evaluate every applicable policy. `None` when no policy of the
    /// session type links the pair.
    async fn evaluate_policies(
        &self,
        conn: &mut SqliteConnection,
        identity_id: &str,
        api_session_id: &str,
        session_type: SessionType,
        service_id: &str,
    ) -> Result<Option<PolicyOutcome>, StoreError> {
        let applicable: Vec<_> = services::policy_posture_checks(conn, identity_id, service_id)
            .await?
            .into_iter()
            .filter(|p| p.policy.policy_type == session_type)
            .collect();
        if applicable.is_empty() {
            return Ok(None);
        }

        let mut results = CheckResultCache::new();
        let mut passing = Vec::new();
        let mut failures = Vec::new();

        for entry in &applicable {
            let failed: Vec<_> = entry
                .checks
                .iter()
                .filter_map(|check| {
                    self.posture
                        .evaluate_check(&mut results, identity_id, api_session_id, check)
                        .err()
                })
                .collect();

            if failed.is_empty() {
                passing.push(entry.policy.id.clone());
            } else {
                failures.push(PolicyFailure {
                    policy_id: entry.policy.id.clone(),
                    policy_name: entry.policy.name.clone(),
                    checks: failed,
                });
            }
        }
        passing.sort();

        debug!(
            identity_id,
            service_id,
            policies = applicable.len(),
            checks_evaluated = results.evaluations(),
            passing = passing.len(),
            "posture evaluated"
        );
        Ok(Some(PolicyOutcome { passing, failures }))
    }
}

struct PolicyOutcome {
    passing: Vec<String>,
    failures: Vec<PolicyFailure>,
}
