//! In-memory posture data per identity.
//!
//! Posture is reported by endpoints and is never persisted. Changes are
//! published on a broadcast channel (identity id) so the enforcer can
//! re-check that identity's sessions.

use std::collections::HashMap;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::broadcast;

use super::checks::{CheckContext, CheckResultCache};
use super::data::{PostureData, PostureResponse};
use super::{CheckFailure, PostureSessionRequestFailure};
use crate::config::PostureConfig;
use crate::types::PostureCheck;

const CHANGE_CHANNEL_CAPACITY: usize = 256;

/// Posture data for every identity seen since startup.
#[derive(Debug)]
pub struct PostureCache {
    data: Mutex<HashMap<String, PostureData>>,
    max_failures: usize,
    mfa_grace: Duration,
    changes: broadcast::Sender<String>,
}

impl PostureCache {
    /// Empty cache sized by `config`.
    pub fn new(config: &PostureConfig) -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            data: Mutex::new(HashMap::new()),
            max_failures: config.max_failure_history.max(1),
            mfa_grace: config.mfa_grace(),
            changes,
        }
    }

    /// Subscribe to identity ids whose posture changed.
    pub fn subscribe(&self) -> broadcast::Receiver<String> {
        self.changes.subscribe()
    }

    fn notify(&self, identity_id: &str) {
        // No receivers is fine.
        let _ = self.changes.send(identity_id.to_owned());
    }

    /// Record posture responses from an endpoint.
    pub fn add_responses(
        &self,
        identity_id: &str,
        api_session_id: &str,
        responses: Vec<PostureResponse>,
    ) {
        if let Ok(mut data) = self.data.lock() {
            let entry = data.entry(identity_id.to_owned()).or_default();
            for response in responses {
                entry.apply(api_session_id, response);
            }
        }
        tracing::debug!(identity_id, api_session_id, "posture data updated");
        self.notify(identity_id);
    }

    /// Record (or clear) a successful MFA for an api session.
    pub fn set_mfa_passed(
        &self,
        identity_id: &str,
        api_session_id: &str,
        passed_at: Option<DateTime<Utc>>,
    ) {
        if let Ok(mut data) = self.data.lock() {
            data.entry(identity_id.to_owned())
                .or_default()
                .api_session_mut(api_session_id)
                .mfa
                .passed_at = passed_at;
        }
        self.notify(identity_id);
    }

    /// Snapshot of an identity's posture.
    pub fn posture_data(&self, identity_id: &str) -> Option<PostureData> {
        self.data
            .lock()
            .ok()
            .and_then(|data| data.get(identity_id).cloned())
    }

    /// Evaluate `check` for an api session through the request cache.
    ///
    /// Evaluation runs on a snapshot, outside the lock. A poisoned lock is
    /// treated as missing data, so the check fails.
    pub fn evaluate_check(
        &self,
        results: &mut CheckResultCache,
        identity_id: &str,
        api_session_id: &str,
        check: &PostureCheck,
    ) -> Result<(), CheckFailure> {
        let snapshot = self.posture_data(identity_id);
        let ctx = CheckContext {
            api_session_id,
            data: snapshot.as_ref(),
            now: Utc::now(),
            mfa_grace: self.mfa_grace,
        };
        results.evaluate(check, &ctx)
    }

    /// Append to an identity's failure history, dropping the oldest entry
    /// once full.
    pub fn add_session_request_failure(&self, identity_id: &str, failure: PostureSessionRequestFailure) {
        if let Ok(mut data) = self.data.lock() {
            let history = &mut data
                .entry(identity_id.to_owned())
                .or_default()
                .session_request_failures;
            while history.len() >= self.max_failures {
                history.pop_front();
            }
            history.push_back(failure);
        }
    }

    /// Recent failed session requests, oldest first.
    pub fn session_request_failures(&self, identity_id: &str) -> Vec<PostureSessionRequestFailure> {
        self.data
            .lock()
            .ok()
            .and_then(|data| {
                data.get(identity_id)
                    .map(|d| d.session_request_failures.iter().cloned().collect())
            })
            .unwrap_or_default()
    }

    /// Forget per-session posture of a deleted api session.
    pub fn api_session_deleted(&self, identity_id: &str, api_session_id: &str) {
        if let Ok(mut data) = self.data.lock() {
            if let Some(entry) = data.get_mut(identity_id) {
                entry.api_sessions.remove(api_session_id);
            }
        }
    }

    /// Forget a deleted identity entirely.
    pub fn identity_deleted(&self, identity_id: &str) {
        if let Ok(mut data) = self.data.lock() {
            data.remove(identity_id);
        }
    }
}
