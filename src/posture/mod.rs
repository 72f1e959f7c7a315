//! Posture evaluation.
//!
//! Endpoints report posture (OS, MAC addresses, domain, processes, MFA and
//! wake/unlock events) into the in-memory [`PostureCache`]. Session
//! admission asks the [`PostureEvaluator`] whether any service policy of the
//! requested type is satisfied: checks are ANDed within a policy and policies
//! are ORed. The [`PostureEnforcer`] revokes sessions whose posture stops
//! passing.

pub mod cache;
pub mod checks;
pub mod data;
pub mod enforcer;
pub mod evaluator;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::{PostureCheckType, SessionType};

pub use cache::PostureCache;
pub use checks::CheckResultCache;
pub use data::{PostureData, PostureResponse};
pub use enforcer::PostureEnforcer;
pub use evaluator::PostureEvaluator;

/// One failed posture check with expected and observed values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckFailure {
    /// Check id.
    pub check_id: String,
    /// Check name.
    pub check_name: String,
    /// Check kind.
    pub check_type: PostureCheckType,
    /// What the check requires.
    pub expected: serde_json::Value,
    /// What the endpoint reported.
    pub actual: serde_json::Value,
}

/// A service policy whose checks did not all pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyFailure {
    /// Policy id.
    pub policy_id: String,
    /// Policy name.
    pub policy_name: String,
    /// Failed checks of this policy.
    pub checks: Vec<CheckFailure>,
}

/// Why a session request failed posture, for clients and support.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostureSessionRequestFailure {
    /// When the request was evaluated.
    pub when: DateTime<Utc>,
    /// Requested service.
    pub service_id: String,
    /// Requested service's name.
    pub service_name: String,
    /// Requesting api session.
    pub api_session_id: String,
    /// Requested direction.
    pub session_type: SessionType,
    /// Every applicable policy and its failed checks.
    pub policy_failures: Vec<PolicyFailure>,
}

impl PostureSessionRequestFailure {
    /// Human readable summary naming the failed policies.
    pub fn cause_message(&self) -> String {
        let names: Vec<String> = self
            .policy_failures
            .iter()
            .map(|p| format!("{} ({})", p.policy_name, p.policy_id))
            .collect();
        format!(
            "Failed to pass posture checks for service policies: [{}]",
            names.join(", ")
        )
    }
}

/// Outcome of evaluating posture for one session request.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionPostureResult {
    /// At least one applicable policy passed, or none applied.
    pub passed: bool,
    /// Ids of the passing policies, in id order.
    pub passing_policy_ids: Vec<String>,
    /// Diagnostic payload when `passed` is false.
    pub failure: Option<PostureSessionRequestFailure>,
}
