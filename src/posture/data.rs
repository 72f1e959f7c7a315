//! Posture state reported by endpoints.

use std::collections::{BTreeMap, HashMap, VecDeque};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::PostureSessionRequestFailure;

/// Reported operating system.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OsInfo {
    /// OS type, e.g. `Windows`.
    pub os_type: String,
    /// Dotted version, e.g. `10.0.19041`.
    pub version: String,
    /// Build string, informational.
    #[serde(default)]
    pub build: String,
}

/// Reported state of one process.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    /// Executable path.
    pub path: String,
    /// Whether the process is running.
    pub is_running: bool,
    /// Binary hash.
    #[serde(default)]
    pub hash: String,
    /// Signer certificate fingerprints.
    #[serde(default)]
    pub signer_fingerprints: Vec<String>,
}

/// SDK reported by the client of an api session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SdkInfo {
    /// Application id.
    #[serde(default)]
    pub app_id: String,
    /// Application version.
    #[serde(default)]
    pub app_version: String,
    /// SDK type, e.g. `ziti-sdk-c`.
    #[serde(default, rename = "type")]
    pub sdk_type: String,
    /// SDK version.
    #[serde(default)]
    pub version: String,
}

/// MFA state of one api session.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MfaState {
    /// Last successful MFA, if any.
    pub passed_at: Option<DateTime<Utc>>,
}

/// Wake and unlock events of one api session's endpoint.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EndpointState {
    /// Last wake.
    pub woken_at: Option<DateTime<Utc>>,
    /// Last unlock.
    pub unlocked_at: Option<DateTime<Utc>>,
}

/// Posture scoped to a single api session.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSessionPostureData {
    /// MFA state.
    pub mfa: MfaState,
    /// Wake and unlock events.
    pub endpoint_state: EndpointState,
    /// Client SDK.
    pub sdk_info: Option<SdkInfo>,
}

/// Everything known about one identity's endpoint posture.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostureData {
    /// Reported MAC addresses.
    pub mac_addresses: Vec<String>,
    /// Reported domain, empty if none.
    pub domain: String,
    /// Reported OS.
    pub os: Option<OsInfo>,
    /// Reported processes by path.
    pub processes: BTreeMap<String, ProcessInfo>,
    /// Per api session state.
    pub api_sessions: HashMap<String, ApiSessionPostureData>,
    /// Most recent failed session requests, oldest first.
    pub session_request_failures: VecDeque<PostureSessionRequestFailure>,
}

impl PostureData {
    /// Apply one response. Api-session scoped responses create the session
    /// entry on demand.
    pub fn apply(&mut self, api_session_id: &str, response: PostureResponse) {
        match response {
            PostureResponse::Os(os) => self.os = Some(os),
            PostureResponse::Mac { mac_addresses } => self.mac_addresses = mac_addresses,
            PostureResponse::Domain { domain } => self.domain = domain,
            PostureResponse::Process(process) => {
                self.processes.insert(process.path.clone(), process);
            }
            PostureResponse::Woken { at } => {
                self.api_session_mut(api_session_id).endpoint_state.woken_at = Some(at);
            }
            PostureResponse::Unlocked { at } => {
                self.api_session_mut(api_session_id).endpoint_state.unlocked_at = Some(at);
            }
            PostureResponse::SdkInfo(info) => {
                self.api_session_mut(api_session_id).sdk_info = Some(info);
            }
        }
    }

    /// Posture of an api session, created if missing.
    pub fn api_session_mut(&mut self, api_session_id: &str) -> &mut ApiSessionPostureData {
        self.api_sessions
            .entry(api_session_id.to_owned())
            .or_default()
    }
}

/// A posture report submitted by an endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "typeId", rename_all_fields = "camelCase")]
pub enum PostureResponse {
    /// Operating system.
    #[serde(rename = "OS")]
    Os(OsInfo),
    /// MAC addresses.
    #[serde(rename = "MAC")]
    Mac {
        /// Every interface address.
        mac_addresses: Vec<String>,
    },
    /// Windows domain.
    #[serde(rename = "DOMAIN")]
    Domain {
        /// Domain name.
        domain: String,
    },
    /// A process.
    #[serde(rename = "PROCESS")]
    Process(ProcessInfo),
    /// Endpoint woke.
    #[serde(rename = "WOKEN")]
    Woken {
        /// Wake time.
        at: DateTime<Utc>,
    },
    /// Endpoint unlocked.
    #[serde(rename = "UNLOCKED")]
    Unlocked {
        /// Unlock time.
        at: DateTime<Utc>,
    },
    /// Client SDK.
    #[serde(rename = "SDK_INFO")]
    SdkInfo(SdkInfo),
}
