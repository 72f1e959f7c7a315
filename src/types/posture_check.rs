//! Posture check definitions.
//!
//! The kind of a check is fixed at creation; updates may only change its
//! payload, name and role attributes. Evaluation lives in
//! [`crate::posture::checks`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::new_id;
use crate::error::FieldError;
use crate::roles::Semantic;

/// `timeout_seconds` value meaning an MFA pass never expires.
///
/// Zero is a real timeout (re-verify immediately), so the sentinel is out of range.
pub const MFA_NO_TIMEOUT: i64 = -1;

/// Discriminant of a posture check kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PostureCheckType {
    /// Operating system and version.
    #[serde(rename = "OS")]
    Os,
    /// MAC address allow-list.
    #[serde(rename = "MAC")]
    Mac,
    /// Windows domain allow-list.
    #[serde(rename = "DOMAIN")]
    Domain,
    /// Single running process.
    #[serde(rename = "PROCESS")]
    Process,
    /// Several processes under a semantic.
    #[serde(rename = "PROCESS_MULTI")]
    ProcessMulti,
    /// MFA freshness.
    #[serde(rename = "MFA")]
    Mfa,
}

impl PostureCheckType {
    /// Storage and wire representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Os => "OS",
            Self::Mac => "MAC",
            Self::Domain => "DOMAIN",
            Self::Process => "PROCESS",
            Self::ProcessMulti => "PROCESS_MULTI",
            Self::Mfa => "MFA",
        }
    }
}

impl std::fmt::Display for PostureCheckType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An allowed operating system and, optionally, version requirements.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OperatingSystem {
    /// OS type, compared case-insensitively (`Windows`, `macOS`, `Linux`, ...).
    pub os_type: String,
    /// Semver requirements; empty means any version.
    #[serde(default)]
    pub os_versions: Vec<String>,
}

/// A process the endpoint must be running.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessSpec {
    /// OS the path applies to.
    pub os_type: String,
    /// Absolute executable path.
    pub path: String,
    /// Accepted binary hashes; empty means any.
    #[serde(default)]
    pub hashes: Vec<String>,
    /// Accepted signer fingerprints; empty means any.
    #[serde(default)]
    pub signer_fingerprints: Vec<String>,
}

/// MFA freshness requirements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MfaCheck {
    /// Seconds an MFA pass stays valid, or [`MFA_NO_TIMEOUT`].
    pub timeout_seconds: i64,
    /// Require MFA again after the endpoint wakes.
    #[serde(default)]
    pub prompt_on_wake: bool,
    /// Require MFA again after the endpoint unlocks.
    #[serde(default)]
    pub prompt_on_unlock: bool,
    /// Do not apply timeouts to SDKs too old to re-prompt.
    #[serde(default)]
    pub ignore_legacy_endpoints: bool,
}

impl Default for MfaCheck {
    fn default() -> Self {
        Self {
            timeout_seconds: MFA_NO_TIMEOUT,
            prompt_on_wake: false,
            prompt_on_unlock: false,
            ignore_legacy_endpoints: false,
        }
    }
}

/// Kind-specific payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "typeId", rename_all_fields = "camelCase")]
pub enum PostureCheckKind {
    /// Allowed operating systems.
    #[serde(rename = "OS")]
    Os {
        /// Allowed OS entries.
        operating_systems: Vec<OperatingSystem>,
    },
    /// Allowed MAC addresses.
    #[serde(rename = "MAC")]
    Mac {
        /// Addresses, any formatting.
        mac_addresses: Vec<String>,
    },
    /// Allowed domains.
    #[serde(rename = "DOMAIN")]
    Domain {
        /// Domain names.
        domains: Vec<String>,
    },
    /// One required process.
    #[serde(rename = "PROCESS")]
    Process {
        /// Process requirement.
        process: ProcessSpec,
    },
    /// Several processes.
    #[serde(rename = "PROCESS_MULTI")]
    ProcessMulti {
        /// AllOf: every process; AnyOf: at least one.
        semantic: Semantic,
        /// Process requirements.
        processes: Vec<ProcessSpec>,
    },
    /// MFA freshness.
    #[serde(rename = "MFA")]
    Mfa(MfaCheck),
}

impl PostureCheckKind {
    /// Discriminant.
    pub fn type_id(&self) -> PostureCheckType {
        match self {
            Self::Os { .. } => PostureCheckType::Os,
            Self::Mac { .. } => PostureCheckType::Mac,
            Self::Domain { .. } => PostureCheckType::Domain,
            Self::Process { .. } => PostureCheckType::Process,
            Self::ProcessMulti { .. } => PostureCheckType::ProcessMulti,
            Self::Mfa(_) => PostureCheckType::Mfa,
        }
    }

    /// Validate the payload.
    ///
    /// # Errors
    ///
    /// Returns a [`FieldError`] for unparsable version requirements, empty
    /// process paths or an MFA timeout below [`MFA_NO_TIMEOUT`].
    pub fn validate(&self) -> Result<(), FieldError> {
        match self {
            Self::Os { operating_systems } => {
                for os in operating_systems {
                    for req in &os.os_versions {
                        semver::VersionReq::parse(req).map_err(|e| {
                            FieldError::new(e.to_string(), "operatingSystems.osVersions", req.as_str())
                        })?;
                    }
                }
                Ok(())
            }
            Self::Mac { .. } | Self::Domain { .. } => Ok(()),
            Self::Process { process } => validate_process(process),
            Self::ProcessMulti { processes, .. } => processes.iter().try_for_each(validate_process),
            Self::Mfa(mfa) => {
                if mfa.timeout_seconds < MFA_NO_TIMEOUT {
                    return Err(FieldError::new(
                        "must be -1 (no timeout) or a non-negative number of seconds",
                        "timeoutSeconds",
                        mfa.timeout_seconds.to_string(),
                    ));
                }
                Ok(())
            }
        }
    }
}

fn validate_process(process: &ProcessSpec) -> Result<(), FieldError> {
    if process.path.trim().is_empty() {
        return Err(FieldError::new("process path is required", "process.path", ""));
    }
    Ok(())
}

/// A device or environment requirement referenced by service policies.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PostureCheck {
    /// Entity id.
    pub id: String,
    /// Unique name.
    pub name: String,
    /// Attributes matched by `postureCheckRoles`.
    #[serde(default)]
    pub role_attributes: Vec<String>,
    /// Bumped on every update.
    #[serde(default = "first_version")]
    pub version: i64,
    /// Kind and payload.
    pub kind: PostureCheckKind,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

fn first_version() -> i64 {
    1
}

impl PostureCheck {
    /// New check at version 1.
    pub fn new(name: impl Into<String>, role_attributes: Vec<String>, kind: PostureCheckKind) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            role_attributes,
            version: first_version(),
            kind,
            created_at: Utc::now(),
        }
    }

    /// Discriminant of this check's kind.
    pub fn type_id(&self) -> PostureCheckType {
        self.kind.type_id()
    }
}
