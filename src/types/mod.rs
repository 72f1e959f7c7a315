//! Entity model shared across the crate.
//!
//! Identities, services, edge routers and configs are operator-managed;
//! api sessions and sessions are created by the authentication and admission
//! flows. Policies live in [`policy`], posture checks in [`posture_check`].

pub mod policy;
pub mod posture_check;

use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::error::FieldError;

pub use policy::{EdgeRouterPolicy, ServiceEdgeRouterPolicy, ServicePolicy};
pub use posture_check::{PostureCheck, PostureCheckKind, PostureCheckType};

/// Bytes of entropy in a bearer token.
const TOKEN_BYTES: usize = 32;

/// New time-ordered entity id (UUIDv7, monotonic within the process).
pub fn new_id() -> String {
    uuid::Uuid::now_v7().to_string()
}

/// New opaque bearer token.
pub fn new_token() -> String {
    let mut buf = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut buf);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(buf)
}

// ---------------------------------------------------------------------------
// Enums
// ---------------------------------------------------------------------------

/// Direction of a session, and the permission a service policy grants.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SessionType {
    /// Connect to a service.
    #[default]
    Dial,
    /// Host a service.
    Bind,
}

impl SessionType {
    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Dial => "Dial",
            Self::Bind => "Bind",
        }
    }

    /// Parse a session or policy type.
    ///
    /// # Errors
    ///
    /// Returns a [`FieldError`] for anything other than `Dial` / `Bind`.
    pub fn parse(value: &str) -> Result<Self, FieldError> {
        match value {
            "Dial" => Ok(Self::Dial),
            "Bind" => Ok(Self::Bind),
            other => Err(FieldError::new("must be Dial or Bind", "type", other)),
        }
    }
}

impl std::fmt::Display for SessionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every entity kind the store knows about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EntityKind {
    /// [`Identity`].
    Identity,
    /// [`Service`].
    Service,
    /// [`EdgeRouter`].
    EdgeRouter,
    /// [`Config`].
    Config,
    /// [`PostureCheck`].
    PostureCheck,
    /// [`ServicePolicy`].
    ServicePolicy,
    /// [`EdgeRouterPolicy`].
    EdgeRouterPolicy,
    /// [`ServiceEdgeRouterPolicy`].
    ServiceEdgeRouterPolicy,
    /// [`ApiSession`].
    ApiSession,
    /// [`Session`].
    Session,
}

impl EntityKind {
    /// Singular camel-case name used in errors and the link index.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Identity => "identity",
            Self::Service => "service",
            Self::EdgeRouter => "edgeRouter",
            Self::Config => "config",
            Self::PostureCheck => "postureCheck",
            Self::ServicePolicy => "servicePolicy",
            Self::EdgeRouterPolicy => "edgeRouterPolicy",
            Self::ServiceEdgeRouterPolicy => "serviceEdgeRouterPolicy",
            Self::ApiSession => "apiSession",
            Self::Session => "session",
        }
    }

    /// Backing table.
    pub fn table(self) -> &'static str {
        match self {
            Self::Identity => "identities",
            Self::Service => "services",
            Self::EdgeRouter => "edge_routers",
            Self::Config => "configs",
            Self::PostureCheck => "posture_checks",
            Self::ServicePolicy => "service_policies",
            Self::EdgeRouterPolicy => "edge_router_policies",
            Self::ServiceEdgeRouterPolicy => "service_edge_router_policies",
            Self::ApiSession => "api_sessions",
            Self::Session => "sessions",
        }
    }

    /// True for the three policy kinds.
    pub fn is_policy(self) -> bool {
        matches!(
            self,
            Self::ServicePolicy | Self::EdgeRouterPolicy | Self::ServiceEdgeRouterPolicy
        )
    }
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

// ---------------------------------------------------------------------------
// Operator-managed entities
// ---------------------------------------------------------------------------

/// Per-identity override of the config a service hands out.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceConfigOverride {
    /// Service the override applies to.
    pub service_id: String,
    /// Config used instead of the service's own config of the same type.
    pub config_id: String,
}

/// An authenticated principal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    /// Entity id.
    pub id: String,
    /// Unique name.
    pub name: String,
    /// Attributes matched by policy role expressions.
    #[serde(default)]
    pub role_attributes: Vec<String>,
    /// Admins bypass every policy check.
    #[serde(default)]
    pub is_admin: bool,
    /// Authentication policy reference.
    #[serde(default = "default_auth_policy")]
    pub auth_policy_id: String,
    /// Disabled identities may not obtain sessions.
    #[serde(default)]
    pub disabled: bool,
    /// Config overrides for specific services.
    #[serde(default)]
    pub service_configs: Vec<ServiceConfigOverride>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

fn default_auth_policy() -> String {
    "default".to_owned()
}

impl Identity {
    /// New enabled, non-admin identity.
    pub fn new(name: impl Into<String>, role_attributes: Vec<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            role_attributes,
            is_admin: false,
            auth_policy_id: default_auth_policy(),
            disabled: false,
            service_configs: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// A network service that can be dialed or bound.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Service {
    /// Entity id.
    pub id: String,
    /// Unique name.
    pub name: String,
    /// Attributes matched by policy role expressions.
    #[serde(default)]
    pub role_attributes: Vec<String>,
    /// Statically assigned config ids.
    #[serde(default)]
    pub configs: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Service {
    /// New service without configs.
    pub fn new(name: impl Into<String>, role_attributes: Vec<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            role_attributes,
            configs: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

/// Typed configuration blob attached to services.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    /// Entity id.
    pub id: String,
    /// Unique name.
    pub name: String,
    /// Config type name; a service exposes at most one config per type.
    pub config_type: String,
    /// Opaque JSON payload.
    pub data: serde_json::Value,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl Config {
    /// New config.
    pub fn new(name: impl Into<String>, config_type: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            config_type: config_type.into(),
            data,
            created_at: Utc::now(),
        }
    }
}

/// A data-plane router.
///
/// Online status is not persisted; see [`crate::advisor::RouterStatus`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeRouter {
    /// Entity id.
    pub id: String,
    /// Unique name.
    pub name: String,
    /// Attributes matched by policy role expressions.
    #[serde(default)]
    pub role_attributes: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl EdgeRouter {
    /// New router.
    pub fn new(name: impl Into<String>, role_attributes: Vec<String>) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            role_attributes,
            created_at: Utc::now(),
        }
    }
}

// ---------------------------------------------------------------------------
// Authentication and admission entities
// ---------------------------------------------------------------------------

/// Client certificate presented when an api session was established.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSessionCertificate {
    /// Entity id.
    pub id: String,
    /// Hex SHA-1 fingerprint.
    pub fingerprint: String,
    /// Certificate subject.
    pub subject: String,
    /// Start of validity.
    pub valid_after: DateTime<Utc>,
    /// End of validity.
    pub valid_before: DateTime<Utc>,
}

impl ApiSessionCertificate {
    /// True when `at` falls inside the validity window.
    pub fn is_valid_at(&self, at: DateTime<Utc>) -> bool {
        self.valid_after <= at && at <= self.valid_before
    }
}

/// An authenticated login session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiSession {
    /// Entity id, time ordered.
    pub id: String,
    /// Owning identity.
    pub identity_id: String,
    /// Bearer token.
    pub token: String,
    /// MFA was completed for this session.
    #[serde(default)]
    pub mfa_complete: bool,
    /// MFA is required before the session is fully usable.
    #[serde(default)]
    pub mfa_required: bool,
    /// Best-effort last activity, written by the activity accumulator.
    pub last_activity_at: DateTime<Utc>,
    /// Client certificates.
    #[serde(default)]
    pub certificates: Vec<ApiSessionCertificate>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ApiSession {
    /// New api session with a fresh token.
    pub fn new(identity_id: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: new_id(),
            identity_id: identity_id.into(),
            token: new_token(),
            mfa_complete: false,
            mfa_required: false,
            last_activity_at: now,
            certificates: Vec::new(),
            created_at: now,
        }
    }
}

/// A per-service, per-direction grant under an api session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    /// Entity id, time ordered.
    pub id: String,
    /// Owning api session.
    pub api_session_id: String,
    /// Identity of the owning api session.
    pub identity_id: String,
    /// Service the grant is for.
    pub service_id: String,
    /// Dial or bind.
    pub session_type: SessionType,
    /// Bearer token handed to routers.
    pub token: String,
    /// Service policies that authorized the grant.
    #[serde(default)]
    pub service_policies: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}
