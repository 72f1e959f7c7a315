//! Command-dispatch boundary.
//!
//! Mutations of replicated entities are expressed as [`Command`]s and handed
//! to a [`Replicator`]. The replicator serializes the command into the
//! versioned log format ([`wire`]), replicates it, and every node applies it
//! through the same [`Applier`]. A dispatch that returns an error applied
//! nothing anywhere.

pub mod apply;
pub mod wire;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{FieldError, ReplicationError, StoreError};
use crate::store::{FieldSet, Repository};
use crate::types::{
    ApiSession, Config, EdgeRouter, EdgeRouterPolicy, EntityKind, Identity, PostureCheck, Service,
    ServiceEdgeRouterPolicy, ServicePolicy, Session,
};

pub use apply::Applier;

/// A replicated entity, tagged with its kind.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "data")]
pub enum EntityPayload {
    /// An identity.
    Identity(Identity),
    /// A service.
    Service(Service),
    /// An edge router.
    EdgeRouter(EdgeRouter),
    /// A config.
    Config(Config),
    /// A posture check.
    PostureCheck(PostureCheck),
    /// A service policy.
    ServicePolicy(ServicePolicy),
    /// An edge router policy.
    EdgeRouterPolicy(EdgeRouterPolicy),
    /// A service edge router policy.
    ServiceEdgeRouterPolicy(ServiceEdgeRouterPolicy),
    /// An api session.
    ApiSession(ApiSession),
    /// A session.
    Session(Session),
}

macro_rules! payload_from {
    ($($variant:ident),* $(,)?) => {
        $(
            impl From<$variant> for EntityPayload {
                fn from(entity: $variant) -> Self {
                    Self::$variant(entity)
                }
            }
        )*
    };
}

payload_from!(
    Identity,
    Service,
    EdgeRouter,
    Config,
    PostureCheck,
    ServicePolicy,
    EdgeRouterPolicy,
    ServiceEdgeRouterPolicy,
    ApiSession,
    Session,
);

impl EntityPayload {
    /// Kind of the carried entity.
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Identity(_) => EntityKind::Identity,
            Self::Service(_) => EntityKind::Service,
            Self::EdgeRouter(_) => EntityKind::EdgeRouter,
            Self::Config(_) => EntityKind::Config,
            Self::PostureCheck(_) => EntityKind::PostureCheck,
            Self::ServicePolicy(_) => EntityKind::ServicePolicy,
            Self::EdgeRouterPolicy(_) => EntityKind::EdgeRouterPolicy,
            Self::ServiceEdgeRouterPolicy(_) => EntityKind::ServiceEdgeRouterPolicy,
            Self::ApiSession(_) => EntityKind::ApiSession,
            Self::Session(_) => EntityKind::Session,
        }
    }

    /// Id of the carried entity.
    pub fn id(&self) -> &str {
        match self {
            Self::Identity(e) => e.id(),
            Self::Service(e) => e.id(),
            Self::EdgeRouter(e) => e.id(),
            Self::Config(e) => e.id(),
            Self::PostureCheck(e) => e.id(),
            Self::ServicePolicy(e) => e.id(),
            Self::EdgeRouterPolicy(e) => e.id(),
            Self::ServiceEdgeRouterPolicy(e) => e.id(),
            Self::ApiSession(e) => e.id(),
            Self::Session(e) => e.id(),
        }
    }

    /// Static validation of the carried entity.
    ///
    /// # Errors
    ///
    /// Returns the entity's first [`FieldError`].
    pub fn validate(&self) -> Result<(), FieldError> {
        match self {
            Self::Identity(e) => e.validate(),
            Self::Service(e) => e.validate(),
            Self::EdgeRouter(e) => e.validate(),
            Self::Config(e) => e.validate(),
            Self::PostureCheck(e) => e.validate(),
            Self::ServicePolicy(e) => e.validate(),
            Self::EdgeRouterPolicy(e) => e.validate(),
            Self::ServiceEdgeRouterPolicy(e) => e.validate(),
            Self::ApiSession(e) => e.validate(),
            Self::Session(e) => e.validate(),
        }
    }
}

/// A mutation submitted to the replicated log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum Command {
    /// Insert a new entity.
    Create {
        /// The entity.
        entity: EntityPayload,
    },
    /// Change the named fields of an existing entity.
    Update {
        /// Entity carrying the new field values.
        entity: EntityPayload,
        /// Fields to copy from `entity`.
        fields: FieldSet,
    },
    /// Remove an entity.
    Delete {
        /// Entity kind.
        kind: EntityKind,
        /// Entity id.
        id: String,
    },
}

impl Command {
    /// Create command.
    pub fn create(entity: impl Into<EntityPayload>) -> Self {
        Self::Create {
            entity: entity.into(),
        }
    }

    /// Update command.
    pub fn update(entity: impl Into<EntityPayload>, fields: FieldSet) -> Self {
        Self::Update {
            entity: entity.into(),
            fields,
        }
    }

    /// Delete command.
    pub fn delete(kind: EntityKind, id: impl Into<String>) -> Self {
        Self::Delete {
            kind,
            id: id.into(),
        }
    }

    /// Short name for logs.
    pub fn op(&self) -> &'static str {
        match self {
            Self::Create { .. } => "create",
            Self::Update { .. } => "update",
            Self::Delete { .. } => "delete",
        }
    }

    /// Kind of the targeted entity.
    pub fn kind(&self) -> EntityKind {
        match self {
            Self::Create { entity } | Self::Update { entity, .. } => entity.kind(),
            Self::Delete { kind, .. } => *kind,
        }
    }

    /// Validation that needs no storage access.
    ///
    /// Updates are validated after patching, on apply.
    ///
    /// # Errors
    ///
    /// Returns the first [`FieldError`].
    pub fn validate(&self) -> Result<(), FieldError> {
        match self {
            Self::Create { entity } => entity.validate(),
            Self::Update { .. } | Self::Delete { .. } => Ok(()),
        }
    }
}

/// Submits commands and waits until they are applied or rejected.
#[async_trait]
pub trait Replicator: Send + Sync {
    /// Dispatch a command. Returns the id of the affected entity.
    ///
    /// For a session create whose (api session, type, service) tuple already
    /// has a session, the existing session's id is returned.
    ///
    /// # Errors
    ///
    /// - [`ReplicationError::Rejected`]: validation or lookup failed on apply.
    /// - [`ReplicationError::Unavailable`]: the command was not replicated.
    async fn dispatch(&self, command: Command) -> Result<String, ReplicationError>;
}

/// Single-node replicator: round-trips the command through the log format and
/// applies it locally.
pub struct LocalReplicator {
    applier: Applier,
}

impl LocalReplicator {
    /// Wrap an applier.
    pub fn new(applier: Applier) -> Self {
        Self { applier }
    }
}

#[async_trait]
impl Replicator for LocalReplicator {
    async fn dispatch(&self, command: Command) -> Result<String, ReplicationError> {
        command.validate().map_err(StoreError::from)?;

        let entry = wire::marshal(&command)?;
        let replayed = wire::unmarshal(&entry)?;
        let (op, kind) = (replayed.op(), replayed.kind());

        match self.applier.apply(replayed).await {
            Ok(id) => {
                debug!(op, kind = %kind, id = %id, "command applied");
                Ok(id)
            }
            Err(e) if matches!(e, StoreError::Database(_)) => {
                warn!(op, kind = %kind, error = %e, "command failed to apply");
                Err(ReplicationError::Rejected(e))
            }
            Err(e) => {
                debug!(op, kind = %kind, error = %e, "command rejected");
                Err(ReplicationError::Rejected(e))
            }
        }
    }
}
