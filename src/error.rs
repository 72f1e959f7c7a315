//! Error taxonomy shared by the store, replication boundary and admission flow.
//!
//! Storage and replication report [`StoreError`] / [`ReplicationError`];
//! callers of the admission surface see [`AdmissionError`], which carries a
//! stable [`ErrorCode`] for clients.

use crate::posture::PostureSessionRequestFailure;

/// A rejected field value on an entity or command.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid value for {field} ({value}): {reason}")]
pub struct FieldError {
    /// Human readable explanation.
    pub reason: String,
    /// Name of the offending field.
    pub field: String,
    /// The rejected value, rendered as text.
    pub value: String,
}

impl FieldError {
    /// Build a field error from anything string-like.
    pub fn new(reason: impl Into<String>, field: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            field: field.into(),
            value: value.into(),
        }
    }
}

/// Errors from the storage binding.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// No record matched the lookup.
    #[error("{entity} not found for {field} {value}")]
    NotFound {
        /// Singular entity name, e.g. `service`.
        entity: &'static str,
        /// Lookup field, usually `id` or `token`.
        field: &'static str,
        /// Looked-up value.
        value: String,
    },

    /// A field failed validation.
    #[error(transparent)]
    Field(#[from] FieldError),

    /// A unique value is already taken.
    #[error("{entity} with {field} {value} already exists")]
    Conflict {
        /// Singular entity name.
        entity: &'static str,
        /// Unique field that collided.
        field: &'static str,
        /// Colliding value.
        value: String,
    },

    /// Underlying SQLite failure.
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    /// JSON column could not be encoded or decoded.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored value is not one the schema allows.
    #[error("corrupt row in {table}: {detail}")]
    Corrupt {
        /// Table holding the row.
        table: &'static str,
        /// What was wrong with it.
        detail: String,
    },
}

impl StoreError {
    /// Shorthand for a lookup by id that found nothing.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            field: "id",
            value: id.into(),
        }
    }

    /// True for [`StoreError::NotFound`].
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

/// Errors from the command-dispatch boundary.
#[derive(Debug, thiserror::Error)]
pub enum ReplicationError {
    /// The apply step refused the command; nothing was written.
    #[error("command rejected: {0}")]
    Rejected(#[from] StoreError),

    /// The command could not be replicated; nothing was written anywhere.
    #[error("replication unavailable: {0}")]
    Unavailable(String),

    /// The command could not be encoded for, or decoded from, the log.
    #[error("wire codec error: {0}")]
    Codec(#[source] serde_json::Error),

    /// A log entry was written by an incompatible encoder.
    #[error("unsupported wire version {0}")]
    UnsupportedVersion(u32),
}

/// Stable, documented error codes returned with every rejected admission.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Entity, token or (deliberately) permission missing.
    NotFound,
    /// A field failed validation.
    InvalidField,
    /// Posture checks did not pass for any applicable policy.
    InvalidPosture,
    /// No edge router is reachable by both identity and service.
    NoEdgeRoutersAvailable,
    /// Unique value already taken.
    Conflict,
    /// Replication could not apply the command; safe to retry.
    Unavailable,
    /// Anything else.
    Internal,
}

impl ErrorCode {
    /// Wire representation of the code.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotFound => "NOT_FOUND",
            Self::InvalidField => "INVALID_FIELD",
            Self::InvalidPosture => "INVALID_POSTURE",
            Self::NoEdgeRoutersAvailable => "NO_EDGE_ROUTERS_AVAILABLE",
            Self::Conflict => "CONFLICT",
            Self::Unavailable => "UNAVAILABLE",
            Self::Internal => "INTERNAL",
        }
    }
}

impl std::fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Errors surfaced to callers of the admission and api-session surfaces.
#[derive(Debug, thiserror::Error)]
pub enum AdmissionError {
    /// Missing entity. Also used for services the identity may not use.
    #[error("{entity} not found")]
    NotFound {
        /// Singular entity name.
        entity: &'static str,
        /// Looked-up value.
        id: String,
    },

    /// A field failed validation.
    #[error(transparent)]
    Field(#[from] FieldError),

    /// Posture checks failed; carries the diagnostic payload.
    #[error("{}", .0.cause_message())]
    PostureFailure(Box<PostureSessionRequestFailure>),

    /// No edge router is reachable for the identity and service.
    #[error("no edge routers available for service {service_id}")]
    NoEdgeRoutersAvailable {
        /// Service the session was requested for.
        service_id: String,
    },

    /// Unique value already taken.
    #[error("{entity} with {field} {value} already exists")]
    Conflict {
        /// Singular entity name.
        entity: &'static str,
        /// Unique field.
        field: &'static str,
        /// Colliding value.
        value: String,
    },

    /// The command could not be replicated. Retrying is safe.
    #[error("unavailable: {0}")]
    Unavailable(String),

    /// Storage or codec failure.
    #[error("internal error: {0}")]
    Internal(String),
}

impl AdmissionError {
    /// Stable code for this error.
    pub fn code(&self) -> ErrorCode {
        match self {
            Self::NotFound { .. } => ErrorCode::NotFound,
            Self::Field(_) => ErrorCode::InvalidField,
            Self::PostureFailure(_) => ErrorCode::InvalidPosture,
            Self::NoEdgeRoutersAvailable { .. } => ErrorCode::NoEdgeRoutersAvailable,
            Self::Conflict { .. } => ErrorCode::Conflict,
            Self::Unavailable(_) => ErrorCode::Unavailable,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Not-found condition for an entity id.
    pub fn not_found(entity: &'static str, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity,
            id: id.into(),
        }
    }
}

impl From<StoreError> for AdmissionError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound { entity, value, .. } => Self::NotFound { entity, id: value },
            StoreError::Field(e) => Self::Field(e),
            StoreError::Conflict {
                entity,
                field,
                value,
            } => Self::Conflict {
                entity,
                field,
                value,
            },
            other => Self::Internal(other.to_string()),
        }
    }
}

impl From<ReplicationError> for AdmissionError {
    fn from(err: ReplicationError) -> Self {
        match err {
            ReplicationError::Rejected(e) => e.into(),
            ReplicationError::Unavailable(msg) => Self::Unavailable(msg),
            other => Self::Internal(other.to_string()),
        }
    }
}
