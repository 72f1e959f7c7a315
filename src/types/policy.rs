//! The three policy flavors.
//!
//! Every policy links two (or, for service policies, three) entity kinds
//! through role expressions evaluated under one [`Semantic`]. [`SideSpec`]
//! describes each linked side so the link index can treat all flavors alike.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{new_id, EntityKind, SessionType};
use crate::error::FieldError;
use crate::roles::{RoleExpression, Semantic};

/// One role-expression list of a policy and the entity kind it selects.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SideSpec {
    /// Kind of entity selected by this side.
    pub entity_kind: EntityKind,
    /// Field name used in errors and field sets.
    pub field: &'static str,
    /// Column holding the JSON role list.
    pub column: &'static str,
}

const SERVICE_POLICY_SIDES: &[SideSpec] = &[
    SideSpec {
        entity_kind: EntityKind::Identity,
        field: "identityRoles",
        column: "identity_roles",
    },
    SideSpec {
        entity_kind: EntityKind::Service,
        field: "serviceRoles",
        column: "service_roles",
    },
    SideSpec {
        entity_kind: EntityKind::PostureCheck,
        field: "postureCheckRoles",
        column: "posture_check_roles",
    },
];

const EDGE_ROUTER_POLICY_SIDES: &[SideSpec] = &[
    SideSpec {
        entity_kind: EntityKind::Identity,
        field: "identityRoles",
        column: "identity_roles",
    },
    SideSpec {
        entity_kind: EntityKind::EdgeRouter,
        field: "edgeRouterRoles",
        column: "edge_router_roles",
    },
];

const SERVICE_EDGE_ROUTER_POLICY_SIDES: &[SideSpec] = &[
    SideSpec {
        entity_kind: EntityKind::Service,
        field: "serviceRoles",
        column: "service_roles",
    },
    SideSpec {
        entity_kind: EntityKind::EdgeRouter,
        field: "edgeRouterRoles",
        column: "edge_router_roles",
    },
];

/// Linked sides of a policy kind. Empty for non-policy kinds.
pub fn policy_sides(kind: EntityKind) -> &'static [SideSpec] {
    match kind {
        EntityKind::ServicePolicy => SERVICE_POLICY_SIDES,
        EntityKind::EdgeRouterPolicy => EDGE_ROUTER_POLICY_SIDES,
        EntityKind::ServiceEdgeRouterPolicy => SERVICE_EDGE_ROUTER_POLICY_SIDES,
        _ => &[],
    }
}

/// Policy kinds that select entities of `entity_kind`.
pub fn policies_targeting(entity_kind: EntityKind) -> impl Iterator<Item = (EntityKind, SideSpec)> {
    [
        EntityKind::ServicePolicy,
        EntityKind::EdgeRouterPolicy,
        EntityKind::ServiceEdgeRouterPolicy,
    ]
    .into_iter()
    .flat_map(|kind| policy_sides(kind).iter().map(move |side| (kind, *side)))
    .filter(move |(_, side)| side.entity_kind == entity_kind)
}

/// Shared view over the three policy flavors.
pub trait Policy {
    /// Policy kind.
    const POLICY_KIND: EntityKind;

    /// Policy name.
    fn name(&self) -> &str;

    /// Quantifier over every side.
    fn semantic(&self) -> Semantic;

    /// Raw role list for a side field.
    fn roles(&self, side: &SideSpec) -> &[String];

    /// Mutable role list for a side field, `None` for a side this flavor
    /// does not have.
    fn roles_mut(&mut self, side: &SideSpec) -> Option<&mut Vec<String>>;

    /// Parse every side's role expression.
    ///
    /// # Errors
    ///
    /// Returns the first malformed term as a [`FieldError`].
    fn validate_roles(&self) -> Result<(), FieldError> {
        if self.name().trim().is_empty() {
            return Err(FieldError::new("name is required", "name", self.name()));
        }
        for side in policy_sides(Self::POLICY_KIND) {
            RoleExpression::parse(side.field, self.roles(side))?;
        }
        Ok(())
    }
}

/// Grants dial or bind on services to identities, gated by posture checks.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServicePolicy {
    /// Entity id.
    pub id: String,
    /// Unique name.
    pub name: String,
    /// Permission granted.
    #[serde(default)]
    pub policy_type: SessionType,
    /// Quantifier.
    #[serde(default)]
    pub semantic: Semantic,
    /// Identities selected.
    #[serde(default)]
    pub identity_roles: Vec<String>,
    /// Services selected.
    #[serde(default)]
    pub service_roles: Vec<String>,
    /// Posture checks required.
    #[serde(default)]
    pub posture_check_roles: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ServicePolicy {
    /// New policy without posture checks.
    pub fn new(
        name: impl Into<String>,
        policy_type: SessionType,
        semantic: Semantic,
        identity_roles: Vec<String>,
        service_roles: Vec<String>,
    ) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            policy_type,
            semantic,
            identity_roles,
            service_roles,
            posture_check_roles: Vec::new(),
            created_at: Utc::now(),
        }
    }
}

impl Policy for ServicePolicy {
    const POLICY_KIND: EntityKind = EntityKind::ServicePolicy;

    fn name(&self) -> &str {
        &self.name
    }

    fn semantic(&self) -> Semantic {
        self.semantic
    }

    fn roles(&self, side: &SideSpec) -> &[String] {
        match side.entity_kind {
            EntityKind::Identity => &self.identity_roles,
            EntityKind::Service => &self.service_roles,
            EntityKind::PostureCheck => &self.posture_check_roles,
            _ => &[],
        }
    }

    fn roles_mut(&mut self, side: &SideSpec) -> Option<&mut Vec<String>> {
        match side.entity_kind {
            EntityKind::Identity => Some(&mut self.identity_roles),
            EntityKind::Service => Some(&mut self.service_roles),
            EntityKind::PostureCheck => Some(&mut self.posture_check_roles),
            _ => None,
        }
    }
}

/// Lets identities use edge routers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EdgeRouterPolicy {
    /// Entity id.
    pub id: String,
    /// Unique name.
    pub name: String,
    /// Quantifier.
    #[serde(default)]
    pub semantic: Semantic,
    /// Identities selected.
    #[serde(default)]
    pub identity_roles: Vec<String>,
    /// Edge routers selected.
    #[serde(default)]
    pub edge_router_roles: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl EdgeRouterPolicy {
    /// New policy.
    pub fn new(
        name: impl Into<String>,
        semantic: Semantic,
        identity_roles: Vec<String>,
        edge_router_roles: Vec<String>,
    ) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            semantic,
            identity_roles,
            edge_router_roles,
            created_at: Utc::now(),
        }
    }
}

impl Policy for EdgeRouterPolicy {
    const POLICY_KIND: EntityKind = EntityKind::EdgeRouterPolicy;

    fn name(&self) -> &str {
        &self.name
    }

    fn semantic(&self) -> Semantic {
        self.semantic
    }

    fn roles(&self, side: &SideSpec) -> &[String] {
        match side.entity_kind {
            EntityKind::Identity => &self.identity_roles,
            EntityKind::EdgeRouter => &self.edge_router_roles,
            _ => &[],
        }
    }

    fn roles_mut(&mut self, side: &SideSpec) -> Option<&mut Vec<String>> {
        match side.entity_kind {
            EntityKind::Identity => Some(&mut self.identity_roles),
            EntityKind::EdgeRouter => Some(&mut self.edge_router_roles),
            _ => None,
        }
    }
}

/// Lets services be carried by edge routers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceEdgeRouterPolicy {
    /// Entity id.
    pub id: String,
    /// Unique name.
    pub name: String,
    /// Quantifier.
    #[serde(default)]
    pub semantic: Semantic,
    /// Services selected.
    #[serde(default)]
    pub service_roles: Vec<String>,
    /// Edge routers selected.
    #[serde(default)]
    pub edge_router_roles: Vec<String>,
    /// Creation time.
    pub created_at: DateTime<Utc>,
}

impl ServiceEdgeRouterPolicy {
    /// New policy.
    pub fn new(
        name: impl Into<String>,
        semantic: Semantic,
        service_roles: Vec<String>,
        edge_router_roles: Vec<String>,
    ) -> Self {
        Self {
            id: new_id(),
            name: name.into(),
            semantic,
            service_roles,
            edge_router_roles,
            created_at: Utc::now(),
        }
    }
}

impl Policy for ServiceEdgeRouterPolicy {
    const POLICY_KIND: EntityKind = EntityKind::ServiceEdgeRouterPolicy;

    fn name(&self) -> &str {
        &self.name
    }

    fn semantic(&self) -> Semantic {
        self.semantic
    }

    fn roles(&self, side: &SideSpec) -> &[String] {
        match side.entity_kind {
            EntityKind::Service => &self.service_roles,
            EntityKind::EdgeRouter => &self.edge_router_roles,
            _ => &[],
        }
    }

    fn roles_mut(&mut self, side: &SideSpec) -> Option<&mut Vec<String>> {
        match side.entity_kind {
            EntityKind::Service => Some(&mut self.service_roles),
            EntityKind::EdgeRouter => Some(&mut self.edge_router_roles),
            _ => None,
        }
    }
}
