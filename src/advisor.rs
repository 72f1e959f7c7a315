//! Policy advisor: explains why an identity can or cannot use a service.
//!
//! Router online status is reported for diagnosis only; admission never
//! consults it.

use std::collections::HashSet;
use std::sync::{Arc, RwLock};

use serde::Serialize;

use crate::error::StoreError;
use crate::reachability;
use crate::services;
use crate::store::repo::{self, Repository};
use crate::store::{links, Db};
use crate::types::{EdgeRouter, EntityKind, Identity, Service, SessionType};

/// Source of router connectivity.
pub trait RouterStatus: Send + Sync {
    /// True when the router is currently connected.
    fn is_online(&self, router_id: &str) -> bool;
}

/// Router connectivity tracked in memory.
#[derive(Debug, Default)]
pub struct OnlineRouterRegistry {
    online: RwLock<HashSet<String>>,
}

impl OnlineRouterRegistry {
    /// Empty registry; every router is offline.
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark a router connected or disconnected.
    pub fn set_online(&self, router_id: &str, online: bool) {
        if let Ok(mut set) = self.online.write() {
            if online {
                set.insert(router_id.to_owned());
            } else {
                set.remove(router_id);
            }
        }
    }
}

impl RouterStatus for OnlineRouterRegistry {
    fn is_online(&self, router_id: &str) -> bool {
        self.online
            .read()
            .map(|set| set.contains(router_id))
            .unwrap_or(false)
    }
}

/// A router usable by both sides of an analysis.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommonRouter {
    /// The router.
    pub router: EdgeRouter,
    /// Connectivity at analysis time.
    pub is_online: bool,
    /// Edge router policies linking the identity to the router.
    pub identity_policies: Vec<String>,
    /// Service edge router policies linking the service to the router.
    pub service_policies: Vec<String>,
}

/// Reachability of one service for one identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceReachability {
    /// The identity.
    pub identity: Identity,
    /// The service.
    pub service: Service,
    /// Identity may bind.
    pub is_bind_allowed: bool,
    /// Identity may dial.
    pub is_dial_allowed: bool,
    /// Routers the identity may use.
    pub identity_router_count: usize,
    /// Routers the service may be reached through.
    pub service_router_count: usize,
    /// Routers in both sets; every router for admins.
    pub common_routers: Vec<CommonRouter>,
}

/// Policies linking an entity pair.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkInspection {
    /// First entity.
    pub from_id: String,
    /// Second entity.
    pub to_id: String,
    /// Linking policy ids, in id order.
    pub policies: Vec<String>,
}

/// Diagnoses identity, service and router connectivity.
#[derive(Clone)]
pub struct PolicyAdvisor {
    db: Db,
    router_status: Arc<dyn RouterStatus>,
}

impl std::fmt::Debug for PolicyAdvisor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PolicyAdvisor").finish_non_exhaustive()
    }
}

impl PolicyAdvisor {
    /// New advisor.
    pub fn new(db: Db, router_status: Arc<dyn RouterStatus>) -> Self {
        Self { db, router_status }
    }

    /// Explain whether and through which routers an identity reaches a
    /// service.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown identity or service.
    pub async fn analyze_service_reachability(
        &self,
        identity_id: &str,
        service_id: &str,
    ) -> Result<ServiceReachability, StoreError> {
        let mut tx = self.db.view().await?;
        let identity = repo::load_required::<Identity>(&mut tx, identity_id).await?;
        let service = repo::load_required::<Service>(&mut tx, service_id).await?;

        let permissions = services::read_for_identity(&mut tx, service_id, &identity)
            .await?
            .map(|detail| detail.permissions)
            .unwrap_or_default();

        let identity_routers = reachability::identity_routers(&mut tx, &identity).await?;
        let service_routers = reachability::service_routers(&mut tx, service_id).await?;

        let mut common_routers = Vec::new();
        for (router_id, identity_policies) in &identity_routers {
            // Admins reach every router, linked to the service or not.
            let service_policies = match service_routers.get(router_id) {
                Some(policies) => policies.clone(),
                None if identity.is_admin => Vec::new(),
                None => continue,
            };
            let Some(router) = EdgeRouter::load(&mut tx, router_id).await? else {
                continue;
            };
            common_routers.push(CommonRouter {
                is_online: self.router_status.is_online(router_id),
                router,
                identity_policies: identity_policies.clone(),
                service_policies,
            });
        }

        Ok(ServiceReachability {
            is_bind_allowed: permissions.contains(&SessionType::Bind),
            is_dial_allowed: permissions.contains(&SessionType::Dial),
            identity_router_count: identity_routers.len(),
            service_router_count: service_routers.len(),
            common_routers,
            identity,
            service,
        })
    }

    async fn inspect(
        &self,
        policy_kind: EntityKind,
        from: (EntityKind, &str),
        to: (EntityKind, &str),
    ) -> Result<LinkInspection, StoreError> {
        let mut tx = self.db.view().await?;
        for (kind, id) in [from, to] {
            if !repo::exists(&mut tx, kind, id).await? {
                return Err(StoreError::not_found(kind.as_str(), id));
            }
        }
        let policies = links::policies_linking(&mut tx, policy_kind, from, to).await?;
        Ok(LinkInspection {
            from_id: from.1.to_owned(),
            to_id: to.1.to_owned(),
            policies,
        })
    }

    /// Edge router policies linking an identity and a router.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when either entity is missing.
    pub async fn inspect_identity_edge_router_links(
        &self,
        identity_id: &str,
        router_id: &str,
    ) -> Result<LinkInspection, StoreError> {
        self.inspect(
            EntityKind::EdgeRouterPolicy,
            (EntityKind::Identity, identity_id),
            (EntityKind::EdgeRouter, router_id),
        )
        .await
    }

    /// Service policies linking an identity and a service.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when either entity is missing.
    pub async fn inspect_identity_service_links(
        &self,
        identity_id: &str,
        service_id: &str,
    ) -> Result<LinkInspection, StoreError> {
        self.inspect(
            EntityKind::ServicePolicy,
            (EntityKind::Identity, identity_id),
            (EntityKind::Service, service_id),
        )
        .await
    }

    /// Service edge router policies linking a service and a router.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] when either entity is missing.
    pub async fn inspect_service_edge_router_links(
        &self,
        service_id: &str,
        router_id: &str,
    ) -> Result<LinkInspection, StoreError> {
        self.inspect(
            EntityKind::ServiceEdgeRouterPolicy,
            (EntityKind::Service, service_id),
            (EntityKind::EdgeRouter, router_id),
        )
        .await
    }
}
