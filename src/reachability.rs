//! Edge router reachability.
//!
//! An identity reaches a service through a router when the router is linked
//! to the identity by an edge router policy and to the service by a service
//! edge router policy. Admin identities reach every router, whatever the
//! policies say.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use sqlx::SqliteConnection;

use crate::advisor::RouterStatus;
use crate::error::StoreError;
use crate::store::repo::{self, Repository};
use crate::store::{links, Db};
use crate::types::{EdgeRouter, EntityKind, Identity};

/// Default page size for [`list_for_identity_and_service`].
pub const DEFAULT_ROUTER_LIMIT: usize = 25;

/// Routers reachable by an identity, each with the edge router policies
/// that grant it. Admins get every router with no policies.
///
/// # Errors
///
/// Returns [`StoreError`] on database failure.
pub async fn identity_routers(
    conn: &mut SqliteConnection,
    identity: &Identity,
) -> Result<BTreeMap<String, Vec<String>>, StoreError> {
    if identity.is_admin {
        return Ok(repo::list_ids(conn, EntityKind::EdgeRouter)
            .await?
            .into_iter()
            .map(|id| (id, Vec::new()))
            .collect());
    }
    links::linked_through(
        conn,
        EntityKind::Identity,
        &identity.id,
        EntityKind::EdgeRouterPolicy,
        EntityKind::EdgeRouter,
    )
    .await
}

/// Routers a service may be reached through, each with the service edge
/// router policies that grant it.
///
/// # Errors
///
/// Returns [`StoreError`] on database failure.
pub async fn service_routers(
    conn: &mut SqliteConnection,
    service_id: &str,
) -> Result<BTreeMap<String, Vec<String>>, StoreError> {
    links::linked_through(
        conn,
        EntityKind::Service,
        service_id,
        EntityKind::ServiceEdgeRouterPolicy,
        EntityKind::EdgeRouter,
    )
    .await
}

/// Ids of routers usable by both the identity and the service, in id order.
/// Admins get every router.
///
/// # Errors
///
/// Returns [`StoreError`] on database failure.
pub async fn common_router_ids(
    conn: &mut SqliteConnection,
    identity: &Identity,
    service_id: &str,
) -> Result<Vec<String>, StoreError> {
    if identity.is_admin {
        return repo::list_ids(conn, EntityKind::EdgeRouter).await;
    }
    let a: BTreeSet<String> = identity_routers(conn, identity).await?.into_keys().collect();
    let b: BTreeSet<String> = service_routers(conn, service_id).await?.into_keys().collect();
    Ok(a.intersection(&b).cloned().collect())
}

/// True when `router_id` carries traffic for the identity and the service.
/// For admins, true when the router exists.
///
/// # Errors
///
/// Returns [`StoreError`] on database failure.
pub async fn is_access_to_edge_router_allowed(
    conn: &mut SqliteConnection,
    identity: &Identity,
    service_id: &str,
    router_id: &str,
) -> Result<bool, StoreError> {
    if identity.is_admin {
        return repo::exists(conn, EntityKind::EdgeRouter, router_id).await;
    }
    let for_identity = links::policies_linking(
        conn,
        EntityKind::EdgeRouterPolicy,
        (EntityKind::Identity, &identity.id),
        (EntityKind::EdgeRouter, router_id),
    )
    .await?;
    if for_identity.is_empty() {
        return Ok(false);
    }
    let for_service = links::policies_linking(
        conn,
        EntityKind::ServiceEdgeRouterPolicy,
        (EntityKind::Service, service_id),
        (EntityKind::EdgeRouter, router_id),
    )
    .await?;
    Ok(!for_service.is_empty())
}

/// Routers usable by both, at most `limit` (default 25). Online routers
/// come first, then id order.
///
/// # Errors
///
/// Returns [`StoreError`] on database failure.
pub async fn list_for_identity_and_service(
    conn: &mut SqliteConnection,
    status: &dyn RouterStatus,
    identity: &Identity,
    service_id: &str,
    limit: Option<usize>,
) -> Result<Vec<EdgeRouter>, StoreError> {
    let limit = limit.unwrap_or(DEFAULT_ROUTER_LIMIT);
    let mut ids = common_router_ids(conn, identity, service_id).await?;
    // Stable, so id order holds within each group.
    ids.sort_by_key(|id| !status.is_online(id));
    ids.truncate(limit);
    repo::load_edge_routers(conn, &ids).await
}

/// True when at least one router is usable by both.
///
/// # Errors
///
/// Returns [`StoreError`] on database failure.
pub async fn is_shared_edge_router_present(
    conn: &mut SqliteConnection,
    identity: &Identity,
    service_id: &str,
) -> Result<bool, StoreError> {
    Ok(!common_router_ids(conn, identity, service_id).await?.is_empty())
}

/// Reachability queries that open their own read transaction.
#[derive(Clone)]
pub struct EdgeRouterResolver {
    db: Db,
    router_status: Arc<dyn RouterStatus>,
}

impl std::fmt::Debug for EdgeRouterResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EdgeRouterResolver")
            .field("db", &self.db)
            .finish_non_exhaustive()
    }
}

impl EdgeRouterResolver {
    /// New resolver. `router_status` only orders listings.
    pub fn new(db: Db, router_status: Arc<dyn RouterStatus>) -> Self {
        Self { db, router_status }
    }

    async fn identity(conn: &mut SqliteConnection, identity_id: &str) -> Result<Identity, StoreError> {
        repo::load_required::<Identity>(conn, identity_id).await
    }

    /// See [`is_access_to_edge_router_allowed`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown identity.
    pub async fn is_access_to_edge_router_allowed(
        &self,
        identity_id: &str,
        service_id: &str,
        router_id: &str,
    ) -> Result<bool, StoreError> {
        let mut tx = self.db.view().await?;
        let identity = Self::identity(&mut tx, identity_id).await?;
        is_access_to_edge_router_allowed(&mut tx, &identity, service_id, router_id).await
    }

    /// See [`list_for_identity_and_service`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown identity.
    pub async fn list_for_identity_and_service(
        &self,
        identity_id: &str,
        service_id: &str,
        limit: Option<usize>,
    ) -> Result<Vec<EdgeRouter>, StoreError> {
        let mut tx = self.db.view().await?;
        let identity = Self::identity(&mut tx, identity_id).await?;
        list_for_identity_and_service(
            &mut tx,
            self.router_status.as_ref(),
            &identity,
            service_id,
            limit,
        )
        .await
    }

    /// See [`is_shared_edge_router_present`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::NotFound`] for an unknown identity.
    pub async fn is_shared_edge_router_present(
        &self,
        identity_id: &str,
        service_id: &str,
    ) -> Result<bool, StoreError> {
        let mut tx = self.db.view().await?;
        let identity = Self::identity(&mut tx, identity_id).await?;
        is_shared_edge_router_present(&mut tx, &identity, service_id).await
    }

    /// Router with id, if it exists.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database failure.
    pub async fn edge_router(&self, router_id: &str) -> Result<Option<EdgeRouter>, StoreError> {
        let mut tx = self.db.view().await?;
        EdgeRouter::load(&mut tx, router_id).await
    }
}
