//! Typed persistence, one [`Repository`] implementation per entity.
//!
//! Every method takes the connection of an already-open transaction so that
//! entity writes, link-index maintenance and cascade bookkeeping commit
//! together.

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqliteConnection};

use super::{decode_list, decode_time, encode_list, encode_time, map_unique, FieldSet};
use crate::error::{FieldError, StoreError};
use crate::roles::{validate_role_attributes, Semantic};
use crate::types::policy::Policy;
use crate::types::{
    ApiSession, ApiSessionCertificate, Config, EdgeRouter, EdgeRouterPolicy, EntityKind, Identity,
    PostureCheck, PostureCheckKind, Service, ServiceEdgeRouterPolicy, ServicePolicy, Session,
    SessionType,
};

/// Persistence for one entity type.
#[async_trait]
pub trait Repository: Sized + Clone + Send + Sync + Serialize + DeserializeOwned {
    /// Entity kind, which also names the table.
    const KIND: EntityKind;

    /// Entity id.
    fn id(&self) -> &str;

    /// Static validation, run before dispatch and again on apply.
    ///
    /// # Errors
    ///
    /// Returns a [`FieldError`] describing the first invalid field.
    fn validate(&self) -> Result<(), FieldError> {
        Ok(())
    }

    /// Copy the fields named in `fields` from `update` onto `self`.
    fn patch(&mut self, update: &Self, fields: &FieldSet);

    /// Reject updates that change immutable state.
    ///
    /// # Errors
    ///
    /// Returns a [`FieldError`] naming the immutable field.
    fn check_update(&self, _update: &Self, _fields: &FieldSet) -> Result<(), FieldError> {
        Ok(())
    }

    /// Load by id.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError`] on database or decoding failure.
    async fn load(conn: &mut SqliteConnection, id: &str) -> Result<Option<Self>, StoreError>;

    /// Insert a new row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when a unique value is taken.
    async fn insert(&self, conn: &mut SqliteConnection) -> Result<(), StoreError>;

    /// Overwrite the stored row.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Conflict`] when a unique value is taken.
    async fn save(&self, conn: &mut SqliteConnection) -> Result<(), StoreError>;

    /// Delete by id. Returns whether a row existed.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Database`] on failure.
    async fn delete(conn: &mut SqliteConnection, id: &str) -> Result<bool, StoreError> {
        let sql = format!("DELETE FROM {} WHERE id = ?", Self::KIND.table());
        let result = sqlx::query(&sql).bind(id).execute(&mut *conn).await?;
        Ok(result.rows_affected() > 0)
    }
}

/// Load by id or fail with [`StoreError::NotFound`].
///
/// # Errors
///
/// Returns [`StoreError::NotFound`] when no row matches.
pub async fn load_required<E: Repository>(
    conn: &mut SqliteConnection,
    id: &str,
) -> Result<E, StoreError> {
    E::load(conn, id)
        .await?
        .ok_or_else(|| StoreError::not_found(E::KIND.as_str(), id))
}

/// True when a row of `kind` with `id` exists.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on failure.
pub async fn exists(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    id: &str,
) -> Result<bool, StoreError> {
    let sql = format!("SELECT 1 FROM {} WHERE id = ?", kind.table());
    let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
    Ok(row.is_some())
}

/// Id of the entity of `kind` with a unique name.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on failure.
pub async fn id_for_name(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    name: &str,
) -> Result<Option<String>, StoreError> {
    let sql = format!("SELECT id FROM {} WHERE name = ?", kind.table());
    let id = sqlx::query_scalar::<_, String>(&sql)
        .bind(name)
        .fetch_optional(&mut *conn)
        .await?;
    Ok(id)
}

/// Every id of `kind`, in id order.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on failure.
pub async fn list_ids(conn: &mut SqliteConnection, kind: EntityKind) -> Result<Vec<String>, StoreError> {
    let sql = format!("SELECT id FROM {} ORDER BY id", kind.table());
    let ids = sqlx::query_scalar::<_, String>(&sql)
        .fetch_all(&mut *conn)
        .await?;
    Ok(ids)
}

fn validate_name(name: &str) -> Result<(), FieldError> {
    if name.trim().is_empty() {
        return Err(FieldError::new("name is required", "name", name));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Identity
// ---------------------------------------------------------------------------

const IDENTITY_COLUMNS: &str =
    "id, name, role_attributes, is_admin, auth_policy_id, disabled, service_configs, created_at";

fn identity_from_row(row: &SqliteRow) -> Result<Identity, StoreError> {
    Ok(Identity {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        role_attributes: decode_list(row.try_get("role_attributes")?)?,
        is_admin: row.try_get("is_admin")?,
        auth_policy_id: row.try_get("auth_policy_id")?,
        disabled: row.try_get("disabled")?,
        service_configs: serde_json::from_str(row.try_get("service_configs")?)?,
        created_at: decode_time("identities", row.try_get("created_at")?)?,
    })
}

#[async_trait]
impl Repository for Identity {
    const KIND: EntityKind = EntityKind::Identity;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), FieldError> {
        validate_name(&self.name)?;
        validate_role_attributes(&self.role_attributes)
    }

    fn patch(&mut self, update: &Self, fields: &FieldSet) {
        if fields.contains("name") {
            self.name.clone_from(&update.name);
        }
        if fields.contains("roleAttributes") {
            self.role_attributes.clone_from(&update.role_attributes);
        }
        if fields.contains("isAdmin") {
            self.is_admin = update.is_admin;
        }
        if fields.contains("authPolicyId") {
            self.auth_policy_id.clone_from(&update.auth_policy_id);
        }
        if fields.contains("disabled") {
            self.disabled = update.disabled;
        }
        if fields.contains("serviceConfigs") {
            self.service_configs.clone_from(&update.service_configs);
        }
    }

    async fn load(conn: &mut SqliteConnection, id: &str) -> Result<Option<Self>, StoreError> {
        let sql = format!("SELECT {IDENTITY_COLUMNS} FROM identities WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
        row.as_ref().map(identity_from_row).transpose()
    }

    async fn insert(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO identities (id, name, role_attributes, is_admin, auth_policy_id, \
             disabled, service_configs, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.id)
        .bind(&self.name)
        .bind(encode_list(&self.role_attributes)?)
        .bind(self.is_admin)
        .bind(&self.auth_policy_id)
        .bind(self.disabled)
        .bind(serde_json::to_string(&self.service_configs)?)
        .bind(encode_time(self.created_at))
        .execute(&mut *conn)
        .await
        .map_err(|e| map_unique(e, "identity", "name", &self.name))?;
        Ok(())
    }

    async fn save(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE identities SET name = ?, role_attributes = ?, is_admin = ?, \
             auth_policy_id = ?, disabled = ?, service_configs = ? WHERE id = ?",
        )
        .bind(&self.name)
        .bind(encode_list(&self.role_attributes)?)
        .bind(self.is_admin)
        .bind(&self.auth_policy_id)
        .bind(self.disabled)
        .bind(serde_json::to_string(&self.service_configs)?)
        .bind(&self.id)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_unique(e, "identity", "name", &self.name))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

fn service_from_row(row: &SqliteRow) -> Result<Service, StoreError> {
    Ok(Service {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        role_attributes: decode_list(row.try_get("role_attributes")?)?,
        configs: decode_list(row.try_get("configs")?)?,
        created_at: decode_time("services", row.try_get("created_at")?)?,
    })
}

#[async_trait]
impl Repository for Service {
    const KIND: EntityKind = EntityKind::Service;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), FieldError> {
        validate_name(&self.name)?;
        validate_role_attributes(&self.role_attributes)
    }

    fn patch(&mut self, update: &Self, fields: &FieldSet) {
        if fields.contains("name") {
            self.name.clone_from(&update.name);
        }
        if fields.contains("roleAttributes") {
            self.role_attributes.clone_from(&update.role_attributes);
        }
        if fields.contains("configs") {
            self.configs.clone_from(&update.configs);
        }
    }

    async fn load(conn: &mut SqliteConnection, id: &str) -> Result<Option<Self>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, role_attributes, configs, created_at FROM services WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(service_from_row).transpose()
    }

    async fn insert(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO services (id, name, role_attributes, configs, created_at) \
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&self.id)
        .bind(&self.name)
        .bind(encode_list(&self.role_attributes)?)
        .bind(encode_list(&self.configs)?)
        .bind(encode_time(self.created_at))
        .execute(&mut *conn)
        .await
        .map_err(|e| map_unique(e, "service", "name", &self.name))?;
        Ok(())
    }

    async fn save(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query("UPDATE services SET name = ?, role_attributes = ?, configs = ? WHERE id = ?")
            .bind(&self.name)
            .bind(encode_list(&self.role_attributes)?)
            .bind(encode_list(&self.configs)?)
            .bind(&self.id)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_unique(e, "service", "name", &self.name))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Config
// ---------------------------------------------------------------------------

fn config_from_row(row: &SqliteRow) -> Result<Config, StoreError> {
    Ok(Config {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        config_type: row.try_get("config_type")?,
        data: serde_json::from_str(row.try_get("data")?)?,
        created_at: decode_time("configs", row.try_get("created_at")?)?,
    })
}

#[async_trait]
impl Repository for Config {
    const KIND: EntityKind = EntityKind::Config;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), FieldError> {
        validate_name(&self.name)?;
        if self.config_type.trim().is_empty() {
            return Err(FieldError::new("config type is required", "configType", ""));
        }
        Ok(())
    }

    fn patch(&mut self, update: &Self, fields: &FieldSet) {
        if fields.contains("name") {
            self.name.clone_from(&update.name);
        }
        if fields.contains("data") {
            self.data.clone_from(&update.data);
        }
    }

    fn check_update(&self, update: &Self, fields: &FieldSet) -> Result<(), FieldError> {
        if fields.contains("configType") && update.config_type != self.config_type {
            return Err(FieldError::new(
                "config type may not be changed",
                "configType",
                update.config_type.as_str(),
            ));
        }
        Ok(())
    }

    async fn load(conn: &mut SqliteConnection, id: &str) -> Result<Option<Self>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, config_type, data, created_at FROM configs WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(config_from_row).transpose()
    }

    async fn insert(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO configs (id, name, config_type, data, created_at) VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&self.id)
        .bind(&self.name)
        .bind(&self.config_type)
        .bind(serde_json::to_string(&self.data)?)
        .bind(encode_time(self.created_at))
        .execute(&mut *conn)
        .await
        .map_err(|e| map_unique(e, "config", "name", &self.name))?;
        Ok(())
    }

    async fn save(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query("UPDATE configs SET name = ?, data = ? WHERE id = ?")
            .bind(&self.name)
            .bind(serde_json::to_string(&self.data)?)
            .bind(&self.id)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_unique(e, "config", "name", &self.name))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EdgeRouter
// ---------------------------------------------------------------------------

fn edge_router_from_row(row: &SqliteRow) -> Result<EdgeRouter, StoreError> {
    Ok(EdgeRouter {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        role_attributes: decode_list(row.try_get("role_attributes")?)?,
        created_at: decode_time("edge_routers", row.try_get("created_at")?)?,
    })
}

/// Load several edge routers, skipping ids that no longer exist.
///
/// # Errors
///
/// Returns [`StoreError`] on database or decoding failure.
pub async fn load_edge_routers(
    conn: &mut SqliteConnection,
    ids: &[String],
) -> Result<Vec<EdgeRouter>, StoreError> {
    let mut routers = Vec::with_capacity(ids.len());
    for id in ids {
        if let Some(router) = EdgeRouter::load(&mut *conn, id).await? {
            routers.push(router);
        }
    }
    Ok(routers)
}

#[async_trait]
impl Repository for EdgeRouter {
    const KIND: EntityKind = EntityKind::EdgeRouter;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), FieldError> {
        validate_name(&self.name)?;
        validate_role_attributes(&self.role_attributes)
    }

    fn patch(&mut self, update: &Self, fields: &FieldSet) {
        if fields.contains("name") {
            self.name.clone_from(&update.name);
        }
        if fields.contains("roleAttributes") {
            self.role_attributes.clone_from(&update.role_attributes);
        }
    }

    async fn load(conn: &mut SqliteConnection, id: &str) -> Result<Option<Self>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, role_attributes, created_at FROM edge_routers WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(edge_router_from_row).transpose()
    }

    async fn insert(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO edge_routers (id, name, role_attributes, created_at) VALUES (?, ?, ?, ?)",
        )
        .bind(&self.id)
        .bind(&self.name)
        .bind(encode_list(&self.role_attributes)?)
        .bind(encode_time(self.created_at))
        .execute(&mut *conn)
        .await
        .map_err(|e| map_unique(e, "edgeRouter", "name", &self.name))?;
        Ok(())
    }

    async fn save(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query("UPDATE edge_routers SET name = ?, role_attributes = ? WHERE id = ?")
            .bind(&self.name)
            .bind(encode_list(&self.role_attributes)?)
            .bind(&self.id)
            .execute(&mut *conn)
            .await
            .map_err(|e| map_unique(e, "edgeRouter", "name", &self.name))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// PostureCheck
// ---------------------------------------------------------------------------

fn posture_check_from_row(row: &SqliteRow) -> Result<PostureCheck, StoreError> {
    let kind: PostureCheckKind = serde_json::from_str(row.try_get("payload")?)?;
    let type_id: String = row.try_get("type_id")?;
    if kind.type_id().as_str() != type_id {
        return Err(StoreError::Corrupt {
            table: "posture_checks",
            detail: format!("type_id {type_id} does not match payload {}", kind.type_id()),
        });
    }
    Ok(PostureCheck {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        role_attributes: decode_list(row.try_get("role_attributes")?)?,
        version: row.try_get("version")?,
        kind,
        created_at: decode_time("posture_checks", row.try_get("created_at")?)?,
    })
}

#[async_trait]
impl Repository for PostureCheck {
    const KIND: EntityKind = EntityKind::PostureCheck;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), FieldError> {
        validate_name(&self.name)?;
        validate_role_attributes(&self.role_attributes)?;
        self.kind.validate()
    }

    fn patch(&mut self, update: &Self, fields: &FieldSet) {
        if fields.contains("name") {
            self.name.clone_from(&update.name);
        }
        if fields.contains("roleAttributes") {
            self.role_attributes.clone_from(&update.role_attributes);
        }
        if fields.contains("kind") {
            self.kind.clone_from(&update.kind);
        }
        self.version = self.version.saturating_add(1);
    }

    fn check_update(&self, update: &Self, fields: &FieldSet) -> Result<(), FieldError> {
        if fields.contains("kind") && update.type_id() != self.type_id() {
            return Err(FieldError::new(
                format!("posture check kind is {} and may not be changed", self.type_id()),
                "typeId",
                update.type_id().as_str(),
            ));
        }
        Ok(())
    }

    async fn load(conn: &mut SqliteConnection, id: &str) -> Result<Option<Self>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, type_id, version, role_attributes, payload, created_at \
             FROM posture_checks WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(posture_check_from_row).transpose()
    }

    async fn insert(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO posture_checks (id, name, type_id, version, role_attributes, payload, \
             created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.id)
        .bind(&self.name)
        .bind(self.type_id().as_str())
        .bind(self.version)
        .bind(encode_list(&self.role_attributes)?)
        .bind(serde_json::to_string(&self.kind)?)
        .bind(encode_time(self.created_at))
        .execute(&mut *conn)
        .await
        .map_err(|e| map_unique(e, "postureCheck", "name", &self.name))?;
        Ok(())
    }

    async fn save(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE posture_checks SET name = ?, version = ?, role_attributes = ?, payload = ? \
             WHERE id = ?",
        )
        .bind(&self.name)
        .bind(self.version)
        .bind(encode_list(&self.role_attributes)?)
        .bind(serde_json::to_string(&self.kind)?)
        .bind(&self.id)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_unique(e, "postureCheck", "name", &self.name))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Policies
// ---------------------------------------------------------------------------

fn semantic_from_row(row: &SqliteRow, table: &'static str) -> Result<Semantic, StoreError> {
    let raw: String = row.try_get("semantic")?;
    Semantic::parse(&raw).map_err(|e| StoreError::Corrupt {
        table,
        detail: e.to_string(),
    })
}

fn service_policy_from_row(row: &SqliteRow) -> Result<ServicePolicy, StoreError> {
    let raw_type: String = row.try_get("policy_type")?;
    Ok(ServicePolicy {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        policy_type: SessionType::parse(&raw_type).map_err(|e| StoreError::Corrupt {
            table: "service_policies",
            detail: e.to_string(),
        })?,
        semantic: semantic_from_row(row, "service_policies")?,
        identity_roles: decode_list(row.try_get("identity_roles")?)?,
        service_roles: decode_list(row.try_get("service_roles")?)?,
        posture_check_roles: decode_list(row.try_get("posture_check_roles")?)?,
        created_at: decode_time("service_policies", row.try_get("created_at")?)?,
    })
}

#[async_trait]
impl Repository for ServicePolicy {
    const KIND: EntityKind = EntityKind::ServicePolicy;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), FieldError> {
        self.validate_roles()
    }

    fn patch(&mut self, update: &Self, fields: &FieldSet) {
        if fields.contains("name") {
            self.name.clone_from(&update.name);
        }
        if fields.contains("policyType") {
            self.policy_type = update.policy_type;
        }
        if fields.contains("semantic") {
            self.semantic = update.semantic;
        }
        if fields.contains("identityRoles") {
            self.identity_roles.clone_from(&update.identity_roles);
        }
        if fields.contains("serviceRoles") {
            self.service_roles.clone_from(&update.service_roles);
        }
        if fields.contains("postureCheckRoles") {
            self.posture_check_roles.clone_from(&update.posture_check_roles);
        }
    }

    async fn load(conn: &mut SqliteConnection, id: &str) -> Result<Option<Self>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, policy_type, semantic, identity_roles, service_roles, \
             posture_check_roles, created_at FROM service_policies WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(service_policy_from_row).transpose()
    }

    async fn insert(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO service_policies (id, name, policy_type, semantic, identity_roles, \
             service_roles, posture_check_roles, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.id)
        .bind(&self.name)
        .bind(self.policy_type.as_str())
        .bind(self.semantic.as_str())
        .bind(encode_list(&self.identity_roles)?)
        .bind(encode_list(&self.service_roles)?)
        .bind(encode_list(&self.posture_check_roles)?)
        .bind(encode_time(self.created_at))
        .execute(&mut *conn)
        .await
        .map_err(|e| map_unique(e, "servicePolicy", "name", &self.name))?;
        Ok(())
    }

    async fn save(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE service_policies SET name = ?, policy_type = ?, semantic = ?, \
             identity_roles = ?, service_roles = ?, posture_check_roles = ? WHERE id = ?",
        )
        .bind(&self.name)
        .bind(self.policy_type.as_str())
        .bind(self.semantic.as_str())
        .bind(encode_list(&self.identity_roles)?)
        .bind(encode_list(&self.service_roles)?)
        .bind(encode_list(&self.posture_check_roles)?)
        .bind(&self.id)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_unique(e, "servicePolicy", "name", &self.name))?;
        Ok(())
    }
}

fn edge_router_policy_from_row(row: &SqliteRow) -> Result<EdgeRouterPolicy, StoreError> {
    Ok(EdgeRouterPolicy {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        semantic: semantic_from_row(row, "edge_router_policies")?,
        identity_roles: decode_list(row.try_get("identity_roles")?)?,
        edge_router_roles: decode_list(row.try_get("edge_router_roles")?)?,
        created_at: decode_time("edge_router_policies", row.try_get("created_at")?)?,
    })
}

#[async_trait]
impl Repository for EdgeRouterPolicy {
    const KIND: EntityKind = EntityKind::EdgeRouterPolicy;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), FieldError> {
        self.validate_roles()
    }

    fn patch(&mut self, update: &Self, fields: &FieldSet) {
        if fields.contains("name") {
            self.name.clone_from(&update.name);
        }
        if fields.contains("semantic") {
            self.semantic = update.semantic;
        }
        if fields.contains("identityRoles") {
            self.identity_roles.clone_from(&update.identity_roles);
        }
        if fields.contains("edgeRouterRoles") {
            self.edge_router_roles.clone_from(&update.edge_router_roles);
        }
    }

    async fn load(conn: &mut SqliteConnection, id: &str) -> Result<Option<Self>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, semantic, identity_roles, edge_router_roles, created_at \
             FROM edge_router_policies WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(edge_router_policy_from_row).transpose()
    }

    async fn insert(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO edge_router_policies (id, name, semantic, identity_roles, \
             edge_router_roles, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.id)
        .bind(&self.name)
        .bind(self.semantic.as_str())
        .bind(encode_list(&self.identity_roles)?)
        .bind(encode_list(&self.edge_router_roles)?)
        .bind(encode_time(self.created_at))
        .execute(&mut *conn)
        .await
        .map_err(|e| map_unique(e, "edgeRouterPolicy", "name", &self.name))?;
        Ok(())
    }

    async fn save(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE edge_router_policies SET name = ?, semantic = ?, identity_roles = ?, \
             edge_router_roles = ? WHERE id = ?",
        )
        .bind(&self.name)
        .bind(self.semantic.as_str())
        .bind(encode_list(&self.identity_roles)?)
        .bind(encode_list(&self.edge_router_roles)?)
        .bind(&self.id)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_unique(e, "edgeRouterPolicy", "name", &self.name))?;
        Ok(())
    }
}

fn service_edge_router_policy_from_row(
    row: &SqliteRow,
) -> Result<ServiceEdgeRouterPolicy, StoreError> {
    Ok(ServiceEdgeRouterPolicy {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        semantic: semantic_from_row(row, "service_edge_router_policies")?,
        service_roles: decode_list(row.try_get("service_roles")?)?,
        edge_router_roles: decode_list(row.try_get("edge_router_roles")?)?,
        created_at: decode_time("service_edge_router_policies", row.try_get("created_at")?)?,
    })
}

#[async_trait]
impl Repository for ServiceEdgeRouterPolicy {
    const KIND: EntityKind = EntityKind::ServiceEdgeRouterPolicy;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), FieldError> {
        self.validate_roles()
    }

    fn patch(&mut self, update: &Self, fields: &FieldSet) {
        if fields.contains("name") {
            self.name.clone_from(&update.name);
        }
        if fields.contains("semantic") {
            self.semantic = update.semantic;
        }
        if fields.contains("serviceRoles") {
            self.service_roles.clone_from(&update.service_roles);
        }
        if fields.contains("edgeRouterRoles") {
            self.edge_router_roles.clone_from(&update.edge_router_roles);
        }
    }

    async fn load(conn: &mut SqliteConnection, id: &str) -> Result<Option<Self>, StoreError> {
        let row = sqlx::query(
            "SELECT id, name, semantic, service_roles, edge_router_roles, created_at \
             FROM service_edge_router_policies WHERE id = ?",
        )
        .bind(id)
        .fetch_optional(&mut *conn)
        .await?;
        row.as_ref().map(service_edge_router_policy_from_row).transpose()
    }

    async fn insert(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO service_edge_router_policies (id, name, semantic, service_roles, \
             edge_router_roles, created_at) VALUES (?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.id)
        .bind(&self.name)
        .bind(self.semantic.as_str())
        .bind(encode_list(&self.service_roles)?)
        .bind(encode_list(&self.edge_router_roles)?)
        .bind(encode_time(self.created_at))
        .execute(&mut *conn)
        .await
        .map_err(|e| map_unique(e, "serviceEdgeRouterPolicy", "name", &self.name))?;
        Ok(())
    }

    async fn save(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE service_edge_router_policies SET name = ?, semantic = ?, service_roles = ?, \
             edge_router_roles = ? WHERE id = ?",
        )
        .bind(&self.name)
        .bind(self.semantic.as_str())
        .bind(encode_list(&self.service_roles)?)
        .bind(encode_list(&self.edge_router_roles)?)
        .bind(&self.id)
        .execute(&mut *conn)
        .await
        .map_err(|e| map_unique(e, "serviceEdgeRouterPolicy", "name", &self.name))?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// ApiSession
// ---------------------------------------------------------------------------

pub(crate) const API_SESSION_COLUMNS: &str =
    "id, identity_id, token, mfa_complete, mfa_required, last_activity_at, created_at";

/// Decode an api session row; certificates are loaded separately.
pub(crate) fn api_session_from_row(row: &SqliteRow) -> Result<ApiSession, StoreError> {
    Ok(ApiSession {
        id: row.try_get("id")?,
        identity_id: row.try_get("identity_id")?,
        token: row.try_get("token")?,
        mfa_complete: row.try_get("mfa_complete")?,
        mfa_required: row.try_get("mfa_required")?,
        last_activity_at: decode_time("api_sessions", row.try_get("last_activity_at")?)?,
        certificates: Vec::new(),
        created_at: decode_time("api_sessions", row.try_get("created_at")?)?,
    })
}

/// Certificates presented for an api session.
///
/// # Errors
///
/// Returns [`StoreError`] on database or decoding failure.
pub async fn load_certificates(
    conn: &mut SqliteConnection,
    api_session_id: &str,
) -> Result<Vec<ApiSessionCertificate>, StoreError> {
    let rows = sqlx::query(
        "SELECT id, fingerprint, subject, valid_after, valid_before \
         FROM api_session_certificates WHERE api_session_id = ? ORDER BY id",
    )
    .bind(api_session_id)
    .fetch_all(&mut *conn)
    .await?;

    rows.iter()
        .map(|row| {
            Ok(ApiSessionCertificate {
                id: row.try_get("id")?,
                fingerprint: row.try_get("fingerprint")?,
                subject: row.try_get("subject")?,
                valid_after: decode_time("api_session_certificates", row.try_get("valid_after")?)?,
                valid_before: decode_time(
                    "api_session_certificates",
                    row.try_get("valid_before")?,
                )?,
            })
        })
        .collect()
}

#[async_trait]
impl Repository for ApiSession {
    const KIND: EntityKind = EntityKind::ApiSession;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), FieldError> {
        if self.identity_id.is_empty() {
            return Err(FieldError::new("identity is required", "identityId", ""));
        }
        if self.token.is_empty() {
            return Err(FieldError::new("token is required", "token", ""));
        }
        Ok(())
    }

    fn patch(&mut self, update: &Self, fields: &FieldSet) {
        if fields.contains("mfaComplete") {
            self.mfa_complete = update.mfa_complete;
        }
        if fields.contains("mfaRequired") {
            self.mfa_required = update.mfa_required;
        }
        if fields.contains("lastActivityAt") {
            self.last_activity_at = update.last_activity_at;
        }
    }

    async fn load(conn: &mut SqliteConnection, id: &str) -> Result<Option<Self>, StoreError> {
        let sql = format!("SELECT {API_SESSION_COLUMNS} FROM api_sessions WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
        let Some(row) = row else {
            return Ok(None);
        };
        let mut api_session = api_session_from_row(&row)?;
        api_session.certificates = load_certificates(conn, id).await?;
        Ok(Some(api_session))
    }

    async fn insert(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO api_sessions (id, identity_id, token, mfa_complete, mfa_required, \
             last_activity_at, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.id)
        .bind(&self.identity_id)
        .bind(&self.token)
        .bind(self.mfa_complete)
        .bind(self.mfa_required)
        .bind(encode_time(self.last_activity_at))
        .bind(encode_time(self.created_at))
        .execute(&mut *conn)
        .await
        .map_err(|e| map_unique(e, "apiSession", "token", "<redacted>"))?;

        for cert in &self.certificates {
            sqlx::query(
                "INSERT INTO api_session_certificates (id, api_session_id, fingerprint, subject, \
                 valid_after, valid_before) VALUES (?, ?, ?, ?, ?, ?)",
            )
            .bind(&cert.id)
            .bind(&self.id)
            .bind(&cert.fingerprint)
            .bind(&cert.subject)
            .bind(encode_time(cert.valid_after))
            .bind(encode_time(cert.valid_before))
            .execute(&mut *conn)
            .await?;
        }
        Ok(())
    }

    async fn save(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query(
            "UPDATE api_sessions SET mfa_complete = ?, mfa_required = ?, last_activity_at = ? \
             WHERE id = ?",
        )
        .bind(self.mfa_complete)
        .bind(self.mfa_required)
        .bind(encode_time(self.last_activity_at))
        .bind(&self.id)
        .execute(&mut *conn)
        .await?;
        Ok(())
    }

    async fn delete(conn: &mut SqliteConnection, id: &str) -> Result<bool, StoreError> {
        sqlx::query("DELETE FROM api_session_certificates WHERE api_session_id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        let result = sqlx::query("DELETE FROM api_sessions WHERE id = ?")
            .bind(id)
            .execute(&mut *conn)
            .await?;
        Ok(result.rows_affected() > 0)
    }
}

// ---------------------------------------------------------------------------
// Session
// ---------------------------------------------------------------------------

pub(crate) const SESSION_COLUMNS: &str =
    "id, api_session_id, identity_id, service_id, session_type, token, service_policies, created_at";

/// Decode a session row.
pub(crate) fn session_from_row(row: &SqliteRow) -> Result<Session, StoreError> {
    let raw_type: String = row.try_get("session_type")?;
    Ok(Session {
        id: row.try_get("id")?,
        api_session_id: row.try_get("api_session_id")?,
        identity_id: row.try_get("identity_id")?,
        service_id: row.try_get("service_id")?,
        session_type: SessionType::parse(&raw_type).map_err(|e| StoreError::Corrupt {
            table: "sessions",
            detail: e.to_string(),
        })?,
        token: row.try_get("token")?,
        service_policies: decode_list(row.try_get("service_policies")?)?,
        created_at: decode_time("sessions", row.try_get("created_at")?)?,
    })
}

#[async_trait]
impl Repository for Session {
    const KIND: EntityKind = EntityKind::Session;

    fn id(&self) -> &str {
        &self.id
    }

    fn validate(&self) -> Result<(), FieldError> {
        if self.api_session_id.is_empty() {
            return Err(FieldError::new("api session is required", "apiSessionId", ""));
        }
        if self.service_id.is_empty() {
            return Err(FieldError::new("service is required", "serviceId", ""));
        }
        Ok(())
    }

    fn patch(&mut self, update: &Self, fields: &FieldSet) {
        if fields.contains("servicePolicies") {
            self.service_policies.clone_from(&update.service_policies);
        }
    }

    async fn load(conn: &mut SqliteConnection, id: &str) -> Result<Option<Self>, StoreError> {
        let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE id = ?");
        let row = sqlx::query(&sql).bind(id).fetch_optional(&mut *conn).await?;
        row.as_ref().map(session_from_row).transpose()
    }

    async fn insert(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO sessions (id, api_session_id, identity_id, service_id, session_type, \
             token, service_policies, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(&self.id)
        .bind(&self.api_session_id)
        .bind(&self.identity_id)
        .bind(&self.service_id)
        .bind(self.session_type.as_str())
        .bind(&self.token)
        .bind(encode_list(&self.service_policies)?)
        .bind(encode_time(self.created_at))
        .execute(&mut *conn)
        .await
        .map_err(|e| map_unique(e, "session", "apiSessionId/type/serviceId", &self.api_session_id))?;
        Ok(())
    }

    async fn save(&self, conn: &mut SqliteConnection) -> Result<(), StoreError> {
        sqlx::query("UPDATE sessions SET service_policies = ? WHERE id = ?")
            .bind(encode_list(&self.service_policies)?)
            .bind(&self.id)
            .execute(&mut *conn)
            .await?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Indexed lookups and filters
// ---------------------------------------------------------------------------

/// Id of the session holding an (api session, type, service) tuple.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on failure.
pub async fn find_session_for_tuple(
    conn: &mut SqliteConnection,
    api_session_id: &str,
    session_type: SessionType,
    service_id: &str,
) -> Result<Option<String>, StoreError> {
    let id = sqlx::query_scalar::<_, String>(
        "SELECT id FROM sessions WHERE api_session_id = ? AND session_type = ? AND service_id = ?",
    )
    .bind(api_session_id)
    .bind(session_type.as_str())
    .bind(service_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(id)
}

/// Session by bearer token.
///
/// # Errors
///
/// Returns [`StoreError`] on database or decoding failure.
pub async fn session_by_token(
    conn: &mut SqliteConnection,
    token: &str,
) -> Result<Option<Session>, StoreError> {
    let sql = format!("SELECT {SESSION_COLUMNS} FROM sessions WHERE token = ?");
    let row = sqlx::query(&sql).bind(token).fetch_optional(&mut *conn).await?;
    row.as_ref().map(session_from_row).transpose()
}

/// Api session by bearer token, with its certificates.
///
/// # Errors
///
/// Returns [`StoreError`] on database or decoding failure.
pub async fn api_session_by_token(
    conn: &mut SqliteConnection,
    token: &str,
) -> Result<Option<ApiSession>, StoreError> {
    let sql = format!("SELECT {API_SESSION_COLUMNS} FROM api_sessions WHERE token = ?");
    let row = sqlx::query(&sql).bind(token).fetch_optional(&mut *conn).await?;
    let Some(row) = row else {
        return Ok(None);
    };
    let mut api_session = api_session_from_row(&row)?;
    api_session.certificates = load_certificates(conn, &api_session.id).await?;
    Ok(Some(api_session))
}

/// Api sessions of an identity, oldest first, without certificates.
///
/// # Errors
///
/// Returns [`StoreError`] on database or decoding failure.
pub async fn api_sessions_for_identity(
    conn: &mut SqliteConnection,
    identity_id: &str,
) -> Result<Vec<ApiSession>, StoreError> {
    let sql = format!(
        "SELECT {API_SESSION_COLUMNS} FROM api_sessions WHERE identity_id = ? ORDER BY id"
    );
    let rows = sqlx::query(&sql).bind(identity_id).fetch_all(&mut *conn).await?;
    rows.iter().map(api_session_from_row).collect()
}

/// Delete every session for a service. Returns the number removed.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on failure.
pub async fn delete_sessions_for_service(
    conn: &mut SqliteConnection,
    service_id: &str,
) -> Result<u64, StoreError> {
    let result = sqlx::query("DELETE FROM sessions WHERE service_id = ?")
        .bind(service_id)
        .execute(&mut *conn)
        .await?;
    Ok(result.rows_affected())
}

/// Ids of services that reference a config.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on failure.
pub async fn services_using_config(
    conn: &mut SqliteConnection,
    config_id: &str,
) -> Result<Vec<String>, StoreError> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT id FROM services \
         WHERE EXISTS (SELECT 1 FROM json_each(services.configs) WHERE json_each.value = ?) \
         ORDER BY id",
    )
    .bind(config_id)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}

/// Equality filter over sessions. Unset fields match everything.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionFilter {
    /// Owning api session.
    pub api_session_id: Option<String>,
    /// Identity of the owning api session.
    pub identity_id: Option<String>,
    /// Service.
    pub service_id: Option<String>,
    /// Dial or bind.
    pub session_type: Option<SessionType>,
    /// Any of these services.
    pub service_ids: Option<Vec<String>>,
    /// Page size.
    pub limit: Option<i64>,
    /// Rows to skip.
    pub offset: Option<i64>,
}

/// Sessions matching a filter, in id order.
///
/// # Errors
///
/// Returns [`StoreError`] on database or decoding failure.
pub async fn list_sessions(
    conn: &mut SqliteConnection,
    filter: &SessionFilter,
) -> Result<Vec<Session>, StoreError> {
    let mut qb = sqlx::QueryBuilder::<sqlx::Sqlite>::new(format!(
        "SELECT {SESSION_COLUMNS} FROM sessions WHERE 1 = 1"
    ));
    if let Some(v) = &filter.api_session_id {
        qb.push(" AND api_session_id = ").push_bind(v.clone());
    }
    if let Some(v) = &filter.identity_id {
        qb.push(" AND identity_id = ").push_bind(v.clone());
    }
    if let Some(v) = &filter.service_id {
        qb.push(" AND service_id = ").push_bind(v.clone());
    }
    if let Some(v) = filter.session_type {
        qb.push(" AND session_type = ").push_bind(v.as_str());
    }
    if let Some(ids) = &filter.service_ids {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        qb.push(" AND service_id IN (");
        let mut separated = qb.separated(", ");
        for id in ids {
            separated.push_bind(id.clone());
        }
        separated.push_unseparated(")");
    }
    qb.push(" ORDER BY id");
    if let Some(limit) = filter.limit {
        qb.push(" LIMIT ").push_bind(limit);
        if let Some(offset) = filter.offset {
            qb.push(" OFFSET ").push_bind(offset);
        }
    }

    let rows = qb.build().fetch_all(&mut *conn).await?;
    rows.iter().map(session_from_row).collect()
}
