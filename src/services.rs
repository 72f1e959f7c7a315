//! Service visibility for identities.
//!
//! A service is visible to an identity when some service policy links both.
//! The policy types of those policies are the identity's permissions on the
//! service. Admins see every service with both permissions.

use std::collections::BTreeMap;

use serde::Serialize;
use sqlx::SqliteConnection;

use crate::error::StoreError;
use crate::store::links;
use crate::store::repo::{self, Repository};
use crate::types::{Config, EntityKind, Identity, PostureCheck, Service, ServicePolicy, SessionType};

/// A service as seen by one identity.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDetail {
    /// The service.
    pub service: Service,
    /// Dial and/or bind, sorted.
    pub permissions: Vec<SessionType>,
    /// Effective config data keyed by config type.
    pub config: BTreeMap<String, serde_json::Value>,
}

impl ServiceDetail {
    /// True when the identity may open sessions of `session_type`.
    pub fn allows(&self, session_type: SessionType) -> bool {
        self.permissions.contains(&session_type)
    }
}

/// A service policy together with its linked posture checks.
#[derive(Debug, Clone)]
pub struct PolicyChecks {
    /// The policy.
    pub policy: ServicePolicy,
    /// Linked checks, in id order.
    pub checks: Vec<PostureCheck>,
}

/// Service policies linking both the identity and the service.
///
/// # Errors
///
/// Returns [`StoreError`] on database failure or a dangling link.
pub async fn linking_policies(
    conn: &mut SqliteConnection,
    identity_id: &str,
    service_id: &str,
) -> Result<Vec<ServicePolicy>, StoreError> {
    let ids = links::policies_linking(
        conn,
        EntityKind::ServicePolicy,
        (EntityKind::Identity, identity_id),
        (EntityKind::Service, service_id),
    )
    .await?;

    let mut policies = Vec::with_capacity(ids.len());
    for id in &ids {
        policies.push(repo::load_required::<ServicePolicy>(conn, id).await?);
    }
    Ok(policies)
}

/// Posture requirements of every service policy linking the pair.
///
/// # Errors
///
/// Returns [`StoreError`] on database failure or a dangling link.
pub async fn policy_posture_checks(
    conn: &mut SqliteConnection,
    identity_id: &str,
    service_id: &str,
) -> Result<Vec<PolicyChecks>, StoreError> {
    let policies = linking_policies(conn, identity_id, service_id).await?;
    let mut result = Vec::with_capacity(policies.len());
    for policy in policies {
        let check_ids = links::related_entities(conn, &policy.id, EntityKind::PostureCheck).await?;
        let mut checks = Vec::with_capacity(check_ids.len());
        for id in &check_ids {
            checks.push(repo::load_required::<PostureCheck>(conn, id).await?);
        }
        result.push(PolicyChecks { policy, checks });
    }
    Ok(result)
}

/// Resolve a service as visible to `identity`.
///
/// Returns `None` when the service does not exist or no policy grants the
/// identity any permission on it; callers cannot tell the two apart.
///
/// # Errors
///
/// Returns [`StoreError`] on database failure.
pub async fn read_for_identity(
    conn: &mut SqliteConnection,
    service_id: &str,
    identity: &Identity,
) -> Result<Option<ServiceDetail>, StoreError> {
    let Some(service) = Service::load(conn, service_id).await? else {
        return Ok(None);
    };

    let permissions = if identity.is_admin {
        vec![SessionType::Dial, SessionType::Bind]
    } else {
        let mut permissions: Vec<SessionType> = linking_policies(conn, &identity.id, service_id)
            .await?
            .iter()
            .map(|p| p.policy_type)
            .collect();
        permissions.sort();
        permissions.dedup();
        permissions
    };
    if permissions.is_empty() {
        return Ok(None);
    }

    let config = effective_config(conn, &service, identity).await?;
    Ok(Some(ServiceDetail {
        service,
        permissions,
        config,
    }))
}

/// Service configs by type, with the identity's overrides applied.
///
/// # Errors
///
/// Returns [`StoreError`] on database failure.
pub async fn effective_config(
    conn: &mut SqliteConnection,
    service: &Service,
    identity: &Identity,
) -> Result<BTreeMap<String, serde_json::Value>, StoreError> {
    let mut by_type = BTreeMap::new();
    for config_id in &service.configs {
        if let Some(config) = Config::load(conn, config_id).await? {
            by_type.insert(config.config_type, config.data);
        }
    }
    for override_ in identity
        .service_configs
        .iter()
        .filter(|o| o.service_id == service.id)
    {
        match Config::load(conn, &override_.config_id).await? {
            Some(config) => {
                by_type.insert(config.config_type, config.data);
            }
            None => tracing::debug!(
                identity_id = %identity.id,
                config_id = %override_.config_id,
                "skipping override for missing config"
            ),
        }
    }
    Ok(by_type)
}
