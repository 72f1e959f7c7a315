//! Policy link index.
//!
//! For every policy and every entity of a kind one of its sides selects, the
//! index holds a row iff the role matcher accepts the pair. Rows are
//! recomputed inside the write transaction that changes an entity's
//! attributes or a policy's roles, so readers never see stale links.
//!
//! Traversals:
//! - reverse: entity -> linked policies ([`related_policies`])
//! - forward: policy -> linked entities ([`related_entities`])
//! - two-hop: entity -> policies -> entities ([`linked_through`])

use std::collections::{BTreeMap, BTreeSet};

use sqlx::{Row, SqliteConnection};
use tracing::{debug, warn};

use super::{decode_list, encode_list, repo};
use crate::error::{FieldError, StoreError};
use crate::roles::{matches, RoleExpression, Semantic};
use crate::types::policy::{policies_targeting, policy_sides, Policy, SideSpec};
use crate::types::EntityKind;

/// One persisted link.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Link {
    /// Kind of the policy.
    pub policy_kind: EntityKind,
    /// Policy id.
    pub policy_id: String,
    /// Kind of the linked entity.
    pub entity_kind: EntityKind,
    /// Linked entity id.
    pub entity_id: String,
}

/// Difference between the stored index and a from-scratch recomputation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkDiscrepancy {
    /// Matcher accepts the pair but no row exists.
    Missing(Link),
    /// A row exists for a pair the matcher rejects.
    Stale(Link),
}

/// Whether a policy side links an entity.
///
/// An empty posture-check expression links nothing, whatever the semantic:
/// it means the policy has no posture requirement.
fn side_links(
    side: &SideSpec,
    expression: &RoleExpression,
    semantic: Semantic,
    entity_id: &str,
    entity_attributes: &[String],
) -> bool {
    if side.entity_kind == EntityKind::PostureCheck && expression.is_empty() {
        return false;
    }
    matches(entity_id, entity_attributes, expression, semantic)
}

fn parse_semantic(raw: &str, table: &'static str) -> Result<Semantic, StoreError> {
    Semantic::parse(raw).map_err(|e| StoreError::Corrupt {
        table,
        detail: e.to_string(),
    })
}

/// Every policy of `policy_kind` with the parsed expression of one side.
async fn load_policy_side(
    conn: &mut SqliteConnection,
    policy_kind: EntityKind,
    side: &SideSpec,
) -> Result<Vec<(String, Semantic, RoleExpression)>, StoreError> {
    let sql = format!(
        "SELECT id, semantic, {} AS roles FROM {}",
        side.column,
        policy_kind.table()
    );
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;

    let mut policies = Vec::with_capacity(rows.len());
    for row in &rows {
        let id: String = row.try_get("id")?;
        let semantic = parse_semantic(row.try_get("semantic")?, policy_kind.table())?;
        let raw = decode_list(row.try_get("roles")?)?;
        let expression = RoleExpression::parse(side.field, &raw)?;
        policies.push((id, semantic, expression));
    }
    Ok(policies)
}

/// Every entity of a linkable kind with its role attributes.
async fn load_attributes(
    conn: &mut SqliteConnection,
    kind: EntityKind,
) -> Result<Vec<(String, Vec<String>)>, StoreError> {
    let sql = format!("SELECT id, role_attributes FROM {}", kind.table());
    let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;
    rows.iter()
        .map(|row| Ok((row.try_get("id")?, decode_list(row.try_get("role_attributes")?)?)))
        .collect()
}

async fn insert_link(
    conn: &mut SqliteConnection,
    policy_kind: EntityKind,
    policy_id: &str,
    entity_kind: EntityKind,
    entity_id: &str,
) -> Result<(), StoreError> {
    sqlx::query(
        "INSERT OR IGNORE INTO policy_links (policy_kind, policy_id, entity_kind, entity_id) \
         VALUES (?, ?, ?, ?)",
    )
    .bind(policy_kind.as_str())
    .bind(policy_id)
    .bind(entity_kind.as_str())
    .bind(entity_id)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Maintenance
// ---------------------------------------------------------------------------

/// Recompute every link of an entity after it was created or its role
/// attributes changed.
///
/// # Errors
///
/// Returns [`StoreError`] on database failure or a corrupt stored policy.
pub async fn entity_changed(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    entity_id: &str,
    attributes: &[String],
) -> Result<(), StoreError> {
    remove_entity(conn, kind, entity_id).await?;

    let mut linked: usize = 0;
    for (policy_kind, side) in policies_targeting(kind) {
        for (policy_id, semantic, expression) in load_policy_side(conn, policy_kind, &side).await? {
            if side_links(&side, &expression, semantic, entity_id, attributes) {
                insert_link(conn, policy_kind, &policy_id, kind, entity_id).await?;
                linked = linked.saturating_add(1);
            }
        }
    }

    debug!(entity_kind = %kind, entity_id, linked, "recomputed entity links");
    Ok(())
}

/// Recompute every link of a policy after it was created or its roles or
/// semantic changed.
///
/// # Errors
///
/// Returns [`StoreError::Field`] if an `@id` term names an entity that does
/// not exist, or [`StoreError`] on database failure.
pub async fn policy_changed<P>(conn: &mut SqliteConnection, policy: &P) -> Result<(), StoreError>
where
    P: Policy + repo::Repository,
{
    let policy_id = policy.id().to_owned();
    remove_policy(conn, &policy_id).await?;

    let mut linked: usize = 0;
    for side in policy_sides(P::POLICY_KIND) {
        let expression = RoleExpression::parse(side.field, policy.roles(side))?;

        for id in expression.entity_refs() {
            if !repo::exists(conn, side.entity_kind, id).await? {
                return Err(FieldError::new(
                    format!("no {} found with the given id", side.entity_kind),
                    side.field,
                    format!("@{id}"),
                )
                .into());
            }
        }

        for (entity_id, attributes) in load_attributes(conn, side.entity_kind).await? {
            if side_links(side, &expression, policy.semantic(), &entity_id, &attributes) {
                insert_link(conn, P::POLICY_KIND, &policy_id, side.entity_kind, &entity_id).await?;
                linked = linked.saturating_add(1);
            }
        }
    }

    debug!(policy_kind = %P::POLICY_KIND, policy_id = %policy_id, linked, "recomputed policy links");
    Ok(())
}

/// Rewrite `@<name>` terms to `@<id>` before a policy is stored.
///
/// A term that already names an existing id is kept. Terms matching neither
/// an id nor a name are left for [`policy_changed`] to reject.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on failure.
pub async fn resolve_entity_names<P>(conn: &mut SqliteConnection, policy: &mut P) -> Result<(), StoreError>
where
    P: Policy,
{
    for side in policy_sides(P::POLICY_KIND) {
        let Some(roles) = policy.roles_mut(side) else {
            continue;
        };
        for term in roles.iter_mut() {
            let Some(reference) = term.strip_prefix('@') else {
                continue;
            };
            if reference.is_empty() || repo::exists(conn, side.entity_kind, reference).await? {
                continue;
            }
            if let Some(id) = repo::id_for_name(conn, side.entity_kind, reference).await? {
                debug!(entity_kind = %side.entity_kind, name = reference, id = %id, "resolved entity name");
                *term = format!("@{id}");
            }
        }
    }
    Ok(())
}

/// Strip `@<id>` terms naming a deleted entity from every policy, then
/// recompute the affected policy sides.
///
/// Returns the number of policies rewritten.
///
/// # Errors
///
/// Returns [`StoreError`] on database failure or a corrupt stored policy.
pub async fn remove_entity_references(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    entity_id: &str,
) -> Result<usize, StoreError> {
    let reference = format!("@{entity_id}");
    let mut rewritten: usize = 0;

    for (policy_kind, side) in policies_targeting(kind) {
        let sql = format!(
            "SELECT id, semantic, {} AS roles FROM {}",
            side.column,
            policy_kind.table()
        );
        let rows = sqlx::query(&sql).fetch_all(&mut *conn).await?;

        for row in &rows {
            let roles = decode_list(row.try_get("roles")?)?;
            if !roles.contains(&reference) {
                continue;
            }
            let policy_id: String = row.try_get("id")?;
            let semantic = parse_semantic(row.try_get("semantic")?, policy_kind.table())?;
            let remaining: Vec<String> = roles.into_iter().filter(|r| *r != reference).collect();

            let update = format!("UPDATE {} SET {} = ? WHERE id = ?", policy_kind.table(), side.column);
            sqlx::query(&update)
                .bind(encode_list(&remaining)?)
                .bind(&policy_id)
                .execute(&mut *conn)
                .await?;

            let expression = RoleExpression::parse(side.field, &remaining)?;
            relink_side(conn, policy_kind, &policy_id, &side, &expression, semantic).await?;
            rewritten = rewritten.saturating_add(1);
            debug!(policy_kind = %policy_kind, policy_id = %policy_id, entity_id, "removed entity reference");
        }
    }
    Ok(rewritten)
}

/// Replace the links of one policy side.
async fn relink_side(
    conn: &mut SqliteConnection,
    policy_kind: EntityKind,
    policy_id: &str,
    side: &SideSpec,
    expression: &RoleExpression,
    semantic: Semantic,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM policy_links WHERE policy_id = ? AND entity_kind = ?")
        .bind(policy_id)
        .bind(side.entity_kind.as_str())
        .execute(&mut *conn)
        .await?;
    for (entity_id, attributes) in load_attributes(conn, side.entity_kind).await? {
        if side_links(side, expression, semantic, &entity_id, &attributes) {
            insert_link(conn, policy_kind, policy_id, side.entity_kind, &entity_id).await?;
        }
    }
    Ok(())
}

/// Drop every link of a deleted entity.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on failure.
pub async fn remove_entity(
    conn: &mut SqliteConnection,
    kind: EntityKind,
    entity_id: &str,
) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM policy_links WHERE entity_kind = ? AND entity_id = ?")
        .bind(kind.as_str())
        .bind(entity_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

/// Drop every link of a deleted policy.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on failure.
pub async fn remove_policy(conn: &mut SqliteConnection, policy_id: &str) -> Result<(), StoreError> {
    sqlx::query("DELETE FROM policy_links WHERE policy_id = ?")
        .bind(policy_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Traversal
// ---------------------------------------------------------------------------

/// Policies of `policy_kind` linked to an entity, in id order.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on failure.
pub async fn related_policies(
    conn: &mut SqliteConnection,
    entity_kind: EntityKind,
    entity_id: &str,
    policy_kind: EntityKind,
) -> Result<Vec<String>, StoreError> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT policy_id FROM policy_links \
         WHERE entity_kind = ? AND entity_id = ? AND policy_kind = ? ORDER BY policy_id",
    )
    .bind(entity_kind.as_str())
    .bind(entity_id)
    .bind(policy_kind.as_str())
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}

/// Entities of `entity_kind` linked to a policy, in id order.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on failure.
pub async fn related_entities(
    conn: &mut SqliteConnection,
    policy_id: &str,
    entity_kind: EntityKind,
) -> Result<Vec<String>, StoreError> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT entity_id FROM policy_links \
         WHERE policy_id = ? AND entity_kind = ? ORDER BY entity_id",
    )
    .bind(policy_id)
    .bind(entity_kind.as_str())
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}

/// True when the policy links the entity.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on failure.
pub async fn is_linked(
    conn: &mut SqliteConnection,
    policy_id: &str,
    entity_kind: EntityKind,
    entity_id: &str,
) -> Result<bool, StoreError> {
    let row = sqlx::query(
        "SELECT 1 FROM policy_links WHERE policy_id = ? AND entity_kind = ? AND entity_id = ?",
    )
    .bind(policy_id)
    .bind(entity_kind.as_str())
    .bind(entity_id)
    .fetch_optional(&mut *conn)
    .await?;
    Ok(row.is_some())
}

/// Entities of `to_kind` reached from an entity through policies of
/// `policy_kind`, each with the ids of the policies that produced it.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on failure.
pub async fn linked_through(
    conn: &mut SqliteConnection,
    from_kind: EntityKind,
    from_id: &str,
    policy_kind: EntityKind,
    to_kind: EntityKind,
) -> Result<BTreeMap<String, Vec<String>>, StoreError> {
    let rows = sqlx::query(
        "SELECT b.entity_id AS entity_id, b.policy_id AS policy_id \
         FROM policy_links a \
         JOIN policy_links b ON b.policy_id = a.policy_id AND b.entity_kind = ? \
         WHERE a.entity_kind = ? AND a.entity_id = ? AND a.policy_kind = ? \
         ORDER BY b.entity_id, b.policy_id",
    )
    .bind(to_kind.as_str())
    .bind(from_kind.as_str())
    .bind(from_id)
    .bind(policy_kind.as_str())
    .fetch_all(&mut *conn)
    .await?;

    let mut reached: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for row in &rows {
        let entity_id: String = row.try_get("entity_id")?;
        let policy_id: String = row.try_get("policy_id")?;
        reached.entry(entity_id).or_default().push(policy_id);
    }
    Ok(reached)
}

/// Policies of `policy_kind` linked to both entities, in id order.
///
/// # Errors
///
/// Returns [`StoreError::Database`] on failure.
pub async fn policies_linking(
    conn: &mut SqliteConnection,
    policy_kind: EntityKind,
    a: (EntityKind, &str),
    b: (EntityKind, &str),
) -> Result<Vec<String>, StoreError> {
    let ids = sqlx::query_scalar::<_, String>(
        "SELECT a.policy_id FROM policy_links a \
         JOIN policy_links b ON b.policy_id = a.policy_id \
         WHERE a.policy_kind = ? AND a.entity_kind = ? AND a.entity_id = ? \
           AND b.entity_kind = ? AND b.entity_id = ? \
         ORDER BY a.policy_id",
    )
    .bind(policy_kind.as_str())
    .bind(a.0.as_str())
    .bind(a.1)
    .bind(b.0.as_str())
    .bind(b.1)
    .fetch_all(&mut *conn)
    .await?;
    Ok(ids)
}

// ---------------------------------------------------------------------------
// Integrity
// ---------------------------------------------------------------------------

async fn expected_links(conn: &mut SqliteConnection) -> Result<BTreeSet<Link>, StoreError> {
    let mut expected = BTreeSet::new();
    for policy_kind in [
        EntityKind::ServicePolicy,
        EntityKind::EdgeRouterPolicy,
        EntityKind::ServiceEdgeRouterPolicy,
    ] {
        for side in policy_sides(policy_kind) {
            let policies = load_policy_side(conn, policy_kind, side).await?;
            let entities = load_attributes(conn, side.entity_kind).await?;
            for (policy_id, semantic, expression) in &policies {
                for (entity_id, attributes) in &entities {
                    if side_links(side, expression, *semantic, entity_id, attributes) {
                        expected.insert(Link {
                            policy_kind,
                            policy_id: policy_id.clone(),
                            entity_kind: side.entity_kind,
                            entity_id: entity_id.clone(),
                        });
                    }
                }
            }
        }
    }
    Ok(expected)
}

fn parse_kind(raw: &str) -> Result<EntityKind, StoreError> {
    [
        EntityKind::Identity,
        EntityKind::Service,
        EntityKind::EdgeRouter,
        EntityKind::PostureCheck,
        EntityKind::ServicePolicy,
        EntityKind::EdgeRouterPolicy,
        EntityKind::ServiceEdgeRouterPolicy,
    ]
    .into_iter()
    .find(|k| k.as_str() == raw)
    .ok_or_else(|| StoreError::Corrupt {
        table: "policy_links",
        detail: format!("unknown kind {raw}"),
    })
}

async fn stored_links(conn: &mut SqliteConnection) -> Result<BTreeSet<Link>, StoreError> {
    let rows = sqlx::query("SELECT policy_kind, policy_id, entity_kind, entity_id FROM policy_links")
        .fetch_all(&mut *conn)
        .await?;
    rows.iter()
        .map(|row| {
            Ok(Link {
                policy_kind: parse_kind(row.try_get("policy_kind")?)?,
                policy_id: row.try_get("policy_id")?,
                entity_kind: parse_kind(row.try_get("entity_kind")?)?,
                entity_id: row.try_get("entity_id")?,
            })
        })
        .collect()
}

/// Compare the stored index with a full recomputation.
///
/// With `fix`, missing links are inserted and stale ones deleted in the
/// caller's transaction.
///
/// # Errors
///
/// Returns [`StoreError`] on database failure or a corrupt stored policy.
pub async fn check_integrity(
    conn: &mut SqliteConnection,
    fix: bool,
) -> Result<Vec<LinkDiscrepancy>, StoreError> {
    let expected = expected_links(conn).await?;
    let stored = stored_links(conn).await?;

    let mut discrepancies: Vec<LinkDiscrepancy> = expected
        .difference(&stored)
        .cloned()
        .map(LinkDiscrepancy::Missing)
        .collect();
    discrepancies.extend(stored.difference(&expected).cloned().map(LinkDiscrepancy::Stale));

    for discrepancy in &discrepancies {
        warn!(?discrepancy, fix, "policy link index discrepancy");
        if !fix {
            continue;
        }
        match discrepancy {
            LinkDiscrepancy::Missing(link) => {
                insert_link(
                    conn,
                    link.policy_kind,
                    &link.policy_id,
                    link.entity_kind,
                    &link.entity_id,
                )
                .await?;
            }
            LinkDiscrepancy::Stale(link) => {
                sqlx::query(
                    "DELETE FROM policy_links \
                     WHERE policy_id = ? AND entity_kind = ? AND entity_id = ?",
                )
                .bind(&link.policy_id)
                .bind(link.entity_kind.as_str())
                .bind(&link.entity_id)
                .execute(&mut *conn)
                .await?;
            }
        }
    }

    Ok(discrepancies)
}
