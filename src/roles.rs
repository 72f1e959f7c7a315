//! Role-attribute matching.
//!
//! Policies select entities with role expressions. Each term is one of:
//! - `#all`: matches every entity
//! - `#<attr>` (or a bare `<attr>`): the entity carries attribute `<attr>`
//! - `@<id>`: the entity with that id, regardless of its attributes
//!
//! A policy's [`Semantic`] decides whether every term (`AllOf`) or at least
//! one term (`AnyOf`) must be satisfied. An empty expression is vacuously
//! true under `AllOf` and vacuously false under `AnyOf`.

use serde::{Deserialize, Serialize};

use crate::error::FieldError;

/// The wildcard role.
pub const ALL_ROLE: &str = "#all";

/// Quantifier a policy applies over its role expressions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Semantic {
    /// Every term must be satisfied.
    #[default]
    AllOf,
    /// At least one term must be satisfied.
    AnyOf,
}

impl Semantic {
    /// Storage representation.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::AllOf => "AllOf",
            Self::AnyOf => "AnyOf",
        }
    }

    /// Parse a semantic name.
    ///
    /// # Errors
    ///
    /// Returns a [`FieldError`] for anything other than `AllOf` / `AnyOf`.
    pub fn parse(value: &str) -> Result<Self, FieldError> {
        match value {
            "AllOf" => Ok(Self::AllOf),
            "AnyOf" => Ok(Self::AnyOf),
            other => Err(FieldError::new(
                "must be AllOf or AnyOf",
                "semantic",
                other,
            )),
        }
    }
}

/// One parsed term of a role expression.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleTerm {
    /// `#all`.
    All,
    /// Attribute tag, without the leading `#`.
    Attribute(String),
    /// Exact entity reference, without the leading `@`.
    Entity(String),
}

impl RoleTerm {
    /// Parse a single term.
    ///
    /// # Errors
    ///
    /// Returns a [`FieldError`] for an empty term or a bare `#` / `@`.
    pub fn parse(raw: &str) -> Result<Self, FieldError> {
        let field = "roles";
        if raw == ALL_ROLE {
            return Ok(Self::All);
        }
        if let Some(attr) = raw.strip_prefix('#') {
            if attr.is_empty() {
                return Err(FieldError::new("attribute tag is empty", field, raw));
            }
            return Ok(Self::Attribute(attr.to_owned()));
        }
        if let Some(id) = raw.strip_prefix('@') {
            if id.is_empty() {
                return Err(FieldError::new("entity reference is empty", field, raw));
            }
            return Ok(Self::Entity(id.to_owned()));
        }
        if raw.trim().is_empty() {
            return Err(FieldError::new("role is empty", field, raw));
        }
        Ok(Self::Attribute(raw.to_owned()))
    }
}

/// A parsed role expression.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RoleExpression {
    terms: Vec<RoleTerm>,
}

impl RoleExpression {
    /// Parse every term of a stored expression.
    ///
    /// # Errors
    ///
    /// Returns the first term's [`FieldError`], with `field` set to the
    /// expression's field name.
    pub fn parse(field: &str, raw: &[String]) -> Result<Self, FieldError> {
        let terms = raw
            .iter()
            .map(|r| {
                RoleTerm::parse(r).map_err(|mut e| {
                    e.field = field.to_owned();
                    e
                })
            })
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self { terms })
    }

    /// Parsed terms in input order.
    pub fn terms(&self) -> &[RoleTerm] {
        &self.terms
    }

    /// True when the expression has no terms.
    pub fn is_empty(&self) -> bool {
        self.terms.is_empty()
    }

    /// True when `#all` appears anywhere.
    pub fn contains_all(&self) -> bool {
        self.terms.iter().any(|t| matches!(t, RoleTerm::All))
    }

    /// Entity ids referenced with `@`.
    pub fn entity_refs(&self) -> impl Iterator<Item = &str> {
        self.terms.iter().filter_map(|t| match t {
            RoleTerm::Entity(id) => Some(id.as_str()),
            _ => None,
        })
    }
}

/// Decide whether an entity satisfies a role expression.
///
/// `@id` terms are identity tests against `entity_id`, not set membership.
pub fn matches(
    entity_id: &str,
    entity_attributes: &[String],
    expression: &RoleExpression,
    semantic: Semantic,
) -> bool {
    if expression.contains_all() {
        return true;
    }

    let satisfied = |term: &RoleTerm| match term {
        RoleTerm::All => true,
        RoleTerm::Attribute(attr) => entity_attributes.iter().any(|a| a == attr),
        RoleTerm::Entity(id) => id == entity_id,
    };

    match semantic {
        Semantic::AllOf => expression.terms.iter().all(satisfied),
        Semantic::AnyOf => expression.terms.iter().any(satisfied),
    }
}

/// Validate the role attributes carried by an identity, service, router or
/// posture check.
///
/// # Errors
///
/// Returns a [`FieldError`] for empty attributes or ones starting with `#`
/// or `@`, which would be ambiguous with role-expression terms.
pub fn validate_role_attributes(attributes: &[String]) -> Result<(), FieldError> {
    for attr in attributes {
        if attr.trim().is_empty() {
            return Err(FieldError::new(
                "role attributes may not be empty",
                "roleAttributes",
                attr.as_str(),
            ));
        }
        if attr.starts_with('#') || attr.starts_with('@') {
            return Err(FieldError::new(
                "role attributes may not be prefixed with # or @",
                "roleAttributes",
                attr.as_str(),
            ));
        }
    }
    Ok(())
}
