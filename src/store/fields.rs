//! Partial-update masks.
//!
//! An update command carries the full entity plus a [`FieldSet`] naming the
//! fields the caller meant to change. Field names are the camel-case wire
//! names (`roleAttributes`, `identityRoles`, ...).

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

/// Set of updated field names. `None` inside means every field.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldSet {
    fields: Option<BTreeSet<String>>,
}

impl Default for FieldSet {
    fn default() -> Self {
        Self::all()
    }
}

impl FieldSet {
    /// Every field.
    pub fn all() -> Self {
        Self { fields: None }
    }

    /// Exactly the named fields.
    pub fn of<I, S>(fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            fields: Some(fields.into_iter().map(Into::into).collect()),
        }
    }

    /// True when this set covers every field.
    pub fn is_all(&self) -> bool {
        self.fields.is_none()
    }

    /// True when `field` is covered.
    pub fn contains(&self, field: &str) -> bool {
        match &self.fields {
            None => true,
            Some(set) => set.contains(field),
        }
    }

    /// True when any of `fields` is covered.
    pub fn contains_any(&self, fields: &[&str]) -> bool {
        fields.iter().any(|f| self.contains(f))
    }

    /// Fields covered by either set.
    pub fn union(&self, other: &Self) -> Self {
        match (&self.fields, &other.fields) {
            (Some(a), Some(b)) => Self {
                fields: Some(a.union(b).cloned().collect()),
            },
            _ => Self::all(),
        }
    }

    /// Fields covered by both sets.
    pub fn intersection(&self, other: &Self) -> Self {
        match (&self.fields, &other.fields) {
            (None, None) => Self::all(),
            (Some(a), None) | (None, Some(a)) => Self {
                fields: Some(a.clone()),
            },
            (Some(a), Some(b)) => Self {
                fields: Some(a.intersection(b).cloned().collect()),
            },
        }
    }
}
