//! Declarative query types consumed by `DataStoreQuery` (entigrid-resource)
//! and carried over the wire in a `Synchronize` command.

use serde::{Deserialize, Serialize};

use crate::value::{PropertyName, Value};

/// Comparator applied to one property filter.
///
/// Only `Equals` and `In` are enforceable directly by an index; the rest
/// always fall through to post-filtering against a materialized entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Comparator {
    Equals(Value),
    In(Vec<Value>),
    Contains(Value),
    GreaterThan(Value),
    LessThan(Value),
}

impl Comparator {
    /// Whether this comparator can be enforced by a `TypeIndex` lookup
    /// rather than by post-filtering a materialized entity.
    #[must_use]
    pub fn is_index_enforceable(&self) -> bool {
        matches!(self, Comparator::Equals(_) | Comparator::In(_))
    }
}

/// One filter clause: a property name plus the comparator applied to it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FilterClause {
    pub property: PropertyName,
    pub comparator: Comparator,
}

/// Sort direction for a query's `sort_by` property.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SortDirection {
    Ascending,
    Descending,
}

/// A declarative query over one entity type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Query {
    pub entity_type: String,
    #[serde(default)]
    pub filters: Vec<FilterClause>,
    #[serde(default)]
    pub sort_by: Option<PropertyName>,
    #[serde(default)]
    pub sort_direction: Option<SortDirection>,
    /// Property used to resolve parent/child relationships for tree
    /// queries (e.g. `folder` on `Mail`).
    #[serde(default)]
    pub parent_property: Option<PropertyName>,
    /// Subset of properties the caller wants hydrated; empty means "all".
    #[serde(default)]
    pub requested_properties: Vec<PropertyName>,
    /// Whether this query should remain subscribed for incremental
    /// `update()` calls, or is a one-shot `execute()`.
    #[serde(default)]
    pub live_query: bool,
}

impl Query {
    #[must_use]
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            filters: Vec::new(),
            sort_by: None,
            sort_direction: None,
            parent_property: None,
            requested_properties: Vec::new(),
            live_query: false,
        }
    }

    #[must_use]
    pub fn filter(mut self, property: impl Into<PropertyName>, comparator: Comparator) -> Self {
        self.filters.push(FilterClause { property: property.into(), comparator });
        self
    }

    #[must_use]
    pub fn sorted_by(mut self, property: impl Into<PropertyName>, direction: SortDirection) -> Self {
        self.sort_by = Some(property.into());
        self.sort_direction = Some(direction);
        self
    }

    #[must_use]
    pub fn live(mut self) -> Self {
        self.live_query = true;
        self
    }
}

/// Classification of an incremental result relative to a subscriber's
/// last-seen uid set, produced by `DataStoreQuery::update`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Added,
    Modified,
    Removed,
}
