//! Entity and per-revision record metadata.

use std::collections::BTreeSet;

use serde::{Deserialize, Serialize};

use crate::value::{PropertyBag, PropertyName, Uid, Value};

/// The operation that produced a stored revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    Creation,
    Modification,
    Removal,
}

/// Metadata embedded in every stored record, alongside the property bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordMetadata {
    pub revision: u64,
    pub operation: Operation,
    /// Whether this mutation must be replayed to the remote source, or
    /// originated from a sync pull and should not be echoed back.
    pub replay_to_source: bool,
    /// Properties changed by the command that produced this revision (not
    /// the full bag -- used to drive incremental index maintenance).
    pub modified_properties: BTreeSet<PropertyName>,
}

/// One entity at one revision: metadata plus the full materialized bag.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub uid: Uid,
    pub entity_type: String,
    pub metadata: RecordMetadata,
    pub properties: PropertyBag,
}

impl Entity {
    #[must_use]
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.properties.get(name)
    }

    #[must_use]
    pub fn is_removed(&self) -> bool {
        self.metadata.operation == Operation::Removal
    }
}
