//! `TypeIndex`: the per-entity-type index registry (§4.C).
//!
//! A `TypeIndex` is configured once at startup per entity type (one plain
//! property index, one sorted-property index, or one secondary/foreign-key
//! index per `add_*` call) and then driven by the pipeline on every
//! `add`/`remove`. `query()` picks the most selective covering index for a
//! filter; anything it can't cover is left for the caller to post-filter
//! against materialized entities.

use std::collections::BTreeSet;

use entigrid_core::entity::Entity;
use entigrid_core::query::{Comparator, Query};
use entigrid_core::value::{PropertyName, Uid, Value};

use crate::storage::index::{sortable_date, IndexManager};
use crate::storage::keys::TOPLEVEL_SENTINEL;
use crate::storage::kv::{ReadTxn, StoreError, WriteTxn};

/// A type-specific secondary indexer not expressible as a plain or
/// sorted property lookup (composite keys spanning more than two
/// properties, derived/computed index values, and the like).
pub trait CustomIndexer: Send + Sync {
    fn add(&self, uid: &Uid, entity: &Entity, txn: &mut WriteTxn<'_>) -> Result<(), StoreError>;
    fn remove(&self, uid: &Uid, entity: &Entity, txn: &mut WriteTxn<'_>) -> Result<(), StoreError>;
}

/// Per-entity-type index registry.
pub struct TypeIndex {
    entity_type: String,
    properties: Vec<PropertyName>,
    sorted_properties: Vec<(PropertyName, PropertyName)>,
    secondary_properties: Vec<(PropertyName, PropertyName)>,
    custom_indexers: Vec<Box<dyn CustomIndexer>>,
}

fn value_key(value: Option<&Value>) -> Vec<u8> {
    match value {
        Some(v) if !v.is_empty_value() => v.canonical_bytes(),
        _ => TOPLEVEL_SENTINEL.as_bytes().to_vec(),
    }
}

impl TypeIndex {
    #[must_use]
    pub fn new(entity_type: impl Into<String>) -> Self {
        Self {
            entity_type: entity_type.into(),
            properties: Vec::new(),
            sorted_properties: Vec::new(),
            secondary_properties: Vec::new(),
            custom_indexers: Vec::new(),
        }
    }

    /// Registers a plain equality/`In` index on `property`.
    #[must_use]
    pub fn add_property(mut self, property: impl Into<PropertyName>) -> Self {
        self.properties.push(property.into());
        self
    }

    /// Registers a composite index keyed by `property`'s value followed by
    /// a sortable encoding of `sort_property`'s value, so queries filtering
    /// on `property` and sorting by `sort_property` resolve in one lookup.
    #[must_use]
    pub fn add_property_with_sorting(
        mut self,
        property: impl Into<PropertyName>,
        sort_property: impl Into<PropertyName>,
    ) -> Self {
        self.sorted_properties.push((property.into(), sort_property.into()));
        self
    }

    /// Registers a two-hop index: `property`'s value maps to
    /// `result_property`'s value, so `lookup(result_property, v)` can
    /// resolve through `property` first (§4.C two-hop foreign-key
    /// resolution).
    #[must_use]
    pub fn add_secondary_property(
        mut self,
        property: impl Into<PropertyName>,
        result_property: impl Into<PropertyName>,
    ) -> Self {
        self.secondary_properties.push((property.into(), result_property.into()));
        self
    }

    #[must_use]
    pub fn add_custom_indexer(mut self, indexer: Box<dyn CustomIndexer>) -> Self {
        self.custom_indexers.push(indexer);
        self
    }

    fn index_name(&self, property: &str, sort_property: Option<&str>) -> String {
        match sort_property {
            Some(sort) => format!("{}.index.{}.sort.{}", self.entity_type, property, sort),
            None => format!("{}.index.{}", self.entity_type, property),
        }
    }

    fn sort_key_bytes(value: Option<&Value>) -> Vec<u8> {
        match value {
            Some(Value::Date(secs)) => sortable_date(*secs).to_vec(),
            other => value_key(other),
        }
    }

    /// Indexes `entity` under `uid` across every registered property.
    ///
    /// # Errors
    ///
    /// Returns a storage error if any underlying `redb` write fails.
    pub fn add(&self, uid: &Uid, entity: &Entity, txn: &mut WriteTxn<'_>) -> Result<(), StoreError> {
        for property in &self.properties {
            let key = value_key(entity.get(property));
            IndexManager::add(txn, &self.index_name(property, None), &key, uid)?;
        }
        for (property, sort_property) in &self.sorted_properties {
            let mut composite = value_key(entity.get(property));
            composite.extend(Self::sort_key_bytes(entity.get(sort_property)));
            IndexManager::add(txn, &self.index_name(property, Some(sort_property)), &composite, uid)?;
        }
        for (property, result_property) in &self.secondary_properties {
            let left = value_key(entity.get(property));
            let right = value_key(entity.get(result_property));
            let right_as_uid = String::from_utf8_lossy(&right).into_owned();
            IndexManager::add(txn, &self.index_name(property, Some(result_property)), &left, &right_as_uid)?;
        }
        for indexer in &self.custom_indexers {
            indexer.add(uid, entity, txn)?;
        }
        Ok(())
    }

    /// Removes `entity`'s index entries for `uid`. Mirrors [`Self::add`];
    /// removing an entry that was never added is a no-op (§13).
    ///
    /// # Errors
    ///
    /// Returns a storage error if any underlying `redb` write fails.
    pub fn remove(&self, uid: &Uid, entity: &Entity, txn: &mut WriteTxn<'_>) -> Result<(), StoreError> {
        for property in &self.properties {
            let key = value_key(entity.get(property));
            IndexManager::remove(txn, &self.index_name(property, None), &key, uid)?;
        }
        for (property, sort_property) in &self.sorted_properties {
            let mut composite = value_key(entity.get(property));
            composite.extend(Self::sort_key_bytes(entity.get(sort_property)));
            IndexManager::remove(txn, &self.index_name(property, Some(sort_property)), &composite, uid)?;
        }
        for (property, result_property) in &self.secondary_properties {
            let left = value_key(entity.get(property));
            let right = value_key(entity.get(result_property));
            let right_as_uid = String::from_utf8_lossy(&right).into_owned();
            IndexManager::remove(txn, &self.index_name(property, Some(result_property)), &left, &right_as_uid)?;
        }
        for indexer in &self.custom_indexers {
            indexer.remove(uid, entity, txn)?;
        }
        Ok(())
    }

    /// Picks the most selective index covering `query` and returns the
    /// candidate uid set, the filter properties the index already
    /// satisfied, and the sort property it already satisfied (if any). An
    /// empty `applied_filters` means no index matched and the caller must
    /// fall back to a full scan.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the underlying `redb` lookup fails.
    pub fn query(
        &self,
        query: &Query,
        txn: &WriteTxn<'_>,
    ) -> Result<(Vec<Uid>, BTreeSet<PropertyName>, Option<PropertyName>), StoreError> {
        for (property, sort_property) in &self.sorted_properties {
            if query.sort_by.as_deref() != Some(sort_property.as_str()) {
                continue;
            }
            if let Some(clause) = query.filters.iter().find(|f| &f.property == property) {
                if clause.comparator.is_index_enforceable() {
                    let keys =
                        index_lookup(txn, &self.index_name(property, Some(sort_property)), &clause.comparator, true)?;
                    return Ok((keys, BTreeSet::from([property.clone()]), Some(sort_property.clone())));
                }
            }
        }
        for property in &self.properties {
            if let Some(clause) = query.filters.iter().find(|f| &f.property == property) {
                if clause.comparator.is_index_enforceable() {
                    let keys = index_lookup(txn, &self.index_name(property, None), &clause.comparator, false)?;
                    return Ok((keys, BTreeSet::from([property.clone()]), None));
                }
            }
        }
        Ok((Vec::new(), BTreeSet::new(), None))
    }

    /// Looks up uids for `property`'s `value`, resolving through a
    /// two-hop secondary index if `property` was registered with
    /// [`Self::add_secondary_property`] rather than a direct index.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the underlying `redb` lookup fails.
    pub fn lookup(&self, property: &str, value: &Value, txn: &WriteTxn<'_>) -> Result<Vec<Uid>, StoreError> {
        if self.properties.iter().any(|p| p == property) {
            let key = value_key(Some(value));
            return IndexManager::lookup(txn, &self.index_name(property, None), &key);
        }
        if let Some((_, result_property)) = self.secondary_properties.iter().find(|(p, _)| p == property) {
            let key = value_key(Some(value));
            let secondary_keys =
                IndexManager::lookup(txn, &self.index_name(property, Some(result_property)), &key)?;
            let mut resolved = Vec::new();
            for secondary in secondary_keys {
                resolved.extend(self.lookup(result_property, &Value::String(secondary), txn)?);
            }
            return Ok(resolved);
        }
        tracing::warn!(property, "lookup requested on a property with no registered index");
        Ok(Vec::new())
    }

    /// Read-only counterpart of [`Self::query`], run against a snapshot
    /// transaction so `DataStoreQuery` execution never contends with the
    /// pipeline's single write transaction (§5, §4.E).
    ///
    /// # Errors
    ///
    /// Returns a storage error if the underlying `redb` lookup fails.
    pub fn query_snapshot(
        &self,
        query: &Query,
        txn: &ReadTxn<'_>,
    ) -> Result<(Vec<Uid>, BTreeSet<PropertyName>, Option<PropertyName>), StoreError> {
        for (property, sort_property) in &self.sorted_properties {
            if query.sort_by.as_deref() != Some(sort_property.as_str()) {
                continue;
            }
            if let Some(clause) = query.filters.iter().find(|f| &f.property == property) {
                if clause.comparator.is_index_enforceable() {
                    let keys = index_lookup_snapshot(
                        txn,
                        &self.index_name(property, Some(sort_property)),
                        &clause.comparator,
                        true,
                    )?;
                    return Ok((keys, BTreeSet::from([property.clone()]), Some(sort_property.clone())));
                }
            }
        }
        for property in &self.properties {
            if let Some(clause) = query.filters.iter().find(|f| &f.property == property) {
                if clause.comparator.is_index_enforceable() {
                    let keys =
                        index_lookup_snapshot(txn, &self.index_name(property, None), &clause.comparator, false)?;
                    return Ok((keys, BTreeSet::from([property.clone()]), None));
                }
            }
        }
        Ok((Vec::new(), BTreeSet::new(), None))
    }

    /// Read-only counterpart of [`Self::lookup`].
    ///
    /// # Errors
    ///
    /// Returns a storage error if the underlying `redb` lookup fails.
    pub fn lookup_snapshot(&self, property: &str, value: &Value, txn: &ReadTxn<'_>) -> Result<Vec<Uid>, StoreError> {
        if self.properties.iter().any(|p| p == property) {
            let key = value_key(Some(value));
            return IndexManager::lookup_snapshot(txn, &self.index_name(property, None), &key);
        }
        if let Some((_, result_property)) = self.secondary_properties.iter().find(|(p, _)| p == property) {
            let key = value_key(Some(value));
            let secondary_keys =
                IndexManager::lookup_snapshot(txn, &self.index_name(property, Some(result_property)), &key)?;
            let mut resolved = Vec::new();
            for secondary in secondary_keys {
                resolved.extend(self.lookup_snapshot(result_property, &Value::String(secondary), txn)?);
            }
            return Ok(resolved);
        }
        tracing::warn!(property, "lookup requested on a property with no registered index");
        Ok(Vec::new())
    }
}

/// `composite` is `true` when `index_name` is a `(property, sortProperty)`
/// index: its stored keys are `value_key(property) || sortKeyBytes(sort)`,
/// so a filter on `property` alone only ever knows a *prefix* of the stored
/// key and must scan (`lookup_prefix`), never look up the bare value key
/// exactly -- a plain property index has no sort suffix appended and is
/// looked up exactly instead.
fn index_lookup_snapshot(
    txn: &ReadTxn<'_>,
    index_name: &str,
    comparator: &Comparator,
    composite: bool,
) -> Result<Vec<Uid>, StoreError> {
    match comparator {
        Comparator::Equals(value) => {
            let key = value_key(Some(value));
            if composite {
                IndexManager::lookup_prefix_snapshot(txn, index_name, &key)
            } else {
                IndexManager::lookup_snapshot(txn, index_name, &key)
            }
        }
        Comparator::In(values) => {
            let mut out = Vec::new();
            for value in values {
                let key = value_key(Some(value));
                out.extend(if composite {
                    IndexManager::lookup_prefix_snapshot(txn, index_name, &key)?
                } else {
                    IndexManager::lookup_snapshot(txn, index_name, &key)?
                });
            }
            Ok(out)
        }
        _ => Ok(Vec::new()),
    }
}

/// See [`index_lookup_snapshot`] for the meaning of `composite`.
fn index_lookup(
    txn: &WriteTxn<'_>,
    index_name: &str,
    comparator: &Comparator,
    composite: bool,
) -> Result<Vec<Uid>, StoreError> {
    match comparator {
        Comparator::Equals(value) => {
            let key = value_key(Some(value));
            if composite {
                IndexManager::lookup_prefix(txn, index_name, &key)
            } else {
                IndexManager::lookup(txn, index_name, &key)
            }
        }
        Comparator::In(values) => {
            let mut out = Vec::new();
            for value in values {
                let key = value_key(Some(value));
                out.extend(if composite {
                    IndexManager::lookup_prefix(txn, index_name, &key)?
                } else {
                    IndexManager::lookup(txn, index_name, &key)?
                });
            }
            Ok(out)
        }
        _ => Ok(Vec::new()),
    }
}
