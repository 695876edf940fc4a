//! `DataStoreQuery`: compiled Source -> Filter -> Collector execution over
//! one [`Pipeline`]'s entity store (§4.E).
//!
//! `Source` picks the most selective covering `TypeIndex` for the query's
//! filters, falling back to a full type scan when nothing covers it.
//! `Filter` re-checks any clause the index didn't already enforce against
//! the materialized entity. `Collector` sorts (when the index didn't
//! already deliver the right order) and drops tombstoned entities from
//! one-shot results.

use entigrid_core::entity::{Entity, Operation as EntityOperation};
use entigrid_core::query::{ChangeKind, Comparator, FilterClause, Query, SortDirection};
use entigrid_core::value::{Uid, Value};

use crate::pipeline::Pipeline;
use crate::storage::kv::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum QueryError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("query has no parent_property to execute as a subquery")]
    NoParentProperty,
}

impl From<QueryError> for entigrid_core::error::CoreError {
    fn from(err: QueryError) -> Self {
        match err {
            QueryError::Store(e) => e.into(),
            QueryError::NoParentProperty => {
                entigrid_core::error::CoreError::TransactionError("query has no parent_property".to_string())
            }
        }
    }
}

/// One change delivered by [`DataStoreQuery::update`], relative to a
/// subscriber's last-seen revision.
#[derive(Debug, Clone)]
pub struct QueryChange {
    pub kind: ChangeKind,
    pub entity: Entity,
}

/// A compiled, re-runnable query against one entity type.
pub struct DataStoreQuery {
    query: Query,
}

impl DataStoreQuery {
    #[must_use]
    pub fn new(query: Query) -> Self {
        Self { query }
    }

    #[must_use]
    pub fn query(&self) -> &Query {
        &self.query
    }

    /// Runs the query once against the current snapshot, returning live
    /// (non-removed) matches in the query's requested order.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the underlying read transaction fails.
    pub fn execute(&self, pipeline: &Pipeline) -> Result<Vec<Entity>, QueryError> {
        let txn = pipeline.store().begin_read()?;
        let (candidates, applied_filters, applied_sort) = source(&self.query, pipeline, &txn)?;

        let mut matches: Vec<Entity> = candidates
            .into_iter()
            .filter(|e| !e.is_removed())
            .filter(|e| filter_pass(e, &self.query, &applied_filters))
            .collect();

        collect(&mut matches, &self.query, applied_sort.as_deref());
        Ok(matches)
    }

    /// Runs this query scoped to one parent, via `parent_property` (tree
    /// queries, e.g. `Mail` under a `folder`).
    ///
    /// # Errors
    ///
    /// Returns [`QueryError::NoParentProperty`] if this query has none, or a
    /// storage error.
    pub fn execute_subquery(&self, pipeline: &Pipeline, parent_uid: &Uid) -> Result<Vec<Entity>, QueryError> {
        let parent_property = self.query.parent_property.clone().ok_or(QueryError::NoParentProperty)?;
        let mut sub_query = self.query.clone();
        sub_query
            .filters
            .push(FilterClause { property: parent_property, comparator: Comparator::Equals(Value::Reference(parent_uid.clone())) });
        DataStoreQuery::new(sub_query).execute(pipeline)
    }

    /// Returns every change to this query's entity type committed after
    /// `base_revision`, classified `Added`/`Modified`/`Removed` (§4.E, §4.F).
    ///
    /// Walks the revision log rather than re-querying the index, since a
    /// removed entity's uid has already been struck from its `TypeIndex`
    /// entries by the time its tombstone revision is visible -- the index
    /// alone can no longer tell us it used to match.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the underlying read transaction fails.
    pub fn update(&self, pipeline: &Pipeline, base_revision: u64) -> Result<Vec<QueryChange>, QueryError> {
        let txn = pipeline.store().begin_read()?;
        let max_revision = txn.max_revision()?;

        let mut seen = std::collections::BTreeSet::new();
        let mut changes = Vec::new();
        for revision in (base_revision + 1)..=max_revision {
            let Some((entity_type, uid)) = txn.get_uid_from_revision(revision)? else {
                continue;
            };
            if entity_type != self.query.entity_type || !seen.insert(uid.clone()) {
                continue;
            }
            let Some(entity) = txn.find_latest(&entity_type, &uid)? else {
                continue;
            };
            if entity.metadata.revision <= base_revision {
                continue;
            }

            if entity.is_removed() {
                changes.push(QueryChange { kind: ChangeKind::Removed, entity });
                continue;
            }
            if !matches_all_filters(&entity, &self.query) {
                continue;
            }
            let kind = if entity.metadata.operation == EntityOperation::Creation {
                ChangeKind::Added
            } else {
                ChangeKind::Modified
            };
            changes.push(QueryChange { kind, entity });
        }

        Ok(changes)
    }
}

fn source(
    query: &Query,
    pipeline: &Pipeline,
    txn: &crate::storage::kv::ReadTxn<'_>,
) -> Result<(Vec<Entity>, std::collections::BTreeSet<entigrid_core::value::PropertyName>, Option<entigrid_core::value::PropertyName>), QueryError> {
    if let Some(index) = pipeline.type_index(&query.entity_type) {
        let (uids, applied_filters, applied_sort) = index.query_snapshot(query, txn)?;
        if !applied_filters.is_empty() {
            let mut entities = Vec::with_capacity(uids.len());
            for uid in uids {
                if let Some(entity) = txn.find_latest(&query.entity_type, &uid)? {
                    entities.push(entity);
                }
            }
            return Ok((entities, applied_filters, applied_sort));
        }
    }
    Ok((txn.scan_type(&query.entity_type)?, std::collections::BTreeSet::new(), None))
}

fn filter_pass(
    entity: &Entity,
    query: &Query,
    applied_filters: &std::collections::BTreeSet<entigrid_core::value::PropertyName>,
) -> bool {
    query.filters.iter().filter(|clause| !applied_filters.contains(&clause.property)).all(|clause| matches_clause(entity, clause))
}

fn matches_all_filters(entity: &Entity, query: &Query) -> bool {
    query.filters.iter().all(|clause| matches_clause(entity, clause))
}

fn matches_clause(entity: &Entity, clause: &FilterClause) -> bool {
    let value = entity.get(&clause.property);
    match &clause.comparator {
        Comparator::Equals(target) => value == Some(target),
        Comparator::In(targets) => value.is_some_and(|v| targets.contains(v)),
        Comparator::Contains(target) => matches!(value, Some(Value::List(items)) if items.contains(target)),
        Comparator::GreaterThan(target) => value.is_some_and(|v| v.canonical_bytes() > target.canonical_bytes()),
        Comparator::LessThan(target) => value.is_some_and(|v| v.canonical_bytes() < target.canonical_bytes()),
    }
}

fn collect(entities: &mut Vec<Entity>, query: &Query, applied_sort: Option<&str>) {
    let Some(sort_by) = &query.sort_by else { return };
    if applied_sort == Some(sort_by.as_str()) {
        // The index lookup already delivered rows in the requested sort
        // order; avoid paying for a redundant sort.
        return;
    }
    entities.sort_by(|a, b| {
        let av = a.get(sort_by).map(Value::canonical_bytes).unwrap_or_default();
        let bv = b.get(sort_by).map(Value::canonical_bytes).unwrap_or_default();
        av.cmp(&bv)
    });
    if query.sort_direction == Some(SortDirection::Descending) {
        entities.reverse();
    }
}
