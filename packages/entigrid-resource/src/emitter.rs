//! `ResultProvider`/Emitter: push-based incremental query subscription
//! (§4.F).
//!
//! One `ResultProvider` per live query. It holds the query's current result
//! snapshot under a lock and broadcasts `Added`/`Modified`/`Removed`/
//! `InitialResultSetComplete` events as the resource process shell drives it
//! forward on each commit via [`ResultProvider::poll_revision`].

use parking_lot::Mutex;
use tokio::sync::broadcast;

use entigrid_core::entity::Entity;
use entigrid_core::query::ChangeKind;
use entigrid_core::value::Uid;

use crate::pipeline::Pipeline;
use crate::query::{DataStoreQuery, QueryError};

/// Default broadcast channel capacity; a subscriber that falls this far
/// behind loses the gap and must resubscribe (the next `subscribe()` call
/// replays the current full snapshot, so no data is lost, only coalesced).
const CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone)]
pub enum Event {
    Added(Entity),
    Modified(Entity),
    Removed(Entity),
    /// Marks the end of the snapshot a fresh subscriber was just handed.
    InitialResultSetComplete,
}

struct State {
    last_results: Vec<Entity>,
    base_revision: u64,
    disposed: bool,
}

/// Per-live-query event source (§4.F).
pub struct ResultProvider {
    query: DataStoreQuery,
    state: Mutex<State>,
    events: broadcast::Sender<Event>,
}

impl ResultProvider {
    /// Captures the query's current result set as the initial snapshot.
    ///
    /// # Errors
    ///
    /// Returns a storage error if executing the query fails.
    pub fn new(query: DataStoreQuery, pipeline: &Pipeline) -> Result<Self, QueryError> {
        let last_results = query.execute(pipeline)?;
        let base_revision = pipeline.store().begin_read()?.max_revision()?;
        let (events, _) = broadcast::channel(CHANNEL_CAPACITY);
        Ok(Self { query, state: Mutex::new(State { last_results, base_revision, disposed: false }), events })
    }

    /// Subscribes to this provider's events, returning the full current
    /// snapshot alongside the receiver. Per §4.F, a subscriber that connects
    /// after `initialResultSetComplete` still gets the complete current
    /// state before any incremental event it observes on the receiver.
    #[must_use]
    pub fn subscribe(&self) -> (Vec<Entity>, broadcast::Receiver<Event>) {
        let state = self.state.lock();
        (state.last_results.clone(), self.events.subscribe())
    }

    /// Announces that the snapshot handed out by the most recent
    /// `subscribe()` calls is complete.
    pub fn mark_initial_result_set_complete(&self) {
        let _ = self.events.send(Event::InitialResultSetComplete);
    }

    /// Advances this provider to `new_revision`, diffing against its last
    /// observed revision and broadcasting one event per change. A no-op
    /// once disposed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if diffing the query fails.
    pub fn poll_revision(&self, pipeline: &Pipeline, new_revision: u64) -> Result<(), QueryError> {
        let mut state = self.state.lock();
        if state.disposed || new_revision <= state.base_revision {
            return Ok(());
        }

        let changes = self.query.update(pipeline, state.base_revision)?;
        for change in changes {
            match change.kind {
                ChangeKind::Added => {
                    state.last_results.push(change.entity.clone());
                    let _ = self.events.send(Event::Added(change.entity));
                }
                ChangeKind::Modified => {
                    match state.last_results.iter_mut().find(|e| e.uid == change.entity.uid) {
                        Some(existing) => *existing = change.entity.clone(),
                        None => state.last_results.push(change.entity.clone()),
                    }
                    let _ = self.events.send(Event::Modified(change.entity));
                }
                ChangeKind::Removed => {
                    state.last_results.retain(|e| e.uid != change.entity.uid);
                    let _ = self.events.send(Event::Removed(change.entity));
                }
            }
        }
        state.base_revision = new_revision;
        Ok(())
    }

    /// Lazily loads `parent`'s children for a tree query, broadcasting each
    /// as `Added` (§4.F). A no-op returning an empty set once disposed.
    ///
    /// # Errors
    ///
    /// Returns a storage error, or [`QueryError::NoParentProperty`] if this
    /// provider's query has no `parent_property`.
    pub fn fetch(&self, pipeline: &Pipeline, parent: &Uid) -> Result<Vec<Entity>, QueryError> {
        if self.state.lock().disposed {
            return Ok(Vec::new());
        }
        let children = self.query.execute_subquery(pipeline, parent)?;
        for child in &children {
            let _ = self.events.send(Event::Added(child.clone()));
        }
        Ok(children)
    }

    /// Cancels any outstanding fetch (subsequent `fetch` calls become
    /// no-ops) and releases the held snapshot.
    pub fn dispose(&self) {
        let mut state = self.state.lock();
        state.disposed = true;
        state.last_results.clear();
    }

    #[must_use]
    pub fn is_disposed(&self) -> bool {
        self.state.lock().disposed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use entigrid_core::query::{Comparator, Query};
    use entigrid_core::value::{PropertyBag, Value};
    use std::sync::Arc;
    use tempfile::tempdir;

    use crate::pipeline::{CreateEntityCommand, DeleteEntityCommand, ModifyEntityCommand};
    use crate::storage::kv::EntityStore;
    use crate::typeindex::TypeIndex;

    fn bag(pairs: &[(&str, &str)]) -> PropertyBag {
        pairs.iter().map(|(k, v)| (k.to_string(), Value::String(v.to_string()))).collect()
    }

    fn pipeline() -> Pipeline {
        let dir = tempdir().unwrap();
        let store = Arc::new(EntityStore::open(&dir.path().join("s.redb")).unwrap());
        let mut pipeline = Pipeline::new(store);
        pipeline.register_type_index("Mail", TypeIndex::new("Mail").add_property("folder"));
        pipeline
    }

    #[test]
    fn subscribe_replays_current_snapshot() {
        let pipeline = pipeline();
        pipeline
            .create_entity(CreateEntityCommand {
                entity_type: "Mail".into(),
                entity_id: Some("m1".into()),
                replay_to_source: true,
                delta: bag(&[("folder", "inbox")]),
            })
            .unwrap();

        let query = Query::new("Mail").filter("folder", Comparator::Equals(Value::String("inbox".into())));
        let provider = ResultProvider::new(DataStoreQuery::new(query), &pipeline).unwrap();

        let (snapshot, _rx) = provider.subscribe();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].uid, "m1");
    }

    #[tokio::test]
    async fn poll_revision_broadcasts_added_and_removed() {
        let pipeline = pipeline();
        let query = Query::new("Mail").filter("folder", Comparator::Equals(Value::String("inbox".into())));
        let provider = ResultProvider::new(DataStoreQuery::new(query), &pipeline).unwrap();
        let (_snapshot, mut rx) = provider.subscribe();

        pipeline
            .create_entity(CreateEntityCommand {
                entity_type: "Mail".into(),
                entity_id: Some("m1".into()),
                replay_to_source: true,
                delta: bag(&[("folder", "inbox")]),
            })
            .unwrap();
        let revision = pipeline.store().begin_read().unwrap().max_revision().unwrap();
        provider.poll_revision(&pipeline, revision).unwrap();

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::Added(e) if e.uid == "m1"));

        pipeline
            .delete_entity(DeleteEntityCommand { entity_type: "Mail".into(), entity_id: "m1".into(), replay_to_source: true })
            .unwrap();
        let revision = pipeline.store().begin_read().unwrap().max_revision().unwrap();
        provider.poll_revision(&pipeline, revision).unwrap();

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::Removed(e) if e.uid == "m1"));

        let (snapshot, _rx2) = provider.subscribe();
        assert!(snapshot.is_empty());
    }

    #[tokio::test]
    async fn poll_revision_broadcasts_modified() {
        let pipeline = pipeline();
        pipeline
            .create_entity(CreateEntityCommand {
                entity_type: "Mail".into(),
                entity_id: Some("m1".into()),
                replay_to_source: true,
                delta: bag(&[("folder", "inbox")]),
            })
            .unwrap();

        let query = Query::new("Mail");
        let provider = ResultProvider::new(DataStoreQuery::new(query), &pipeline).unwrap();
        let (_snapshot, mut rx) = provider.subscribe();

        pipeline
            .modify_entity(ModifyEntityCommand {
                entity_type: "Mail".into(),
                entity_id: "m1".into(),
                revision: 1,
                replay_to_source: true,
                modified_properties: std::collections::BTreeSet::from(["folder".to_string()]),
                deletions: std::collections::BTreeSet::new(),
                delta: bag(&[("folder", "archive")]),
            })
            .unwrap();
        let revision = pipeline.store().begin_read().unwrap().max_revision().unwrap();
        provider.poll_revision(&pipeline, revision).unwrap();

        let event = rx.recv().await.unwrap();
        assert!(matches!(event, Event::Modified(e) if e.uid == "m1"));
    }

    #[test]
    fn dispose_clears_snapshot_and_blocks_fetch() {
        let pipeline = pipeline();
        let query = Query::new("Mail");
        let provider = ResultProvider::new(DataStoreQuery::new(query), &pipeline).unwrap();

        provider.dispose();
        assert!(provider.is_disposed());
        let (snapshot, _rx) = provider.subscribe();
        assert!(snapshot.is_empty());
        assert!(provider.fetch(&pipeline, &"parent".to_string()).unwrap().is_empty());
    }
}
