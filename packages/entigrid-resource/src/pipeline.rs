//! `Pipeline`: transactional command processing over one [`EntityStore`]
//! (§4.D).
//!
//! Every command runs inside a single write transaction: resolve the uid,
//! materialize the candidate entity, run registered preprocessors (which may
//! maintain secondary indexes or enqueue their own sub-commands against the
//! same transaction), then persist. The revision is computed *after*
//! preprocessors run, since a preprocessor that recurses into the pipeline
//! consumes revisions of its own.

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use entigrid_core::entity::{Entity, Operation as EntityOperation, RecordMetadata};
use entigrid_core::error::CoreError;
use entigrid_core::value::{PropertyBag, PropertyName, Uid};

use crate::storage::kv::{EntityStore, StoreError, WriteTxn};
use crate::typeindex::TypeIndex;

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<PipelineError> for CoreError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Core(e) => e,
            PipelineError::Store(e) => e.into(),
        }
    }
}

/// A stage invoked during `Pipeline::create_entity`/`modify_entity`/
/// `delete_entity` for every command against a type it [`applies_to`].
///
/// `new_entity` is materialized but not yet persisted; the preprocessor may
/// mutate its properties and is responsible for recording any of its own
/// property changes in `new_entity.metadata.modified_properties` (§4.D step
/// 5). `previous` is `None` only for `CreateEntity`.
///
/// [`applies_to`]: Preprocessor::applies_to
pub trait Preprocessor: Send + Sync {
    /// # Errors
    ///
    /// Returning an error aborts the whole command (and, per §4.D, the
    /// write transaction it is running in).
    fn process(
        &self,
        uid: &Uid,
        next_revision: u64,
        previous: Option<&Entity>,
        new_entity: &mut Entity,
        txn: &mut WriteTxn<'_>,
    ) -> Result<(), PipelineError>;

    /// Restricts this preprocessor to one entity type; `"*"` matches every type.
    fn applies_to(&self) -> &str;
}

pub struct CreateEntityCommand {
    pub entity_type: String,
    pub entity_id: Option<Uid>,
    pub replay_to_source: bool,
    pub delta: PropertyBag,
}

pub struct ModifyEntityCommand {
    pub entity_type: String,
    pub entity_id: Uid,
    pub revision: u64,
    pub replay_to_source: bool,
    pub modified_properties: BTreeSet<PropertyName>,
    pub deletions: BTreeSet<PropertyName>,
    pub delta: PropertyBag,
}

pub struct DeleteEntityCommand {
    pub entity_type: String,
    pub entity_id: Uid,
    pub replay_to_source: bool,
}

/// Result of one successfully committed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutcome {
    pub uid: Uid,
    pub revision: u64,
}

/// Transactional command processor for one [`EntityStore`] (§4.D).
///
/// Owns the store's `TypeIndex` registry and the ordered preprocessor chain.
/// Per §5, a `Pipeline` is owned exclusively by its resource's event loop --
/// it is not `Sync`-safe to drive two commands through the same `Pipeline`
/// concurrently (the underlying `redb` writer enforces this anyway).
pub struct Pipeline {
    store: Arc<EntityStore>,
    type_indexes: HashMap<String, TypeIndex>,
    preprocessors: Vec<Arc<dyn Preprocessor>>,
}

impl Pipeline {
    #[must_use]
    pub fn new(store: Arc<EntityStore>) -> Self {
        Self { store, type_indexes: HashMap::new(), preprocessors: Vec::new() }
    }

    /// Registers the `TypeIndex` used to maintain secondary indexes for
    /// `entity_type`. At most one index registry per type; a later call
    /// replaces an earlier one.
    pub fn register_type_index(&mut self, entity_type: impl Into<String>, index: TypeIndex) {
        self.type_indexes.insert(entity_type.into(), index);
    }

    /// Appends a preprocessor. Preprocessors run in registration order
    /// (§4.D), so callers that need index maintenance before business-logic
    /// preprocessors must register it first.
    pub fn register_preprocessor(&mut self, preprocessor: Arc<dyn Preprocessor>) {
        self.preprocessors.push(preprocessor);
    }

    fn run_preprocessors(
        &self,
        entity_type: &str,
        uid: &Uid,
        next_revision: u64,
        previous: Option<&Entity>,
        new_entity: &mut Entity,
        txn: &mut WriteTxn<'_>,
    ) -> Result<(), PipelineError> {
        for preprocessor in &self.preprocessors {
            let applies = preprocessor.applies_to();
            if applies == "*" || applies == entity_type {
                preprocessor.process(uid, next_revision, previous, new_entity, txn)?;
            }
        }
        Ok(())
    }

    /// Processes a `CreateEntity` command (§4.D).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::AlreadyExists`] if `entity_id` is supplied and
    /// already has a live record, or a storage/preprocessor error.
    pub fn create_entity(&self, cmd: CreateEntityCommand) -> Result<CommandOutcome, PipelineError> {
        let mut txn = self.store.begin_write()?;
        let uid = cmd.entity_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        if txn.find_latest(&cmd.entity_type, &uid)?.is_some() {
            return Err(PipelineError::Core(CoreError::AlreadyExists));
        }

        let mut new_entity = Entity {
            uid: uid.clone(),
            entity_type: cmd.entity_type.clone(),
            metadata: RecordMetadata {
                revision: 0,
                operation: EntityOperation::Creation,
                replay_to_source: cmd.replay_to_source,
                modified_properties: cmd.delta.keys().cloned().collect(),
            },
            properties: cmd.delta,
        };

        let provisional_revision = txn.max_revision()? + 1;
        self.run_preprocessors(&cmd.entity_type, &uid, provisional_revision, None, &mut new_entity, &mut txn)?;

        if let Some(index) = self.type_indexes.get(&cmd.entity_type) {
            index.add(&uid, &new_entity, &mut txn)?;
        }

        let new_revision = txn.max_revision()? + 1;
        new_entity.metadata.revision = new_revision;
        txn.write(&new_entity)?;
        txn.set_max_revision(new_revision)?;
        txn.commit()?;

        tracing::debug!(entity_type = %cmd.entity_type, uid = %uid, revision = new_revision, "committed CreateEntity");
        Ok(CommandOutcome { uid, revision: new_revision })
    }

    /// Processes a `ModifyEntity` command (§4.D).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if no record exists for the uid,
    /// [`CoreError::AlreadyRemoved`] if the latest record is a tombstone, or
    /// a storage/preprocessor error. The command's `revision` field is
    /// informational (the base revision the caller last observed); this
    /// pipeline does not enforce optimistic-concurrency rejection on it,
    /// since SPEC_FULL leaves conflict-detection semantics unspecified.
    pub fn modify_entity(&self, cmd: ModifyEntityCommand) -> Result<CommandOutcome, PipelineError> {
        let mut txn = self.store.begin_write()?;
        let previous = txn
            .find_latest(&cmd.entity_type, &cmd.entity_id)?
            .ok_or(PipelineError::Core(CoreError::NotFound))?;
        if previous.is_removed() {
            return Err(PipelineError::Core(CoreError::AlreadyRemoved));
        }

        let mut new_entity = previous.clone();
        new_entity.metadata.operation = EntityOperation::Modification;
        new_entity.metadata.replay_to_source = cmd.replay_to_source;
        for property in &cmd.modified_properties {
            if let Some(value) = cmd.delta.get(property) {
                new_entity.properties.insert(property.clone(), value.clone());
            }
        }
        for property in &cmd.deletions {
            new_entity.properties.remove(property);
        }
        new_entity.metadata.modified_properties = cmd.modified_properties.clone();

        let provisional_revision = txn.max_revision()? + 1;
        self.run_preprocessors(
            &cmd.entity_type,
            &cmd.entity_id,
            provisional_revision,
            Some(&previous),
            &mut new_entity,
            &mut txn,
        )?;

        if let Some(index) = self.type_indexes.get(&cmd.entity_type) {
            // Remove-old-then-add-new (§13): avoids wiping a freshly-added
            // entry when the old and new index keys happen to coincide.
            index.remove(&cmd.entity_id, &previous, &mut txn)?;
            index.add(&cmd.entity_id, &new_entity, &mut txn)?;
        }

        let new_revision = txn.max_revision()? + 1;
        new_entity.metadata.revision = new_revision;
        txn.write(&new_entity)?;
        txn.set_max_revision(new_revision)?;
        txn.commit()?;

        tracing::debug!(entity_type = %cmd.entity_type, uid = %cmd.entity_id, revision = new_revision, "committed ModifyEntity");
        Ok(CommandOutcome { uid: cmd.entity_id, revision: new_revision })
    }

    /// Processes a `DeleteEntity` command (§4.D).
    ///
    /// # Errors
    ///
    /// Returns [`CoreError::NotFound`] if no record exists for the uid,
    /// [`CoreError::AlreadyRemoved`] if it is already a tombstone, or a
    /// storage/preprocessor error.
    pub fn delete_entity(&self, cmd: DeleteEntityCommand) -> Result<CommandOutcome, PipelineError> {
        let mut txn = self.store.begin_write()?;
        let previous = txn
            .find_latest(&cmd.entity_type, &cmd.entity_id)?
            .ok_or(PipelineError::Core(CoreError::NotFound))?;
        if previous.is_removed() {
            return Err(PipelineError::Core(CoreError::AlreadyRemoved));
        }

        let mut new_entity = previous.clone();
        new_entity.metadata.operation = EntityOperation::Removal;
        new_entity.metadata.replay_to_source = cmd.replay_to_source;
        new_entity.metadata.modified_properties = BTreeSet::new();

        let provisional_revision = txn.max_revision()? + 1;
        self.run_preprocessors(
            &cmd.entity_type,
            &cmd.entity_id,
            provisional_revision,
            Some(&previous),
            &mut new_entity,
            &mut txn,
        )?;

        if let Some(index) = self.type_indexes.get(&cmd.entity_type) {
            index.remove(&cmd.entity_id, &previous, &mut txn)?;
        }

        let new_revision = txn.max_revision()? + 1;
        new_entity.metadata.revision = new_revision;
        txn.write(&new_entity)?;
        txn.set_max_revision(new_revision)?;
        txn.commit()?;

        tracing::debug!(entity_type = %cmd.entity_type, uid = %cmd.entity_id, revision = new_revision, "committed DeleteEntity");
        Ok(CommandOutcome { uid: cmd.entity_id, revision: new_revision })
    }

    /// Reaps superseded revisions behind `revision` (§4.D Cleanup). Advisory;
    /// intended to run on an idle timer, never inline with a command.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the underlying transaction fails.
    pub fn cleanup_revision(&self, revision: u64) -> Result<(), PipelineError> {
        let mut txn = self.store.begin_write()?;
        if let Some((entity_type, uid)) = txn.get_uid_from_revision(revision)? {
            let history = txn.scan(&entity_type, &uid)?;
            for entity in &history {
                if entity.metadata.revision < revision {
                    txn.remove(&entity_type, &uid, entity.metadata.revision)?;
                }
            }
            if let Some(tip) = history.iter().max_by_key(|e| e.metadata.revision) {
                if tip.is_removed() {
                    txn.remove(&entity_type, &uid, tip.metadata.revision)?;
                }
            }
        }
        txn.set_cleaned_up_revision(revision)?;
        txn.commit()?;
        Ok(())
    }

    /// Direct access to the underlying store, for `DataStoreQuery` and the
    /// resource process shell's background workers.
    #[must_use]
    pub fn store(&self) -> &Arc<EntityStore> {
        &self.store
    }

    /// Looks up the registered `TypeIndex` for `entity_type`, if any.
    #[must_use]
    pub fn type_index(&self, entity_type: &str) -> Option<&TypeIndex> {
        self.type_indexes.get(entity_type)
    }
}
