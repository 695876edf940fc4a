//! `EntityStore`: append-only, revisioned persistence over `redb` (§4.A).
//!
//! Every entity type's records live in one shared `redb` table, keyed by
//! `type || SEP || uid || SEP || revision` (see [`super::keys`]); this gives
//! each type its own contiguous key range without needing a separate `redb`
//! table per type known up front. A second table tracks revision -> uid for
//! `getUidFromRevision`/`getTypeFromRevision`, and a third holds the two
//! scalar counters (`maxRevision`, `cleanedUpRevision`).

use redb::{Database, ReadableTable, TableDefinition};

use entigrid_core::entity::Entity;
use entigrid_core::protocol::StoredRecord;
use entigrid_core::value::KEY_SEPARATOR;
use entigrid_core::CoreError;

use super::keys::{assemble_key, uid_range, validate_uid};

pub(crate) const ENTITIES: TableDefinition<&[u8], &[u8]> = TableDefinition::new("entities");
pub(crate) const REVISIONS: TableDefinition<u64, &[u8]> = TableDefinition::new("revisions");
const COUNTERS: TableDefinition<&str, u64> = TableDefinition::new("counters");

const MAX_REVISION_KEY: &str = "maxRevision";
const CLEANED_UP_REVISION_KEY: &str = "cleanedUpRevision";

/// Number of times `EntityStore::open` retries table validation before
/// surfacing [`StoreError::CorruptDatabase`].
const CORRUPTION_RETRY_ATTEMPTS: u32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("io error opening database: {0}")]
    IoError(#[from] redb::DatabaseError),
    #[error("database appears corrupt after {CORRUPTION_RETRY_ATTEMPTS} validation attempts: {0}")]
    CorruptDatabase(String),
    #[error("transaction error: {0}")]
    Transaction(#[from] redb::TransactionError),
    #[error("table error: {0}")]
    Table(#[from] redb::TableError),
    #[error("storage error: {0}")]
    Storage(#[from] redb::StorageError),
    #[error("commit error: {0}")]
    Commit(#[from] redb::CommitError),
    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<StoreError> for CoreError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Core(e) => e,
            other => CoreError::TransactionError(other.to_string()),
        }
    }
}

fn encode_record(entity: &Entity) -> Result<Vec<u8>, StoreError> {
    let record = StoredRecord { metadata: entity.metadata.clone(), properties: entity.properties.clone() };
    rmp_serde::to_vec_named(&record).map_err(|e| StoreError::Core(CoreError::TransactionError(e.to_string())))
}

fn decode_record(uid: &str, entity_type: &str, bytes: &[u8]) -> Result<Entity, StoreError> {
    let record: StoredRecord =
        rmp_serde::from_slice(bytes).map_err(|e| StoreError::Core(CoreError::TransactionError(e.to_string())))?;
    Ok(Entity {
        uid: uid.to_string(),
        entity_type: entity_type.to_string(),
        metadata: record.metadata,
        properties: record.properties,
    })
}

fn revision_pointer(entity_type: &str, uid: &str) -> Vec<u8> {
    let mut value = Vec::with_capacity(entity_type.len() + 1 + uid.len());
    value.extend_from_slice(entity_type.as_bytes());
    value.push(KEY_SEPARATOR);
    value.extend_from_slice(uid.as_bytes());
    value
}

fn split_revision_pointer(bytes: &[u8]) -> Result<(String, String), StoreError> {
    let sep = bytes
        .iter()
        .position(|&b| b == KEY_SEPARATOR)
        .ok_or_else(|| StoreError::Core(CoreError::InvalidBuffer))?;
    let entity_type = String::from_utf8(bytes[..sep].to_vec())
        .map_err(|_| StoreError::Core(CoreError::InvalidBuffer))?;
    let uid = String::from_utf8(bytes[sep + 1..].to_vec())
        .map_err(|_| StoreError::Core(CoreError::InvalidBuffer))?;
    Ok((entity_type, uid))
}

/// Builds the composite row key `type || SEP || uid || SEP || revision`.
pub(crate) fn row_key(entity_type: &str, uid: &str, revision: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(entity_type.len() + 1 + uid.len() + 21);
    key.extend_from_slice(entity_type.as_bytes());
    key.push(KEY_SEPARATOR);
    key.extend_from_slice(&assemble_key(uid, revision));
    key
}

fn type_prefix_range(entity_type: &str) -> (Vec<u8>, Vec<u8>) {
    let mut lo = Vec::with_capacity(entity_type.len() + 1);
    lo.extend_from_slice(entity_type.as_bytes());
    lo.push(KEY_SEPARATOR);
    let mut hi = lo.clone();
    hi.push(0xFF);
    (lo, hi)
}

/// Folds a full-type row range into one [`Entity`] per uid, keeping only the
/// highest revision seen for each (row keys within one uid's block sort in
/// ascending revision order, and uid blocks themselves sort in uid order, so
/// a single forward pass suffices).
fn fold_latest_per_uid(
    entity_type: &str,
    rows: impl Iterator<Item = Result<(Vec<u8>, Vec<u8>), StoreError>>,
) -> Result<Vec<Entity>, StoreError> {
    let mut out: Vec<Entity> = Vec::new();
    for row in rows {
        let (key, value) = row?;
        let (uid, _revision) = crate::storage::keys::split_key(&key[entity_type.len() + 1..])?;
        let entity = decode_record(&uid, entity_type, &value)?;
        match out.last_mut() {
            Some(last) if last.uid == uid => *last = entity,
            _ => out.push(entity),
        }
    }
    Ok(out)
}

fn row_prefix_range(entity_type: &str, uid: &str) -> (Vec<u8>, Vec<u8>) {
    let (uid_lo, uid_hi) = uid_range(uid);
    let mut lo = Vec::with_capacity(entity_type.len() + 1 + uid_lo.len());
    lo.extend_from_slice(entity_type.as_bytes());
    lo.push(KEY_SEPARATOR);
    lo.extend_from_slice(&uid_lo);
    let mut hi = Vec::with_capacity(entity_type.len() + 1 + uid_hi.len());
    hi.extend_from_slice(entity_type.as_bytes());
    hi.push(KEY_SEPARATOR);
    hi.extend_from_slice(&uid_hi);
    (lo, hi)
}

/// Append-only revisioned key/value store for one resource instance.
pub struct EntityStore {
    db: Database,
}

impl EntityStore {
    /// Opens (creating if absent) the `redb` database at `path`, validating
    /// the fixed tables. Retries validation up to
    /// [`CORRUPTION_RETRY_ATTEMPTS`] times before surfacing
    /// [`StoreError::CorruptDatabase`].
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::IoError`] if the file cannot be opened, or
    /// [`StoreError::CorruptDatabase`] if table validation never succeeds.
    pub fn open(path: &std::path::Path) -> Result<Self, StoreError> {
        let mut last_err: Option<StoreError> = None;
        for attempt in 1..=CORRUPTION_RETRY_ATTEMPTS {
            match Self::try_open(path) {
                Ok(store) => return Ok(store),
                Err(err) => {
                    tracing::warn!(attempt, error = %err, "entity store validation failed, retrying");
                    last_err = Some(err);
                }
            }
        }
        Err(StoreError::CorruptDatabase(last_err.map(|e| e.to_string()).unwrap_or_default()))
    }

    fn try_open(path: &std::path::Path) -> Result<Self, StoreError> {
        let db = Database::create(path)?;
        // Touch every fixed table once so a truly corrupt file surfaces
        // its error here rather than on the first real command.
        let txn = db.begin_write()?;
        {
            txn.open_table(ENTITIES)?;
            txn.open_table(REVISIONS)?;
            txn.open_table(COUNTERS)?;
        }
        txn.commit()?;
        Ok(Self { db })
    }

    /// Direct access to the underlying database, for sibling storage
    /// modules (`index`) that maintain secondary state inside the same
    /// write transaction as entity writes.
    pub(crate) fn database(&self) -> &Database {
        &self.db
    }

    /// Opens a fresh write transaction. The pipeline holds at most one of
    /// these open at a time per store (§5).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transaction`] if `redb` cannot begin the
    /// transaction.
    pub fn begin_write(&self) -> Result<WriteTxn<'_>, StoreError> {
        Ok(WriteTxn { inner: self.db.begin_write()?, _store: std::marker::PhantomData })
    }

    /// Opens a read-only snapshot transaction.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Transaction`] if `redb` cannot begin the
    /// transaction.
    pub fn begin_read(&self) -> Result<ReadTxn<'_>, StoreError> {
        Ok(ReadTxn { inner: self.db.begin_read()?, _store: std::marker::PhantomData })
    }
}

/// A write transaction against one [`EntityStore`].
pub struct WriteTxn<'s> {
    pub(crate) inner: redb::WriteTransaction,
    _store: std::marker::PhantomData<&'s EntityStore>,
}

impl<'s> WriteTxn<'s> {
    /// Writes one record for `entity` at `entity.metadata.revision`,
    /// overwriting nothing (revisions are append-only; a duplicate write at
    /// the same revision is a pipeline bug, not a storage-layer error).
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Core`]`(`[`CoreError::InvalidUid`]`)` if the
    /// entity's uid contains the key separator byte.
    pub fn write(&mut self, entity: &Entity) -> Result<(), StoreError> {
        validate_uid(&entity.uid).map_err(StoreError::Core)?;
        let key = row_key(&entity.entity_type, &entity.uid, entity.metadata.revision);
        let value = encode_record(entity)?;
        {
            let mut table = self.inner.open_table(ENTITIES)?;
            table.insert(key.as_slice(), value.as_slice())?;
        }
        let pointer = revision_pointer(&entity.entity_type, &entity.uid);
        {
            let mut table = self.inner.open_table(REVISIONS)?;
            table.insert(entity.metadata.revision, pointer.as_slice())?;
        }
        Ok(())
    }

    /// Removes the record at exactly `(entity_type, uid, revision)`.
    /// Cleanup uses this to drop superseded revisions; it never removes a
    /// uid's most recent revision unless that revision is itself a
    /// `Removal`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` table cannot be opened.
    pub fn remove(&mut self, entity_type: &str, uid: &str, revision: u64) -> Result<(), StoreError> {
        let key = row_key(entity_type, uid, revision);
        let mut table = self.inner.open_table(ENTITIES)?;
        table.remove(key.as_slice())?;
        Ok(())
    }

    /// Returns the most recent record for `(entity_type, uid)`, if any.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` range scan or decode fails.
    pub fn find_latest(&self, entity_type: &str, uid: &str) -> Result<Option<Entity>, StoreError> {
        let table = self.inner.open_table(ENTITIES)?;
        let (lo, hi) = row_prefix_range(entity_type, uid);
        let mut latest: Option<Vec<u8>> = None;
        for row in table.range(lo.as_slice()..=hi.as_slice())? {
            let (_k, v) = row?;
            latest = Some(v.value().to_vec());
        }
        latest.map(|bytes| decode_record(uid, entity_type, &bytes)).transpose()
    }

    /// Returns every stored revision for `(entity_type, uid)`, oldest first.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` range scan or decode fails.
    pub fn scan(&self, entity_type: &str, uid: &str) -> Result<Vec<Entity>, StoreError> {
        let table = self.inner.open_table(ENTITIES)?;
        let (lo, hi) = row_prefix_range(entity_type, uid);
        let mut out = Vec::new();
        for row in table.range(lo.as_slice()..=hi.as_slice())? {
            let (_k, v) = row?;
            out.push(decode_record(uid, entity_type, v.value())?);
        }
        Ok(out)
    }

    /// Returns `(entity_type, uid)` for the record written at `revision`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` table cannot be opened or the
    /// stored pointer is malformed.
    pub fn get_uid_from_revision(&self, revision: u64) -> Result<Option<(String, String)>, StoreError> {
        let table = self.inner.open_table(REVISIONS)?;
        match table.get(revision)? {
            Some(v) => split_revision_pointer(v.value()).map(Some),
            None => Ok(None),
        }
    }

    /// Returns the latest revision of every entity of `entity_type`, in uid
    /// order. Backs `DataStoreQuery`'s full-scan fallback when no registered
    /// `TypeIndex` covers a query's filters (§4.E).
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` range scan or decode fails.
    pub fn scan_type(&self, entity_type: &str) -> Result<Vec<Entity>, StoreError> {
        let table = self.inner.open_table(ENTITIES)?;
        let (lo, hi) = type_prefix_range(entity_type);
        let rows = table
            .range(lo.as_slice()..hi.as_slice())?
            .map(|row| row.map(|(k, v)| (k.value().to_vec(), v.value().to_vec())).map_err(StoreError::from));
        fold_latest_per_uid(entity_type, rows)
    }

    /// The highest revision ever committed by this store.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` table cannot be opened.
    pub fn max_revision(&self) -> Result<u64, StoreError> {
        let table = self.inner.open_table(COUNTERS)?;
        Ok(table.get(MAX_REVISION_KEY)?.map(|v| v.value()).unwrap_or(0))
    }

    /// Persists the new high-water revision. The pipeline calls this once
    /// per committed command, after all preprocessors have run (§4.D).
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` table cannot be opened.
    pub fn set_max_revision(&mut self, revision: u64) -> Result<(), StoreError> {
        let mut table = self.inner.open_table(COUNTERS)?;
        table.insert(MAX_REVISION_KEY, revision)?;
        Ok(())
    }

    /// The highest revision cleanup has fully processed.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` table cannot be opened.
    pub fn cleaned_up_revision(&self) -> Result<u64, StoreError> {
        let table = self.inner.open_table(COUNTERS)?;
        Ok(table.get(CLEANED_UP_REVISION_KEY)?.map(|v| v.value()).unwrap_or(0))
    }

    /// Advances the cleanup watermark.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` table cannot be opened.
    pub fn set_cleaned_up_revision(&mut self, revision: u64) -> Result<(), StoreError> {
        let mut table = self.inner.open_table(COUNTERS)?;
        table.insert(CLEANED_UP_REVISION_KEY, revision)?;
        Ok(())
    }

    /// Commits the transaction, making every write in it durable and
    /// visible to subsequent `begin_read`/`begin_write` calls.
    ///
    /// # Errors
    ///
    /// Returns [`StoreError::Commit`] if `redb` fails to commit.
    pub fn commit(self) -> Result<(), StoreError> {
        self.inner.commit()?;
        Ok(())
    }
}

/// A read-only snapshot transaction against one [`EntityStore`].
pub struct ReadTxn<'s> {
    pub(crate) inner: redb::ReadTransaction,
    _store: std::marker::PhantomData<&'s EntityStore>,
}

impl<'s> ReadTxn<'s> {
    /// See [`WriteTxn::find_latest`].
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` range scan or decode fails.
    pub fn find_latest(&self, entity_type: &str, uid: &str) -> Result<Option<Entity>, StoreError> {
        let table = self.inner.open_table(ENTITIES)?;
        let (lo, hi) = row_prefix_range(entity_type, uid);
        let mut latest: Option<Vec<u8>> = None;
        for row in table.range(lo.as_slice()..=hi.as_slice())? {
            let (_k, v) = row?;
            latest = Some(v.value().to_vec());
        }
        latest.map(|bytes| decode_record(uid, entity_type, &bytes)).transpose()
    }

    /// See [`WriteTxn::scan`].
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` range scan or decode fails.
    pub fn scan(&self, entity_type: &str, uid: &str) -> Result<Vec<Entity>, StoreError> {
        let table = self.inner.open_table(ENTITIES)?;
        let (lo, hi) = row_prefix_range(entity_type, uid);
        let mut out = Vec::new();
        for row in table.range(lo.as_slice()..=hi.as_slice())? {
            let (_k, v) = row?;
            out.push(decode_record(uid, entity_type, v.value())?);
        }
        Ok(out)
    }

    /// See [`WriteTxn::get_uid_from_revision`].
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` table cannot be opened or the
    /// stored pointer is malformed.
    pub fn get_uid_from_revision(&self, revision: u64) -> Result<Option<(String, String)>, StoreError> {
        let table = self.inner.open_table(REVISIONS)?;
        match table.get(revision)? {
            Some(v) => split_revision_pointer(v.value()).map(Some),
            None => Ok(None),
        }
    }

    /// See [`WriteTxn::scan_type`].
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` range scan or decode fails.
    pub fn scan_type(&self, entity_type: &str) -> Result<Vec<Entity>, StoreError> {
        let table = self.inner.open_table(ENTITIES)?;
        let (lo, hi) = type_prefix_range(entity_type);
        let rows = table
            .range(lo.as_slice()..hi.as_slice())?
            .map(|row| row.map(|(k, v)| (k.value().to_vec(), v.value().to_vec())).map_err(StoreError::from));
        fold_latest_per_uid(entity_type, rows)
    }

    /// See [`WriteTxn::max_revision`].
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` table cannot be opened.
    pub fn max_revision(&self) -> Result<u64, StoreError> {
        let table = self.inner.open_table(COUNTERS)?;
        Ok(table.get(MAX_REVISION_KEY)?.map(|v| v.value()).unwrap_or(0))
    }

    /// See [`WriteTxn::cleaned_up_revision`].
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` table cannot be opened.
    pub fn cleaned_up_revision(&self) -> Result<u64, StoreError> {
        let table = self.inner.open_table(COUNTERS)?;
        Ok(table.get(CLEANED_UP_REVISION_KEY)?.map(|v| v.value()).unwrap_or(0))
    }
}
