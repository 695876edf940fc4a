//! `IndexManager`: the `(indexName, key) -> uid` secondary-index multimap
//! (§4.B).
//!
//! One shared `redb` multimap table holds every named index's entries,
//! keyed by `indexName || SEP || keyBytes`. A composite sort key is built
//! as `propertyValueBytes || sortableBytes(sortValue)`: concatenating the
//! filter value ahead of the sort value keeps all entries for one filter
//! value contiguous while still ordering them by the sort value within that
//! group.

use redb::MultimapTableDefinition;

use entigrid_core::value::{Uid, KEY_SEPARATOR};

use super::kv::{ReadTxn, StoreError, WriteTxn};

pub(crate) const INDEXES: MultimapTableDefinition<&[u8], &[u8]> = MultimapTableDefinition::new("indexes");

/// Builds the composite multimap key for one index entry.
#[must_use]
pub fn index_key(index_name: &str, key_bytes: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(index_name.len() + 1 + key_bytes.len());
    out.extend_from_slice(index_name.as_bytes());
    out.push(KEY_SEPARATOR);
    out.extend_from_slice(key_bytes);
    out
}

/// Encodes a unix-seconds timestamp so ascending byte order yields
/// descending chronological order: `UINT_MAX - unixSeconds`, big-endian.
///
/// Timestamps outside `[0, u32::MAX]` saturate rather than wrap, so
/// out-of-range dates still sort to the respective end of the index.
#[must_use]
pub fn sortable_date(unix_seconds: i64) -> [u8; 4] {
    let clamped = unix_seconds.clamp(0, u32::MAX as i64) as u32;
    (u32::MAX - clamped).to_be_bytes()
}

/// Manages secondary index entries inside an [`EntityStore`](super::EntityStore)'s
/// shared write transaction. Index maintenance always happens alongside an
/// entity write in the same transaction, so there is no separate
/// `IndexManager` read path: callers needing to read already go through
/// [`lookup`].
pub struct IndexManager;

impl IndexManager {
    /// Adds one `(index_name, key_bytes) -> uid` entry.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` multimap table cannot be
    /// opened.
    pub fn add(txn: &mut WriteTxn<'_>, index_name: &str, key_bytes: &[u8], uid: &Uid) -> Result<(), StoreError> {
        let composite = index_key(index_name, key_bytes);
        let mut table = txn.inner.open_multimap_table(INDEXES)?;
        table.insert(composite.as_slice(), uid.as_bytes())?;
        Ok(())
    }

    /// Removes one `(index_name, key_bytes) -> uid` entry. A no-op, not an
    /// error, if the pair was never present -- callers remove-then-add
    /// speculatively during `ModifyEntity` without checking first (§13).
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` multimap table cannot be
    /// opened.
    pub fn remove(txn: &mut WriteTxn<'_>, index_name: &str, key_bytes: &[u8], uid: &Uid) -> Result<(), StoreError> {
        let composite = index_key(index_name, key_bytes);
        let mut table = txn.inner.open_multimap_table(INDEXES)?;
        table.remove(composite.as_slice(), uid.as_bytes())?;
        Ok(())
    }

    /// Returns every uid stored under exactly `(index_name, key_bytes)`.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` multimap table cannot be
    /// opened or a value fails to decode as UTF-8.
    pub fn lookup(txn: &WriteTxn<'_>, index_name: &str, key_bytes: &[u8]) -> Result<Vec<Uid>, StoreError> {
        let composite = index_key(index_name, key_bytes);
        let table = txn.inner.open_multimap_table(INDEXES)?;
        let mut out = Vec::new();
        for value in table.get(composite.as_slice())? {
            let value = value?;
            out.push(
                String::from_utf8(value.value().to_vec())
                    .map_err(|_| StoreError::from(entigrid_core::CoreError::InvalidBuffer))?,
            );
        }
        Ok(out)
    }

    /// Returns every uid whose composite key under `index_name` falls in
    /// `[lo, hi]`, in ascending key order. Backs `GreaterThan`/`LessThan`
    /// comparators and sorted scans.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` multimap table cannot be
    /// opened or a value fails to decode as UTF-8.
    pub fn lookup_range(
        txn: &WriteTxn<'_>,
        index_name: &str,
        lo: &[u8],
        hi: &[u8],
    ) -> Result<Vec<Uid>, StoreError> {
        let lo_key = index_key(index_name, lo);
        let hi_key = index_key(index_name, hi);
        let table = txn.inner.open_multimap_table(INDEXES)?;
        let mut out = Vec::new();
        for entry in table.range(lo_key.as_slice()..=hi_key.as_slice())? {
            let (_k, values) = entry?;
            for value in values {
                let value = value?;
                out.push(
                    String::from_utf8(value.value().to_vec())
                        .map_err(|_| StoreError::from(entigrid_core::CoreError::InvalidBuffer))?,
                );
            }
        }
        Ok(out)
    }

    /// Read-only counterpart of [`Self::lookup`], used by `DataStoreQuery` so
    /// that query execution runs against a snapshot rather than contending
    /// with the pipeline's single write transaction (§5).
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` multimap table cannot be
    /// opened or a value fails to decode as UTF-8.
    pub fn lookup_snapshot(txn: &ReadTxn<'_>, index_name: &str, key_bytes: &[u8]) -> Result<Vec<Uid>, StoreError> {
        let composite = index_key(index_name, key_bytes);
        let table = txn.inner.open_multimap_table(INDEXES)?;
        let mut out = Vec::new();
        for value in table.get(composite.as_slice())? {
            let value = value?;
            out.push(
                String::from_utf8(value.value().to_vec())
                    .map_err(|_| StoreError::from(entigrid_core::CoreError::InvalidBuffer))?,
            );
        }
        Ok(out)
    }

    /// Returns every uid whose composite key under `index_name` starts with
    /// `prefix_bytes`, in ascending key order. Backs lookups against a
    /// composite `(filterProp, sortProp)` index (§4.C), where an entry's
    /// full key is `filterValueBytes || sortableBytes(sortValue)`: an
    /// `Equals(filterValue)` clause only knows the prefix, not the sort
    /// suffix, so it must scan every key sharing that prefix rather than
    /// look up one exact key.
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` multimap table cannot be
    /// opened or a value fails to decode as UTF-8.
    pub fn lookup_prefix(txn: &WriteTxn<'_>, index_name: &str, prefix_bytes: &[u8]) -> Result<Vec<Uid>, StoreError> {
        let prefix = index_key(index_name, prefix_bytes);
        let table = txn.inner.open_multimap_table(INDEXES)?;
        let mut out = Vec::new();
        for entry in table.range(prefix.as_slice()..)? {
            let (key, values) = entry?;
            if !key.value().starts_with(prefix.as_slice()) {
                break;
            }
            for value in values {
                let value = value?;
                out.push(
                    String::from_utf8(value.value().to_vec())
                        .map_err(|_| StoreError::from(entigrid_core::CoreError::InvalidBuffer))?,
                );
            }
        }
        Ok(out)
    }

    /// Read-only counterpart of [`Self::lookup_prefix`].
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` multimap table cannot be
    /// opened or a value fails to decode as UTF-8.
    pub fn lookup_prefix_snapshot(txn: &ReadTxn<'_>, index_name: &str, prefix_bytes: &[u8]) -> Result<Vec<Uid>, StoreError> {
        let prefix = index_key(index_name, prefix_bytes);
        let table = txn.inner.open_multimap_table(INDEXES)?;
        let mut out = Vec::new();
        for entry in table.range(prefix.as_slice()..)? {
            let (key, values) = entry?;
            if !key.value().starts_with(prefix.as_slice()) {
                break;
            }
            for value in values {
                let value = value?;
                out.push(
                    String::from_utf8(value.value().to_vec())
                        .map_err(|_| StoreError::from(entigrid_core::CoreError::InvalidBuffer))?,
                );
            }
        }
        Ok(out)
    }

    /// Read-only counterpart of [`Self::lookup_range`].
    ///
    /// # Errors
    ///
    /// Returns a storage error if the `redb` multimap table cannot be
    /// opened or a value fails to decode as UTF-8.
    pub fn lookup_range_snapshot(
        txn: &ReadTxn<'_>,
        index_name: &str,
        lo: &[u8],
        hi: &[u8],
    ) -> Result<Vec<Uid>, StoreError> {
        let lo_key = index_key(index_name, lo);
        let hi_key = index_key(index_name, hi);
        let table = txn.inner.open_multimap_table(INDEXES)?;
        let mut out = Vec::new();
        for entry in table.range(lo_key.as_slice()..=hi_key.as_slice())? {
            let (_k, values) = entry?;
            for value in values {
                let value = value?;
                out.push(
                    String::from_utf8(value.value().to_vec())
                        .map_err(|_| StoreError::from(entigrid_core::CoreError::InvalidBuffer))?,
                );
            }
        }
        Ok(out)
    }
}
