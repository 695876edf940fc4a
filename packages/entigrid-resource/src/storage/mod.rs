//! Revisioned entity storage over an embedded transactional key-value
//! engine (§4.A-§4.B).
//!
//! - [`keys`]: record key assembly (`uid || SEP || revision`)
//! - [`kv`]: [`kv::EntityStore`], the append-only per-(uid,revision) store
//! - [`index`]: [`index::IndexManager`], the `(indexName,key) -> uid`
//!   secondary-index multimap

pub mod index;
pub mod keys;
pub mod kv;

pub use index::IndexManager;
pub use kv::{EntityStore, ReadTxn, StoreError, WriteTxn};
