//! entigrid-core -- the shared vocabulary between a resource process and
//! its clients.
//!
//! - **Value** ([`value`]): the dynamic property-bag value type
//! - **Entity** ([`entity`]): entity records and per-revision metadata
//! - **Protocol** ([`protocol`]): the framed wire protocol and command set
//! - **Query** ([`query`]): declarative filter/sort query types
//! - **Error** ([`error`]): the shared error taxonomy and wire error codes
//! - **Context** ([`context`]): `AppContext`, threaded explicitly instead
//!   of through a global

pub mod context;
pub mod entity;
pub mod error;
pub mod protocol;
pub mod query;
pub mod value;

pub use context::AppContext;
pub use entity::{Entity, Operation, RecordMetadata};
pub use error::CoreError;
pub use protocol::{Command, CommandId, FrameError, StoredRecord};
pub use query::{ChangeKind, Comparator, FilterClause, Query, SortDirection};
pub use value::{PropertyBag, PropertyName, Uid, Value, KEY_SEPARATOR};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn crate_loads() {
        // Empty body: if this test runs, the crate compiles and loads.
    }

    #[test]
    fn reexports_accessible() {
        let ctx = AppContext::new("inst", "/tmp");
        assert_eq!(&*ctx.instance_id, "inst");

        let q = Query::new("Mail").filter("folder", Comparator::Equals(Value::String("inbox".into())));
        assert_eq!(q.filters.len(), 1);

        assert_eq!(CoreError::NotFound.code(), error::code::NOT_FOUND);
        assert_eq!(CommandId::from_u32(CommandId::Shutdown as u32), Some(CommandId::Shutdown));
    }
}
