//! Typed operations dispatched through the middleware stack to the domain
//! services (§4.H). Each variant mirrors one of the payload-carrying command
//! IDs in `entigrid_core::protocol::Command`.

use entigrid_core::query::Query;
use entigrid_core::value::{PropertyBag, PropertyName, Uid};

/// Well-known service names the `OperationRouter` dispatches by.
pub mod service_names {
    pub const PIPELINE: &str = "pipeline";
    pub const SYNC: &str = "sync";
    pub const CONTROL: &str = "control";
}

/// Context carried with every operation through the middleware stack.
#[derive(Debug, Clone)]
pub struct OperationContext {
    pub call_id: u64,
    pub service_name: &'static str,
    pub call_timeout_ms: u64,
}

impl OperationContext {
    #[must_use]
    pub fn new(call_id: u64, service_name: &'static str, call_timeout_ms: u64) -> Self {
        Self {
            call_id,
            service_name,
            call_timeout_ms,
        }
    }
}

/// Typed operation variants dispatched through the pipeline. One variant per
/// payload-carrying command in §6.
#[derive(Debug, Clone)]
pub enum Operation {
    CreateEntity {
        ctx: OperationContext,
        entity_type: String,
        entity_id: Option<Uid>,
        replay_to_source: bool,
        delta: PropertyBag,
    },
    ModifyEntity {
        ctx: OperationContext,
        entity_type: String,
        entity_id: Uid,
        revision: u64,
        replay_to_source: bool,
        modified_properties: std::collections::BTreeSet<PropertyName>,
        deletions: std::collections::BTreeSet<PropertyName>,
        delta: PropertyBag,
    },
    DeleteEntity {
        ctx: OperationContext,
        entity_type: String,
        entity_id: Uid,
        replay_to_source: bool,
    },
    Synchronize {
        ctx: OperationContext,
        query: Query,
    },
    Handshake {
        ctx: OperationContext,
        process_id: u32,
    },
    Shutdown {
        ctx: OperationContext,
    },
}

impl Operation {
    #[must_use]
    pub fn ctx(&self) -> &OperationContext {
        match self {
            Operation::CreateEntity { ctx, .. }
            | Operation::ModifyEntity { ctx, .. }
            | Operation::DeleteEntity { ctx, .. }
            | Operation::Synchronize { ctx, .. }
            | Operation::Handshake { ctx, .. }
            | Operation::Shutdown { ctx } => ctx,
        }
    }
}

/// Successful response from an operation handler.
#[derive(Debug, Clone)]
pub enum OperationResponse {
    /// The command committed at the given revision.
    Committed { call_id: u64, revision: u64 },
    /// The handshake was accepted.
    HandshakeAck { call_id: u64 },
    /// Shutdown has been accepted; the caller should expect the connection
    /// to close once draining completes.
    ShutdownAck { call_id: u64 },
    /// A query result set, serialized by the caller as needed.
    QueryResult { call_id: u64, uids: Vec<Uid> },
    Empty,
}

/// Errors returned by operation handlers. Maps onto `entigrid_core::error::CoreError`
/// at the dispatch boundary so `CommandCompletion` carries a stable numeric code.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    #[error("unknown service: {name}")]
    UnknownService { name: String },
    #[error("operation timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("resource overloaded, try again later")]
    Overloaded,
    #[error("wrong service for operation")]
    WrongService,
    #[error(transparent)]
    Core(#[from] entigrid_core::error::CoreError),
    #[error("internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

impl OperationError {
    /// Stable numeric code surfaced on `CommandCompletion{success=false}` frames.
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            OperationError::UnknownService { .. } | OperationError::WrongService => {
                entigrid_core::error::code::NOT_FOUND
            }
            OperationError::Timeout { .. } => entigrid_core::error::code::TRANSACTION_ERROR,
            OperationError::Overloaded => entigrid_core::error::code::BUSY,
            OperationError::Core(e) => e.code(),
            OperationError::Internal(_) => entigrid_core::error::code::TRANSACTION_ERROR,
        }
    }
}
