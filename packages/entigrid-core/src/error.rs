//! Shared error taxonomy surfaced across the wire as `CommandCompletion`
//! failure codes (see §7 of the design notes this crate implements).

use thiserror::Error;

/// Top-level error kind returned by any command-handling path.
///
/// Structural/application errors (`InvalidBuffer`..`AlreadyRemoved`) abort
/// only the command that raised them; `TransactionError` aborts the whole
/// in-flight write transaction; `ConnectionError`/`ResourceSpawnError` are
/// transport-level and never touch storage state.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CoreError {
    #[error("command buffer failed structural validation")]
    InvalidBuffer,
    #[error("uid contains the reserved key separator byte")]
    InvalidUid,
    #[error("entity not found")]
    NotFound,
    #[error("entity already exists")]
    AlreadyExists,
    #[error("entity already removed")]
    AlreadyRemoved,
    #[error("storage transaction failed: {0}")]
    TransactionError(String),
    #[error("connection error: {0}")]
    ConnectionError(String),
    #[error("failed to spawn resource process: {0}")]
    ResourceSpawnError(String),
    #[error("command rejected: resource is busy")]
    Busy,
}

/// Stable numeric codes carried in `Command::CommandCompletion { code, .. }`.
///
/// Kept in one place so every call site maps an error the same way instead
/// of inventing ad hoc codes per handler.
pub mod code {
    pub const INVALID_BUFFER: u32 = 1;
    pub const INVALID_UID: u32 = 2;
    pub const NOT_FOUND: u32 = 3;
    pub const ALREADY_EXISTS: u32 = 4;
    pub const ALREADY_REMOVED: u32 = 5;
    pub const TRANSACTION_ERROR: u32 = 6;
    pub const CONNECTION_ERROR: u32 = 7;
    pub const RESOURCE_SPAWN_ERROR: u32 = 8;
    pub const BUSY: u32 = 9;
}

impl CoreError {
    #[must_use]
    pub fn code(&self) -> u32 {
        match self {
            CoreError::InvalidBuffer => code::INVALID_BUFFER,
            CoreError::InvalidUid => code::INVALID_UID,
            CoreError::NotFound => code::NOT_FOUND,
            CoreError::AlreadyExists => code::ALREADY_EXISTS,
            CoreError::AlreadyRemoved => code::ALREADY_REMOVED,
            CoreError::TransactionError(_) => code::TRANSACTION_ERROR,
            CoreError::ConnectionError(_) => code::CONNECTION_ERROR,
            CoreError::ResourceSpawnError(_) => code::RESOURCE_SPAWN_ERROR,
            CoreError::Busy => code::BUSY,
        }
    }

    /// Whether this error only aborts the current command, leaving the
    /// ambient write transaction (if any) open for subsequent commands.
    #[must_use]
    pub fn aborts_command_only(&self) -> bool {
        !matches!(self, CoreError::TransactionError(_))
    }
}
