//! Client-side error taxonomy for `ResourceAccess` (§7: `ConnectionError`,
//! `ResourceSpawnError`).

use entigrid_core::protocol::FrameError;

/// Failure modes visible to a caller of [`crate::client::ResourceAccess`].
#[derive(Debug, thiserror::Error)]
pub enum AccessError {
    /// The command could not be MsgPack-encoded onto the wire.
    #[error("failed to encode command: {0}")]
    Encode(#[from] FrameError),
    /// The connection dropped before a `CommandCompletion` arrived for this
    /// command. The caller decides whether to resubmit.
    #[error("connection to resource process was lost before completion")]
    Disconnected,
    /// The driver task has shut down and can no longer accept commands.
    #[error("resource access has been shut down")]
    Shutdown,
    /// Connect attempts exhausted `AccessConfig::backoff_max_attempts`
    /// without the resource process coming up.
    #[error("failed to spawn or reach resource process after repeated attempts")]
    SpawnExhausted,
}
