//! Networking: connection tracking, the Unix-domain-socket accept loop, and
//! graceful shutdown control (§4.I).

pub mod config;
pub mod connection;
pub mod listener;
pub mod shutdown;

pub use config::ConnectionConfig;
pub use connection::{ConnectionHandle, ConnectionId, ConnectionRegistry, OutboundMessage, SendError};
pub use listener::{serve, share_dispatcher, ListenerState, SharedDispatcher};
pub use shutdown::{HealthState, InFlightGuard, ShutdownController};
