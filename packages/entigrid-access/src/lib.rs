//! entigrid-access -- the client side of the resource-process IPC channel
//! (§4.G `ResourceAccess`).
//!
//! A facade (out of scope here) owns one [`client::ResourceAccess`] per
//! configured resource instance and drives entity mutations and queries
//! through it rather than touching the resource process's socket directly.

pub mod client;
pub mod error;

pub use client::{AccessConfig, AccessEvent, CommandOutcome, ResourceAccess, ResourceAccessDriver};
pub use error::AccessError;
