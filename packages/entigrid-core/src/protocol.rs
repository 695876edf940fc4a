//! Framed wire protocol between a resource process and its clients.
//!
//! Frame layout (little-endian):
//!
//! ```text
//! offset 0 :  u32 messageId
//! offset 4 :  u32 commandId
//! offset 8 :  u32 payloadSize
//! offset 12:  payloadSize bytes (MsgPack-encoded Command)
//! ```
//!
//! `messageId` is assigned by the client as a per-connection counter. A
//! response frame (`CommandCompletion`, `RevisionUpdate`, `Notification`)
//! reuses the originating `messageId` where one exists; `RevisionUpdate`
//! carries no correlation and is always sent with `messageId = 0`.

use std::collections::BTreeSet;

use bytes::{Buf, BufMut, BytesMut};
use serde::{Deserialize, Serialize};

use crate::entity::RecordMetadata;
use crate::query::Query;
use crate::value::{PropertyBag, PropertyName, Uid};

/// Length of the fixed frame header in bytes.
pub const FRAME_HEADER_LEN: usize = 12;

/// Exhaustive, closed set of command identifiers carried in the frame
/// header. This discriminant is redundant with the tag embedded in the
/// MsgPack-encoded `Command` payload, but is kept in the header so a
/// listener can route or meter traffic without decoding the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u32)]
pub enum CommandId {
    Handshake = 0,
    Synchronize = 1,
    Shutdown = 2,
    CreateEntity = 3,
    ModifyEntity = 4,
    DeleteEntity = 5,
    RevisionUpdate = 6,
    CommandCompletion = 7,
    Notification = 8,
}

impl CommandId {
    #[must_use]
    pub fn from_u32(v: u32) -> Option<Self> {
        Some(match v {
            0 => Self::Handshake,
            1 => Self::Synchronize,
            2 => Self::Shutdown,
            3 => Self::CreateEntity,
            4 => Self::ModifyEntity,
            5 => Self::DeleteEntity,
            6 => Self::RevisionUpdate,
            7 => Self::CommandCompletion,
            8 => Self::Notification,
            _ => return None,
        })
    }
}

/// Rollup status surfaced on the `Notification` channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Status {
    Connected,
    Offline,
    Busy,
    Error,
}

/// The decoded payload of one frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum Command {
    Handshake {
        process_id: u32,
    },
    CreateEntity {
        domain_type: String,
        entity_id: Option<Uid>,
        replay_to_source: bool,
        delta: PropertyBag,
    },
    ModifyEntity {
        domain_type: String,
        entity_id: Uid,
        revision: u64,
        replay_to_source: bool,
        modified_properties: BTreeSet<PropertyName>,
        deletions: BTreeSet<PropertyName>,
        delta: PropertyBag,
    },
    DeleteEntity {
        domain_type: String,
        entity_id: Uid,
        replay_to_source: bool,
    },
    Synchronize {
        query: Query,
    },
    Shutdown,
    RevisionUpdate {
        revision: u64,
    },
    CommandCompletion {
        completed_message_id: u32,
        success: bool,
        /// Numeric error code, see `entigrid_core::error::code`. Absent on success.
        code: Option<u32>,
    },
    Notification {
        status: Status,
    },
}

impl Command {
    #[must_use]
    pub fn command_id(&self) -> CommandId {
        match self {
            Command::Handshake { .. } => CommandId::Handshake,
            Command::CreateEntity { .. } => CommandId::CreateEntity,
            Command::ModifyEntity { .. } => CommandId::ModifyEntity,
            Command::DeleteEntity { .. } => CommandId::DeleteEntity,
            Command::Synchronize { .. } => CommandId::Synchronize,
            Command::Shutdown => CommandId::Shutdown,
            Command::RevisionUpdate { .. } => CommandId::RevisionUpdate,
            Command::CommandCompletion { .. } => CommandId::CommandCompletion,
            Command::Notification { .. } => CommandId::Notification,
        }
    }
}

/// Metadata-carrying record persisted for one (uid, revision) pair.
///
/// Distinct from [`Command`]: this is the at-rest form written by the
/// pipeline, not the on-wire command that produced it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredRecord {
    pub metadata: RecordMetadata,
    pub properties: PropertyBag,
}

/// Errors encoding or decoding a frame.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    #[error("frame payload too large: {0} bytes")]
    PayloadTooLarge(usize),
    #[error("incomplete frame: need {needed} bytes, have {have}")]
    Incomplete { needed: usize, have: usize },
    #[error("failed to encode command payload: {0}")]
    Encode(#[from] rmp_serde::encode::Error),
    #[error("failed to decode command payload: {0}")]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Encodes one command into a length-prefixed frame, appending it to `out`.
///
/// # Errors
///
/// Returns [`FrameError::Encode`] if the command cannot be MsgPack-encoded,
/// or [`FrameError::PayloadTooLarge`] if the encoded payload does not fit
/// in a `u32` length prefix.
pub fn encode_frame(message_id: u32, command: &Command, out: &mut BytesMut) -> Result<(), FrameError> {
    let payload = rmp_serde::to_vec_named(command)?;
    if payload.len() > u32::MAX as usize {
        return Err(FrameError::PayloadTooLarge(payload.len()));
    }
    out.reserve(FRAME_HEADER_LEN + payload.len());
    out.put_u32_le(message_id);
    out.put_u32_le(command.command_id() as u32);
    out.put_u32_le(payload.len() as u32);
    out.put_slice(&payload);
    Ok(())
}

/// A frame with its header fields decoded and payload bytes still owned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub message_id: u32,
    pub command_id: u32,
    pub payload_size: usize,
}

/// Attempts to parse the fixed header from the front of `buf` without
/// consuming it. Returns `None` if fewer than [`FRAME_HEADER_LEN`] bytes
/// are buffered.
#[must_use]
pub fn peek_header(buf: &[u8]) -> Option<FrameHeader> {
    if buf.len() < FRAME_HEADER_LEN {
        return None;
    }
    let message_id = u32::from_le_bytes(buf[0..4].try_into().unwrap());
    let command_id = u32::from_le_bytes(buf[4..8].try_into().unwrap());
    let payload_size = u32::from_le_bytes(buf[8..12].try_into().unwrap()) as usize;
    Some(FrameHeader { message_id, command_id, payload_size })
}

/// Attempts to decode one complete frame from the front of `buf`, advancing
/// `buf` past it on success. Returns `Ok(None)` if the buffer does not yet
/// contain a full frame (the caller should read more bytes and retry).
///
/// # Errors
///
/// Returns [`FrameError::Decode`] if the payload bytes are present but not
/// valid MsgPack for [`Command`].
pub fn try_decode_frame(buf: &mut BytesMut) -> Result<Option<(u32, Command)>, FrameError> {
    let Some(header) = peek_header(buf) else {
        return Ok(None);
    };
    let total = FRAME_HEADER_LEN + header.payload_size;
    if buf.len() < total {
        return Ok(None);
    }
    buf.advance(FRAME_HEADER_LEN);
    let payload = buf.split_to(header.payload_size);
    let command: Command = rmp_serde::from_slice(&payload)?;
    Ok(Some((header.message_id, command)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handshake_roundtrip() {
        let mut buf = BytesMut::new();
        encode_frame(0, &Command::Handshake { process_id: 4242 }, &mut buf).unwrap();
        let (message_id, command) = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(message_id, 0);
        assert_eq!(command, Command::Handshake { process_id: 4242 });
        assert!(buf.is_empty());
    }

    #[test]
    fn incomplete_frame_returns_none() {
        let mut buf = BytesMut::new();
        encode_frame(7, &Command::Shutdown, &mut buf).unwrap();
        let mut truncated = BytesMut::from(&buf[..buf.len() - 1]);
        assert!(try_decode_frame(&mut truncated).unwrap().is_none());
    }

    #[test]
    fn two_frames_back_to_back() {
        let mut buf = BytesMut::new();
        encode_frame(1, &Command::Shutdown, &mut buf).unwrap();
        encode_frame(2, &Command::RevisionUpdate { revision: 9 }, &mut buf).unwrap();

        let (id1, cmd1) = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(id1, 1);
        assert_eq!(cmd1, Command::Shutdown);

        let (id2, cmd2) = try_decode_frame(&mut buf).unwrap().unwrap();
        assert_eq!(id2, 2);
        assert_eq!(cmd2, Command::RevisionUpdate { revision: 9 });

        assert!(buf.is_empty());
    }

    #[test]
    fn command_id_matches_variant() {
        assert_eq!(Command::Shutdown.command_id(), CommandId::Shutdown);
        assert_eq!(
            Command::DeleteEntity { domain_type: "Mail".into(), entity_id: "u1".into(), replay_to_source: false }
                .command_id(),
            CommandId::DeleteEntity
        );
    }

    #[test]
    fn command_id_from_u32_rejects_unknown() {
        assert_eq!(CommandId::from_u32(99), None);
        assert_eq!(CommandId::from_u32(3), Some(CommandId::CreateEntity));
    }
}
