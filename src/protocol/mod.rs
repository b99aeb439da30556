//! Host/worker command protocol.
//!
//! This module defines how commands are laid out on the wire and how they are moved across a
//! socket in both directions.
//!
//! # Overview
//!
//! Every message exchanged with a worker is a [`Command`]: a fixed-size header carrying a magic
//! sentinel, a tag and the total length, followed by a tag-dependent payload. The length is the
//! only thing needed to find where a command ends in a byte stream, so the receive path never
//! looks past the header except for `Error` payloads.
//!
//! # Key Components
//!
//! - [`Command`]: one complete message, stored in its wire form.
//! - [`receive`]: reassembles complete commands from whatever chunks the transport delivers.
//! - [`CommandSocket`]: socket abstraction with per-call blocking mode and readiness polling.
//! - [`ProtocolTransport`]: blocking writer/reader used on the send path.
//!
//! # Binary Format
//!
//! - The header is 16 bytes: `magic: u32`, `tag: u32`, `length: u64`.
//! - All integers are big-endian, fixed width.
//! - `length` covers the header itself, so the smallest command is 16 bytes.
//!
//! # See Also
//!
//! - [`connection`](crate::connection): Uses the receive path from its receiver agent.
//! - [`session`](crate::session): Builds the `OpenSession` payload.
use bincode::config::{BigEndian, Configuration, Fixint};

mod command;
mod receive;
mod socket;
mod transport;

pub use command::{
    COMMAND_MAGIC, Command, CommandError, CommandHeader, CommandTag, HEADER_SIZE,
    MAX_COMMAND_LEN, WorkerError, errcode,
};
pub use receive::{LOCAL_BUFFER_SIZE, ReceiveError, Received, default_allocate, receive};
pub use socket::{CommandSocket, RecvMode};
pub use transport::{ProtocolTransport, TransportError};

/// Encoding used for every fixed structure on the wire.
pub(crate) fn wire_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}
