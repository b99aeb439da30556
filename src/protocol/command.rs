//! Wire representation of a single protocol command.
//!
//! A [`Command`] owns one contiguous buffer holding its header followed by the payload, exactly
//! as the bytes travel on the socket. Keeping the wire form means a received command can be
//! handed around without re-encoding, and a sent command is written with a single `write_all`.
//!
//! # Header
//!
//! | field    | type  | notes                                   |
//! |----------|-------|-----------------------------------------|
//! | `magic`  | `u32` | always [`COMMAND_MAGIC`]                |
//! | `tag`    | `u32` | see [`CommandTag`]                      |
//! | `length` | `u64` | header plus payload, in bytes           |
//!
//! Integers are big-endian with fixed-width encoding.
use bincode::{Decode, Encode, decode_from_slice, encode_into_slice, encode_to_vec};
use thiserror::Error;

use super::wire_config;

pub const COMMAND_MAGIC: u32 = 0x7870_7563;
pub const HEADER_SIZE: usize = 16;

/// Guardrail against garbage lengths; no legitimate command comes close.
pub const MAX_COMMAND_LEN: u64 = 1 << 30;

#[derive(Debug, Error)]
pub enum CommandError {
    #[error("command header needs {needed} bytes, got {got}")]
    Truncated { needed: usize, got: usize },

    #[error("bad command magic {found:#010x}")]
    BadMagic { found: u32 },

    #[error("invalid command length {length}")]
    BadLength { length: u64 },

    #[error("command declares {declared} bytes but buffer holds {actual}")]
    LengthMismatch { declared: u64, actual: usize },

    #[error("failed to encode command: {0}")]
    Encode(#[from] bincode::error::EncodeError),

    #[error("failed to decode command: {0}")]
    Decode(#[from] bincode::error::DecodeError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandTag {
    Success,
    Error,
    CpuFallback,
    OpenSession,
    ScanExec,
    JoinExec,
    PreAggExec,
    Final,
    Unknown(u32),
}

impl From<u32> for CommandTag {
    fn from(value: u32) -> Self {
        match value {
            0x0000 => CommandTag::Success,
            0x0001 => CommandTag::Error,
            0x0002 => CommandTag::CpuFallback,
            0x0100 => CommandTag::OpenSession,
            0x0101 => CommandTag::ScanExec,
            0x0102 => CommandTag::JoinExec,
            0x0103 => CommandTag::PreAggExec,
            0x01ff => CommandTag::Final,
            other => CommandTag::Unknown(other),
        }
    }
}

impl From<CommandTag> for u32 {
    fn from(value: CommandTag) -> Self {
        match value {
            CommandTag::Success => 0x0000,
            CommandTag::Error => 0x0001,
            CommandTag::CpuFallback => 0x0002,
            CommandTag::OpenSession => 0x0100,
            CommandTag::ScanExec => 0x0101,
            CommandTag::JoinExec => 0x0102,
            CommandTag::PreAggExec => 0x0103,
            CommandTag::Final => 0x01ff,
            CommandTag::Unknown(other) => other,
        }
    }
}

#[derive(Debug, Clone, Copy, Encode, Decode, PartialEq, Eq)]
pub struct CommandHeader {
    pub magic: u32,
    pub tag: u32,
    pub length: u64,
}

impl CommandHeader {
    /// Decodes and validates the header at the start of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self, CommandError> {
        if bytes.len() < HEADER_SIZE {
            return Err(CommandError::Truncated {
                needed: HEADER_SIZE,
                got: bytes.len(),
            });
        }
        let (header, _): (CommandHeader, usize) =
            decode_from_slice(&bytes[..HEADER_SIZE], wire_config())?;

        if header.magic != COMMAND_MAGIC {
            return Err(CommandError::BadMagic {
                found: header.magic,
            });
        }
        if header.length < HEADER_SIZE as u64 || header.length > MAX_COMMAND_LEN {
            return Err(CommandError::BadLength {
                length: header.length,
            });
        }
        Ok(header)
    }

    pub fn tag(&self) -> CommandTag {
        self.tag.into()
    }
}

/// One complete protocol message, header included.
#[derive(Clone, PartialEq, Eq)]
pub struct Command {
    buf: Vec<u8>,
}

impl Command {
    pub fn new(tag: CommandTag, payload: &[u8]) -> Result<Self, CommandError> {
        let length = (HEADER_SIZE + payload.len()) as u64;
        if length > MAX_COMMAND_LEN {
            return Err(CommandError::BadLength { length });
        }
        let header = CommandHeader {
            magic: COMMAND_MAGIC,
            tag: tag.into(),
            length,
        };

        let mut buf = vec![0; length as usize];
        encode_into_slice(header, &mut buf[..HEADER_SIZE], wire_config())?;
        buf[HEADER_SIZE..].copy_from_slice(payload);
        Ok(Self { buf })
    }

    /// Wraps bytes received from the wire, validating the header against the buffer.
    pub fn from_wire(buf: Vec<u8>) -> Result<Self, CommandError> {
        let header = CommandHeader::decode(&buf)?;
        if header.length != buf.len() as u64 {
            return Err(CommandError::LengthMismatch {
                declared: header.length,
                actual: buf.len(),
            });
        }
        Ok(Self { buf })
    }

    /// Builds an `Error` command carrying `error` as its payload.
    pub fn error(error: &WorkerError) -> Result<Self, CommandError> {
        let payload = encode_to_vec(error, wire_config())?;
        Self::new(CommandTag::Error, &payload)
    }

    pub fn tag(&self) -> CommandTag {
        self.raw_tag().into()
    }

    pub fn length(&self) -> u64 {
        self.buf.len() as u64
    }

    pub fn payload(&self) -> &[u8] {
        &self.buf[HEADER_SIZE..]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.buf
    }

    fn raw_tag(&self) -> u32 {
        u32::from_be_bytes([self.buf[4], self.buf[5], self.buf[6], self.buf[7]])
    }
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Command")
            .field("tag", &self.tag())
            .field("length", &self.length())
            .finish()
    }
}

/// Error codes for failures detected on this side of the connection.
pub mod errcode {
    pub const PROTOCOL: u32 = 0x1001;
    pub const CONNECTION_CLOSED: u32 = 0x1002;
    pub const IO: u32 = 0x1003;
    pub const OUT_OF_MEMORY: u32 = 0x1004;
}

/// Error reported by the worker (or synthesized locally for connection failures).
///
/// Carried as the payload of `Error` commands and stored in the connection's error slot.
#[derive(Debug, Clone, Error, Encode, Decode, PartialEq, Eq)]
#[error("{filename}:{lineno}  {message} (code {code:#x}, function {funcname})")]
pub struct WorkerError {
    pub code: u32,
    pub lineno: u32,
    pub filename: String,
    pub funcname: String,
    pub message: String,
}

impl WorkerError {
    /// Decodes the payload of an `Error` command.
    pub fn from_command(command: &Command) -> Result<Self, CommandError> {
        let (error, _): (WorkerError, usize) =
            decode_from_slice(command.payload(), wire_config())?;
        Ok(error)
    }

    pub(crate) fn local(
        code: u32,
        funcname: &str,
        location: &std::panic::Location<'_>,
        message: String,
    ) -> Self {
        Self {
            code,
            lineno: location.line(),
            filename: location.file().to_string(),
            funcname: funcname.to_string(),
            message,
        }
    }
}
