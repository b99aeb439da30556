use std::io::{self, Read, Write};

use thiserror::Error;

use super::command::{Command, CommandError, CommandHeader, HEADER_SIZE};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("invalid command: {0}")]
    Command(#[from] CommandError),
    #[error("Transport IO Error: {0}")]
    Io(#[from] io::Error),
}

/// Blocking command stream over any byte transport.
///
/// Used for the send path of a connection, where commands are written whole, and by tools that
/// talk to a worker synchronously.
pub struct ProtocolTransport<T> {
    stream: T,
}

impl<T> ProtocolTransport<T> {
    pub fn new(stream: T) -> Self {
        Self { stream }
    }

    pub fn get_ref(&self) -> &T {
        &self.stream
    }

    pub fn into_inner(self) -> T {
        self.stream
    }
}

impl<T: Write> ProtocolTransport<T> {
    pub fn write_command(&mut self, command: &Command) -> Result<(), TransportError> {
        self.stream.write_all(command.as_bytes())?;
        self.stream.flush()?;
        Ok(())
    }
}

impl<T: Read> ProtocolTransport<T> {
    /// Reads exactly one command, blocking until it is complete.
    pub fn read_command(&mut self) -> Result<Command, TransportError> {
        let mut header = [0_u8; HEADER_SIZE];
        self.stream.read_exact(&mut header)?;
        let length = CommandHeader::decode(&header)?.length as usize;

        let mut buf = vec![0_u8; length];
        buf[..HEADER_SIZE].copy_from_slice(&header);
        self.stream.read_exact(&mut buf[HEADER_SIZE..])?;
        Ok(Command::from_wire(buf)?)
    }
}
