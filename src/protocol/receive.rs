//! Reassembly of complete commands from a socket byte stream.
//!
//! The transport may hand over a command in any number of pieces, several commands in one
//! piece, or stop in the middle of a header. [`receive`] hides all of that: it reads whatever is
//! available, and every time a complete command is in hand it copies it into a buffer obtained
//! from the caller's `allocate` callback and passes it to `attach`.
//!
//! # Buffering
//!
//! Reads land in a [`LOCAL_BUFFER_SIZE`] stack buffer. Leftover bytes of an incomplete command
//! are moved to its front between reads. A command that cannot fit in the local buffer switches
//! the decoder to an exact-size allocation, and the rest of that command is read straight into
//! it.
//!
//! # Blocking
//!
//! The first read of a call, and the first read after each completed command, do not block: no
//! data means nothing is queued and the call returns. Once part of a command has arrived the
//! peer is expected to send the rest shortly, so reads block until the command is complete.
use std::io;

use log::{error, trace};
use thiserror::Error;

use super::{
    CommandSocket, RecvMode,
    command::{Command, CommandError, CommandHeader, HEADER_SIZE},
};

pub const LOCAL_BUFFER_SIZE: usize = 2 * 8192;

macro_rules! report {
    ($label:expr, $($arg:tt)*) => {
        error!("[{}; {}:{}] {}", $label, file!(), line!(), format_args!($($arg)*))
    };
}

#[derive(Debug, Error)]
pub enum ReceiveError {
    #[error("[{label}] protocol error with {buffered} bytes buffered: {source}")]
    Protocol {
        label: String,
        buffered: usize,
        #[source]
        source: CommandError,
    },

    #[error("[{label}] connection closed during command read ({buffered} bytes buffered)")]
    Truncated { label: String, buffered: usize },

    #[error("[{label}] out of memory (sz={size})")]
    OutOfMemory { label: String, size: usize },

    #[error("[{label}] failed on recv: {source}")]
    Io {
        label: String,
        #[source]
        source: io::Error,
    },
}

/// Outcome of one [`receive`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Received {
    /// Commands handed to `attach` during the call.
    pub attached: usize,
    /// The peer closed the stream on a command boundary.
    pub end_of_stream: bool,
}

/// Where the bytes of the command currently being assembled live.
enum Residency {
    /// `filled` bytes at the front of the local buffer.
    Local { filled: usize },
    /// A command longer than the local buffer, read directly into its final allocation.
    Exact { buf: Vec<u8>, filled: usize },
}

impl Residency {
    fn idle() -> Self {
        Residency::Local { filled: 0 }
    }

    fn is_idle(&self) -> bool {
        matches!(self, Residency::Local { filled: 0 })
    }

    fn buffered(&self) -> usize {
        match self {
            Residency::Local { filled } | Residency::Exact { filled, .. } => *filled,
        }
    }
}

/// Allocates a zeroed buffer of `size` bytes, or `None` if the allocator refuses.
pub fn default_allocate(size: usize) -> Option<Vec<u8>> {
    let mut buf = Vec::new();
    buf.try_reserve_exact(size).ok()?;
    buf.resize(size, 0);
    Some(buf)
}

/// Reads every command currently available on `socket`.
///
/// `allocate(size)` provides the buffer a command of `size` bytes is copied into (its previous
/// contents are overwritten); returning `None` aborts the call with
/// [`ReceiveError::OutOfMemory`]. `attach` takes ownership of each complete command in stream
/// order. `label` identifies the socket in errors and logs.
pub fn receive<S, A, F>(
    socket: &mut S,
    label: &str,
    mut allocate: A,
    mut attach: F,
) -> Result<Received, ReceiveError>
where
    S: CommandSocket + ?Sized,
    A: FnMut(usize) -> Option<Vec<u8>>,
    F: FnMut(Command),
{
    let mut local = [0_u8; LOCAL_BUFFER_SIZE];
    let mut residency = Residency::idle();
    let mut mode = RecvMode::NonBlocking;
    let mut attached = 0;

    loop {
        let target = match &mut residency {
            Residency::Local { filled } => &mut local[*filled..],
            Residency::Exact { buf, filled } => &mut buf[*filled..],
        };

        let nbytes = match socket.recv(target, mode) {
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                if residency.is_idle() {
                    return Ok(Received {
                        attached,
                        end_of_stream: false,
                    });
                }
                mode = RecvMode::Blocking;
                continue;
            }
            Err(e) => {
                report!(label, "failed on recv ({mode:?}, {} bytes buffered): {e}", residency.buffered());
                return Err(ReceiveError::Io {
                    label: label.to_string(),
                    source: e,
                });
            }
        };

        if nbytes == 0 {
            if residency.is_idle() {
                return Ok(Received {
                    attached,
                    end_of_stream: true,
                });
            }
            report!(label, "connection closed during command read");
            return Err(ReceiveError::Truncated {
                label: label.to_string(),
                buffered: residency.buffered(),
            });
        }
        trace!("[{label}] recv {nbytes} bytes ({mode:?})");

        match &mut residency {
            Residency::Exact { buf, filled } => {
                *filled += nbytes;
                if *filled == buf.len() {
                    let buffered = *filled;
                    let command = Command::from_wire(std::mem::take(buf))
                        .map_err(|e| protocol_error(label, buffered, e))?;
                    attach(command);
                    attached += 1;
                    residency = Residency::idle();
                    mode = RecvMode::NonBlocking;
                }
            }
            Residency::Local { filled } => {
                let end = *filled + nbytes;
                let (next, next_mode) =
                    split_local(&mut local, end, label, &mut allocate, &mut attach, &mut attached)?;
                residency = next;
                mode = next_mode;
            }
        }
    }
}

/// Hands over every complete command among the first `end` bytes of `local` and decides where
/// the remainder continues.
fn split_local<A, F>(
    local: &mut [u8; LOCAL_BUFFER_SIZE],
    end: usize,
    label: &str,
    allocate: &mut A,
    attach: &mut F,
    attached: &mut usize,
) -> Result<(Residency, RecvMode), ReceiveError>
where
    A: FnMut(usize) -> Option<Vec<u8>>,
    F: FnMut(Command),
{
    let mut start = 0;

    loop {
        let avail = end - start;
        if avail < HEADER_SIZE {
            local.copy_within(start..end, 0);
            let mode = if avail == 0 {
                RecvMode::NonBlocking
            } else {
                RecvMode::Blocking
            };
            return Ok((Residency::Local { filled: avail }, mode));
        }

        let header = CommandHeader::decode(&local[start..end])
            .map_err(|e| protocol_error(label, avail, e))?;
        let length = header.length as usize;

        if length <= avail {
            let mut buf = allocate_exact(allocate, length, label)?;
            buf.copy_from_slice(&local[start..start + length]);
            let command = Command::from_wire(buf).map_err(|e| protocol_error(label, avail, e))?;
            attach(command);
            *attached += 1;
            start += length;
        } else if length <= LOCAL_BUFFER_SIZE {
            local.copy_within(start..end, 0);
            return Ok((Residency::Local { filled: avail }, RecvMode::Blocking));
        } else {
            trace!("[{label}] command of {length} bytes exceeds local buffer");
            let mut buf = allocate_exact(allocate, length, label)?;
            buf[..avail].copy_from_slice(&local[start..end]);
            return Ok((Residency::Exact { buf, filled: avail }, RecvMode::Blocking));
        }
    }
}

fn allocate_exact<A>(allocate: &mut A, size: usize, label: &str) -> Result<Vec<u8>, ReceiveError>
where
    A: FnMut(usize) -> Option<Vec<u8>>,
{
    match allocate(size) {
        Some(mut buf) => {
            buf.resize(size, 0);
            Ok(buf)
        }
        None => {
            report!(label, "out of memory (sz={size})");
            Err(ReceiveError::OutOfMemory {
                label: label.to_string(),
                size,
            })
        }
    }
}

fn protocol_error(label: &str, buffered: usize, source: CommandError) -> ReceiveError {
    report!(label, "{source} ({buffered} bytes buffered)");
    ReceiveError::Protocol {
        label: label.to_string(),
        buffered,
        source,
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::VecDeque,
        io::Write,
        os::unix::net::UnixStream,
        thread,
        time::Duration,
    };

    use crate::protocol::CommandTag;

    use super::*;

    enum Step {
        Data(Vec<u8>),
        WouldBlock,
        Interrupted,
        Fail(io::ErrorKind),
    }

    /// Replays a fixed script of socket events; an exhausted script reads as end of stream.
    struct ScriptedSocket {
        steps: VecDeque<Step>,
        modes: Vec<RecvMode>,
    }

    impl ScriptedSocket {
        fn new(steps: Vec<Step>) -> Self {
            Self {
                steps: steps.into(),
                modes: Vec::new(),
            }
        }

        fn chunks(stream: &[u8], size: usize) -> Self {
            let mut steps = Vec::new();
            for chunk in stream.chunks(size) {
                steps.push(Step::Data(chunk.to_vec()));
                steps.push(Step::WouldBlock);
            }
            Self::new(steps)
        }
    }

    impl CommandSocket for ScriptedSocket {
        fn recv(&mut self, buf: &mut [u8], mode: RecvMode) -> io::Result<usize> {
            self.modes.push(mode);
            loop {
                match self.steps.pop_front() {
                    None => return Ok(0),
                    Some(Step::Data(data)) => {
                        let n = data.len().min(buf.len());
                        buf[..n].copy_from_slice(&data[..n]);
                        if n < data.len() {
                            self.steps.push_front(Step::Data(data[n..].to_vec()));
                        }
                        return Ok(n);
                    }
                    // A blocking read just waits for the next data.
                    Some(Step::WouldBlock) if mode == RecvMode::Blocking => continue,
                    Some(Step::WouldBlock) => return Err(io::ErrorKind::WouldBlock.into()),
                    Some(Step::Interrupted) => return Err(io::ErrorKind::Interrupted.into()),
                    Some(Step::Fail(kind)) => return Err(kind.into()),
                }
            }
        }

        fn wait_readable(&mut self, _timeout: Duration) -> io::Result<bool> {
            Ok(!self.steps.is_empty())
        }
    }

    fn sample_commands() -> Vec<Command> {
        vec![
            Command::new(CommandTag::Success, b"").unwrap(),
            Command::new(CommandTag::ScanExec, &[7; 37]).unwrap(),
            Command::new(CommandTag::Unknown(99), &(0..=255).collect::<Vec<u8>>()).unwrap(),
        ]
    }

    fn concat(commands: &[Command]) -> Vec<u8> {
        commands.iter().flat_map(|c| c.as_bytes().to_vec()).collect()
    }

    /// Calls `receive` until the stream ends.
    fn drain(socket: &mut ScriptedSocket) -> Result<Vec<Command>, ReceiveError> {
        let mut out = Vec::new();
        loop {
            let received = receive(socket, "test", default_allocate, |c| out.push(c))?;
            if received.end_of_stream {
                return Ok(out);
            }
        }
    }

    #[test]
    fn every_split_point_yields_identical_commands() {
        let commands = sample_commands();
        let stream = concat(&commands);

        for split in 0..=stream.len() {
            let mut steps = Vec::new();
            if split > 0 {
                steps.push(Step::Data(stream[..split].to_vec()));
            }
            steps.push(Step::WouldBlock);
            if split < stream.len() {
                steps.push(Step::Data(stream[split..].to_vec()));
            }
            let mut socket = ScriptedSocket::new(steps);

            let out = drain(&mut socket).unwrap();
            assert_eq!(out, commands, "split at byte {split}");
        }
    }

    #[test]
    fn byte_by_byte_delivery() {
        let commands = sample_commands();
        let mut socket = ScriptedSocket::chunks(&concat(&commands), 1);

        assert_eq!(drain(&mut socket).unwrap(), commands);
    }

    #[test]
    fn several_commands_in_one_read() {
        let commands = sample_commands();
        let mut socket =
            ScriptedSocket::new(vec![Step::Data(concat(&commands)), Step::WouldBlock]);
        let mut out = Vec::new();

        let received = receive(&mut socket, "test", default_allocate, |c| out.push(c)).unwrap();

        assert_eq!(
            received,
            Received {
                attached: 3,
                end_of_stream: false
            }
        );
        assert_eq!(out, commands);
        assert_eq!(socket.modes, vec![RecvMode::NonBlocking, RecvMode::NonBlocking]);
    }

    #[test]
    fn nothing_queued_returns_immediately() {
        let mut socket = ScriptedSocket::new(vec![Step::WouldBlock]);

        let received = receive(&mut socket, "test", default_allocate, |_| {}).unwrap();

        assert_eq!(received, Received::default());
        assert_eq!(socket.modes, vec![RecvMode::NonBlocking]);
    }

    #[test]
    fn partial_command_switches_to_blocking() {
        let command = Command::new(CommandTag::Success, b"abcdef").unwrap();
        let bytes = command.as_bytes();
        let mut socket = ScriptedSocket::new(vec![
            Step::Data(bytes[..5].to_vec()),
            Step::WouldBlock,
            Step::Data(bytes[5..].to_vec()),
            Step::WouldBlock,
        ]);
        let mut out = Vec::new();

        let received = receive(&mut socket, "test", default_allocate, |c| out.push(c)).unwrap();

        assert_eq!(received.attached, 1);
        assert_eq!(out, vec![command]);
        assert_eq!(
            socket.modes,
            vec![
                RecvMode::NonBlocking,
                RecvMode::Blocking,
                RecvMode::NonBlocking
            ]
        );
    }

    #[test]
    fn oversized_command_uses_exact_allocation() {
        let payload: Vec<u8> = (0..40_000).map(|i| (i % 251) as u8).collect();
        let big = Command::new(CommandTag::Success, &payload).unwrap();
        let small = Command::new(CommandTag::Final, b"end").unwrap();
        let stream = concat(&[big.clone(), small.clone()]);
        let mut socket = ScriptedSocket::chunks(&stream, 4096);
        let mut sizes = Vec::new();
        let mut out = Vec::new();

        loop {
            let received = receive(
                &mut socket,
                "test",
                |size| {
                    sizes.push(size);
                    default_allocate(size)
                },
                |c| out.push(c),
            )
            .unwrap();
            if received.end_of_stream {
                break;
            }
        }

        assert_eq!(out, vec![big.clone(), small.clone()]);
        assert_eq!(sizes, vec![big.as_bytes().len(), small.as_bytes().len()]);
    }

    #[test]
    fn end_of_stream_mid_command() {
        let command = Command::new(CommandTag::Success, b"abcdef").unwrap();
        let mut socket = ScriptedSocket::new(vec![Step::Data(command.as_bytes()[..20].to_vec())]);

        let err = drain(&mut socket).unwrap_err();
        assert!(matches!(err, ReceiveError::Truncated { buffered: 20, .. }));
    }

    #[test]
    fn bad_magic_is_protocol_error() {
        let mut bytes = Command::new(CommandTag::Success, b"abc").unwrap().into_bytes();
        bytes[1] = 0;
        let mut socket = ScriptedSocket::new(vec![Step::Data(bytes)]);

        let err = drain(&mut socket).unwrap_err();
        assert!(matches!(
            err,
            ReceiveError::Protocol {
                source: CommandError::BadMagic { .. },
                ..
            }
        ));
    }

    #[test]
    fn allocator_failure_is_out_of_memory() {
        let command = Command::new(CommandTag::Success, b"abc").unwrap();
        let mut socket = ScriptedSocket::new(vec![Step::Data(command.as_bytes().to_vec())]);

        let err = receive(&mut socket, "test", |_| None, |_| {}).unwrap_err();
        assert!(matches!(err, ReceiveError::OutOfMemory { size: 19, .. }));
    }

    #[test]
    fn interrupted_reads_are_retried() {
        let command = Command::new(CommandTag::Success, b"abc").unwrap();
        let bytes = command.as_bytes();
        let mut socket = ScriptedSocket::new(vec![
            Step::Interrupted,
            Step::Data(bytes[..10].to_vec()),
            Step::Interrupted,
            Step::Data(bytes[10..].to_vec()),
        ]);

        assert_eq!(drain(&mut socket).unwrap(), vec![command]);
    }

    #[test]
    fn recv_failure_is_reported() {
        let mut socket = ScriptedSocket::new(vec![Step::Fail(io::ErrorKind::ConnectionReset)]);

        let err = receive(&mut socket, "gpu0", default_allocate, |_| {}).unwrap_err();
        match err {
            ReceiveError::Io { label, source } => {
                assert_eq!(label, "gpu0");
                assert_eq!(source.kind(), io::ErrorKind::ConnectionReset);
            }
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn unix_socket_fragmented_writes() {
        let (mut reader, mut writer) = UnixStream::pair().unwrap();
        let mut commands = sample_commands();
        commands.push(Command::new(CommandTag::Success, &vec![3; 3 * LOCAL_BUFFER_SIZE]).unwrap());
        let stream = concat(&commands);

        let handle = thread::spawn(move || {
            for chunk in stream.chunks(1000) {
                writer.write_all(chunk).unwrap();
                thread::sleep(Duration::from_millis(1));
            }
        });

        let mut out = Vec::new();
        while out.len() < commands.len() {
            reader.wait_readable(Duration::from_secs(5)).unwrap();
            receive(&mut reader, "pair", default_allocate, |c| out.push(c)).unwrap();
        }
        handle.join().unwrap();

        assert_eq!(out, commands);
    }
}
