//! Client side of one worker connection.
//!
//! # Overview
//!
//! A [`Connection`] owns a socket to one worker process. Commands are written on the caller's
//! thread; a background receiver agent reads the responses and queues them. The scan scheduler
//! ([`Connection::fetch_next`]) keeps up to `max_async_tasks` commands in flight and hands the
//! responses back in arrival order.
//!
//! Every command is owned by exactly one place at a time: in flight (`running`), queued by the
//! receiver (`ready`), or handed to the consumer as an [`ActiveCommand`] until it is dropped.
//!
//! # Key Components
//!
//! - [`ConnectionOptions`]: concurrency limit and wait intervals.
//! - [`ShutdownSignal`]: administrative shutdown observed at every wait point.
//! - [`ConnectionStats`]: snapshot of the counters, for logging and tests.
//! - [`ScanError`]: everything that aborts a scan.
//!
//! # See Also
//!
//! - [`crate::scan`] for the row iterator driving the scheduler.
//! - [`receive`](crate::protocol::receive()) for the framing used by the receiver agent.

mod receiver;
mod scheduler;
mod state;

use std::{
    io::{self, Write},
    net::{Shutdown, TcpStream, ToSocketAddrs},
    ops::Deref,
    os::{
        fd::{AsFd, AsRawFd, OwnedFd},
        unix::net::UnixStream,
    },
    path::Path,
    sync::{
        Arc, Mutex, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use log::{debug, info};
use thiserror::Error;

use crate::{
    HostError,
    protocol::{Command, CommandSocket, ProtocolTransport, TransportError, WorkerError},
    session::SessionError,
};

use self::{receiver::Receiver, state::Shared};

#[derive(Debug, Error)]
pub enum ScanError {
    #[error("worker error: {0}")]
    Worker(WorkerError),
    #[error("failed to send command: {0}")]
    Transport(#[from] TransportError),
    #[error("failed to build session: {0}")]
    Session(#[from] SessionError),
    #[error("scan driver failed: {0}")]
    Driver(#[source] HostError),
    #[error("terminating connection due to administrator command")]
    AdminShutdown,
    #[error("worker closed the connection")]
    Disconnected,
    #[error(transparent)]
    Options(#[from] OptionsError),
    #[error("connection IO error: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum OptionsError {
    #[error("max_async_tasks must be at least 1")]
    NoAsyncTasks,
    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),
}

/// Tuning knobs of one connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionOptions {
    /// Upper bound on commands in flight plus responses waiting for pickup.
    pub max_async_tasks: usize,
    /// Longest single wait before the shutdown signal is re-checked.
    pub wait_timeout: Duration,
    /// Pause of the scheduler when it has nothing to submit, pick up or wait for.
    pub threshold_pause: Duration,
    /// Readiness poll interval of the receiver agent.
    pub poll_interval: Duration,
}

impl Default for ConnectionOptions {
    fn default() -> Self {
        Self {
            max_async_tasks: 8,
            wait_timeout: Duration::from_secs(1),
            threshold_pause: Duration::from_millis(20),
            poll_interval: Duration::from_millis(100),
        }
    }
}

impl ConnectionOptions {
    pub fn validate(&self) -> Result<(), OptionsError> {
        if self.max_async_tasks == 0 {
            return Err(OptionsError::NoAsyncTasks);
        }
        if self.wait_timeout.is_zero() {
            return Err(OptionsError::ZeroInterval("wait_timeout"));
        }
        if self.poll_interval.is_zero() {
            return Err(OptionsError::ZeroInterval("poll_interval"));
        }
        Ok(())
    }
}

/// Cloneable flag that aborts the scan at its next wait point.
#[derive(Debug, Clone, Default)]
pub struct ShutdownSignal(Arc<AtomicBool>);

impl ShutdownSignal {
    pub fn trigger(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_triggered(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnectionStats {
    pub running: usize,
    pub ready: usize,
    pub active: usize,
    pub submitted: u64,
    pub completed: u64,
    /// The error slot is set.
    pub failed: bool,
}

/// A response handed to the consumer.
///
/// Dropping it releases the command from the connection's active queue.
#[derive(Debug)]
pub struct ActiveCommand {
    shared: Arc<Shared>,
    id: u64,
    command: Command,
}

impl ActiveCommand {
    fn new(shared: Arc<Shared>, id: u64, command: Command) -> Self {
        Self {
            shared,
            id,
            command,
        }
    }

    pub fn command(&self) -> &Command {
        &self.command
    }
}

impl Deref for ActiveCommand {
    type Target = Command;

    fn deref(&self) -> &Command {
        &self.command
    }
}

impl Drop for ActiveCommand {
    fn drop(&mut self) {
        debug!("[{}] release #{}", self.shared.label, self.id);
        self.shared.release_active(self.id);
    }
}

/// Socket handle kept for shutting the connection down.
#[derive(Debug)]
enum Endpoint {
    Tcp(TcpStream),
    Unix(UnixStream),
    /// Duplicate of a caller-supplied reader's descriptor.
    Socket(OwnedFd),
}

impl Endpoint {
    fn shutdown(&self) {
        let result = match self {
            Endpoint::Tcp(stream) => stream.shutdown(Shutdown::Both),
            Endpoint::Unix(stream) => stream.shutdown(Shutdown::Both),
            Endpoint::Socket(fd) => {
                // SAFETY: `fd` is an open descriptor owned by this endpoint.
                if unsafe { libc::shutdown(fd.as_raw_fd(), libc::SHUT_RDWR) } < 0 {
                    Err(io::Error::last_os_error())
                } else {
                    Ok(())
                }
            }
        };
        if let Err(e) = result {
            debug!("socket shutdown failed: {e}");
        }
    }
}

pub struct Connection {
    shared: Arc<Shared>,
    transport: Mutex<ProtocolTransport<Box<dyn Write + Send>>>,
    endpoint: Endpoint,
    receiver: Receiver,
}

impl Connection {
    pub fn connect_tcp<A: ToSocketAddrs>(
        addr: A,
        options: ConnectionOptions,
    ) -> Result<Self, ScanError> {
        let stream = TcpStream::connect(addr)?;
        stream.set_nodelay(true)?;
        let label = match stream.peer_addr() {
            Ok(addr) => addr.to_string(),
            Err(_) => "tcp".to_string(),
        };
        Self::from_tcp_stream(stream, label, options)
    }

    pub fn connect_unix<P: AsRef<Path>>(
        path: P,
        options: ConnectionOptions,
    ) -> Result<Self, ScanError> {
        let path = path.as_ref();
        let stream = UnixStream::connect(path)?;
        Self::from_unix_stream(stream, path.display().to_string(), options)
    }

    pub fn from_tcp_stream(
        stream: TcpStream,
        label: impl Into<String>,
        options: ConnectionOptions,
    ) -> Result<Self, ScanError> {
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        Self::start(Endpoint::Tcp(stream), reader, Box::new(writer), label.into(), options)
    }

    pub fn from_unix_stream(
        stream: UnixStream,
        label: impl Into<String>,
        options: ConnectionOptions,
    ) -> Result<Self, ScanError> {
        let reader = stream.try_clone()?;
        let writer = stream.try_clone()?;
        Self::start(Endpoint::Unix(stream), reader, Box::new(writer), label.into(), options)
    }

    /// Builds a connection from an already split socket.
    ///
    /// A duplicate of the reader's descriptor is kept so that dropping the connection can shut
    /// the socket down, which also ends a receive blocked in the middle of a command.
    pub fn from_parts<S, W>(
        reader: S,
        writer: W,
        label: impl Into<String>,
        options: ConnectionOptions,
    ) -> Result<Self, ScanError>
    where
        S: CommandSocket + AsFd + Send + 'static,
        W: Write + Send + 'static,
    {
        let endpoint = Endpoint::Socket(reader.as_fd().try_clone_to_owned()?);
        Self::start(endpoint, reader, Box::new(writer), label.into(), options)
    }

    fn start<S>(
        endpoint: Endpoint,
        reader: S,
        writer: Box<dyn Write + Send>,
        label: String,
        options: ConnectionOptions,
    ) -> Result<Self, ScanError>
    where
        S: CommandSocket + Send + 'static,
    {
        options.validate()?;
        let shared = Arc::new(Shared::new(label, options));
        let receiver = Receiver::spawn(Arc::clone(&shared), reader)?;
        info!("[{}] connected to worker", shared.label);

        Ok(Self {
            shared,
            transport: Mutex::new(ProtocolTransport::new(writer)),
            endpoint,
            receiver,
        })
    }

    pub fn label(&self) -> &str {
        &self.shared.label
    }

    pub fn options(&self) -> &ConnectionOptions {
        &self.shared.options
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shared.shutdown.clone()
    }

    pub fn stats(&self) -> ConnectionStats {
        self.shared.stats()
    }

    /// The sticky error, if any.
    pub fn error(&self) -> Option<WorkerError> {
        self.shared.lock().error.clone()
    }

    /// Writes one command to the worker and counts it as running.
    pub fn send_command(&self, command: &Command) -> Result<(), ScanError> {
        self.shared.note_sent()?;
        debug!("[{}] submit {command:?}", self.shared.label);

        let mut transport = self.transport.lock().unwrap_or_else(PoisonError::into_inner);
        if let Err(e) = transport.write_command(command) {
            drop(transport);
            self.shared.note_send_failed(e.to_string());
            return Err(e.into());
        }
        Ok(())
    }

    /// Sends the session command and blocks for its reply.
    pub fn open_session(&self, command: &Command) -> Result<Command, ScanError> {
        self.send_command(command)?;

        let mut state = self.shared.lock();
        loop {
            state.check_error()?;
            if let Some(reply) = state.ready_cmds.pop_front() {
                state.num_ready_cmds -= 1;
                drop(state);
                info!("[{}] session opened: {reply:?}", self.shared.label);
                return Ok(reply);
            }
            if state.disconnected {
                return Err(ScanError::Disconnected);
            }
            state.woken = false;
            state = self.shared.wait(state);
            self.shared.check_shutdown()?;
        }
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shared.close();
        self.endpoint.shutdown();
        self.receiver.join();
        debug!("[{}] connection closed", self.shared.label);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::{
        os::unix::net::UnixStream,
        thread::{self, JoinHandle},
    };

    use crate::protocol::{Command, CommandTag, ProtocolTransport};

    pub type Reply = fn(&Command) -> Option<Command>;

    /// Echoes scan payloads back as `Success`, answers `Final` with `Final`.
    pub fn echo(command: &Command) -> Option<Command> {
        let tag = match command.tag() {
            CommandTag::Final => CommandTag::Final,
            _ => CommandTag::Success,
        };
        Command::new(tag, command.payload()).ok()
    }

    /// Worker side of a socket pair for tests.
    ///
    /// Replies to the first `hold` commands are held back until all of them have arrived.
    /// A `None` reply leaves the command unanswered. Returns the tags seen, once the
    /// connection is closed.
    pub fn spawn_worker(stream: UnixStream, hold: usize, reply: Reply) -> JoinHandle<Vec<CommandTag>> {
        thread::spawn(move || {
            let mut transport = ProtocolTransport::new(stream);
            let mut held = Vec::new();
            let mut seen = Vec::new();

            while let Ok(command) = transport.read_command() {
                seen.push(command.tag());
                held.extend(reply(&command));
                if seen.len() < hold {
                    continue;
                }
                for reply in held.drain(..) {
                    if transport.write_command(&reply).is_err() {
                        return seen;
                    }
                }
            }
            seen
        })
    }
}

#[cfg(test)]
mod tests {
    use std::{os::unix::net::UnixListener, sync::mpsc, thread};

    use tempdir::TempDir;

    use crate::protocol::{CommandTag, errcode};

    use super::{testing::*, *};

    fn worker_error(message: &str) -> WorkerError {
        WorkerError {
            code: 0x42,
            lineno: 120,
            filename: "xpu_scan.cu".into(),
            funcname: "kern_scan".into(),
            message: message.into(),
        }
    }

    fn fail(_: &Command) -> Option<Command> {
        Command::error(&worker_error("out of device memory")).ok()
    }

    #[test]
    fn default_options_are_valid() {
        let options = ConnectionOptions::default();
        assert_eq!(options.max_async_tasks, 8);
        assert_eq!(options.wait_timeout, Duration::from_secs(1));
        assert_eq!(options.validate(), Ok(()));
    }

    #[test]
    fn invalid_options_are_rejected() {
        let options = ConnectionOptions {
            max_async_tasks: 0,
            ..Default::default()
        };
        assert_eq!(options.validate(), Err(OptionsError::NoAsyncTasks));

        let options = ConnectionOptions {
            poll_interval: Duration::ZERO,
            ..Default::default()
        };
        assert_eq!(
            options.validate(),
            Err(OptionsError::ZeroInterval("poll_interval"))
        );

        let (a, _b) = UnixStream::pair().unwrap();
        let result = Connection::from_unix_stream(a, "bad", options);
        assert!(matches!(result, Err(ScanError::Options(_))));
    }

    #[test]
    fn open_session_returns_reply() {
        let (client, server) = UnixStream::pair().unwrap();
        let worker = spawn_worker(server, 0, echo);
        let conn = Connection::from_unix_stream(client, "session", Default::default()).unwrap();

        let command = Command::new(CommandTag::OpenSession, b"session").unwrap();
        let reply = conn.open_session(&command).unwrap();

        assert_eq!(reply.tag(), CommandTag::Success);
        assert_eq!(reply.payload(), b"session");
        assert_eq!(conn.stats().running, 0);
        assert_eq!(conn.stats().ready, 0);

        drop(conn);
        assert_eq!(worker.join().unwrap(), vec![CommandTag::OpenSession]);
    }

    #[test]
    fn open_session_error_reply() {
        let (client, server) = UnixStream::pair().unwrap();
        let _worker = spawn_worker(server, 0, fail);
        let conn = Connection::from_unix_stream(client, "session", Default::default()).unwrap();

        let command = Command::new(CommandTag::OpenSession, b"").unwrap();
        let err = conn.open_session(&command).unwrap_err();

        match err {
            ScanError::Worker(e) => assert_eq!(e, worker_error("out of device memory")),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(conn.stats().failed);
    }

    #[test]
    fn worker_closing_with_running_command() {
        let (client, server) = UnixStream::pair().unwrap();
        let worker = thread::spawn(move || {
            let mut transport = ProtocolTransport::new(server);
            transport.read_command().unwrap();
        });
        let conn = Connection::from_unix_stream(client, "closed", Default::default()).unwrap();

        let command = Command::new(CommandTag::OpenSession, b"").unwrap();
        let err = conn.open_session(&command).unwrap_err();
        worker.join().unwrap();

        match err {
            ScanError::Worker(e) => assert_eq!(e.code, errcode::CONNECTION_CLOSED),
            other => panic!("unexpected error {other:?}"),
        }
    }

    #[test]
    fn shutdown_is_observed_while_waiting() {
        let (client, server) = UnixStream::pair().unwrap();
        let _worker = spawn_worker(server, 0, |_| None);
        let options = ConnectionOptions {
            wait_timeout: Duration::from_millis(20),
            ..Default::default()
        };
        let conn = Connection::from_unix_stream(client, "shutdown", options).unwrap();
        conn.shutdown_signal().trigger();

        let command = Command::new(CommandTag::OpenSession, b"").unwrap();
        let err = conn.open_session(&command).unwrap_err();

        assert!(matches!(err, ScanError::AdminShutdown));
    }

    #[test]
    fn drop_unblocks_stalled_receive() {
        let (client, mut server) = UnixStream::pair().unwrap();
        let reader = client.try_clone().unwrap();
        let conn = Connection::from_parts(reader, client, "stalled", Default::default()).unwrap();

        // a header announcing 64 bytes followed by only part of the payload
        let command = Command::new(CommandTag::Success, &[7; 48]).unwrap();
        server.write_all(&command.as_bytes()[..20]).unwrap();
        thread::sleep(Duration::from_millis(200));

        let (done_tx, done_rx) = mpsc::channel();
        thread::spawn(move || {
            drop(conn);
            done_tx.send(()).unwrap();
        });

        assert!(done_rx.recv_timeout(Duration::from_secs(5)).is_ok());
        drop(server);
    }

    #[test]
    fn connect_unix_socket() {
        let temp = TempDir::new("connection").unwrap();
        let path = temp.path().join("worker.sock");
        let listener = UnixListener::bind(&path).unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            spawn_worker(stream, 0, echo).join().unwrap()
        });

        let conn = Connection::connect_unix(&path, Default::default()).unwrap();
        assert_eq!(conn.label(), path.display().to_string());
        let command = Command::new(CommandTag::OpenSession, b"hello").unwrap();
        assert_eq!(conn.open_session(&command).unwrap().payload(), b"hello");

        drop(conn);
        assert_eq!(server.join().unwrap(), vec![CommandTag::OpenSession]);
    }

    #[test]
    fn connect_tcp_socket() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let server = thread::spawn(move || {
            let (stream, _) = listener.accept().unwrap();
            let mut transport = ProtocolTransport::new(stream);
            let command = transport.read_command().unwrap();
            transport.write_command(&echo(&command).unwrap()).unwrap();
        });

        let conn = Connection::connect_tcp(addr, Default::default()).unwrap();
        let command = Command::new(CommandTag::OpenSession, b"tcp").unwrap();
        assert_eq!(conn.open_session(&command).unwrap().payload(), b"tcp");
        server.join().unwrap();
    }
}
