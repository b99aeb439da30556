pub mod buffer;
pub mod cli;
pub mod connection;
pub mod protocol;
pub mod scan;
pub mod session;

/// Error raised by host-side collaborators ([`session::SessionHost`], [`scan::ScanDriver`]).
pub type HostError = Box<dyn std::error::Error + Send + Sync>;

pub use connection::{
    ActiveCommand, Connection, ConnectionOptions, ConnectionStats, ScanError, ShutdownSignal,
};
pub use protocol::{Command, CommandTag, WorkerError};
pub use scan::{ScanDriver, ScanState, TaskScan};
pub use session::{SessionHost, SessionRequest, build_session_command};
