use std::{
    io,
    sync::Arc,
    thread::{self, JoinHandle},
};

use log::{debug, warn};

use crate::protocol::{CommandSocket, ReceiveError, default_allocate, errcode, receive};

use super::state::Shared;

/// Background agent that reads worker responses and attaches them to the connection.
#[derive(Debug)]
pub(crate) struct Receiver {
    label: String,
    thread: Option<JoinHandle<()>>,
}

impl Receiver {
    pub fn spawn<S>(shared: Arc<Shared>, socket: S) -> io::Result<Self>
    where
        S: CommandSocket + Send + 'static,
    {
        let label = shared.label.clone();
        let thread = thread::Builder::new()
            .name(format!("xpu-recv-{label}"))
            .spawn(move || run(&shared, socket))?;

        Ok(Self {
            label,
            thread: Some(thread),
        })
    }

    pub fn join(&mut self) {
        if let Some(thread) = self.thread.take() {
            debug!("[{}] shutting down receiver", self.label);
            if thread.join().is_err() {
                warn!("[{}] receiver thread panicked", self.label);
            }
        }
    }
}

fn run<S: CommandSocket>(shared: &Shared, mut socket: S) {
    let label = shared.label.as_str();
    let poll_interval = shared.options.poll_interval;

    while !shared.is_closing() {
        match socket.wait_readable(poll_interval) {
            Ok(false) => continue,
            Ok(true) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                shared.fail(errcode::IO, "receiver", format!("poll failed: {e}"));
                break;
            }
        }

        let result = receive(&mut socket, label, default_allocate, |command| {
            shared.attach_response(command)
        });
        if shared.is_closing() {
            break;
        }

        match result {
            Ok(received) if received.end_of_stream => {
                debug!("[{label}] worker closed the connection");
                shared.peer_closed();
                break;
            }
            Ok(received) => {
                debug!("[{label}] attached {} responses", received.attached);
            }
            Err(e) => {
                let code = match &e {
                    ReceiveError::Protocol { .. } => errcode::PROTOCOL,
                    ReceiveError::Truncated { .. } => errcode::CONNECTION_CLOSED,
                    ReceiveError::OutOfMemory { .. } => errcode::OUT_OF_MEMORY,
                    ReceiveError::Io { .. } => errcode::IO,
                };
                shared.fail(code, "receiver", e.to_string());
                break;
            }
        }
    }

    debug!("[{label}] receiver stopped");
}
