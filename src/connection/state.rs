use std::{
    collections::VecDeque,
    panic::Location,
    sync::{
        Arc, Condvar, Mutex, MutexGuard, PoisonError,
        atomic::{AtomicBool, Ordering},
    },
};

use log::{debug, error, warn};

use crate::protocol::{Command, CommandTag, WorkerError, errcode};

use super::{ActiveCommand, ConnectionOptions, ConnectionStats, ScanError, ShutdownSignal};

/// Fields shared between the scheduler and the receiver agent.
///
/// Only ever touched with the connection mutex held.
#[derive(Debug, Default)]
pub(crate) struct ConnectionState {
    pub num_running_cmds: usize,
    pub num_ready_cmds: usize,
    pub ready_cmds: VecDeque<Command>,
    pub active_cmds: VecDeque<u64>,
    pub error: Option<WorkerError>,
    /// Wake signal; set by the receiver, cleared by the scheduler before it waits.
    pub woken: bool,
    /// The worker closed its end; nothing more will be received.
    pub disconnected: bool,
    next_active_id: u64,
    submitted: u64,
    completed: u64,
}

impl ConnectionState {
    pub fn check_error(&self) -> Result<(), ScanError> {
        match &self.error {
            Some(error) => Err(ScanError::Worker(error.clone())),
            None => Ok(()),
        }
    }

    fn record_error(&mut self, label: &str, error: WorkerError) {
        if self.error.is_none() {
            error!("[{label}] {error}");
            self.error = Some(error);
        } else {
            debug!("[{label}] error slot already set, dropping: {error}");
        }
    }
}

#[derive(Debug)]
pub(crate) struct Shared {
    pub label: String,
    pub options: ConnectionOptions,
    pub shutdown: ShutdownSignal,
    state: Mutex<ConnectionState>,
    wake: Condvar,
    closing: AtomicBool,
}

impl Shared {
    pub fn new(label: String, options: ConnectionOptions) -> Self {
        Self {
            label,
            options,
            shutdown: ShutdownSignal::default(),
            state: Mutex::new(ConnectionState::default()),
            wake: Condvar::new(),
            closing: AtomicBool::new(false),
        }
    }

    // Critical sections only adjust counters and queues, so a poisoned lock still holds
    // consistent state.
    pub fn lock(&self) -> MutexGuard<'_, ConnectionState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Blocks until the wake signal is set or `wait_timeout` passes.
    pub fn wait<'a>(&self, state: MutexGuard<'a, ConnectionState>) -> MutexGuard<'a, ConnectionState> {
        let (state, _) = self
            .wake
            .wait_timeout_while(state, self.options.wait_timeout, |s| !s.woken)
            .unwrap_or_else(PoisonError::into_inner);
        state
    }

    pub fn check_shutdown(&self) -> Result<(), ScanError> {
        if self.shutdown.is_triggered() {
            error!("[{}] administrative shutdown while waiting for the worker", self.label);
            return Err(ScanError::AdminShutdown);
        }
        Ok(())
    }

    pub fn is_closing(&self) -> bool {
        self.closing.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closing.store(true, Ordering::Release);
    }

    /// Send path bookkeeping; runs before the bytes go out so a fast reply always finds the
    /// command counted as running.
    pub fn note_sent(&self) -> Result<(), ScanError> {
        let mut state = self.lock();
        state.check_error()?;
        if state.disconnected {
            return Err(ScanError::Disconnected);
        }
        state.num_running_cmds += 1;
        state.submitted += 1;
        Ok(())
    }

    #[track_caller]
    pub fn note_send_failed(&self, message: String) {
        let error = WorkerError::local(errcode::IO, "send_command", Location::caller(), message);
        let mut state = self.lock();
        state.num_running_cmds = state.num_running_cmds.saturating_sub(1);
        state.record_error(&self.label, error);
        self.notify(state);
    }

    /// Receiver side of the protocol: moves a finished command from running to ready.
    ///
    /// `Error` replies fill the error slot instead of the ready queue.
    pub fn attach_response(&self, command: Command) {
        let mut state = self.lock();
        if state.num_running_cmds == 0 {
            warn!("[{}] {command:?} arrived with no command running", self.label);
        } else {
            state.num_running_cmds -= 1;
        }
        state.completed += 1;

        match command.tag() {
            CommandTag::Error => {
                let error = WorkerError::from_command(&command).unwrap_or_else(|e| {
                    WorkerError::local(
                        errcode::PROTOCOL,
                        "attach_response",
                        Location::caller(),
                        format!("undecodable error payload: {e}"),
                    )
                });
                state.record_error(&self.label, error);
            }
            _ => {
                debug!("[{}] ready {command:?}", self.label);
                state.ready_cmds.push_back(command);
                state.num_ready_cmds += 1;
            }
        }
        self.notify(state);
    }

    #[track_caller]
    pub fn fail(&self, code: u32, funcname: &str, message: String) {
        let error = WorkerError::local(code, funcname, Location::caller(), message);
        let mut state = self.lock();
        state.record_error(&self.label, error);
        self.notify(state);
    }

    /// The worker closed the stream on a command boundary.
    pub fn peer_closed(&self) {
        let mut state = self.lock();
        state.disconnected = true;
        if state.num_running_cmds > 0 {
            let running = state.num_running_cmds;
            let error = WorkerError::local(
                errcode::CONNECTION_CLOSED,
                "receiver",
                Location::caller(),
                format!("worker closed the connection with {running} commands running"),
            );
            state.record_error(&self.label, error);
        }
        self.notify(state);
    }

    /// Pops the head of the ready queue into the active queue.
    pub fn pickup(self: &Arc<Self>, state: &mut ConnectionState) -> Option<ActiveCommand> {
        let command = state.ready_cmds.pop_front()?;
        state.num_ready_cmds -= 1;
        let id = state.next_active_id;
        state.next_active_id += 1;
        state.active_cmds.push_back(id);
        debug!("[{}] pickup {command:?} (#{id})", self.label);

        Some(ActiveCommand::new(Arc::clone(self), id, command))
    }

    pub fn release_active(&self, id: u64) {
        let mut state = self.lock();
        if let Some(pos) = state.active_cmds.iter().position(|x| *x == id) {
            state.active_cmds.remove(pos);
        }
    }

    pub fn stats(&self) -> ConnectionStats {
        let state = self.lock();
        ConnectionStats {
            running: state.num_running_cmds,
            ready: state.num_ready_cmds,
            active: state.active_cmds.len(),
            submitted: state.submitted,
            completed: state.completed,
            failed: state.error.is_some(),
        }
    }

    fn notify(&self, mut state: MutexGuard<'_, ConnectionState>) {
        state.woken = true;
        drop(state);
        self.wake.notify_all();
    }
}
