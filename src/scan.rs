//! Row iterator over the responses of a connection.
//!
//! A [`TaskScan`] pulls responses from [`Connection::fetch_next`] and asks its [`ScanDriver`] to
//! unpack rows out of each one. The driver also decides what work is sent: one command per
//! [`ScanDriver::next_chunk`] call, plus an optional terminal command once every chunk has
//! completed.

use log::debug;

use crate::{
    HostError,
    connection::{ActiveCommand, Connection, ScanError},
    protocol::Command,
};

/// Host side of a scan: produces work and decodes rows from responses.
pub trait ScanDriver {
    type Row;

    /// The next unit of work, or `None` when the scan has no more input.
    fn next_chunk(&mut self) -> Result<Option<Command>, HostError>;

    /// Terminal command sent once after every chunk has completed.
    fn final_chunk(&mut self) -> Result<Option<Command>, HostError> {
        Ok(None)
    }

    /// Returns the row at `*index` in `command` and advances the cursor, or `None` once the
    /// response is exhausted.
    fn next_row(&mut self, command: &Command, index: &mut usize) -> Option<Self::Row>;
}

/// Per-scan scheduler state.
#[derive(Debug, Default)]
pub struct ScanState {
    /// The driver has no more chunks.
    pub scan_done: bool,
    /// The terminal command has been sent.
    pub final_done: bool,
    curr_resp: Option<ActiveCommand>,
    curr_index: usize,
}

impl ScanState {
    pub fn new() -> Self {
        Self::default()
    }

    /// The response rows are currently read from.
    pub fn current(&self) -> Option<&ActiveCommand> {
        self.curr_resp.as_ref()
    }
}

pub struct TaskScan<'c, D: ScanDriver> {
    conn: &'c Connection,
    driver: D,
    state: ScanState,
    finished: bool,
}

impl<'c, D: ScanDriver> TaskScan<'c, D> {
    pub fn new(conn: &'c Connection, driver: D) -> Self {
        Self {
            conn,
            driver,
            state: ScanState::new(),
            finished: false,
        }
    }

    pub fn state(&self) -> &ScanState {
        &self.state
    }

    pub fn driver(&self) -> &D {
        &self.driver
    }

    pub fn into_driver(self) -> D {
        self.driver
    }

    /// Returns the next row, or `None` once the scan is exhausted.
    pub fn exec_step(&mut self) -> Result<Option<D::Row>, ScanError> {
        loop {
            if let Some(command) = &self.state.curr_resp {
                if let Some(row) = self.driver.next_row(command, &mut self.state.curr_index) {
                    return Ok(Some(row));
                }
            }
            self.state.curr_resp = None;

            match self.conn.fetch_next(&mut self.state, &mut self.driver)? {
                Some(active) => {
                    self.state.curr_resp = Some(active);
                    self.state.curr_index = 0;
                }
                None => {
                    debug!("[{}] scan exhausted", self.conn.label());
                    return Ok(None);
                }
            }
        }
    }
}

impl<D: ScanDriver> Iterator for TaskScan<'_, D> {
    type Item = Result<D::Row, ScanError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.exec_step() {
            Ok(Some(row)) => Some(Ok(row)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::os::unix::net::UnixStream;

    use crate::{
        connection::{ConnectionOptions, testing::*},
        protocol::CommandTag,
    };

    use super::*;

    /// Chunk `n` carries rows `10n`, `10n + 1` and `10n + 2` as big-endian `u32`s.
    struct RowDriver {
        chunks: u32,
        next: u32,
        with_final: bool,
    }

    impl RowDriver {
        fn new(chunks: u32) -> Self {
            Self {
                chunks,
                next: 0,
                with_final: true,
            }
        }
    }

    impl ScanDriver for RowDriver {
        type Row = u32;

        fn next_chunk(&mut self) -> Result<Option<Command>, HostError> {
            if self.next == self.chunks {
                return Ok(None);
            }
            self.next += 1;
            let payload: Vec<u8> = (0..3)
                .flat_map(|i| (self.next * 10 + i).to_be_bytes())
                .collect();
            Ok(Some(Command::new(CommandTag::ScanExec, &payload)?))
        }

        fn final_chunk(&mut self) -> Result<Option<Command>, HostError> {
            if !self.with_final {
                return Ok(None);
            }
            Ok(Some(Command::new(CommandTag::Final, &999_u32.to_be_bytes())?))
        }

        fn next_row(&mut self, command: &Command, index: &mut usize) -> Option<u32> {
            let start = *index * 4;
            let bytes = command.payload().get(start..start + 4)?;
            *index += 1;
            Some(u32::from_be_bytes(bytes.try_into().ok()?))
        }
    }

    struct FailingDriver;

    impl ScanDriver for FailingDriver {
        type Row = ();

        fn next_chunk(&mut self) -> Result<Option<Command>, HostError> {
            Err("relation is gone".into())
        }

        fn next_row(&mut self, _: &Command, _: &mut usize) -> Option<()> {
            None
        }
    }

    fn connect(max_async_tasks: usize, hold: usize) -> Connection {
        let (client, server) = UnixStream::pair().unwrap();
        spawn_worker(server, hold, echo);
        let options = ConnectionOptions {
            max_async_tasks,
            ..Default::default()
        };
        Connection::from_unix_stream(client, "scan", options).unwrap()
    }

    #[test]
    fn all_rows_in_order() {
        let conn = connect(4, 4);
        let scan = TaskScan::new(&conn, RowDriver::new(6));

        let rows: Vec<u32> = scan.collect::<Result<_, _>>().unwrap();

        let mut expected: Vec<u32> = (1..=6).flat_map(|n| [n * 10, n * 10 + 1, n * 10 + 2]).collect();
        expected.push(999);
        assert_eq!(rows, expected);
        assert_eq!(conn.stats().submitted, 7);
        assert_eq!(conn.stats().active, 0);
    }

    #[test]
    fn empty_scan_without_final() {
        let conn = connect(4, 0);
        let mut driver = RowDriver::new(0);
        driver.with_final = false;
        let mut scan = TaskScan::new(&conn, driver);

        assert_eq!(scan.exec_step().unwrap(), None);
        assert_eq!(scan.exec_step().unwrap(), None);
        assert!(scan.state().scan_done);
        assert!(!scan.state().final_done);
        assert_eq!(conn.stats().submitted, 0);
    }

    #[test]
    fn dropping_scan_releases_current_response() {
        let conn = connect(2, 0);
        let mut scan = TaskScan::new(&conn, RowDriver::new(3));

        assert_eq!(scan.exec_step().unwrap(), Some(10));
        assert!(scan.state().current().is_some());
        assert_eq!(conn.stats().active, 1);

        drop(scan);
        assert_eq!(conn.stats().active, 0);
    }

    #[test]
    fn driver_error_ends_iteration() {
        let conn = connect(2, 0);
        let mut scan = TaskScan::new(&conn, FailingDriver);

        match scan.next() {
            Some(Err(ScanError::Driver(e))) => assert_eq!(e.to_string(), "relation is gone"),
            other => panic!("unexpected {other:?}"),
        }
        assert!(scan.next().is_none());
    }
}
