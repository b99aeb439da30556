//! Probe utilities.
//!
//! The pieces in this module back the `xpu_probe` binary: argument parsing, a [`SessionHost`]
//! fed from the command line and the process environment, and a [`ScanDriver`] that produces
//! synthetic scan chunks so a worker can be exercised without a database.
use std::{
    env,
    io::{self, Write},
    path::PathBuf,
    time::{Duration, SystemTime, UNIX_EPOCH},
};

use clap::{ArgGroup, Parser};
use log::info;
use thiserror::Error;

use crate::{
    HostError,
    connection::{Connection, ConnectionOptions, ScanError},
    protocol::{Command, CommandTag},
    scan::{ScanDriver, TaskScan},
    session::{
        EncodingInfo, QueryParam, ResolvedParam, SessionError, SessionHost, SessionRequest,
        TypeClass, TypeDesc, build_session_command,
    },
};

const INT8_OID: u32 = 20;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error(transparent)]
    Scan(#[from] ScanError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("worker rejected the session with {0:?}")]
    Rejected(CommandTag),
    #[error("failed to write output: {0}")]
    Output(#[from] io::Error),
}

#[derive(Debug, Parser)]
#[command(version, about = "Open a session on an accelerator worker and run a synthetic scan", long_about = None)]
#[command(group(ArgGroup::new("target").required(true).args(["tcp", "unix"])))]
pub struct ProbeArgs {
    /// Worker address (host:port)
    #[arg(long)]
    pub tcp: Option<String>,
    /// Worker Unix socket path
    #[arg(long)]
    pub unix: Option<PathBuf>,
    /// Commands in flight plus responses waiting for pickup
    #[arg(long, default_value_t = 8)]
    pub max_async_tasks: usize,
    /// Longest wait before the interrupt flag is checked, in milliseconds
    #[arg(long, default_value_t = 1000)]
    pub wait_timeout_ms: u64,
    /// Number of scan chunks to submit
    #[arg(long, default_value_t = 16)]
    pub chunks: u32,
    /// Rows carried by each chunk
    #[arg(long, default_value_t = 4)]
    pub rows_per_chunk: u32,
    #[arg(long, default_value_t = 0)]
    pub extra_bufsz: u32,
    #[arg(long, default_value_t = 0)]
    pub kvars_nslots: u32,
    /// Bind a bigint parameter; repeat for more, ids follow the order given
    #[arg(long = "param", value_name = "INT8", allow_negative_numbers = true)]
    pub params: Vec<i64>,
    /// Do not send the terminal command after the last chunk
    #[arg(long)]
    pub no_final: bool,
}

impl ProbeArgs {
    pub fn options(&self) -> ConnectionOptions {
        ConnectionOptions {
            max_async_tasks: self.max_async_tasks,
            wait_timeout: Duration::from_millis(self.wait_timeout_ms),
            ..Default::default()
        }
    }

    pub fn query_params(&self) -> Vec<QueryParam> {
        (0..self.params.len() as u32)
            .map(|id| QueryParam {
                id,
                type_desc: int8(),
            })
            .collect()
    }

    pub fn connect(&self) -> Result<Connection, ScanError> {
        match (&self.tcp, &self.unix) {
            (Some(addr), _) => Connection::connect_tcp(addr.as_str(), self.options()),
            (None, Some(path)) => Connection::connect_unix(path, self.options()),
            (None, None) => Err(ScanError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "no worker address given",
            ))),
        }
    }

    pub fn driver(&self) -> SyntheticDriver {
        SyntheticDriver::new(self.chunks, self.rows_per_chunk, !self.no_final)
    }
}

fn int8() -> TypeDesc {
    TypeDesc::new(INT8_OID, "bigint", TypeClass::ByValue(8))
}

/// Session host backed by command-line parameters and the process environment.
#[derive(Debug)]
pub struct ProbeHost {
    values: Vec<i64>,
    started: i64,
    timezone: Option<String>,
}

impl ProbeHost {
    pub fn new(values: Vec<i64>) -> Self {
        let started = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros() as i64)
            .unwrap_or_default();
        Self {
            values,
            started,
            timezone: env::var("TZ").ok(),
        }
    }
}

impl SessionHost for ProbeHost {
    fn resolve_parameter(&mut self, param: &QueryParam) -> Result<ResolvedParam, HostError> {
        let value = self
            .values
            .get(param.id as usize)
            .ok_or_else(|| format!("parameter ${} is not bound", param.id + 1))?;
        Ok(ResolvedParam {
            type_desc: int8(),
            value: Some(value.to_be_bytes().to_vec()),
        })
    }

    fn transaction_ids(&self) -> Vec<u32> {
        vec![std::process::id()]
    }

    fn transaction_start(&self) -> i64 {
        self.started
    }

    fn timezone(&self) -> Option<Vec<u8>> {
        self.timezone.as_ref().map(|tz| tz.as_bytes().to_vec())
    }

    fn encoding(&self) -> EncodingInfo {
        EncodingInfo {
            name: "UTF8".into(),
            max_len: 4,
        }
    }
}

/// Produces numbered rows packed as big-endian `u32`s, `rows_per_chunk` per scan command.
#[derive(Debug)]
pub struct SyntheticDriver {
    chunks: u32,
    rows_per_chunk: u32,
    next: u32,
    with_final: bool,
}

impl SyntheticDriver {
    pub fn new(chunks: u32, rows_per_chunk: u32, with_final: bool) -> Self {
        Self {
            chunks,
            rows_per_chunk,
            next: 0,
            with_final,
        }
    }
}

impl ScanDriver for SyntheticDriver {
    type Row = u32;

    fn next_chunk(&mut self) -> Result<Option<Command>, HostError> {
        if self.next == self.chunks {
            return Ok(None);
        }
        let end = (self.next + 1)
            .checked_mul(self.rows_per_chunk)
            .ok_or_else(|| format!("row numbers of chunk {} exceed u32", self.next + 1))?;
        let first = end - self.rows_per_chunk;
        self.next += 1;

        let payload: Vec<u8> = (first..end)
            .flat_map(u32::to_be_bytes)
            .collect();
        Ok(Some(Command::new(CommandTag::ScanExec, &payload)?))
    }

    fn final_chunk(&mut self) -> Result<Option<Command>, HostError> {
        if !self.with_final {
            return Ok(None);
        }
        Ok(Some(Command::new(CommandTag::Final, b"")?))
    }

    fn next_row(&mut self, command: &Command, index: &mut usize) -> Option<u32> {
        let start = *index * 4;
        let bytes: [u8; 4] = command.payload().get(start..start + 4)?.try_into().ok()?;
        *index += 1;
        Some(u32::from_be_bytes(bytes))
    }
}

/// Opens a session on `conn`, runs the synthetic scan and writes one row per line to `out`.
///
/// Returns the number of rows read.
pub fn run_probe<W: Write>(
    args: &ProbeArgs,
    conn: &Connection,
    out: &mut W,
) -> Result<u64, ProbeError> {
    let params = args.query_params();
    let request = SessionRequest {
        nparams: params.len() as u32,
        used_params: &params,
        kcxt_extra_bufsz: args.extra_bufsz,
        kcxt_kvars_nslots: args.kvars_nslots,
        ..Default::default()
    };
    let mut host = ProbeHost::new(args.params.clone());
    let session = build_session_command(&request, &mut host)?;

    let reply = conn.open_session(&session)?;
    if reply.tag() != CommandTag::Success {
        return Err(ProbeError::Rejected(reply.tag()));
    }

    let mut rows = 0;
    for row in TaskScan::new(conn, args.driver()) {
        writeln!(out, "{}", row?)?;
        rows += 1;
    }
    out.flush()?;

    info!("[{}] probe finished: {rows} rows, {:?}", conn.label(), conn.stats());
    Ok(rows)
}
