use std::{error::Error, io};

use clap::Parser;
use log::warn;
use xpulink::cli::{ProbeArgs, run_probe};

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = ProbeArgs::parse();
    let conn = args.connect()?;

    let shutdown = conn.shutdown_signal();
    ctrlc::set_handler(move || {
        warn!("interrupt received, cancelling scan");
        shutdown.trigger();
    })?;

    let mut stdout = io::stdout().lock();
    let rows = run_probe(&args, &conn, &mut stdout)?;
    eprintln!("{rows} rows, {:?}", conn.stats());

    Ok(())
}
