use std::thread;

use log::{debug, trace};

use crate::scan::{ScanDriver, ScanState};

use super::{ActiveCommand, Connection, ScanError};

impl Connection {
    /// Returns the next response of the scan, submitting new chunks as capacity allows.
    ///
    /// While chunks remain, each round takes the first applicable step:
    ///
    /// 1. raise the sticky error, if any;
    /// 2. submit the next chunk when `running + ready < max_async_tasks` and either nothing is
    ///    ready or fewer than half the slots are running;
    /// 3. pick up the oldest ready response;
    /// 4. wait for the receiver while commands are running;
    /// 5. otherwise pause for `threshold_pause`.
    ///
    /// Once the driver runs out of chunks the remaining responses are drained, the driver's
    /// final chunk (if any) is sent after everything else has completed, and `None` is returned
    /// when nothing is left.
    pub fn fetch_next<D>(
        &self,
        scan: &mut ScanState,
        driver: &mut D,
    ) -> Result<Option<ActiveCommand>, ScanError>
    where
        D: ScanDriver + ?Sized,
    {
        let shared = &self.shared;
        let max_async_tasks = shared.options.max_async_tasks;

        while !scan.scan_done {
            let mut state = shared.lock();
            state.check_error()?;

            if state.num_running_cmds + state.num_ready_cmds < max_async_tasks
                && (state.ready_cmds.is_empty() || state.num_running_cmds < max_async_tasks / 2)
            {
                drop(state);
                match driver.next_chunk().map_err(ScanError::Driver)? {
                    Some(command) => self.send_command(&command)?,
                    None => {
                        debug!("[{}] no more chunks, draining", shared.label);
                        scan.scan_done = true;
                    }
                }
            } else if let Some(active) = shared.pickup(&mut state) {
                return Ok(Some(active));
            } else if state.num_running_cmds > 0 {
                state.woken = false;
                let state = shared.wait(state);
                drop(state);
                shared.check_shutdown()?;
            } else {
                drop(state);
                trace!("[{}] nothing to do, pausing", shared.label);
                thread::sleep(shared.options.threshold_pause);
                shared.check_shutdown()?;
            }
        }

        let mut state = shared.lock();
        state.woken = false;
        loop {
            state.check_error()?;
            if let Some(active) = shared.pickup(&mut state) {
                return Ok(Some(active));
            }

            if state.num_running_cmds == 0 {
                drop(state);
                if scan.final_done {
                    return Ok(None);
                }
                let Some(command) = driver.final_chunk().map_err(ScanError::Driver)? else {
                    return Ok(None);
                };
                self.send_command(&command)?;
                scan.final_done = true;
                debug!("[{}] final chunk submitted", shared.label);
                state = shared.lock();
                continue;
            }

            state = shared.wait(state);
            state.woken = false;
            shared.check_shutdown()?;
        }
    }
}
