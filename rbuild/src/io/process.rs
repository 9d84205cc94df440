//! Running the build child process and teeing its output.
//!
//! stdout and stderr are drained concurrently by two reader threads and
//! written, chunk by chunk, into one [`Tee`]: the job log plus an optional
//! live viewer. The combined stream therefore interleaves the two pipes in
//! arrival order.

use std::fs::File;
use std::io::{self, Read, Write};
use std::process::{Command, ExitStatus, Stdio};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use tracing::{debug, error, instrument, warn};
use wait_timeout::ChildExt;

/// Live destination for build output (e.g. an HTTP response body).
pub type Viewer = Box<dyn Write + Send>;

const CHUNK_SIZE: usize = 4096;

/// Finished child process.
#[derive(Debug)]
pub struct StreamOutcome {
    pub status: ExitStatus,
    pub timed_out: bool,
    /// Bytes written to the log.
    pub bytes: u64,
    /// True if the viewer went away before the child finished.
    pub viewer_dropped: bool,
}

/// Fan-out of child output to the log (required) and a viewer (best effort).
struct Tee {
    log: File,
    log_error: Option<io::Error>,
    viewer: Option<Viewer>,
    viewer_dropped: bool,
    bytes: u64,
}

impl Tee {
    fn write_chunk(&mut self, chunk: &[u8]) {
        if self.log_error.is_none() {
            match self.log.write_all(chunk).and_then(|()| self.log.flush()) {
                Ok(()) => self.bytes += chunk.len() as u64,
                Err(e) => {
                    error!(err = %e, "failed to write build log");
                    self.log_error = Some(e);
                }
            }
        }
        if let Some(viewer) = self.viewer.as_mut()
            && let Err(e) = viewer.write_all(chunk).and_then(|()| viewer.flush())
        {
            warn!(err = %e, "live viewer went away, continuing with log only");
            self.viewer = None;
            self.viewer_dropped = true;
        }
    }
}

/// Spawn `cmd`, tee its output into `log` and `viewer`, and wait for it.
///
/// With a `timeout`, an overrunning child is killed and `timed_out` is set.
/// A log write failure is reported as an error after the child has exited;
/// the pipes keep being drained so the child never blocks on them.
#[instrument(skip_all, fields(timeout_secs = timeout.map(|t| t.as_secs()), streaming = viewer.is_some()))]
pub fn run_streaming(
    mut cmd: Command,
    log: File,
    viewer: Option<Viewer>,
    timeout: Option<Duration>,
) -> Result<StreamOutcome> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    debug!("spawning child process");
    let mut child = match cmd.spawn() {
        Ok(c) => c,
        Err(e) => {
            error!(err = %e, "failed to spawn command");
            return Err(e).context("spawn command");
        }
    };

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| anyhow!("stdout was not piped"))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| anyhow!("stderr was not piped"))?;

    let tee = Arc::new(Mutex::new(Tee {
        log,
        log_error: None,
        viewer,
        viewer_dropped: false,
        bytes: 0,
    }));
    let stdout_handle = {
        let tee = Arc::clone(&tee);
        thread::spawn(move || pump(stdout, &tee))
    };
    let stderr_handle = {
        let tee = Arc::clone(&tee);
        thread::spawn(move || pump(stderr, &tee))
    };

    let mut timed_out = false;
    let status = match timeout {
        Some(limit) => match child.wait_timeout(limit).context("wait for command")? {
            Some(status) => status,
            None => {
                warn!(timeout_secs = limit.as_secs(), "command timed out, killing");
                timed_out = true;
                child.kill().context("kill command")?;
                child.wait().context("wait command after kill")?
            }
        },
        None => child.wait().context("wait for command")?,
    };

    join_pump(stdout_handle).context("drain stdout")?;
    join_pump(stderr_handle).context("drain stderr")?;

    let mut tee = tee
        .lock()
        .map_err(|_| anyhow!("output tee lock poisoned"))?;
    if let Some(e) = tee.log_error.take() {
        return Err(e).context("write build log");
    }
    // Close the viewer now so the remote end sees EOF.
    tee.viewer = None;

    debug!(exit_code = ?status.code(), timed_out, bytes = tee.bytes, "command finished");
    Ok(StreamOutcome {
        status,
        timed_out,
        bytes: tee.bytes,
        viewer_dropped: tee.viewer_dropped,
    })
}

fn pump<R: Read>(mut reader: R, tee: &Mutex<Tee>) -> Result<()> {
    let mut chunk = [0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            return Ok(());
        }
        let mut tee = tee
            .lock()
            .map_err(|_| anyhow!("output tee lock poisoned"))?;
        tee.write_chunk(&chunk[..n]);
    }
}

fn join_pump(handle: thread::JoinHandle<Result<()>>) -> Result<()> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("output reader thread panicked")),
    }
}
