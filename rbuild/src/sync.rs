//! Client-side orchestration for `rbuild sync`, `rbuild build` and `rbuild pull`.

use std::fs;
use std::io::Write;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::core::decision::{ReconcileDecision, ReconcilePolicy};
use crate::core::types::{JobView, Progress, StartedJob};
use crate::io::client::RemoteClient;
use crate::io::git::Git;
use crate::io::runtime::RuntimePaths;
use crate::io::transfer::{
    ChangeSource, RestoreReport, RetrieveReport, collect_changes, retrieve,
};
use crate::reconcile::{GitEndpoint, reconcile};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Server operations the build cycle needs beyond git.
pub trait BuildServer: GitEndpoint + ChangeSource {
    fn restore_worktree(&self) -> Result<RestoreReport>;
    fn start_job(&self, diff: Vec<u8>, binaries: Vec<(String, Vec<u8>)>) -> Result<StartedJob>;
    fn stream_job(&self, job_id: &str, out: &mut dyn Write) -> Result<u64>;
    fn job_status(&self, job_id: &str) -> Result<JobView>;
    fn job_progress(&self, job_id: &str, offset: u64) -> Result<Progress>;
}

impl BuildServer for RemoteClient {
    fn restore_worktree(&self) -> Result<RestoreReport> {
        RemoteClient::restore_worktree(self)
    }

    fn start_job(&self, diff: Vec<u8>, binaries: Vec<(String, Vec<u8>)>) -> Result<StartedJob> {
        RemoteClient::start_job(self, diff, binaries)
    }

    fn stream_job(&self, job_id: &str, out: &mut dyn Write) -> Result<u64> {
        RemoteClient::stream_job(self, job_id, out)
    }

    fn job_status(&self, job_id: &str) -> Result<JobView> {
        RemoteClient::job_status(self, job_id)
    }

    fn job_progress(&self, job_id: &str, offset: u64) -> Result<Progress> {
        RemoteClient::job_progress(self, job_id, offset)
    }
}

#[derive(Debug, Clone, Default)]
pub struct SyncOptions {
    /// Skip backing up and discarding the mirror's uncommitted changes.
    pub keep_server_changes: bool,
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub restore: Option<RestoreReport>,
    pub decision: ReconcileDecision,
}

#[derive(Debug, Clone)]
pub enum BuildOutcome {
    /// Reconciliation did not end in sync; nothing was sent.
    NotSynced(SyncOutcome),
    Finished { sync: SyncOutcome, job: JobView },
}

/// Clean the mirror (unless told not to), then reconcile both sides.
#[instrument(skip_all, fields(keep_server_changes = options.keep_server_changes))]
pub fn sync<S: BuildServer>(
    local: &Git,
    server: &S,
    policy: &ReconcilePolicy,
    options: &SyncOptions,
) -> Result<SyncOutcome> {
    let restore = if options.keep_server_changes {
        None
    } else {
        let report = server
            .restore_worktree()
            .context("restore server worktree")?;
        if let Some(backup) = &report.backup {
            info!(backup = %backup.display(), "server changes backed up");
        }
        Some(report)
    };
    let decision = reconcile(local, server, policy);
    info!(status = ?decision.status(), "reconcile finished");
    Ok(SyncOutcome { restore, decision })
}

/// Sync, ship the local delta, build, and follow the output into `out`.
#[instrument(skip_all)]
pub fn build<S: BuildServer>(
    local: &Git,
    runtime: &RuntimePaths,
    server: &S,
    policy: &ReconcilePolicy,
    options: &SyncOptions,
    out: &mut dyn Write,
) -> Result<BuildOutcome> {
    let synced = sync(local, server, policy, options)?;
    if !synced.decision.status().is_in_sync() {
        return Ok(BuildOutcome::NotSynced(synced));
    }

    let outgoing = collect_changes(local, runtime)?;
    let mut binaries = Vec::with_capacity(outgoing.manifest.binary_paths.len());
    for rel in &outgoing.manifest.binary_paths {
        let path = local.workdir().join(rel);
        let bytes = fs::read(&path).with_context(|| format!("read {}", path.display()))?;
        binaries.push((rel.clone(), bytes));
    }
    info!(
        plaintext = outgoing.manifest.plaintext_paths.len(),
        binary = binaries.len(),
        diff_bytes = outgoing.diff.len(),
        "sending changes"
    );

    let started = server.start_job(outgoing.diff, binaries)?;
    info!(job_id = %started.job_id, "build job started");
    let job = follow_job(server, &started.job_id, out)?;
    Ok(BuildOutcome::Finished { sync: synced, job })
}

/// Stream a job's output into `out`, then poll until it reaches a terminal state.
///
/// Polling resumes after the bytes already written, even when the live
/// stream broke partway, so nothing is printed twice. If the stream is
/// unavailable, polling alone delivers the output.
pub fn follow_job<S: BuildServer>(server: &S, job_id: &str, out: &mut dyn Write) -> Result<JobView> {
    let mut counted = Counting {
        inner: &mut *out,
        written: 0,
    };
    if let Err(err) = server.stream_job(job_id, &mut counted) {
        warn!(
            job_id,
            streamed = counted.written,
            err = %format!("{err:#}"),
            "live stream unavailable, polling"
        );
    }
    let mut offset = counted.written;
    loop {
        let progress = server.job_progress(job_id, offset)?;
        out.write_all(progress.newtext.as_bytes())
            .context("write build output")?;
        out.flush().context("flush build output")?;
        offset = progress.next_offset;
        if progress.status.is_terminal() {
            return server.job_status(job_id);
        }
        thread::sleep(POLL_INTERVAL);
    }
}

/// Writer that remembers how many bytes went through it.
struct Counting<'a> {
    inner: &'a mut dyn Write,
    written: u64,
}

impl Write for Counting<'_> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

/// Pull the server's uncommitted changes into the local tree.
pub fn pull<S: BuildServer>(local: &Git, runtime: &RuntimePaths, server: &S) -> RetrieveReport {
    retrieve(server, local, runtime)
}
