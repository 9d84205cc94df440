//! Build jobs: the registry and the orchestrator that runs them.
//!
//! At most one job is pending or running at a time. Each job owns an
//! append-only log written by its build thread; progress queries read the
//! same file through their own handles.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use thiserror::Error;
use tracing::{error, info, warn};

use crate::core::path::PathError;
use crate::core::types::{JobStatus, JobView, Progress, StartedJob};
use crate::io::config::{BuildConfig, ServerConfig};
use crate::io::git::Git;
use crate::io::live::{LiveSlot, LiveStreams};
use crate::io::process::{Viewer, run_streaming};
use crate::io::runtime::RuntimePaths;
use crate::io::transfer::{IncomingFile, ResolvedFile, receive_changes, resolve_files};

#[derive(Debug, Error)]
pub enum JobError {
    #[error("busy: job {active} is still running")]
    Busy { active: String },
    #[error("unknown job {0}")]
    NotFound(String),
    #[error(transparent)]
    InvalidPath(#[from] PathError),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

/// One build execution.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub log_path: PathBuf,
    /// Log bytes read so far by progress queries.
    pub accumulated: Vec<u8>,
}

impl Job {
    fn new(id: &str, log_path: PathBuf) -> Self {
        Self {
            id: id.to_string(),
            status: JobStatus::Pending,
            error: None,
            exit_code: None,
            log_path,
            accumulated: Vec::new(),
        }
    }

    pub fn view(&self) -> JobView {
        JobView {
            job_id: self.id.clone(),
            status: self.status,
            error: self.error.clone(),
            exit_code: self.exit_code,
        }
    }

    fn fail(&mut self, message: String) {
        self.status = JobStatus::Error;
        self.error = Some(message);
    }

    /// Append whatever the log gained since the last call.
    fn catch_up(&mut self) -> Result<()> {
        let mut file = match File::open(&self.log_path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => {
                return Err(e).with_context(|| format!("open {}", self.log_path.display()));
            }
        };
        file.seek(SeekFrom::Start(self.accumulated.len() as u64))
            .with_context(|| format!("seek {}", self.log_path.display()))?;
        file.read_to_end(&mut self.accumulated)
            .with_context(|| format!("read {}", self.log_path.display()))?;
        Ok(())
    }

    /// Increment from `offset`; a pure function of the bytes accumulated so far.
    fn progress(&self, offset: u64) -> Progress {
        let len = self.accumulated.len();
        let start = usize::try_from(offset).map_or(len, |o| o.min(len));
        Progress {
            job_id: self.id.clone(),
            status: self.status,
            newtext: String::from_utf8_lossy(&self.accumulated[start..]).to_string(),
            result: String::from_utf8_lossy(&self.accumulated).to_string(),
            next_offset: len as u64,
            error: self.error.clone(),
        }
    }
}

/// Registry of jobs behind one lock.
#[derive(Debug, Default)]
pub struct JobStore {
    jobs: Mutex<HashMap<String, Job>>,
}

impl JobStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reserve a new pending job, refusing while another one is active.
    pub fn create(&self, id: &str, log_path: PathBuf) -> Result<(), JobError> {
        let mut jobs = self.lock();
        if let Some(active) = jobs.values().find(|job| !job.status.is_terminal()) {
            return Err(JobError::Busy {
                active: active.id.clone(),
            });
        }
        jobs.insert(id.to_string(), Job::new(id, log_path));
        Ok(())
    }

    /// Id of the pending or running job, if any.
    pub fn active(&self) -> Option<String> {
        self.lock()
            .values()
            .find(|job| !job.status.is_terminal())
            .map(|job| job.id.clone())
    }

    pub fn get(&self, id: &str) -> Result<Job, JobError> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| JobError::NotFound(id.to_string()))
    }

    /// Run `f` on the job while holding the registry lock.
    pub fn update<R>(&self, id: &str, f: impl FnOnce(&mut Job) -> R) -> Result<R, JobError> {
        let mut jobs = self.lock();
        let job = jobs
            .get_mut(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        Ok(f(job))
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Job>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Creates jobs, runs each build on its own thread, and answers queries.
#[derive(Clone)]
pub struct BuildOrchestrator {
    git: Git,
    runtime: RuntimePaths,
    build: BuildConfig,
    attach_timeout: Duration,
    store: Arc<JobStore>,
    streams: LiveStreams,
    /// Held while anything changes the mirror's files or refs.
    mirror: Arc<Mutex<()>>,
}

impl BuildOrchestrator {
    pub fn new(project_root: &Path, config: &ServerConfig) -> Self {
        Self {
            git: Git::new(project_root),
            runtime: RuntimePaths::new(project_root, &config.runtime_dir),
            build: config.build.clone(),
            attach_timeout: config.stream_attach_timeout(),
            store: Arc::new(JobStore::new()),
            streams: LiveStreams::new(),
            mirror: Arc::new(Mutex::new(())),
        }
    }

    pub fn streams(&self) -> &LiveStreams {
        &self.streams
    }

    pub fn runtime(&self) -> &RuntimePaths {
        &self.runtime
    }

    /// Validate the upload, reserve a job, apply the changes and start the build.
    ///
    /// Paths are checked before anything is written. A failure after the job
    /// is reserved leaves it in `error`.
    pub fn start(&self, diff: Vec<u8>, files: Vec<IncomingFile>) -> Result<StartedJob, JobError> {
        let _mirror = self.lock_mirror();
        let files = resolve_files(self.git.workdir(), files)?;
        let job_id = uuid::Uuid::new_v4().to_string();
        self.store.create(&job_id, self.runtime.log_path(&job_id))?;
        info!(job_id, binaries = files.len(), "job created");

        match self.prepare(&job_id, &diff, &files) {
            Ok((log, command, slot)) => {
                let ctx = BuildContext {
                    job_id: job_id.clone(),
                    log_path: self.runtime.log_path(&job_id),
                    timeout: self.build.timeout(),
                    attach_timeout: self.attach_timeout,
                    store: Arc::clone(&self.store),
                };
                let spawned = thread::Builder::new()
                    .name(format!("build-{job_id}"))
                    .spawn(move || ctx.run(command, log, slot));
                if let Err(e) = spawned {
                    let err = anyhow!(e).context("spawn build thread");
                    self.mark_failed(&job_id, &err);
                    return Err(err.into());
                }
                Ok(StartedJob { job_id })
            }
            Err(err) => {
                self.mark_failed(&job_id, &err);
                Err(err.into())
            }
        }
    }

    /// Run `f` against the mirror while no build is pending or running.
    ///
    /// Job creation waits for `f` to finish, and `f` is refused with
    /// [`JobError::Busy`] once a job exists.
    pub fn with_idle_mirror<R>(&self, f: impl FnOnce(&Git) -> R) -> Result<R, JobError> {
        let _mirror = self.lock_mirror();
        self.ensure_idle()?;
        Ok(f(&self.git))
    }

    /// Fail with [`JobError::Busy`] while a build is pending or running.
    pub fn ensure_idle(&self) -> Result<(), JobError> {
        match self.store.active() {
            Some(active) => Err(JobError::Busy { active }),
            None => Ok(()),
        }
    }

    pub fn status(&self, job_id: &str) -> Result<JobView, JobError> {
        Ok(self.store.get(job_id)?.view())
    }

    /// Catch up on the log and return everything from `offset` on.
    pub fn progress(&self, job_id: &str, offset: u64) -> Result<Progress, JobError> {
        self.store
            .update(job_id, |job| job.catch_up().map(|()| job.progress(offset)))?
            .map_err(JobError::from)
    }

    fn prepare(
        &self,
        job_id: &str,
        diff: &[u8],
        files: &[ResolvedFile],
    ) -> Result<(File, Command, LiveSlot)> {
        receive_changes(&self.git, &self.runtime, job_id, diff, files)?;
        let argv = self.build.resolved_command(self.git.workdir())?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("build command is empty"))?;
        let mut command = Command::new(program);
        command.args(args).current_dir(self.git.workdir());
        let log_path = self.runtime.log_path(job_id);
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .with_context(|| format!("open {}", log_path.display()))?;
        Ok((log, command, self.streams.register(job_id)))
    }

    fn lock_mirror(&self) -> MutexGuard<'_, ()> {
        self.mirror.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn mark_failed(&self, job_id: &str, err: &anyhow::Error) {
        error!(job_id, err = %format!("{err:#}"), "job failed before build");
        let message = format!("{err:#}");
        if let Err(e) = self.store.update(job_id, |job| job.fail(message)) {
            warn!(job_id, err = %e, "cannot record job failure");
        }
    }
}

/// Everything the build thread needs, detached from the orchestrator.
struct BuildContext {
    job_id: String,
    log_path: PathBuf,
    timeout: Option<Duration>,
    attach_timeout: Duration,
    store: Arc<JobStore>,
}

impl BuildContext {
    fn run(self, command: Command, log: File, slot: LiveSlot) {
        let viewer: Option<Viewer> = slot.wait(self.attach_timeout);
        self.set(|job| job.status = JobStatus::Running);
        info!(job_id = %self.job_id, command = ?command, "build running");

        match run_streaming(command, log, viewer, self.timeout) {
            Ok(outcome) if outcome.timed_out => {
                let secs = self.timeout.map(|t| t.as_secs()).unwrap_or_default();
                let message = format!("build timed out after {secs}s");
                warn!(job_id = %self.job_id, "{message}");
                append_line(&self.log_path, &format!("rbuild: {message}"));
                self.set(|job| job.fail(message));
            }
            Ok(outcome) => {
                let code = outcome.status.code();
                info!(job_id = %self.job_id, exit_code = ?code, "build finished");
                self.set(|job| {
                    job.status = JobStatus::Done;
                    job.exit_code = code;
                });
            }
            Err(err) => {
                let message = format!("{err:#}");
                error!(job_id = %self.job_id, err = %message, "build failed");
                append_line(&self.log_path, &format!("rbuild: {message}"));
                self.set(|job| job.fail(message));
            }
        }
    }

    fn set(&self, f: impl FnOnce(&mut Job)) {
        if let Err(e) = self.store.update(&self.job_id, f) {
            warn!(job_id = %self.job_id, err = %e, "job vanished from store");
        }
    }
}

fn append_line(path: &Path, line: &str) {
    let written = OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .and_then(|mut f| writeln!(f, "{line}"));
    if let Err(e) = written {
        warn!(path = %path.display(), err = %e, "cannot append to build log");
    }
}
