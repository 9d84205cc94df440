//! Layout of the non-versioned runtime directory (default `.rbuild/`).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

/// All canonical paths within the runtime directory for a project root.
#[derive(Debug, Clone)]
pub struct RuntimePaths {
    pub root: PathBuf,
    pub runtime_dir: PathBuf,
    /// Diffs received from the client, one per job.
    pub diffs_dir: PathBuf,
    /// Append-only build logs.
    pub logs_dir: PathBuf,
    /// Mirror changes discarded by a worktree restore.
    pub backups_dir: PathBuf,
    /// Repository-relative POSIX prefix used to exclude the directory from listings.
    pub rel_prefix: String,
}

impl RuntimePaths {
    pub fn new(root: impl Into<PathBuf>, runtime_dir: &str) -> Self {
        let root = root.into();
        let rel = runtime_dir.trim().trim_matches('/').replace('\\', "/");
        let dir = root.join(&rel);
        Self {
            root,
            diffs_dir: dir.join("diffs"),
            logs_dir: dir.join("logs"),
            backups_dir: dir.join("backups"),
            runtime_dir: dir,
            rel_prefix: format!("{rel}/"),
        }
    }

    pub fn diff_path(&self, job_id: &str) -> PathBuf {
        self.diffs_dir.join(format!("gitdiff-{job_id}.diff"))
    }

    pub fn log_path(&self, job_id: &str) -> PathBuf {
        self.logs_dir.join(format!("buildlog-{job_id}.txt"))
    }

    /// Directory holding one worktree backup.
    pub fn backup_dir(&self, stamp: &str) -> PathBuf {
        self.backups_dir.join(format!("worktree-{stamp}"))
    }

    /// Create the runtime subdirectories if they do not exist yet.
    pub fn ensure(&self) -> Result<()> {
        for dir in [&self.diffs_dir, &self.logs_dir, &self.backups_dir] {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }

    /// True if the repository-relative `path` lives inside the runtime directory.
    pub fn contains_rel(&self, path: &str) -> bool {
        path.starts_with(&self.rel_prefix) || path == self.rel_prefix.trim_end_matches('/')
    }

    pub fn project_root(&self) -> &Path {
        &self.root
    }
}
