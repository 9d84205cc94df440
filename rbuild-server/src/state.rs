//! Shared application state for the build server.

use std::path::{Path, PathBuf};

use rbuild::io::config::ServerConfig;
use rbuild::io::git::Git;
use rbuild::io::jobs::BuildOrchestrator;
use rbuild::io::runtime::RuntimePaths;

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Root of the mirror repository.
    pub project_dir: PathBuf,
    pub git: Git,
    pub jobs: BuildOrchestrator,
}

impl AppState {
    pub fn new(project_dir: PathBuf, config: &ServerConfig) -> Self {
        Self {
            git: Git::new(&project_dir),
            jobs: BuildOrchestrator::new(&project_dir, config),
            project_dir,
        }
    }

    pub fn project_dir(&self) -> &Path {
        &self.project_dir
    }

    /// Runtime layout (`diffs/`, `logs/`, `backups/`) under the mirror.
    pub fn runtime(&self) -> &RuntimePaths {
        self.jobs.runtime()
    }
}
