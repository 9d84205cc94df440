//! Shared deterministic types for the reconcile, transfer and job protocols.
//!
//! These types are the wire contract between client and server. Field names
//! and enum spellings are serialized as-is, so renaming anything here is a
//! protocol change.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Reconciliation-relevant snapshot of one repository.
///
/// Captured fresh for every query and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GitState {
    /// Full commit id of `HEAD`.
    pub head: String,
    /// Checked-out branch, empty when `HEAD` is detached.
    pub current_branch: String,
    /// Local branch names.
    pub branches: BTreeSet<String>,
    pub is_detached: bool,
    /// True if a remote named `origin` is configured.
    pub has_origin: bool,
    /// Uncommitted changes to tracked files, staged or unstaged.
    pub dirty_tracked: bool,
    pub dirty_untracked_count: u32,
}

impl GitState {
    /// True when both snapshots sit on the same branch at the same commit.
    pub fn same_position(&self, other: &GitState) -> bool {
        self.head == other.head && self.current_branch == other.current_branch
    }
}

/// One of the two repositories taking part in a sync.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn other(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Side::Client => "client",
            Side::Server => "server",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Branch/commit pair both sides are driven toward.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Target {
    pub branch: String,
    pub commit: String,
}

/// Commits reachable from one side but not the other (`left...right`).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AheadBehind {
    pub left_ahead: u32,
    pub right_ahead: u32,
}

/// Whitelisted git operations a peer may ask for.
///
/// Every variant carries a fully specified argument set; there is no way to
/// pass free-form arguments through.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum GitAction {
    FetchOrigin,
    CheckoutBranch { branch: String },
    CheckoutBranchAtCommit { branch: String, commit: String },
    FfOnlyToCommit { commit: String },
    HasCommit { commit: String },
    AheadBehind { left: String, right: String },
}

impl GitAction {
    /// Stable action name, as used in action logs.
    pub fn name(&self) -> &'static str {
        match self {
            GitAction::FetchOrigin => "fetch_origin",
            GitAction::CheckoutBranch { .. } => "checkout_branch",
            GitAction::CheckoutBranchAtCommit { .. } => "checkout_branch_at_commit",
            GitAction::FfOnlyToCommit { .. } => "ff_only_to_commit",
            GitAction::HasCommit { .. } => "has_commit",
            GitAction::AheadBehind { .. } => "ahead_behind",
        }
    }

    /// True for actions that change refs or the working tree.
    pub fn is_mutating(&self) -> bool {
        !matches!(
            self,
            GitAction::HasCommit { .. } | GitAction::AheadBehind { .. }
        )
    }

    /// Reject malformed arguments before anything reaches git.
    pub fn validate(&self) -> Result<(), ActionError> {
        match self {
            GitAction::FetchOrigin => Ok(()),
            GitAction::CheckoutBranch { branch } => validate_branch(branch),
            GitAction::CheckoutBranchAtCommit { branch, commit } => {
                validate_branch(branch)?;
                validate_commit(commit)
            }
            GitAction::FfOnlyToCommit { commit } | GitAction::HasCommit { commit } => {
                validate_commit(commit)
            }
            GitAction::AheadBehind { left, right } => {
                validate_commit(left)?;
                validate_commit(right)
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ActionError {
    #[error("invalid commit id '{0}': expected 4-64 hex digits")]
    InvalidCommit(String),
    #[error("invalid branch name '{0}'")]
    InvalidBranch(String),
}

/// Accept abbreviated or full hex object ids only.
pub fn validate_commit(commit: &str) -> Result<(), ActionError> {
    let ok = (4..=64).contains(&commit.len()) && commit.bytes().all(|b| b.is_ascii_hexdigit());
    if ok {
        Ok(())
    } else {
        Err(ActionError::InvalidCommit(commit.to_string()))
    }
}

/// Subset of `git check-ref-format --branch` rules, plus no leading `-`.
pub fn validate_branch(branch: &str) -> Result<(), ActionError> {
    let bad = branch.is_empty()
        || branch.starts_with('-')
        || branch.starts_with('/')
        || branch.ends_with('/')
        || branch.ends_with('.')
        || branch.ends_with(".lock")
        || branch.contains("..")
        || branch.contains("//")
        || branch.contains("@{")
        || branch == "@"
        || branch
            .chars()
            .any(|c| c.is_control() || c.is_whitespace() || "~^:?*[\\".contains(c))
        || branch.split('/').any(|part| part.starts_with('.'));
    if bad {
        Err(ActionError::InvalidBranch(branch.to_string()))
    } else {
        Ok(())
    }
}

/// Captured result of one mutating git invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandResult {
    pub success: bool,
    pub stdout: String,
    pub stderr: String,
    /// Exit code, `None` if the process was killed by a signal.
    pub returncode: Option<i32>,
}

/// Result of executing a [`GitAction`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ActionOutcome {
    Command(CommandResult),
    HasCommit { present: bool },
    AheadBehind(AheadBehind),
}

/// Repository-relative changed paths split by content kind.
///
/// Order follows git's report order.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeManifest {
    pub plaintext_paths: Vec<String>,
    pub binary_paths: Vec<String>,
    /// Tracked paths removed from the working tree.
    pub deleted_paths: Vec<String>,
}

impl ChangeManifest {
    pub fn is_empty(&self) -> bool {
        self.plaintext_paths.is_empty() && self.binary_paths.is_empty()
    }
}

/// Build job lifecycle: `pending` -> `running` -> `done` | `error`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Pending,
    Running,
    Done,
    Error,
}

impl JobStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }
}

/// Response to a job creation request.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartedJob {
    pub job_id: String,
}

/// Point-in-time view of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobView {
    pub job_id: String,
    pub status: JobStatus,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
}

impl JobView {
    /// True once the build finished with a zero exit code.
    pub fn succeeded(&self) -> bool {
        self.status == JobStatus::Done && self.exit_code == Some(0)
    }
}

/// Response to a progress poll.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub job_id: String,
    pub status: JobStatus,
    /// Log text from the requested offset to the current end.
    pub newtext: String,
    /// Full log text read so far.
    pub result: String,
    /// Byte offset to request next.
    pub next_offset: u64,
    pub error: Option<String>,
}

/// JSON body of every non-2xx server response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}
