//! Git adapter for snapshots, whitelisted actions and change listing.
//!
//! Every invocation is an argument vector scoped to an explicit working
//! directory; nothing is ever routed through a shell.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

use crate::core::types::{ActionOutcome, AheadBehind, CommandResult, GitAction, GitState};

/// Parsed `git status --porcelain` entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusEntry {
    /// 2-letter XY code, or "??" for untracked.
    pub code: String,
    /// Path for the changed file.
    pub path: String,
}

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Absolute path of the repository's top-level directory.
    pub fn toplevel(&self) -> Result<PathBuf> {
        let out = self.run_capture(&["rev-parse", "--show-toplevel"])?;
        Ok(PathBuf::from(out.trim()))
    }

    /// Capture the reconciliation-relevant state without touching the repository.
    ///
    /// Fails if `HEAD` does not resolve to a commit (e.g. no commits yet).
    #[instrument(skip_all, fields(workdir = %self.workdir.display()))]
    pub fn snapshot(&self) -> Result<GitState> {
        let head = self
            .run_capture(&["rev-parse", "--verify", "HEAD^{commit}"])
            .context("resolve HEAD")?
            .trim()
            .to_string();

        let symbolic = self.run(&["symbolic-ref", "--quiet", "--short", "HEAD"])?;
        let (current_branch, is_detached) = if symbolic.status.success() {
            (
                String::from_utf8_lossy(&symbolic.stdout).trim().to_string(),
                false,
            )
        } else {
            warn!("detached HEAD detected");
            (String::new(), true)
        };

        let branches: BTreeSet<String> = self
            .run_capture(&["for-each-ref", "--format=%(refname:short)", "refs/heads/"])?
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect();

        let has_origin = self
            .run_capture(&["remote"])?
            .lines()
            .any(|line| line.trim() == "origin");

        let entries = self.status_porcelain()?;
        let dirty_untracked_count = entries.iter().filter(|e| e.code == "??").count() as u32;
        let dirty_tracked = entries.iter().any(|e| e.code != "??");

        let state = GitState {
            head,
            current_branch,
            branches,
            is_detached,
            has_origin,
            dirty_tracked,
            dirty_untracked_count,
        };
        debug!(head = %state.head, branch = %state.current_branch, dirty = state.dirty_tracked, "snapshot");
        Ok(state)
    }

    /// Run one whitelisted action after validating its arguments.
    #[instrument(skip_all, fields(action = action.name()))]
    pub fn execute(&self, action: &GitAction) -> Result<ActionOutcome> {
        action.validate()?;
        let outcome = match action {
            GitAction::FetchOrigin => ActionOutcome::Command(self.fetch_origin()?),
            GitAction::CheckoutBranch { branch } => {
                ActionOutcome::Command(self.checkout_branch(branch)?)
            }
            GitAction::CheckoutBranchAtCommit { branch, commit } => {
                ActionOutcome::Command(self.checkout_branch_at_commit(branch, commit)?)
            }
            GitAction::FfOnlyToCommit { commit } => {
                ActionOutcome::Command(self.ff_only_to_commit(commit)?)
            }
            GitAction::HasCommit { commit } => ActionOutcome::HasCommit {
                present: self.has_commit(commit)?,
            },
            GitAction::AheadBehind { left, right } => {
                ActionOutcome::AheadBehind(self.ahead_behind(left, right)?)
            }
        };
        Ok(outcome)
    }

    pub fn fetch_origin(&self) -> Result<CommandResult> {
        self.run_result(&["fetch", "origin"])
    }

    /// Checkout an existing branch.
    pub fn checkout_branch(&self, branch: &str) -> Result<CommandResult> {
        debug!(branch, "checking out branch");
        self.run_result(&["checkout", branch, "--"])
    }

    /// Create (or reset) `branch` at `commit` and check it out.
    pub fn checkout_branch_at_commit(&self, branch: &str, commit: &str) -> Result<CommandResult> {
        debug!(branch, commit, "checking out branch at commit");
        self.run_result(&["checkout", "-B", branch, commit, "--"])
    }

    /// Fast-forward the current branch to `commit`; refuses anything else.
    pub fn ff_only_to_commit(&self, commit: &str) -> Result<CommandResult> {
        debug!(commit, "fast-forwarding");
        self.run_result(&["merge", "--ff-only", commit])
    }

    /// True if `commit` resolves to a commit object locally.
    pub fn has_commit(&self, commit: &str) -> Result<bool> {
        let object = format!("{commit}^{{commit}}");
        let out = self.run(&["cat-file", "-e", &object])?;
        Ok(out.status.success())
    }

    /// Count commits reachable only from `left` and only from `right`.
    pub fn ahead_behind(&self, left: &str, right: &str) -> Result<AheadBehind> {
        let range = format!("{left}...{right}");
        let out = self.run_capture(&["rev-list", "--left-right", "--count", &range])?;
        parse_ahead_behind(&out)
    }

    /// Get status entries (including untracked) in porcelain format.
    pub fn status_porcelain(&self) -> Result<Vec<StatusEntry>> {
        let out = self.run_capture(&["status", "--porcelain=v1", "-uall"])?;
        let mut entries = Vec::new();
        for line in out.lines() {
            if line.trim().is_empty() {
                continue;
            }
            entries.push(parse_status_line(line)?);
        }
        Ok(entries)
    }

    /// Tracked paths that differ from `HEAD` (staged or not), in git's order.
    pub fn changed_tracked_paths(&self) -> Result<Vec<String>> {
        let out = self.run_checked(&["diff", "HEAD", "--no-renames", "--name-only", "-z"])?;
        Ok(split_nul(&out.stdout))
    }

    /// Untracked files that are not ignored.
    pub fn untracked_paths(&self) -> Result<Vec<String>> {
        let out = self.run_checked(&["ls-files", "--others", "--exclude-standard", "-z"])?;
        Ok(split_nul(&out.stdout))
    }

    /// Unified diff of tracked `paths` against `HEAD`. Empty `paths` yields an empty diff.
    pub fn diff_tracked(&self, paths: &[String]) -> Result<Vec<u8>> {
        if paths.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["diff", "HEAD", "--no-renames", "--"];
        args.extend(paths.iter().map(String::as_str));
        Ok(self.run_checked(&args)?.stdout)
    }

    /// Diff that creates the untracked file `path` from nothing.
    pub fn diff_new_file(&self, path: &str) -> Result<Vec<u8>> {
        let args = ["diff", "--no-index", "--", "/dev/null", path];
        let output = self.run(&args)?;
        // `--no-index` exits 1 when the inputs differ, which they always do here.
        match output.status.code() {
            Some(0) | Some(1) => Ok(output.stdout),
            _ => Err(anyhow!(
                "git {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        }
    }

    /// Contents of `path` as committed at `HEAD`.
    pub fn head_blob(&self, path: &str) -> Result<Vec<u8>> {
        let spec = format!("HEAD:{path}");
        Ok(self.run_checked(&["cat-file", "blob", &spec])?.stdout)
    }

    /// Full tracked delta against `HEAD`, binary hunks included.
    pub fn diff_head_binary(&self) -> Result<Vec<u8>> {
        Ok(self.run_checked(&["diff", "HEAD", "--binary"])?.stdout)
    }

    /// Apply a patch file to the working tree.
    #[instrument(skip_all, fields(patch = %patch.display()))]
    pub fn apply_patch(&self, patch: &Path) -> Result<()> {
        let patch = patch.to_string_lossy();
        self.run_checked(&["apply", "--whitespace=nowarn", patch.as_ref()])?;
        Ok(())
    }

    /// Dry-run a patch: fail if it would not apply cleanly. Touches nothing.
    pub fn check_patch(&self, patch: &Path) -> Result<()> {
        let patch = patch.to_string_lossy();
        self.run_checked(&["apply", "--check", "--whitespace=nowarn", patch.as_ref()])?;
        Ok(())
    }

    /// Restore tracked files and the index to `HEAD`. The branch pointer does not move.
    pub fn restore_tracked_to_head(&self) -> Result<()> {
        self.run_checked(&["reset", "--hard", "--quiet", "HEAD"])?;
        Ok(())
    }

    fn run_result(&self, args: &[&str]) -> Result<CommandResult> {
        let output = self.run(args)?;
        let result = CommandResult {
            success: output.status.success(),
            stdout: String::from_utf8_lossy(&output.stdout).to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).to_string(),
            returncode: output.status.code(),
        };
        if !result.success {
            warn!(args = %args.join(" "), stderr = %result.stderr.trim(), "git action failed");
        }
        Ok(result)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        debug!(args = %args.join(" "), "git");
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

fn parse_status_line(line: &str) -> Result<StatusEntry> {
    if let Some(path) = line.strip_prefix("?? ") {
        return Ok(StatusEntry {
            code: "??".to_string(),
            path: path.trim().to_string(),
        });
    }
    if line.len() < 4 {
        return Err(anyhow!("unexpected porcelain line: '{line}'"));
    }
    let code = line[..2].to_string();
    let mut path = line[3..].trim().to_string();
    if let Some((_, new)) = path.split_once("->") {
        path = new.trim().to_string();
    }
    Ok(StatusEntry { code, path })
}

fn parse_ahead_behind(out: &str) -> Result<AheadBehind> {
    let mut counts = out.split_whitespace().map(str::parse::<u32>);
    match (counts.next(), counts.next()) {
        (Some(Ok(left_ahead)), Some(Ok(right_ahead))) => Ok(AheadBehind {
            left_ahead,
            right_ahead,
        }),
        _ => Err(anyhow!("unexpected rev-list count output: '{}'", out.trim())),
    }
}

fn split_nul(stdout: &[u8]) -> Vec<String> {
    stdout
        .split(|b| *b == 0)
        .filter(|part| !part.is_empty())
        .map(|part| String::from_utf8_lossy(part).to_string())
        .collect()
}
