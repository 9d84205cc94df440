//! Test-only helpers: scratch git repositories and canned snapshots.

use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{Context, Result, bail};
use tempfile::TempDir;

use crate::core::types::GitState;
use crate::io::git::Git;

/// Create a clean, attached snapshot on `branch` at `head`.
pub fn git_state(head: &str, branch: &str) -> GitState {
    GitState {
        head: head.to_string(),
        current_branch: branch.to_string(),
        branches: [branch.to_string()]
            .into_iter()
            .filter(|b| !b.is_empty())
            .collect::<BTreeSet<_>>(),
        is_detached: false,
        has_origin: true,
        dirty_tracked: false,
        dirty_untracked_count: 0,
    }
}

/// A git repository in a temp directory, deleted on drop.
pub struct TestRepo {
    _temp: TempDir,
    root: PathBuf,
}

impl TestRepo {
    /// Fresh repository on `main` with one commit (`README.md`).
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let root = temp.path().to_path_buf();
        run_git(&root, &["init", "-q", "-b", "main"])?;
        configure_identity(&root)?;
        let repo = Self { _temp: temp, root };
        repo.write("README.md", "seed\n")?;
        repo.commit_all("chore: seed")?;
        Ok(repo)
    }

    /// Bare copy of this repository, usable as a shared `origin`.
    pub fn bare_clone(&self) -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let root = temp.path().to_path_buf();
        let src = self.root.to_string_lossy().to_string();
        let dest = root.to_string_lossy().to_string();
        run_git(&self.root, &["clone", "-q", "--bare", &src, &dest])?;
        Ok(Self { _temp: temp, root })
    }

    /// Working clone of this repository (its `origin` points here).
    pub fn clone_repo(&self) -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let root = temp.path().to_path_buf();
        let src = self.root.to_string_lossy().to_string();
        let dest = root.to_string_lossy().to_string();
        run_git(&self.root, &["clone", "-q", &src, &dest])?;
        configure_identity(&root)?;
        Ok(Self { _temp: temp, root })
    }

    pub fn path(&self) -> &Path {
        &self.root
    }

    pub fn git(&self) -> Git {
        Git::new(&self.root)
    }

    /// Write `contents` to a repository-relative path, creating parents.
    pub fn write(&self, rel: &str, contents: impl AsRef<[u8]>) -> Result<()> {
        let path = self.root.join(rel);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
        }
        fs::write(&path, contents).with_context(|| format!("write {}", path.display()))
    }

    pub fn read(&self, rel: &str) -> Result<Vec<u8>> {
        let path = self.root.join(rel);
        fs::read(&path).with_context(|| format!("read {}", path.display()))
    }

    /// Stage everything and commit; returns the new `HEAD`.
    pub fn commit_all(&self, message: &str) -> Result<String> {
        run_git(&self.root, &["add", "-A"])?;
        if run_git(&self.root, &["diff", "--cached", "--name-only"])?
            .trim()
            .is_empty()
        {
            bail!("nothing to commit for '{message}'");
        }
        run_git(&self.root, &["commit", "-q", "-m", message])?;
        self.head()
    }

    pub fn head(&self) -> Result<String> {
        Ok(run_git(&self.root, &["rev-parse", "HEAD"])?.trim().to_string())
    }

    /// Push the current branch to `origin`.
    pub fn push(&self) -> Result<()> {
        run_git(&self.root, &["push", "-q", "origin", "HEAD"])?;
        Ok(())
    }

    /// Run an arbitrary git command (test setup only).
    pub fn run(&self, args: &[&str]) -> Result<String> {
        run_git(&self.root, args)
    }
}

fn configure_identity(root: &Path) -> Result<()> {
    run_git(root, &["config", "user.name", "rbuild test"])?;
    run_git(root, &["config", "user.email", "rbuild-test@local.invalid"])?;
    run_git(root, &["config", "commit.gpgsign", "false"])?;
    Ok(())
}

fn run_git(root: &Path, args: &[&str]) -> Result<String> {
    let output = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .with_context(|| format!("spawn git {}", args.join(" ")))?;
    if !output.status.success() {
        bail!(
            "git {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).to_string())
}
