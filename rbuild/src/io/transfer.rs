//! Moving working-tree deltas between the client and the server mirror.
//!
//! Plaintext changes travel as one unified diff; binary files travel as raw
//! bytes keyed by their repository-relative path. The same listing rules
//! apply on both sides so `send` and `retrieve` are symmetric.

use std::collections::{BTreeSet, HashSet};
use std::fs::{self, File};
use std::io::{ErrorKind, Read};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::core::classifier::{looks_binary, partition_paths};
use crate::core::path::{self, PathError};
use crate::core::types::ChangeManifest;
use crate::io::git::Git;
use crate::io::runtime::RuntimePaths;

const SNIFF_BYTES: u64 = 8000;

/// Everything one side has to ship: the manifest and the plaintext diff.
#[derive(Debug, Clone, Default)]
pub struct Outgoing {
    pub manifest: ChangeManifest,
    pub diff: Vec<u8>,
}

/// A binary file received from the other side, before sanitization.
#[derive(Debug, Clone)]
pub struct IncomingFile {
    pub path: String,
    pub bytes: Vec<u8>,
}

/// An [`IncomingFile`] whose path has been confined to the project root.
#[derive(Debug, Clone)]
pub struct ResolvedFile {
    pub rel: String,
    pub dest: PathBuf,
    pub bytes: Vec<u8>,
}

/// Remote side of a retrieve.
pub trait ChangeSource {
    fn fetch_diff(&self) -> Result<Vec<u8>>;
    fn list_binaries(&self) -> Result<Vec<String>>;
    fn fetch_file(&self, path: &str) -> Result<Vec<u8>>;
}

/// One step of a retrieve that did not succeed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveFailure {
    /// `gitdiff`, `binaries`, or a repository-relative file path.
    pub item: String,
    pub error: String,
}

/// Outcome of pulling the server's changes into the local tree.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RetrieveReport {
    pub diff_applied: bool,
    pub files_written: Vec<String>,
    pub failures: Vec<RetrieveFailure>,
}

impl RetrieveReport {
    pub fn success(&self) -> bool {
        self.failures.is_empty()
    }

    fn fail(&mut self, item: &str, err: &anyhow::Error) {
        warn!(item, err = %format!("{err:#}"), "retrieve step failed");
        self.failures.push(RetrieveFailure {
            item: item.to_string(),
            error: format!("{err:#}"),
        });
    }
}

/// What a worktree restore saved before discarding changes.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RestoreReport {
    /// Backup directory, absent when there was nothing to discard.
    pub backup: Option<PathBuf>,
    pub restored_tracked: bool,
    pub removed_untracked: Vec<String>,
}

/// List and classify every changed path, in git's report order.
///
/// `.gitignore` files and the runtime directory are never listed. Deleted
/// binaries are reported in `deleted_paths` only.
#[instrument(skip_all, fields(root = %git.workdir().display()))]
pub fn changed_manifest(git: &Git, runtime: &RuntimePaths) -> Result<ChangeManifest> {
    let root = git.workdir().to_path_buf();
    let tracked = git.changed_tracked_paths()?;
    let untracked = git.untracked_paths()?;

    let mut seen = BTreeSet::new();
    let candidates: Vec<String> = tracked
        .into_iter()
        .chain(untracked)
        .filter(|p| !is_excluded(p, runtime))
        .filter(|p| seen.insert(p.clone()))
        .collect();

    let deleted_paths: Vec<String> = candidates
        .iter()
        .filter(|p| fs::symlink_metadata(root.join(p.as_str())).is_err())
        .cloned()
        .collect();
    let deleted: HashSet<&str> = deleted_paths.iter().map(String::as_str).collect();

    let (plaintext_paths, binary) = partition_paths(&candidates, |p| {
        if deleted.contains(p) {
            head_blob_is_binary(git, p)
        } else {
            file_is_binary(&root.join(p))
        }
    });

    let mut binary_paths = Vec::with_capacity(binary.len());
    for p in binary {
        if deleted.contains(p.as_str()) {
            warn!(path = %p, "binary deletion is not transferred");
        } else {
            binary_paths.push(p);
        }
    }

    debug!(
        plaintext = plaintext_paths.len(),
        binary = binary_paths.len(),
        deleted = deleted_paths.len(),
        "classified changes"
    );
    Ok(ChangeManifest {
        plaintext_paths,
        binary_paths,
        deleted_paths,
    })
}

/// Manifest plus one unified diff over its plaintext paths.
///
/// Tracked paths diff against `HEAD`; untracked ones diff against `/dev/null`.
pub fn collect_changes(git: &Git, runtime: &RuntimePaths) -> Result<Outgoing> {
    let manifest = changed_manifest(git, runtime)?;
    let untracked: HashSet<String> = git.untracked_paths()?.into_iter().collect();

    let (new_files, tracked): (Vec<String>, Vec<String>) = manifest
        .plaintext_paths
        .iter()
        .cloned()
        .partition(|p| untracked.contains(p));

    let mut diff = git.diff_tracked(&tracked).context("diff tracked changes")?;
    for p in &new_files {
        let patch = git
            .diff_new_file(p)
            .with_context(|| format!("diff untracked {p}"))?;
        diff.extend_from_slice(&patch);
    }
    Ok(Outgoing { manifest, diff })
}

/// Confine every incoming path to `root`. Nothing is written on failure.
pub fn resolve_files(root: &Path, files: Vec<IncomingFile>) -> Result<Vec<ResolvedFile>, PathError> {
    files
        .into_iter()
        .map(|file| {
            let dest = resolve_on_disk(root, &file.path)?;
            Ok(ResolvedFile {
                rel: path::to_posix(&file.path),
                dest,
                bytes: file.bytes,
            })
        })
        .collect()
}

/// [`path::resolve`] plus a filesystem check: no existing component below
/// `root` may be a symlink, so reads and writes stay inside the tree.
pub fn resolve_on_disk(root: &Path, rel: &str) -> Result<PathBuf, PathError> {
    let dest = path::resolve(root, Some(rel))?;
    reject_symlinks(root, &dest, rel)?;
    Ok(dest)
}

fn reject_symlinks(root: &Path, dest: &Path, rel: &str) -> Result<(), PathError> {
    let rest = dest
        .strip_prefix(root)
        .map_err(|_| PathError::EscapesRoot(rel.to_string()))?;
    let mut current = root.to_path_buf();
    for component in rest.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(PathError::Symlink(rel.to_string()));
            }
            Ok(_) => {}
            // Nothing below a missing component exists yet.
            Err(_) => break,
        }
    }
    Ok(())
}

/// Server side of a send: check the diff, write the binaries, keep a copy of
/// the diff as `diffs/gitdiff-<job>.diff`, and apply it unless empty.
///
/// A diff that does not apply cleanly is rejected before any binary is
/// written. If a later step fails, written binaries are put back as they were.
#[instrument(skip_all, fields(job_id = %job_id, files = files.len(), diff_bytes = diff.len()))]
pub fn receive_changes(
    git: &Git,
    runtime: &RuntimePaths,
    job_id: &str,
    diff: &[u8],
    files: &[ResolvedFile],
) -> Result<()> {
    runtime.ensure()?;
    let diff_path = runtime.diff_path(job_id);
    fs::write(&diff_path, diff).with_context(|| format!("write {}", diff_path.display()))?;
    let apply = !is_blank(diff);
    if apply {
        git.check_patch(&diff_path)
            .with_context(|| format!("check {}", diff_path.display()))?;
    }

    let mut written = Vec::with_capacity(files.len());
    let result = write_binaries(git.workdir(), files, &mut written).and_then(|()| {
        if !apply {
            debug!("empty diff, nothing to apply");
            return Ok(());
        }
        git.apply_patch(&diff_path)
            .with_context(|| format!("apply {}", diff_path.display()))
    });
    if let Err(err) = result {
        roll_back(&written);
        return Err(err);
    }
    info!(job_id, binaries = written.len(), "applied incoming changes");
    Ok(())
}

/// A binary write that can be undone.
struct Written {
    dest: PathBuf,
    previous: Option<Vec<u8>>,
}

fn write_binaries(root: &Path, files: &[ResolvedFile], written: &mut Vec<Written>) -> Result<()> {
    for file in files {
        reject_symlinks(root, &file.dest, &file.rel)?;
        let previous = match fs::read(&file.dest) {
            Ok(bytes) => Some(bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => None,
            Err(e) => return Err(e).with_context(|| format!("read {}", file.dest.display())),
        };
        written.push(Written {
            dest: file.dest.clone(),
            previous,
        });
        write_file(&file.dest, &file.bytes)?;
        debug!(path = %file.rel, bytes = file.bytes.len(), "wrote binary");
    }
    Ok(())
}

fn roll_back(written: &[Written]) {
    for entry in written.iter().rev() {
        let undone = match &entry.previous {
            Some(bytes) => fs::write(&entry.dest, bytes),
            None => fs::remove_file(&entry.dest),
        };
        match undone {
            Ok(()) => debug!(path = %entry.dest.display(), "rolled back binary"),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => warn!(path = %entry.dest.display(), err = %e, "cannot roll back binary"),
        }
    }
}

/// Client side of a pull. Each step is attempted; failures are collected.
#[instrument(skip_all, fields(root = %git.workdir().display()))]
pub fn retrieve(source: &dyn ChangeSource, git: &Git, runtime: &RuntimePaths) -> RetrieveReport {
    let mut report = RetrieveReport::default();

    match source
        .fetch_diff()
        .and_then(|diff| apply_retrieved_diff(git, runtime, &diff))
    {
        Ok(applied) => report.diff_applied = applied,
        Err(err) => report.fail("gitdiff", &err),
    }

    let binaries = match source.list_binaries() {
        Ok(list) => list,
        Err(err) => {
            report.fail("binaries", &err);
            return report;
        }
    };
    for rel in binaries {
        let written = resolve_on_disk(git.workdir(), &rel)
            .map_err(anyhow::Error::from)
            .and_then(|dest| {
                let bytes = source.fetch_file(&rel)?;
                write_file(&dest, &bytes)
            });
        match written {
            Ok(()) => report.files_written.push(rel),
            Err(err) => report.fail(&rel, &err),
        }
    }
    report
}

/// Back up the mirror's uncommitted delta, then return it to a clean `HEAD`.
///
/// Tracked changes are saved as `tracked.diff` (binary hunks included) and
/// untracked files are copied under `untracked/` before being removed.
#[instrument(skip_all, fields(root = %git.workdir().display()))]
pub fn backup_and_restore(git: &Git, runtime: &RuntimePaths, stamp: &str) -> Result<RestoreReport> {
    let tracked_delta = git.diff_head_binary()?;
    let untracked: Vec<String> = git
        .untracked_paths()?
        .into_iter()
        .filter(|p| !is_excluded(p, runtime))
        .collect();

    let mut report = RestoreReport::default();
    if is_blank(&tracked_delta) && untracked.is_empty() {
        debug!("mirror already clean");
        return Ok(report);
    }

    runtime.ensure()?;
    let dir = runtime.backup_dir(stamp);
    fs::create_dir_all(&dir).with_context(|| format!("create {}", dir.display()))?;
    if !is_blank(&tracked_delta) {
        let patch = dir.join("tracked.diff");
        fs::write(&patch, &tracked_delta).with_context(|| format!("write {}", patch.display()))?;
        git.restore_tracked_to_head()?;
        report.restored_tracked = true;
    }
    for rel in untracked {
        let src = git.workdir().join(&rel);
        let bytes = fs::read(&src).with_context(|| format!("read {}", src.display()))?;
        write_file(&dir.join("untracked").join(&rel), &bytes)?;
        fs::remove_file(&src).with_context(|| format!("remove {}", src.display()))?;
        report.removed_untracked.push(rel);
    }

    info!(
        backup = %dir.display(),
        removed_untracked = report.removed_untracked.len(),
        "restored mirror to HEAD"
    );
    report.backup = Some(dir);
    Ok(report)
}

fn apply_retrieved_diff(git: &Git, runtime: &RuntimePaths, diff: &[u8]) -> Result<bool> {
    if is_blank(diff) {
        return Ok(false);
    }
    runtime.ensure()?;
    let patch = runtime.diff_path(&format!("retrieved-{}", uuid::Uuid::new_v4()));
    fs::write(&patch, diff).with_context(|| format!("write {}", patch.display()))?;
    git.apply_patch(&patch)?;
    Ok(true)
}

fn is_excluded(path: &str, runtime: &RuntimePaths) -> bool {
    path == ".gitignore" || path.ends_with("/.gitignore") || runtime.contains_rel(path)
}

fn is_blank(diff: &[u8]) -> bool {
    diff.iter().all(u8::is_ascii_whitespace)
}

fn write_file(dest: &Path, bytes: &[u8]) -> Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    fs::write(dest, bytes).with_context(|| format!("write {}", dest.display()))
}

fn file_is_binary(path: &Path) -> bool {
    let mut head = Vec::new();
    let read = File::open(path).and_then(|f| f.take(SNIFF_BYTES).read_to_end(&mut head));
    match read {
        Ok(_) => looks_binary(&head),
        Err(e) => {
            warn!(path = %path.display(), err = %e, "cannot sniff file, treating as binary");
            true
        }
    }
}

fn head_blob_is_binary(git: &Git, path: &str) -> bool {
    match git.head_blob(path) {
        Ok(blob) => looks_binary(&blob),
        Err(e) => {
            warn!(path, err = %format!("{e:#}"), "cannot read deleted blob, treating as binary");
            true
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;
    use anyhow::anyhow;
    use std::collections::HashMap;

    const PNG: &[u8] = b"\x89PNG\r\n\x1a\n\0\0\0\rIHDR";

    fn runtime(repo: &TestRepo) -> RuntimePaths {
        RuntimePaths::new(repo.path(), ".rbuild")
    }

    #[test]
    fn manifest_classifies_and_excludes() {
        let repo = TestRepo::new().expect("repo");
        repo.write("App/main.swift", "let a = 1\n").expect("write");
        repo.write("Assets/old.png", PNG).expect("write");
        repo.commit_all("base").expect("commit");

        repo.write("App/main.swift", "let a = 2\n").expect("write");
        repo.write("App/New.swift", "struct New {}\n").expect("write");
        repo.write("Assets/icon.png", PNG).expect("write");
        repo.write("blob", b"\0\x01\x02").expect("write");
        repo.write(".gitignore", "*.tmp\n").expect("write");
        repo.write(".rbuild/logs/buildlog-x.txt", "log\n").expect("write");
        fs::remove_file(repo.path().join("Assets/old.png")).expect("rm");

        let manifest = changed_manifest(&repo.git(), &runtime(&repo)).expect("manifest");
        assert_eq!(manifest.plaintext_paths, vec!["App/main.swift", "App/New.swift"]);
        assert_eq!(manifest.binary_paths, vec!["Assets/icon.png", "blob"]);
        assert_eq!(manifest.deleted_paths, vec!["Assets/old.png"]);
    }

    #[test]
    fn text_deletion_travels_in_diff() {
        let repo = TestRepo::new().expect("repo");
        repo.write("gone.txt", "bye\n").expect("write");
        repo.commit_all("base").expect("commit");
        fs::remove_file(repo.path().join("gone.txt")).expect("rm");

        let out = collect_changes(&repo.git(), &runtime(&repo)).expect("collect");
        assert_eq!(out.manifest.plaintext_paths, vec!["gone.txt"]);
        assert_eq!(out.manifest.deleted_paths, vec!["gone.txt"]);
        assert!(String::from_utf8_lossy(&out.diff).contains("deleted file mode"));
    }

    #[test]
    fn clean_tree_gives_empty_diff() {
        let repo = TestRepo::new().expect("repo");
        let out = collect_changes(&repo.git(), &runtime(&repo)).expect("collect");
        assert!(out.manifest.is_empty());
        assert!(out.diff.is_empty());
    }

    #[test]
    fn send_and_receive_reproduce_the_tree() {
        let origin = TestRepo::new().expect("origin");
        origin.write("App/main.swift", "let a = 1\n").expect("write");
        origin.commit_all("base").expect("commit");
        let client = origin.clone_repo().expect("client");
        let server = origin.clone_repo().expect("server");

        client.write("App/main.swift", "let a = 2\n").expect("write");
        client.write("App/New.swift", "struct New {}\n").expect("write");
        client.write("Assets/icon.png", PNG).expect("write");

        let out = collect_changes(&client.git(), &runtime(&client)).expect("collect");
        let incoming: Vec<IncomingFile> = out
            .manifest
            .binary_paths
            .iter()
            .map(|p| IncomingFile {
                path: p.clone(),
                bytes: client.read(p).expect("read"),
            })
            .collect();
        let files = resolve_files(server.path(), incoming).expect("resolve");
        receive_changes(&server.git(), &runtime(&server), "job-1", &out.diff, &files)
            .expect("receive");

        assert_eq!(server.read("App/main.swift").expect("read"), b"let a = 2\n");
        assert_eq!(server.read("App/New.swift").expect("read"), b"struct New {}\n");
        assert_eq!(server.read("Assets/icon.png").expect("read"), PNG);
        assert!(runtime(&server).diff_path("job-1").is_file());
    }

    #[test]
    fn empty_diff_is_saved_but_not_applied() {
        let repo = TestRepo::new().expect("repo");
        receive_changes(&repo.git(), &runtime(&repo), "job-2", b"", &[]).expect("receive");
        assert!(runtime(&repo).diff_path("job-2").is_file());
        assert!(!repo.git().snapshot().expect("snapshot").dirty_tracked);
    }

    #[test]
    fn hostile_binary_path_is_rejected_before_writing() {
        let temp = tempfile::tempdir().expect("tempdir");
        let files = vec![
            IncomingFile {
                path: "ok.png".to_string(),
                bytes: PNG.to_vec(),
            },
            IncomingFile {
                path: "../escape.png".to_string(),
                bytes: PNG.to_vec(),
            },
        ];
        let err = resolve_files(temp.path(), files).expect_err("traversal");
        assert!(matches!(err, PathError::Traversal(_)));
        assert!(!temp.path().join("ok.png").exists());
    }

    fn incoming(path: &str, bytes: &[u8]) -> IncomingFile {
        IncomingFile {
            path: path.to_string(),
            bytes: bytes.to_vec(),
        }
    }

    #[test]
    fn rejected_diff_leaves_no_binary_behind() {
        let repo = TestRepo::new().expect("repo");
        repo.write("Assets/old.png", PNG).expect("write");
        repo.commit_all("add asset").expect("commit");
        let bad_diff = b"--- a/README.md\n+++ b/README.md\n@@ -1 +1 @@\n-not the content\n+patched\n";

        let files = resolve_files(
            repo.path(),
            vec![incoming("Assets/new.png", PNG), incoming("Assets/old.png", b"\0changed")],
        )
        .expect("resolve");
        receive_changes(&repo.git(), &runtime(&repo), "job-bad", bad_diff, &files)
            .expect_err("diff does not apply");

        assert!(!repo.path().join("Assets/new.png").exists());
        assert_eq!(repo.read("Assets/old.png").expect("read"), PNG);
        assert_eq!(repo.read("README.md").expect("read"), b"seed\n");
    }

    #[test]
    fn failed_binary_write_restores_earlier_binaries() {
        let repo = TestRepo::new().expect("repo");
        repo.write("Assets/old.png", PNG).expect("write");
        repo.commit_all("add asset").expect("commit");

        // README.md is a file, so nothing can be written beneath it.
        let files = resolve_files(
            repo.path(),
            vec![
                incoming("Assets/new.png", PNG),
                incoming("Assets/old.png", b"\0changed"),
                incoming("README.md/blocked.png", PNG),
            ],
        )
        .expect("resolve");
        receive_changes(&repo.git(), &runtime(&repo), "job-partial", b"", &files)
            .expect_err("write fails");

        assert!(!repo.path().join("Assets/new.png").exists());
        assert_eq!(repo.read("Assets/old.png").expect("read"), PNG);
        let state = repo.git().snapshot().expect("snapshot");
        assert!(!state.dirty_tracked);
    }

    #[cfg(unix)]
    #[test]
    fn symlinked_components_are_refused() {
        use std::os::unix::fs::symlink;

        let repo = TestRepo::new().expect("repo");
        let outside = tempfile::tempdir().expect("outside");
        symlink(outside.path(), repo.path().join("link")).expect("dir link");
        fs::write(outside.path().join("secret.txt"), "secret").expect("write");
        symlink(outside.path().join("secret.txt"), repo.path().join("secret.txt"))
            .expect("file link");

        let err = resolve_files(repo.path(), vec![incoming("link/pwned.png", PNG)])
            .expect_err("through dir link");
        assert_eq!(err, PathError::Symlink("link/pwned.png".to_string()));
        assert!(matches!(
            resolve_on_disk(repo.path(), "secret.txt"),
            Err(PathError::Symlink(_))
        ));
        assert!(!outside.path().join("pwned.png").exists());

        let source = FakeSource {
            diff: Ok(Vec::new()),
            binaries: vec!["link/pulled.png".to_string()],
            files: HashMap::from([("link/pulled.png".to_string(), PNG.to_vec())]),
        };
        let report = retrieve(&source, &repo.git(), &runtime(&repo));
        assert!(!report.success());
        assert_eq!(report.failures[0].item, "link/pulled.png");
        assert!(!outside.path().join("pulled.png").exists());
    }

    #[test]
    fn missing_components_are_not_symlinks() {
        let repo = TestRepo::new().expect("repo");
        let dest = resolve_on_disk(repo.path(), "New/Dir/file.png").expect("resolve");
        assert_eq!(dest, repo.path().join("New/Dir/file.png"));
    }

    struct FakeSource {
        diff: Result<Vec<u8>, String>,
        binaries: Vec<String>,
        files: HashMap<String, Vec<u8>>,
    }

    impl ChangeSource for FakeSource {
        fn fetch_diff(&self) -> Result<Vec<u8>> {
            self.diff.clone().map_err(|e| anyhow!(e))
        }

        fn list_binaries(&self) -> Result<Vec<String>> {
            Ok(self.binaries.clone())
        }

        fn fetch_file(&self, path: &str) -> Result<Vec<u8>> {
            self.files
                .get(path)
                .cloned()
                .ok_or_else(|| anyhow!("404 for {path}"))
        }
    }

    #[test]
    fn retrieve_records_per_file_failures_and_continues() {
        let repo = TestRepo::new().expect("repo");
        let source = FakeSource {
            diff: Ok(Vec::new()),
            binaries: vec![
                "missing.png".to_string(),
                "../evil.png".to_string(),
                "Assets/ok.png".to_string(),
            ],
            files: HashMap::from([("Assets/ok.png".to_string(), PNG.to_vec())]),
        };

        let report = retrieve(&source, &repo.git(), &runtime(&repo));
        assert!(!report.success());
        assert!(!report.diff_applied);
        assert_eq!(report.files_written, vec!["Assets/ok.png"]);
        let failed: Vec<&str> = report.failures.iter().map(|f| f.item.as_str()).collect();
        assert_eq!(failed, vec!["missing.png", "../evil.png"]);
        assert_eq!(repo.read("Assets/ok.png").expect("read"), PNG);
    }

    #[test]
    fn retrieve_applies_server_diff() {
        let origin = TestRepo::new().expect("origin");
        let server = origin.clone_repo().expect("server");
        let client = origin.clone_repo().expect("client");
        server.write("README.md", "changed on server\n").expect("write");
        let diff = collect_changes(&server.git(), &runtime(&server))
            .expect("collect")
            .diff;

        let source = FakeSource {
            diff: Ok(diff),
            binaries: Vec::new(),
            files: HashMap::new(),
        };
        let report = retrieve(&source, &client.git(), &runtime(&client));
        assert!(report.success(), "{report:?}");
        assert!(report.diff_applied);
        assert_eq!(client.read("README.md").expect("read"), b"changed on server\n");
    }

    #[test]
    fn failed_diff_fetch_is_recorded() {
        let repo = TestRepo::new().expect("repo");
        let source = FakeSource {
            diff: Err("connection refused".to_string()),
            binaries: Vec::new(),
            files: HashMap::new(),
        };
        let report = retrieve(&source, &repo.git(), &runtime(&repo));
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].item, "gitdiff");
    }

    #[test]
    fn restore_backs_up_then_cleans_mirror() {
        let repo = TestRepo::new().expect("repo");
        repo.write("README.md", "dirty\n").expect("write");
        repo.write("App/New.swift", "struct New {}\n").expect("write");
        let paths = runtime(&repo);

        let report = backup_and_restore(&repo.git(), &paths, "t1").expect("restore");
        assert!(report.restored_tracked);
        assert_eq!(report.removed_untracked, vec!["App/New.swift"]);
        let backup = report.backup.expect("backup dir");
        assert!(fs::read_to_string(backup.join("tracked.diff"))
            .expect("read")
            .contains("+dirty"));
        assert!(backup.join("untracked/App/New.swift").is_file());

        assert!(!repo.git().snapshot().expect("snapshot").dirty_tracked);
        let left = changed_manifest(&repo.git(), &paths).expect("manifest");
        assert!(left.is_empty(), "{left:?}");
        assert_eq!(repo.read("README.md").expect("read"), b"seed\n");
    }

    #[test]
    fn restore_on_clean_mirror_is_a_noop() {
        let repo = TestRepo::new().expect("repo");
        let report = backup_and_restore(&repo.git(), &runtime(&repo), "t2").expect("restore");
        assert_eq!(report, RestoreReport::default());
        assert!(!runtime(&repo).backups_dir.exists());
    }
}
