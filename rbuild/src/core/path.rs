//! Safe resolution of peer-supplied repository paths.
//!
//! Everything that writes or reads a file named by the other side goes
//! through [`resolve`] first.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("path is missing")]
    Missing,
    #[error("path is empty")]
    Empty,
    #[error("path contains NUL byte")]
    Nul,
    #[error("absolute paths are not allowed: {0}")]
    Absolute(String),
    #[error("drive-letter paths are not allowed: {0}")]
    DriveLetter(String),
    #[error("UNC-like paths are not allowed: {0}")]
    Unc(String),
    #[error("path traversal is not allowed: {0}")]
    Traversal(String),
    #[error("path resolves to the project root itself: {0}")]
    RootItself(String),
    #[error("path escapes project root: {0}")]
    EscapesRoot(String),
    #[error("paths inside .git are not allowed: {0}")]
    GitDir(String),
    #[error("path goes through a symlink: {0}")]
    Symlink(String),
}

/// Resolve `client_path` (repository-relative) to an absolute path under `project_root`.
///
/// Backslashes count as separators. The result is checked against the root
/// again after normalization.
pub fn resolve(project_root: &Path, client_path: Option<&str>) -> Result<PathBuf, PathError> {
    let raw = client_path.ok_or(PathError::Missing)?;
    let rel = to_posix(raw.trim());
    if rel.is_empty() {
        return Err(PathError::Empty);
    }
    if rel.contains('\0') {
        return Err(PathError::Nul);
    }
    if rel.starts_with("//") {
        return Err(PathError::Unc(rel));
    }
    if rel.starts_with('/') {
        return Err(PathError::Absolute(rel));
    }
    let first = rel.split('/').next().unwrap_or_default();
    if first.len() >= 2 && first.as_bytes()[1] == b':' {
        return Err(PathError::DriveLetter(rel));
    }

    let parts = normalize(&rel);
    if parts.iter().any(|part| *part == "..") {
        return Err(PathError::Traversal(rel));
    }
    if parts.is_empty() {
        return Err(PathError::RootItself(rel));
    }
    if parts[0].eq_ignore_ascii_case(".git") {
        return Err(PathError::GitDir(rel));
    }

    let mut dest = project_root.to_path_buf();
    for part in &parts {
        dest.push(part);
    }

    let confined = dest
        .strip_prefix(project_root)
        .map(|rest| {
            rest.components().count() == parts.len()
                && rest
                    .components()
                    .all(|component| matches!(component, Component::Normal(_)))
        })
        .unwrap_or(false);
    if !confined {
        return Err(PathError::EscapesRoot(rel));
    }
    Ok(dest)
}

/// Render a relative path with `/` separators for the wire.
pub fn to_posix(path: &str) -> String {
    path.replace('\\', "/")
}

/// Lexical normalization: drop empty and `.` segments, fold `x/..`.
///
/// Leading `..` segments that cannot be folded are kept so callers can reject them.
fn normalize(rel: &str) -> Vec<&str> {
    let mut parts: Vec<&str> = Vec::new();
    for segment in rel.split('/') {
        match segment {
            "" | "." => {}
            ".." => match parts.last() {
                Some(last) if *last != ".." => {
                    parts.pop();
                }
                _ => parts.push(".."),
            },
            other => parts.push(other),
        }
    }
    parts
}

#[cfg(test)]
mod tests {
    use super::*;

    fn root() -> PathBuf {
        PathBuf::from("/srv/project")
    }

    #[test]
    fn resolves_nested_relative_path() {
        let resolved = resolve(&root(), Some("a/b/c.txt")).expect("resolve");
        assert_eq!(resolved, PathBuf::from("/srv/project/a/b/c.txt"));
    }

    #[test]
    fn rejects_parent_traversal() {
        assert_eq!(
            resolve(&root(), Some("../etc/passwd")),
            Err(PathError::Traversal("../etc/passwd".to_string()))
        );
        assert!(matches!(
            resolve(&root(), Some("a/../../x")),
            Err(PathError::Traversal(_))
        ));
    }

    #[test]
    fn folds_inner_parent_segments() {
        let resolved = resolve(&root(), Some("a/../b/./c.png")).expect("resolve");
        assert_eq!(resolved, PathBuf::from("/srv/project/b/c.png"));
    }

    #[test]
    fn rejects_absolute_drive_and_unc() {
        assert!(matches!(
            resolve(&root(), Some("/etc/passwd")),
            Err(PathError::Absolute(_))
        ));
        assert!(matches!(
            resolve(&root(), Some("C:/x")),
            Err(PathError::DriveLetter(_))
        ));
        assert!(matches!(
            resolve(&root(), Some("c:x")),
            Err(PathError::DriveLetter(_))
        ));
        assert!(matches!(
            resolve(&root(), Some("//server/share")),
            Err(PathError::Unc(_))
        ));
        assert!(matches!(
            resolve(&root(), Some("\\\\server\\share")),
            Err(PathError::Unc(_))
        ));
    }

    #[test]
    fn rejects_missing_empty_and_nul() {
        assert_eq!(resolve(&root(), None), Err(PathError::Missing));
        assert_eq!(resolve(&root(), Some("   ")), Err(PathError::Empty));
        assert_eq!(resolve(&root(), Some("a\0b")), Err(PathError::Nul));
    }

    #[test]
    fn rejects_paths_that_collapse_to_root() {
        assert!(matches!(
            resolve(&root(), Some("a/..")),
            Err(PathError::RootItself(_))
        ));
    }

    #[test]
    fn backslashes_are_separators() {
        let resolved = resolve(&root(), Some("Assets\\icon.png")).expect("resolve");
        assert_eq!(resolved, PathBuf::from("/srv/project/Assets/icon.png"));
    }

    #[test]
    fn rejects_git_metadata() {
        assert!(matches!(
            resolve(&root(), Some(".git/hooks/pre-commit")),
            Err(PathError::GitDir(_))
        ));
        assert!(matches!(
            resolve(&root(), Some("x/../.GIT/config")),
            Err(PathError::GitDir(_))
        ));
        assert!(resolve(&root(), Some("docs/.git-notes")).is_ok());
    }
}
