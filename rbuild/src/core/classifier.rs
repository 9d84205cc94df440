//! Deterministic classification of changed paths into plaintext and binary.

use std::path::Path;

/// How a changed file travels: inside the diff or as a raw upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ContentKind {
    Plaintext,
    Binary,
}

/// Extensions that are always text, whether or not a MIME type is known.
const PLAINTEXT_EXTENSIONS: &[&str] = &[
    "c", "cc", "cfg", "conf", "cpp", "css", "csv", "diff", "entitlements", "gitattributes",
    "gradle", "h", "hpp", "html", "ini", "java", "js", "json", "kt", "log", "m", "md", "mm",
    "patch", "pbxproj", "plist", "py", "rb", "rs", "sh", "storyboard", "swift", "toml", "ts",
    "txt", "xcconfig", "xcscheme", "xcworkspacedata", "xib", "xml", "yaml", "yml",
];

/// Non-`text/*` MIME types that are still line-oriented text.
const TEXT_LIKE_MIME: &[&str] = &[
    "application/javascript",
    "application/json",
    "application/toml",
    "application/x-sh",
    "application/xml",
    "application/yaml",
];

/// Classify by name alone. `None` means the name is not conclusive and the
/// caller should look at the content.
pub fn classify_path(path: &str) -> Option<ContentKind> {
    let path = Path::new(path);
    let ext = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase);
    if let Some(ext) = &ext
        && PLAINTEXT_EXTENSIONS.contains(&ext.as_str())
    {
        return Some(ContentKind::Plaintext);
    }

    let mime = mime_guess::from_path(path).first()?;
    if mime.type_() == mime_guess::mime::TEXT || TEXT_LIKE_MIME.contains(&mime.essence_str()) {
        Some(ContentKind::Plaintext)
    } else {
        Some(ContentKind::Binary)
    }
}

/// Split `paths` into `(plaintext, binary)`, preserving input order.
///
/// `is_binary_content` is consulted only for names [`classify_path`] cannot decide.
pub fn partition_paths<F>(paths: &[String], mut is_binary_content: F) -> (Vec<String>, Vec<String>)
where
    F: FnMut(&str) -> bool,
{
    let mut plaintext = Vec::new();
    let mut binary = Vec::new();
    for path in paths {
        let kind = classify_path(path).unwrap_or_else(|| {
            if is_binary_content(path) {
                ContentKind::Binary
            } else {
                ContentKind::Plaintext
            }
        });
        match kind {
            ContentKind::Plaintext => plaintext.push(path.clone()),
            ContentKind::Binary => binary.push(path.clone()),
        }
    }
    (plaintext, binary)
}

/// Heuristic used by git itself: a NUL byte in the first 8000 bytes means binary.
pub fn looks_binary(head: &[u8]) -> bool {
    head.iter().take(8000).any(|b| *b == 0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn images_are_binary() {
        assert_eq!(classify_path("Assets/icon.png"), Some(ContentKind::Binary));
        assert_eq!(classify_path("photo.JPG"), Some(ContentKind::Binary));
    }

    #[test]
    fn source_and_logs_are_plaintext() {
        for path in ["App/main.swift", "gitdiff.diff", "build.log", "App.xcodeproj/project.pbxproj"] {
            assert_eq!(classify_path(path), Some(ContentKind::Plaintext), "{path}");
        }
    }

    #[test]
    fn unknown_names_defer_to_content() {
        assert_eq!(classify_path("Makefile"), None);
        assert_eq!(classify_path("data.zzunknown"), None);
    }

    #[test]
    fn partition_keeps_order_and_sniffs_unknowns() {
        let paths = vec![
            "b.swift".to_string(),
            "blob".to_string(),
            "a.png".to_string(),
            "README".to_string(),
        ];
        let (plaintext, binary) = partition_paths(&paths, |path| path == "blob");
        assert_eq!(plaintext, vec!["b.swift", "README"]);
        assert_eq!(binary, vec!["blob", "a.png"]);
    }

    #[test]
    fn nul_byte_means_binary() {
        assert!(looks_binary(b"abc\0def"));
        assert!(!looks_binary(b"plain text\n"));
    }
}
