//! Vault enumeration and path mapping.
//!
//! Document ids are vault-relative paths with forward slashes. Directories
//! named exactly `.git` or `.syncline` are skipped wherever they appear;
//! the filter is by basename, never by prefix (`.gitignore` is legitimate
//! content).

use std::path::{Component, Path, PathBuf};

/// Directory basenames excluded from the vault.
const IGNORED_DIRS: [&str; 2] = [".git", ".syncline"];

/// Whether any component of the path names an excluded directory.
pub fn is_excluded(path: &Path) -> bool {
    path.components().any(|component| match component {
        Component::Normal(name) => IGNORED_DIRS
            .iter()
            .any(|ignored| name.eq_ignore_ascii_case(ignored)),
        _ => false,
    })
}

/// Whether a vault path is treated as CRDT text (`.md` / `.txt`); every
/// other regular file is a blob.
pub fn is_text_path(path: &Path) -> bool {
    matches!(
        path.extension().and_then(|ext| ext.to_str()),
        Some(ext) if ext.eq_ignore_ascii_case("md") || ext.eq_ignore_ascii_case("txt")
    )
}

/// Derive the document id for an absolute path inside the vault.
///
/// Returns `None` for paths outside the root, excluded paths, and paths
/// that are not valid UTF-8 (those cannot be carried in a frame).
pub fn doc_id_for(root: &Path, path: &Path) -> Option<String> {
    let relative = path.strip_prefix(root).ok()?;
    if is_excluded(relative) {
        return None;
    }
    let mut parts = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(name) => parts.push(name.to_str()?),
            _ => return None,
        }
    }
    if parts.is_empty() {
        return None;
    }
    Some(parts.join("/"))
}

/// Resolve a document id back to an absolute path inside the vault.
pub fn path_for(root: &Path, doc_id: &str) -> PathBuf {
    let mut path = root.to_path_buf();
    for part in doc_id.split('/') {
        path.push(part);
    }
    path
}

/// Enumerate all regular files in the vault.
///
/// A single unreadable entry or directory logs a warning and is skipped;
/// the walk never aborts because of one path.
pub fn walk(root: &Path) -> Vec<PathBuf> {
    let mut files = Vec::new();
    let mut stack = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(e) => {
                log::warn!("skipping unreadable directory {dir:?}: {e}");
                continue;
            }
        };
        for entry in entries {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    log::warn!("skipping unreadable entry in {dir:?}: {e}");
                    continue;
                }
            };
            let path = entry.path();
            let file_type = match entry.file_type() {
                Ok(t) => t,
                Err(e) => {
                    log::warn!("skipping {path:?}: {e}");
                    continue;
                }
            };
            if file_type.is_dir() {
                let excluded = path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| {
                        IGNORED_DIRS
                            .iter()
                            .any(|ignored| name.eq_ignore_ascii_case(ignored))
                    });
                if !excluded {
                    stack.push(path);
                }
            } else if file_type.is_file() {
                files.push(path);
            }
        }
    }

    files.sort();
    files
}

/// Milliseconds-since-epoch mtime of a file, best effort.
pub fn mtime_ms(path: &Path) -> Option<i64> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    let since_epoch = modified.duration_since(std::time::UNIX_EPOCH).ok()?;
    Some(since_epoch.as_millis() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_excluded_by_basename_not_prefix() {
        assert!(is_excluded(Path::new(".git/config")));
        assert!(is_excluded(Path::new("sub/.syncline/state.db")));
        // Dotfiles are legitimate content.
        assert!(!is_excluded(Path::new(".gitignore")));
        assert!(!is_excluded(Path::new("notes/.gitignore")));
        assert!(!is_excluded(Path::new("git/notes.md")));
    }

    #[test]
    fn test_text_path_detection() {
        assert!(is_text_path(Path::new("a.md")));
        assert!(is_text_path(Path::new("b.TXT")));
        assert!(!is_text_path(Path::new("logo.png")));
        assert!(!is_text_path(Path::new("README")));
    }

    #[test]
    fn test_doc_id_roundtrip() {
        let root = Path::new("/vault");
        let path = root.join("notes").join("hello.md");
        let doc_id = doc_id_for(root, &path).unwrap();
        assert_eq!(doc_id, "notes/hello.md");
        assert_eq!(path_for(root, &doc_id), path);
    }

    #[test]
    fn test_doc_id_rejects_excluded_and_foreign() {
        let root = Path::new("/vault");
        assert!(doc_id_for(root, &root.join(".git/config")).is_none());
        assert!(doc_id_for(root, Path::new("/elsewhere/x.md")).is_none());
    }

    #[test]
    fn test_walk_skips_ignored_dirs() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("notes")).unwrap();
        fs::create_dir_all(root.join(".git")).unwrap();
        fs::create_dir_all(root.join(".syncline")).unwrap();
        fs::write(root.join("notes/a.md"), "a").unwrap();
        fs::write(root.join(".gitignore"), "target").unwrap();
        fs::write(root.join(".git/config"), "x").unwrap();
        fs::write(root.join(".syncline/state.db"), "x").unwrap();

        let files = walk(root);
        let ids: Vec<String> = files
            .iter()
            .filter_map(|p| doc_id_for(root, p))
            .collect();
        assert_eq!(ids, vec![".gitignore", "notes/a.md"]);
    }

    #[test]
    fn test_walk_survives_unreadable_entries() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        for i in 0..20 {
            fs::write(root.join(format!("f{i:02}.md")), "x").unwrap();
        }
        // A dangling symlink has no readable file type target content; the
        // walk must still report every regular file.
        #[cfg(unix)]
        std::os::unix::fs::symlink(root.join("missing"), root.join("dangling")).unwrap();

        let files = walk(root);
        let md_count = files.iter().filter(|p| is_text_path(p)).count();
        assert_eq!(md_count, 20);
    }
}
