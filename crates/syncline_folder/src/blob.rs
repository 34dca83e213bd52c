//! Binary file handling: content addressing and conflict resolution.
//!
//! Binary files are content-addressed blobs with last-writer-wins plus
//! loser-renaming. The loser of a concurrent modification keeps its bytes
//! under `"<stem> (<origin_host>)<ext>"`; nothing is lost.

use sha2::{Digest, Sha256};
use syncline_core::IndexEntry;

/// Lowercase hex SHA-256 of a byte slice.
pub fn hash_bytes(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

/// Hash of zero-length content; used to disambiguate an empty `BLOB_DATA`
/// payload (miss) from a genuinely empty blob.
pub fn empty_hash() -> String {
    hash_bytes(&[])
}

/// Conflict-loser name for a vault path: `"img/logo.png"` with host `"A"`
/// becomes `"img/logo (A).png"`.
pub fn conflict_name(path: &str, origin_host: &str) -> String {
    let (dir, file) = match path.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, path),
    };
    let renamed = match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem} ({origin_host}).{ext}"),
        _ => format!("{file} ({origin_host})"),
    };
    match dir {
        Some(dir) => format!("{dir}/{renamed}"),
        None => renamed,
    }
}

/// What to do about a remote index entry for a binary path.
#[derive(Debug, Clone, PartialEq)]
pub enum BlobAction {
    /// Remote has content we lack (or a pure remote change): fetch it.
    Download,
    /// Local content already matches the entry.
    UpToDate,
    /// Both sides changed since the last sync.
    Conflict {
        /// The side with the later mtime keeps the name.
        local_wins: bool,
    },
}

/// Classify a remote blob entry against local reality.
///
/// `local_hash` is the hash of the bytes on disk (None when the file is
/// missing), `last_synced_hash` the hash recorded at the last successful
/// sync of this path.
pub fn classify(
    local_hash: Option<&str>,
    local_mtime_ms: Option<i64>,
    last_synced_hash: Option<&str>,
    remote: &IndexEntry,
) -> BlobAction {
    let remote_hash = remote.hash.as_deref().unwrap_or_default();

    let local_hash = match local_hash {
        None => return BlobAction::Download,
        Some(hash) => hash,
    };
    if local_hash == remote_hash {
        return BlobAction::UpToDate;
    }
    if last_synced_hash == Some(local_hash) {
        // We never touched it since the last sync; the change is purely
        // remote.
        return BlobAction::Download;
    }
    BlobAction::Conflict {
        local_wins: local_mtime_ms.unwrap_or(0) > remote.mtime_ms.unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_is_lowercase_hex_sha256() {
        // Well-known digest of the empty string.
        assert_eq!(
            empty_hash(),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
        assert_eq!(hash_bytes(b"abc").len(), 64);
    }

    #[test]
    fn test_conflict_name_shapes() {
        assert_eq!(conflict_name("logo.png", "A"), "logo (A).png");
        assert_eq!(conflict_name("img/logo.png", "deskbox"), "img/logo (deskbox).png");
        assert_eq!(conflict_name("Makefile", "A"), "Makefile (A)");
        assert_eq!(conflict_name("a/.hidden", "A"), "a/.hidden (A)");
    }

    #[test]
    fn test_classify_missing_local_downloads() {
        let remote = IndexEntry::blob("h2", 2000, "B");
        assert_eq!(classify(None, None, None, &remote), BlobAction::Download);
    }

    #[test]
    fn test_classify_matching_is_up_to_date() {
        let remote = IndexEntry::blob("h1", 2000, "B");
        assert_eq!(
            classify(Some("h1"), Some(1000), Some("h0"), &remote),
            BlobAction::UpToDate
        );
    }

    #[test]
    fn test_classify_pure_remote_change_downloads() {
        let remote = IndexEntry::blob("h2", 2000, "B");
        assert_eq!(
            classify(Some("h1"), Some(1000), Some("h1"), &remote),
            BlobAction::Download
        );
    }

    #[test]
    fn test_classify_concurrent_change_resolves_by_mtime() {
        // S4: A wrote h1 at T1, B wrote h2 at T2 > T1. From A's viewpoint
        // the remote (B) entry wins.
        let remote = IndexEntry::blob("h2", 2000, "B");
        assert_eq!(
            classify(Some("h1"), Some(1000), Some("h0"), &remote),
            BlobAction::Conflict { local_wins: false }
        );

        // And from B's viewpoint against A's entry, local wins.
        let remote = IndexEntry::blob("h1", 1000, "A");
        assert_eq!(
            classify(Some("h2"), Some(2000), Some("h0"), &remote),
            BlobAction::Conflict { local_wins: true }
        );
    }
}
