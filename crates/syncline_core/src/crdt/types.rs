//! Shared types for the CRDT layer.

use serde::{Deserialize, Serialize};

/// Where a CRDT mutation originated.
///
/// Origins are attached to yrs transactions so that update observers can
/// tell locally generated edits apart from applied remote updates and from
/// disk seeding. Only `Local` mutations are forwarded to the relay by the
/// replica's listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOrigin {
    /// An edit made on this replica that must be propagated.
    Local,
    /// An update received from the relay; never re-emitted.
    Remote,
    /// Content seeded from disk on startup; propagated through the
    /// sync-step handshake instead of live updates.
    Seed,
}

impl UpdateOrigin {
    pub(crate) fn tag(self) -> Option<&'static str> {
        match self {
            UpdateOrigin::Local => None,
            UpdateOrigin::Remote => Some("syncline:remote"),
            UpdateOrigin::Seed => Some("syncline:seed"),
        }
    }
}

/// What kind of content a vault path holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    /// A CRDT text document (`.md` / `.txt`).
    Text,
    /// A content-addressed binary blob.
    Blob,
}

/// One entry of the vault index document.
///
/// For text files only `kind` is meaningful; binary files additionally
/// carry the content hash, the writer's file mtime and the writer's host
/// name (used for the conflict-loser rename).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IndexEntry {
    pub kind: EntryKind,
    /// Lowercase hex SHA-256 of the blob content. `None` for text files.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
    /// Milliseconds since the epoch of the writer's file mtime.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mtime_ms: Option<i64>,
    /// Host name of the replica that produced this version.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub origin_host: Option<String>,
}

impl IndexEntry {
    /// Entry for a CRDT text file.
    pub fn text() -> Self {
        Self {
            kind: EntryKind::Text,
            hash: None,
            mtime_ms: None,
            origin_host: None,
        }
    }

    /// Entry for a content-addressed binary file.
    pub fn blob(hash: impl Into<String>, mtime_ms: i64, origin_host: impl Into<String>) -> Self {
        Self {
            kind: EntryKind::Blob,
            hash: Some(hash.into()),
            mtime_ms: Some(mtime_ms),
            origin_host: Some(origin_host.into()),
        }
    }

    pub fn is_blob(&self) -> bool {
        self.kind == EntryKind::Blob
    }
}

/// A change observed while applying a remote update to the vault index.
#[derive(Debug, Clone, PartialEq)]
pub enum IndexChange {
    Added {
        path: String,
        entry: IndexEntry,
    },
    Updated {
        path: String,
        old: IndexEntry,
        new: IndexEntry,
    },
    Removed {
        path: String,
        old: IndexEntry,
    },
}

impl IndexChange {
    pub fn path(&self) -> &str {
        match self {
            IndexChange::Added { path, .. }
            | IndexChange::Updated { path, .. }
            | IndexChange::Removed { path, .. } => path,
        }
    }
}
