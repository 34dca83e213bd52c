//! Client state database.
//!
//! Lives at `<vault>/.syncline/state.db` (the `.syncline` subtree is
//! excluded from the vault itself). Persists each document's encoded CRDT
//! state across daemon restarts, so offline edits are expressed as
//! incremental operations against the stored state instead of re-seeding
//! the whole file, and per-path blob sync state for conflict detection.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};

use crate::error::Result;

/// Last synchronized version of a binary path.
#[derive(Debug, Clone, PartialEq)]
pub struct BlobState {
    pub hash: String,
    pub mtime_ms: i64,
}

pub struct FolderState {
    conn: Mutex<Connection>,
}

impl FolderState {
    /// Open the state database for a vault, creating `.syncline/` if
    /// needed.
    pub fn open(vault_root: &Path) -> Result<Self> {
        let dir = vault_root.join(".syncline");
        std::fs::create_dir_all(&dir)?;
        let conn = Connection::open(dir.join("state.db"))?;
        let state = Self {
            conn: Mutex::new(conn),
        };
        state.init_schema()?;
        Ok(state)
    }

    /// In-memory state for tests.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let state = Self {
            conn: Mutex::new(conn),
        };
        state.init_schema()?;
        Ok(state)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            -- Encoded CRDT state per document (the vault index included)
            CREATE TABLE IF NOT EXISTS docs (
                doc_id TEXT PRIMARY KEY,
                state BLOB NOT NULL,
                updated_at INTEGER NOT NULL
            );

            -- Last synchronized version per binary path
            CREATE TABLE IF NOT EXISTS blob_state (
                path TEXT PRIMARY KEY,
                hash TEXT NOT NULL,
                mtime_ms INTEGER NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    pub fn save_doc(&self, doc_id: &str, state: &[u8]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();
        conn.execute(
            "INSERT OR REPLACE INTO docs (doc_id, state, updated_at) VALUES (?, ?, ?)",
            params![doc_id, state, now],
        )?;
        Ok(())
    }

    pub fn load_doc(&self, doc_id: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        let state = conn
            .query_row(
                "SELECT state FROM docs WHERE doc_id = ?",
                params![doc_id],
                |row| row.get(0),
            )
            .optional()?;
        Ok(state)
    }

    pub fn delete_doc(&self, doc_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM docs WHERE doc_id = ?", params![doc_id])?;
        Ok(())
    }

    pub fn list_docs(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare("SELECT doc_id FROM docs ORDER BY doc_id")?;
        let docs = stmt
            .query_map([], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(docs)
    }

    pub fn set_blob_state(&self, path: &str, hash: &str, mtime_ms: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO blob_state (path, hash, mtime_ms) VALUES (?, ?, ?)",
            params![path, hash, mtime_ms],
        )?;
        Ok(())
    }

    pub fn blob_state(&self, path: &str) -> Result<Option<BlobState>> {
        let conn = self.conn.lock().unwrap();
        let state = conn
            .query_row(
                "SELECT hash, mtime_ms FROM blob_state WHERE path = ?",
                params![path],
                |row| {
                    Ok(BlobState {
                        hash: row.get(0)?,
                        mtime_ms: row.get(1)?,
                    })
                },
            )
            .optional()?;
        Ok(state)
    }

    pub fn delete_blob_state(&self, path: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute("DELETE FROM blob_state WHERE path = ?", params![path])?;
        Ok(())
    }
}

impl std::fmt::Debug for FolderState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FolderState").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_doc_roundtrip() {
        let state = FolderState::in_memory().unwrap();
        assert!(state.load_doc("a.md").unwrap().is_none());

        state.save_doc("a.md", b"state1").unwrap();
        state.save_doc("a.md", b"state2").unwrap();
        assert_eq!(state.load_doc("a.md").unwrap().unwrap(), b"state2");

        state.delete_doc("a.md").unwrap();
        assert!(state.load_doc("a.md").unwrap().is_none());
    }

    #[test]
    fn test_list_docs() {
        let state = FolderState::in_memory().unwrap();
        state.save_doc("b.md", b"x").unwrap();
        state.save_doc("a.md", b"x").unwrap();
        assert_eq!(state.list_docs().unwrap(), vec!["a.md", "b.md"]);
    }

    #[test]
    fn test_blob_state_roundtrip() {
        let state = FolderState::in_memory().unwrap();
        assert!(state.blob_state("logo.png").unwrap().is_none());

        state.set_blob_state("logo.png", "h1", 1000).unwrap();
        let blob = state.blob_state("logo.png").unwrap().unwrap();
        assert_eq!(blob.hash, "h1");
        assert_eq!(blob.mtime_ms, 1000);

        state.delete_blob_state("logo.png").unwrap();
        assert!(state.blob_state("logo.png").unwrap().is_none());
    }

    #[test]
    fn test_open_creates_syncline_dir() {
        let dir = tempfile::tempdir().unwrap();
        let _state = FolderState::open(dir.path()).unwrap();
        assert!(dir.path().join(".syncline/state.db").exists());
    }
}
