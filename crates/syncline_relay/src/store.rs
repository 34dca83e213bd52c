//! Durable update store.
//!
//! Append-only log of per-document CRDT updates plus per-document snapshots
//! and content-addressed blobs, all in a single SQLite file (backup = copy
//! one file). The connection is wrapped in a `Mutex` for thread-safe
//! access; SQLite runs in its default serialized threading mode.
//!
//! Reconstruction-heavy operations (`encode_diff`, `sync_reply`,
//! `compact_doc`) are CPU-bound and must be called through
//! `tokio::task::spawn_blocking` from the session dispatcher.

use std::path::Path;
use std::sync::Mutex;

use rusqlite::{Connection, OptionalExtension, params};
use syncline_core::crdt::squash::{self, SyncReply};

use crate::error::{RelayError, Result};

/// A stored snapshot row.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Single update blob equivalent to the merged log prefix.
    pub bytes: Vec<u8>,
    /// State vector of the merged prefix; the serve horizon for partial
    /// diffs.
    pub state_vector: Vec<u8>,
    /// Highest log sequence merged into this snapshot.
    pub through_seq: i64,
}

/// Everything needed to reconstruct a document's current state.
#[derive(Debug, Clone)]
pub struct DocState {
    pub snapshot: Option<Snapshot>,
    /// Update suffix in append order.
    pub updates: Vec<Vec<u8>>,
    /// Highest sequence number seen for this document (snapshot included).
    pub last_seq: i64,
}

/// SQLite-backed update store.
pub struct UpdateStore {
    conn: Mutex<Connection>,
}

impl UpdateStore {
    /// Open or create the database at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let conn = Connection::open(path)?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Create an in-memory store for testing.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            -- Append-only per-document update log
            CREATE TABLE IF NOT EXISTS updates (
                doc_id TEXT NOT NULL,
                seq INTEGER NOT NULL,
                bytes BLOB NOT NULL,
                created_at INTEGER NOT NULL,
                PRIMARY KEY (doc_id, seq)
            );

            -- Compacted prefixes, one row per document
            CREATE TABLE IF NOT EXISTS snapshots (
                doc_id TEXT PRIMARY KEY,
                bytes BLOB NOT NULL,
                state_vector BLOB NOT NULL,
                through_seq INTEGER NOT NULL
            );

            -- Content-addressed binary blobs
            CREATE TABLE IF NOT EXISTS blobs (
                hash TEXT PRIMARY KEY,
                bytes BLOB NOT NULL
            );
            "#,
        )?;
        Ok(())
    }

    /// Append an update to a document's log. Durable before return.
    ///
    /// Sequence numbers are monotonic per document and never reused, even
    /// after the prefix below them has been compacted away. Identical bytes
    /// may legitimately appear twice in the log; readers are replay-safe.
    pub fn append_update(&self, doc_id: &str, bytes: &[u8]) -> Result<i64> {
        let mut conn = self.conn.lock().unwrap();
        let now = chrono::Utc::now().timestamp_millis();

        let tx = conn.transaction()?;
        let max_logged: i64 = tx.query_row(
            "SELECT COALESCE(MAX(seq), 0) FROM updates WHERE doc_id = ?",
            params![doc_id],
            |row| row.get(0),
        )?;
        let through_seq: i64 = tx
            .query_row(
                "SELECT through_seq FROM snapshots WHERE doc_id = ?",
                params![doc_id],
                |row| row.get(0),
            )
            .optional()?
            .unwrap_or(0);
        let seq = max_logged.max(through_seq) + 1;

        tx.execute(
            "INSERT INTO updates (doc_id, seq, bytes, created_at) VALUES (?, ?, ?, ?)",
            params![doc_id, seq, bytes, now],
        )?;
        tx.commit()?;

        Ok(seq)
    }

    /// Read a document's snapshot and update suffix in one consistent view.
    pub fn read_state(&self, doc_id: &str) -> Result<DocState> {
        let conn = self.conn.lock().unwrap();

        let snapshot = conn
            .query_row(
                "SELECT bytes, state_vector, through_seq FROM snapshots WHERE doc_id = ?",
                params![doc_id],
                |row| {
                    Ok(Snapshot {
                        bytes: row.get(0)?,
                        state_vector: row.get(1)?,
                        through_seq: row.get(2)?,
                    })
                },
            )
            .optional()?;

        let mut stmt =
            conn.prepare("SELECT seq, bytes FROM updates WHERE doc_id = ? ORDER BY seq ASC")?;
        let mut last_seq = snapshot.as_ref().map(|s| s.through_seq).unwrap_or(0);
        let mut updates = Vec::new();
        let rows = stmt.query_map(params![doc_id], |row| {
            Ok((row.get::<_, i64>(0)?, row.get::<_, Vec<u8>>(1)?))
        })?;
        for row in rows {
            let (seq, bytes) = row?;
            last_seq = last_seq.max(seq);
            updates.push(bytes);
        }

        Ok(DocState {
            snapshot,
            updates,
            last_seq,
        })
    }

    /// Whether the document has any durable state at all.
    pub fn doc_exists(&self, doc_id: &str) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let in_log: bool = conn.query_row(
            "SELECT EXISTS(SELECT 1 FROM updates WHERE doc_id = ?)
             OR EXISTS(SELECT 1 FROM snapshots WHERE doc_id = ?)",
            params![doc_id, doc_id],
            |row| row.get(0),
        )?;
        Ok(in_log)
    }

    /// Encode the delta a peer is missing from a document.
    ///
    /// Fails with [`RelayError::HistoryLost`] when the peer's (non-empty)
    /// state vector falls below the compaction horizon. CPU-bound; run on a
    /// blocking worker.
    pub fn encode_diff(&self, doc_id: &str, peer_state_vector: &[u8]) -> Result<Vec<u8>> {
        Ok(self.sync_reply(doc_id, peer_state_vector)?.diff)
    }

    /// Compute the full sync-step reply: the peer's missing diff plus this
    /// document's own state vector. CPU-bound; run on a blocking worker.
    pub fn sync_reply(&self, doc_id: &str, peer_state_vector: &[u8]) -> Result<SyncReply> {
        let state = self.read_state(doc_id)?;

        if let Some(snapshot) = &state.snapshot
            && !peer_state_vector.is_empty()
            && !squash::covers(peer_state_vector, &snapshot.state_vector)?
        {
            return Err(RelayError::HistoryLost {
                doc_id: doc_id.to_string(),
            });
        }

        let snapshot_bytes = state.snapshot.as_ref().map(|s| s.bytes.as_slice());
        Ok(squash::diff_with_state_vector(
            snapshot_bytes,
            &state.updates,
            peer_state_vector,
        )?)
    }

    /// Atomically replace the log prefix up to `up_to_seq` with a snapshot.
    ///
    /// A concurrent `read_state` sees either the old snapshot plus suffix
    /// or the new snapshot with the remaining suffix, never a torn state.
    pub fn replace_prefix(
        &self,
        doc_id: &str,
        up_to_seq: i64,
        snapshot_bytes: &[u8],
        snapshot_state_vector: &[u8],
    ) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        // The snapshot row lands before the prefix is deleted; a crash
        // between the two statements rolls both back.
        tx.execute(
            "INSERT OR REPLACE INTO snapshots (doc_id, bytes, state_vector, through_seq)
             VALUES (?, ?, ?, ?)",
            params![doc_id, snapshot_bytes, snapshot_state_vector, up_to_seq],
        )?;
        tx.execute(
            "DELETE FROM updates WHERE doc_id = ? AND seq <= ?",
            params![doc_id, up_to_seq],
        )?;

        tx.commit()?;
        Ok(())
    }

    /// Squash a document's current log into a fresh snapshot.
    ///
    /// Returns `false` when there was nothing to compact. CPU-bound; run on
    /// a blocking worker.
    pub fn compact_doc(&self, doc_id: &str) -> Result<bool> {
        let state = self.read_state(doc_id)?;
        if state.updates.is_empty() {
            return Ok(false);
        }

        let snapshot_bytes = state.snapshot.as_ref().map(|s| s.bytes.as_slice());
        let squashed = squash::squash(snapshot_bytes, &state.updates);
        self.replace_prefix(
            doc_id,
            state.last_seq,
            &squashed.snapshot,
            &squashed.state_vector,
        )?;
        Ok(true)
    }

    /// Documents whose un-compacted update count has reached `threshold`.
    pub fn docs_over_threshold(&self, threshold: usize) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT doc_id FROM updates GROUP BY doc_id HAVING COUNT(*) >= ? ORDER BY doc_id",
        )?;
        let docs = stmt
            .query_map(params![threshold as i64], |row| row.get(0))?
            .collect::<std::result::Result<Vec<String>, _>>()?;
        Ok(docs)
    }

    /// Number of un-compacted updates for a document.
    pub fn update_count(&self, doc_id: &str) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM updates WHERE doc_id = ?",
            params![doc_id],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    /// Store a blob under its content hash. Re-putting the same hash is a
    /// no-op overwrite of identical bytes.
    pub fn put_blob(&self, hash: &str, bytes: &[u8]) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR REPLACE INTO blobs (hash, bytes) VALUES (?, ?)",
            params![hash, bytes],
        )?;
        Ok(())
    }

    /// Fetch a blob by content hash.
    pub fn get_blob(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        let conn = self.conn.lock().unwrap();
        let bytes = conn
            .query_row(
                "SELECT bytes FROM blobs WHERE hash = ?",
                params![hash],
                |row| row.get(0),
            )
            .optional()?;
        Ok(bytes)
    }
}

impl std::fmt::Debug for UpdateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UpdateStore").finish_non_exhaustive()
    }
}
