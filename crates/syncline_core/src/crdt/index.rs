//! The vault index document.
//!
//! A CRDT set of vault paths, identified by the reserved id `"__index__"`
//! and treated by the relay exactly like any other document. The set is the
//! authoritative vault file listing: adding a path means "this file
//! exists", removing it means "delete everywhere". Index entries are stored
//! as JSON in a Y.Map keyed by path:
//!
//! ```text
//! Y.Doc
//! └── Y.Map "paths"
//!     ├── "notes/hello.md" → {"kind":"text"}
//!     ├── "img/logo.png"   → {"kind":"blob","hash":…,"mtime_ms":…,"origin_host":…}
//!     └── ...
//! ```

use std::collections::HashMap;

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, Map, MapRef, ReadTxn, StateVector, Transact, TransactionMut, Update};

use super::text::decode_state_vector;
use super::types::{IndexChange, IndexEntry, UpdateOrigin};
use crate::error::{Result, SynclineError};

/// Name of the Y.Map holding path entries.
const PATHS_MAP_NAME: &str = "paths";

/// The vault index CRDT.
pub struct VaultIndex {
    doc: Doc,
    paths: MapRef,
}

impl VaultIndex {
    /// Create a new empty index.
    pub fn new() -> Self {
        let doc = Doc::new();
        let paths = doc.get_or_insert_map(PATHS_MAP_NAME);
        Self { doc, paths }
    }

    /// Create an index from a previously encoded state blob.
    pub fn from_state(state: &[u8]) -> Result<Self> {
        let index = Self::new();
        if !state.is_empty() {
            index.apply(state, UpdateOrigin::Seed)?;
        }
        Ok(index)
    }

    /// Insert or replace a path entry as a local edit.
    pub fn insert(&self, path: &str, entry: &IndexEntry) -> Result<()> {
        let json = serde_json::to_string(entry)?;
        let mut txn = self.transact_mut(UpdateOrigin::Local);
        self.paths.insert(&mut txn, path, json);
        Ok(())
    }

    /// Remove a path as a local edit. Returns the removed entry, if any.
    pub fn remove(&self, path: &str) -> Option<IndexEntry> {
        let old = self.get(path);
        let mut txn = self.transact_mut(UpdateOrigin::Local);
        self.paths.remove(&mut txn, path);
        old
    }

    /// Look up the entry for a path.
    pub fn get(&self, path: &str) -> Option<IndexEntry> {
        let txn = self.doc.transact();
        let json = self.paths.get(&txn, path)?.cast::<String>().ok()?;
        match serde_json::from_str(&json) {
            Ok(entry) => Some(entry),
            Err(e) => {
                log::warn!("ignoring unparseable index entry for {path}: {e}");
                None
            }
        }
    }

    pub fn contains(&self, path: &str) -> bool {
        let txn = self.doc.transact();
        self.paths.contains_key(&txn, path)
    }

    /// All paths currently in the index.
    pub fn paths(&self) -> Vec<String> {
        let txn = self.doc.transact();
        self.paths.keys(&txn).map(String::from).collect()
    }

    /// All `(path, entry)` pairs currently in the index.
    pub fn entries(&self) -> Vec<(String, IndexEntry)> {
        let paths = self.paths();
        paths
            .into_iter()
            .filter_map(|path| self.get(&path).map(|entry| (path, entry)))
            .collect()
    }

    pub fn len(&self) -> usize {
        let txn = self.doc.transact();
        self.paths.len(&txn) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Encode the current state vector.
    pub fn encode_state_vector(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.state_vector().encode_v1()
    }

    /// Encode the full state as a single update.
    pub fn encode_state_as_update(&self) -> Vec<u8> {
        let txn = self.doc.transact();
        txn.encode_state_as_update_v1(&StateVector::default())
    }

    /// Encode the delta a peer with the given state vector is missing.
    pub fn encode_diff(&self, peer_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = decode_state_vector(peer_state_vector)?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Apply a remote update and report which paths changed.
    ///
    /// Entry comparison runs over the materialized map rather than the yrs
    /// event stream, so replayed duplicate updates report no changes.
    pub fn apply_remote(&self, update: &[u8]) -> Result<Vec<IndexChange>> {
        let before: HashMap<String, IndexEntry> = self.entries().into_iter().collect();
        self.apply(update, UpdateOrigin::Remote)?;
        let after: HashMap<String, IndexEntry> = self.entries().into_iter().collect();

        let mut changes = Vec::new();
        for (path, entry) in &after {
            match before.get(path) {
                None => changes.push(IndexChange::Added {
                    path: path.clone(),
                    entry: entry.clone(),
                }),
                Some(old) if old != entry => changes.push(IndexChange::Updated {
                    path: path.clone(),
                    old: old.clone(),
                    new: entry.clone(),
                }),
                Some(_) => {}
            }
        }
        for (path, old) in before {
            if !after.contains_key(&path) {
                changes.push(IndexChange::Removed { path, old });
            }
        }
        Ok(changes)
    }

    fn apply(&self, update: &[u8], origin: UpdateOrigin) -> Result<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| SynclineError::Crdt(format!("failed to decode index update: {e}")))?;
        let mut txn = self.transact_mut(origin);
        txn.apply_update(decoded)
            .map_err(|e| SynclineError::Crdt(format!("failed to apply index update: {e}")))?;
        Ok(())
    }

    fn transact_mut(&self, origin: UpdateOrigin) -> TransactionMut<'_> {
        match origin.tag() {
            Some(tag) => self.doc.transact_mut_with(tag),
            None => self.doc.transact_mut(),
        }
    }

    /// Observe locally generated index updates (inserts and removals made
    /// through this replica). The returned subscription must be kept alive.
    pub fn observe_local_updates<F>(&self, callback: F) -> yrs::Subscription
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |txn, event| {
                if !super::text::is_local_origin(txn) {
                    return;
                }
                callback(&event.update);
            })
            .expect("failed to observe index updates")
    }
}

impl Default for VaultIndex {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for VaultIndex {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VaultIndex")
            .field("len", &self.len())
            .finish_non_exhaustive()
    }
}
