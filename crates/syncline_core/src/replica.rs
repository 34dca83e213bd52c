//! Client replica engine.
//!
//! Owns the in-memory CRDT documents for a vault replica: one [`TextCrdt`]
//! per text file plus the [`VaultIndex`]. Every document gets a local-edit
//! listener on allocation that forwards locally generated updates into an
//! outbound channel, from which the connection layer builds `UPDATE`
//! frames. Remote updates are applied with a tagged origin so the listener
//! never re-emits them.

use std::collections::HashMap;

use tokio::sync::mpsc::UnboundedSender;

use crate::crdt::{IndexChange, TextCrdt, VaultIndex};
use crate::error::Result;
use crate::frame::INDEX_DOC_ID;

/// A locally generated update ready to be framed and sent.
#[derive(Debug, Clone)]
pub struct LocalUpdate {
    pub doc_id: String,
    pub update: Vec<u8>,
}

struct ManagedDoc {
    doc: TextCrdt,
    // Dropping the subscription detaches the listener.
    _listener: yrs::Subscription,
}

/// The set of CRDT documents a client holds, with outbound update routing.
pub struct Replica {
    docs: HashMap<String, ManagedDoc>,
    index: VaultIndex,
    _index_listener: yrs::Subscription,
    updates_tx: UnboundedSender<LocalUpdate>,
}

impl Replica {
    /// Create a replica with an empty index.
    pub fn new(updates_tx: UnboundedSender<LocalUpdate>) -> Self {
        Self::with_index(VaultIndex::new(), updates_tx)
    }

    /// Create a replica around a restored index document.
    pub fn with_index(index: VaultIndex, updates_tx: UnboundedSender<LocalUpdate>) -> Self {
        let tx = updates_tx.clone();
        let index_listener = index.observe_local_updates(move |update| {
            let _ = tx.send(LocalUpdate {
                doc_id: INDEX_DOC_ID.to_string(),
                update: update.to_vec(),
            });
        });
        Self {
            docs: HashMap::new(),
            index,
            _index_listener: index_listener,
            updates_tx,
        }
    }

    /// Get the document for `doc_id`, allocating it (with its listener) on
    /// first encounter.
    pub fn ensure_doc(&mut self, doc_id: &str) -> &TextCrdt {
        if !self.docs.contains_key(doc_id) {
            self.install_doc(TextCrdt::new(doc_id));
        }
        &self.docs[doc_id].doc
    }

    /// Restore a document from a persisted state blob.
    pub fn restore_doc(&mut self, doc_id: &str, state: &[u8]) -> Result<&TextCrdt> {
        let doc = TextCrdt::from_state(doc_id, state)?;
        self.install_doc(doc);
        Ok(&self.docs[doc_id].doc)
    }

    fn install_doc(&mut self, doc: TextCrdt) {
        let doc_id = doc.doc_id().to_string();
        let tx = self.updates_tx.clone();
        let id_for_listener = doc_id.clone();
        let listener = doc.observe_local_updates(move |update| {
            let _ = tx.send(LocalUpdate {
                doc_id: id_for_listener.clone(),
                update: update.to_vec(),
            });
        });
        self.docs.insert(
            doc_id,
            ManagedDoc {
                doc,
                _listener: listener,
            },
        );
    }

    pub fn contains_doc(&self, doc_id: &str) -> bool {
        self.docs.contains_key(doc_id)
    }

    pub fn doc(&self, doc_id: &str) -> Option<&TextCrdt> {
        self.docs.get(doc_id).map(|m| &m.doc)
    }

    /// Ids of all allocated text documents.
    pub fn doc_ids(&self) -> Vec<String> {
        self.docs.keys().cloned().collect()
    }

    /// Replace a document's text as a local edit (diff-based).
    pub fn update(&mut self, doc_id: &str, new_text: &str) {
        self.ensure_doc(doc_id).update(new_text);
    }

    /// Replace a document's text bypassing the local-edit listener.
    pub fn set_text(&mut self, doc_id: &str, text: &str) {
        self.ensure_doc(doc_id).set_text(text);
    }

    pub fn get_text(&self, doc_id: &str) -> Option<String> {
        self.doc(doc_id).map(TextCrdt::get_text)
    }

    /// Apply a remote update to a document, allocating it if unseen.
    pub fn apply_remote(&mut self, doc_id: &str, update: &[u8]) -> Result<()> {
        self.ensure_doc(doc_id).apply_remote(update)
    }

    /// Drop a document entirely (index-driven deletion, or HISTORY_LOST
    /// recovery before a re-fetch with an empty state vector).
    pub fn drop_doc(&mut self, doc_id: &str) {
        self.docs.remove(doc_id);
    }

    pub fn index(&self) -> &VaultIndex {
        &self.index
    }

    /// Apply a remote update to the index document.
    pub fn apply_index_remote(&self, update: &[u8]) -> Result<Vec<IndexChange>> {
        self.index.apply_remote(update)
    }
}

impl std::fmt::Debug for Replica {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replica")
            .field("docs", &self.docs.len())
            .field("index", &self.index)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::IndexEntry;
    use tokio::sync::mpsc::unbounded_channel;

    #[test]
    fn test_local_edit_reaches_outbound_channel() {
        let (tx, mut rx) = unbounded_channel();
        let mut replica = Replica::new(tx);

        replica.update("note.md", "Hello");

        let out = rx.try_recv().unwrap();
        assert_eq!(out.doc_id, "note.md");
        assert!(!out.update.is_empty());
        assert!(rx.try_recv().is_err());
    }

    #[test]
    fn test_seed_does_not_reach_outbound_channel() {
        let (tx, mut rx) = unbounded_channel();
        let mut replica = Replica::new(tx);

        replica.set_text("note.md", "seeded from disk");
        assert!(rx.try_recv().is_err());
        assert_eq!(replica.get_text("note.md").unwrap(), "seeded from disk");
    }

    #[test]
    fn test_remote_apply_does_not_echo() {
        let (tx, mut rx) = unbounded_channel();
        let mut replica = Replica::new(tx);

        let remote = TextCrdt::new("note.md");
        remote.set_text("remote content");
        replica
            .apply_remote("note.md", &remote.encode_state_as_update())
            .unwrap();

        assert!(rx.try_recv().is_err());
        assert_eq!(replica.get_text("note.md").unwrap(), "remote content");
    }

    #[test]
    fn test_index_edit_routes_to_reserved_doc_id() {
        let (tx, mut rx) = unbounded_channel();
        let replica = Replica::new(tx);

        replica
            .index()
            .insert("note.md", &IndexEntry::text())
            .unwrap();

        let out = rx.try_recv().unwrap();
        assert_eq!(out.doc_id, INDEX_DOC_ID);
    }

    #[test]
    fn test_drop_doc() {
        let (tx, _rx) = unbounded_channel();
        let mut replica = Replica::new(tx);

        replica.update("note.md", "x");
        assert!(replica.contains_doc("note.md"));
        replica.drop_doc("note.md");
        assert!(replica.get_text("note.md").is_none());
    }

    #[test]
    fn test_restore_doc() {
        let (tx, _rx) = unbounded_channel();
        let mut replica = Replica::new(tx);

        let doc = TextCrdt::new("note.md");
        doc.set_text("persisted");
        let state = doc.encode_state_as_update();

        replica.restore_doc("note.md", &state).unwrap();
        assert_eq!(replica.get_text("note.md").unwrap(), "persisted");
    }
}
