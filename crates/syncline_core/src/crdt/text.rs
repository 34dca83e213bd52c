//! Per-file text document CRDT.
//!
//! `TextCrdt` wraps a yrs [`Doc`] holding a single Y.Text with the file's
//! content. Local edits are expressed as minimal insert/delete operations
//! computed from a character-level diff, so operation identity is preserved
//! wherever the content did not change and concurrent edits merge cleanly.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{
    Doc, GetString, OffsetKind, Options, Origin, ReadTxn, StateVector, Text, TextRef, Transact,
    TransactionMut, Update,
};

use super::types::UpdateOrigin;
use crate::error::{Result, SynclineError};

/// Name of the Y.Text holding the file content.
const CONTENT_TEXT_NAME: &str = "content";

/// Convert a string slice into the document's index unit.
///
/// The offset unit is dictated by the yrs document configuration, not by the
/// call site: byte offsets for `OffsetKind::Bytes`, UTF-16 code units for
/// `OffsetKind::Utf16`. Mixing these up silently desynchronizes replicas on
/// the first multi-byte character.
fn index_units(kind: OffsetKind, s: &str) -> u32 {
    match kind {
        OffsetKind::Bytes => s.len() as u32,
        OffsetKind::Utf16 => s.encode_utf16().count() as u32,
    }
}

/// Byte length of the longest common character prefix of `a` and `b`.
fn common_prefix_bytes(a: &str, b: &str) -> usize {
    let mut n = 0;
    for (ca, cb) in a.chars().zip(b.chars()) {
        if ca != cb {
            break;
        }
        n += ca.len_utf8();
    }
    n
}

/// Byte length of the longest common character suffix of `a` and `b`.
fn common_suffix_bytes(a: &str, b: &str) -> usize {
    let mut n = 0;
    for (ca, cb) in a.chars().rev().zip(b.chars().rev()) {
        if ca != cb {
            break;
        }
        n += ca.len_utf8();
    }
    n
}

/// A CRDT document for a single text file's content.
pub struct TextCrdt {
    doc: Doc,
    content: TextRef,
    doc_id: String,
}

impl TextCrdt {
    /// Create a new empty text document.
    pub fn new(doc_id: impl Into<String>) -> Self {
        let mut options = Options::default();
        options.offset_kind = OffsetKind::Bytes;
        let doc = Doc::with_options(options);
        let content = doc.get_or_insert_text(CONTENT_TEXT_NAME);
        Self {
            doc,
            content,
            doc_id: doc_id.into(),
        }
    }

    /// Create a text document from a previously encoded state blob.
    pub fn from_state(doc_id: impl Into<String>, state: &[u8]) -> Result<Self> {
        let crdt = Self::new(doc_id);
        if !state.is_empty() {
            crdt.apply(state, UpdateOrigin::Seed)?;
        }
        Ok(crdt)
    }

    pub fn doc_id(&self) -> &str {
        &self.doc_id
    }

    /// Get the full content as a string.
    pub fn get_text(&self) -> String {
        let txn = self.doc.transact();
        self.content.get_string(&txn)
    }

    /// Replace the content as a local edit.
    ///
    /// Computes the minimal insert/delete pair against the current content;
    /// the resulting update is visible to [`observe_local_updates`]
    /// listeners.
    ///
    /// [`observe_local_updates`]: Self::observe_local_updates
    pub fn update(&self, new_text: &str) {
        self.splice(new_text, UpdateOrigin::Local);
    }

    /// Replace the content without notifying the local-edit listener.
    ///
    /// Used when seeding from disk on startup: the content reaches other
    /// replicas through the sync-step handshake, not as a live update.
    pub fn set_text(&self, new_text: &str) {
        self.splice(new_text, UpdateOrigin::Seed);
    }

    fn splice(&self, new_text: &str, origin: UpdateOrigin) {
        let current = self.get_text();
        if current == new_text {
            return;
        }

        let prefix = common_prefix_bytes(&current, new_text);
        let suffix = common_suffix_bytes(&current[prefix..], &new_text[prefix..]);

        let removed = &current[prefix..current.len() - suffix];
        let inserted = &new_text[prefix..new_text.len() - suffix];

        let kind = self.doc.offset_kind();
        let at = index_units(kind, &current[..prefix]);
        let removed_len = index_units(kind, removed);

        let mut txn = self.transact_mut(origin);
        if removed_len > 0 {
            self.content.remove_range(&mut txn, at, removed_len);
        }
        if !inserted.is_empty() {
            self.content.insert(&mut txn, at, inserted);
        }
    }

    fn transact_mut(&self, origin: UpdateOrigin) -> TransactionMut<'_> {
        match origin.tag() {
            Some(tag) => self.doc.transact_mut_with(tag),
            None => self.doc.transact_mut(),
        }
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
    ///
    /// An empty state vector yields the full state.
    pub fn encode_diff(&self, peer_state_vector: &[u8]) -> Result<Vec<u8>> {
        let sv = decode_state_vector(peer_state_vector)?;
        let txn = self.doc.transact();
        Ok(txn.encode_state_as_update_v1(&sv))
    }

    /// Apply an update received from the relay.
    ///
    /// The transaction is tagged with the remote origin, so the local-edit
    /// listener does not re-emit it. Applying the same update twice is a
    /// no-op.
    pub fn apply_remote(&self, update: &[u8]) -> Result<()> {
        self.apply(update, UpdateOrigin::Remote)
    }

    fn apply(&self, update: &[u8], origin: UpdateOrigin) -> Result<()> {
        let decoded = Update::decode_v1(update)
            .map_err(|e| SynclineError::Crdt(format!("failed to decode update: {e}")))?;
        let mut txn = self.transact_mut(origin);
        txn.apply_update(decoded)
            .map_err(|e| SynclineError::Crdt(format!("failed to apply update: {e}")))?;
        Ok(())
    }

    /// Observe locally generated updates.
    ///
    /// The callback fires for every update whose transaction is not tagged
    /// with a remote or seed origin, i.e. exactly the edits that must be
    /// forwarded to the relay. The returned subscription must be kept alive.
    pub fn observe_local_updates<F>(&self, callback: F) -> yrs::Subscription
    where
        F: Fn(&[u8]) + Send + Sync + 'static,
    {
        self.doc
            .observe_update_v1(move |txn, event| {
                if !is_local_origin(txn) {
                    return;
                }
                callback(&event.update);
            })
            .expect("failed to observe document updates")
    }
}

pub(crate) fn is_local_origin(txn: &TransactionMut<'_>) -> bool {
    match txn.origin() {
        None => true,
        Some(origin) => {
            *origin != Origin::from(UpdateOrigin::Remote.tag().unwrap())
                && *origin != Origin::from(UpdateOrigin::Seed.tag().unwrap())
        }
    }
}

/// Decode a state vector, treating empty bytes as the zero vector.
pub(crate) fn decode_state_vector(bytes: &[u8]) -> Result<StateVector> {
    if bytes.is_empty() {
        return Ok(StateVector::default());
    }
    StateVector::decode_v1(bytes)
        .map_err(|e| SynclineError::Crdt(format!("failed to decode state vector: {e}")))
}

impl std::fmt::Debug for TextCrdt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TextCrdt")
            .field("doc_id", &self.doc_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_new_doc_is_empty() {
        let doc = TextCrdt::new("note.md");
        assert_eq!(doc.get_text(), "");
    }

    #[test]
    fn test_update_and_get() {
        let doc = TextCrdt::new("note.md");
        doc.update("Hello World");
        assert_eq!(doc.get_text(), "Hello World");
        doc.update("Hello Brave World");
        assert_eq!(doc.get_text(), "Hello Brave World");
    }

    #[test]
    fn test_multibyte_roundtrip() {
        let doc = TextCrdt::new("note.md");
        doc.set_text("café");
        doc.update("café🚀");
        assert_eq!(doc.get_text(), "café🚀");

        // No index skew on a subsequent insert at position 0.
        doc.update("x café🚀");
        assert_eq!(doc.get_text(), "x café🚀");
    }

    #[test]
    fn test_combining_marks() {
        let doc = TextCrdt::new("note.md");
        // "e" followed by a combining acute accent, then appended content.
        doc.set_text("e\u{0301}abc");
        doc.update("e\u{0301}abcdef");
        assert_eq!(doc.get_text(), "e\u{0301}abcdef");
        doc.update("Xe\u{0301}abcdef");
        assert_eq!(doc.get_text(), "Xe\u{0301}abcdef");
    }

    #[test]
    fn test_convergence_with_reordering_and_duplicates() {
        let a = TextCrdt::new("note.md");
        let b = TextCrdt::new("note.md");

        a.set_text("Hello World");
        b.apply_remote(&a.encode_state_as_update()).unwrap();

        a.update("A: Hello World");
        b.update("Hello World!");

        let from_a = a.encode_state_as_update();
        let from_b = b.encode_state_as_update();

        // Apply in opposite orders, with duplicates.
        b.apply_remote(&from_a).unwrap();
        b.apply_remote(&from_a).unwrap();
        a.apply_remote(&from_b).unwrap();
        a.apply_remote(&from_b).unwrap();

        assert_eq!(a.get_text(), b.get_text());
        assert!(a.get_text().contains("A: "));
        assert!(a.get_text().contains('!'));
    }

    #[test]
    fn test_offline_divergence_merge() {
        let a = TextCrdt::new("story.md");
        let b = TextCrdt::new("story.md");

        a.set_text("Once upon a time.");
        b.apply_remote(&a.encode_state_as_update()).unwrap();

        a.update("Deep in the forest, Once upon a time.");
        b.update("Once upon a time. The End.");

        let sv_b = b.encode_state_vector();
        let diff_for_b = a.encode_diff(&sv_b).unwrap();
        let sv_a = a.encode_state_vector();
        let diff_for_a = b.encode_diff(&sv_a).unwrap();

        b.apply_remote(&diff_for_b).unwrap();
        a.apply_remote(&diff_for_a).unwrap();

        assert_eq!(a.get_text(), b.get_text());
        assert_eq!(a.get_text(), "Deep in the forest, Once upon a time. The End.");
    }

    #[test]
    fn test_empty_state_vector_yields_full_state() {
        let doc = TextCrdt::new("note.md");
        doc.set_text("content");
        let full = doc.encode_diff(&[]).unwrap();

        let other = TextCrdt::new("note.md");
        other.apply_remote(&full).unwrap();
        assert_eq!(other.get_text(), "content");
    }

    #[test]
    fn test_listener_fires_only_for_local_edits() {
        let doc = TextCrdt::new("note.md");
        let fired = Arc::new(AtomicUsize::new(0));
        let fired_clone = fired.clone();
        let _sub = doc.observe_local_updates(move |_| {
            fired_clone.fetch_add(1, Ordering::SeqCst);
        });

        doc.set_text("seeded");
        assert_eq!(fired.load(Ordering::SeqCst), 0, "seed must not emit");

        let other = TextCrdt::new("note.md");
        other.set_text("remote content");
        doc.apply_remote(&other.encode_state_as_update()).unwrap();
        assert_eq!(fired.load(Ordering::SeqCst), 0, "remote apply must not emit");

        doc.update("seeded plus local edit");
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_from_state_restores_content() {
        let doc = TextCrdt::new("note.md");
        doc.set_text("persisted");
        let state = doc.encode_state_as_update();

        let restored = TextCrdt::from_state("note.md", &state).unwrap();
        assert_eq!(restored.get_text(), "persisted");
    }

    #[test]
    fn test_diff_helpers() {
        assert_eq!(common_prefix_bytes("hello", "help"), 3);
        assert_eq!(common_suffix_bytes("reading", "coding"), 4);
        assert_eq!(common_prefix_bytes("café", "cafés"), "café".len());
        assert_eq!(common_prefix_bytes("", "abc"), 0);
    }
}
