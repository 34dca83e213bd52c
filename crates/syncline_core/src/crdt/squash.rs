//! Log reconstruction helpers for the relay's update store.
//!
//! The relay never keeps live documents in memory; it reconstructs a
//! document from its stored snapshot plus the update suffix whenever it
//! needs to answer a sync step or compact the log. These helpers own the
//! yrs plumbing for that so the store stays a plain SQL layer. They are
//! CPU-bound and are expected to run on a blocking worker pool, off the
//! session dispatcher.

use yrs::updates::decoder::Decode;
use yrs::updates::encoder::Encode;
use yrs::{Doc, ReadTxn, StateVector, Transact, Update};

use super::text::decode_state_vector;
use crate::error::{Result, SynclineError};

/// Snapshot material produced by squashing a document's log prefix.
#[derive(Debug, Clone)]
pub struct SquashedState {
    /// Single update blob equivalent to the merged log.
    pub snapshot: Vec<u8>,
    /// State vector of the merged log, the serve horizon for partial diffs.
    pub state_vector: Vec<u8>,
}

/// Merge a snapshot and an update suffix into a fresh document.
///
/// Tolerates duplicate updates in the suffix (idempotent re-broadcasts are
/// allowed in the log). Individual undecodable updates are skipped with a
/// warning rather than poisoning the whole document.
fn reconstruct(snapshot: Option<&[u8]>, updates: &[Vec<u8>]) -> Doc {
    let doc = Doc::new();
    {
        let mut txn = doc.transact_mut();
        if let Some(state) = snapshot {
            match Update::decode_v1(state) {
                Ok(update) => {
                    if let Err(e) = txn.apply_update(update) {
                        log::warn!("failed to apply stored snapshot: {e}");
                    }
                }
                Err(e) => log::warn!("failed to decode stored snapshot: {e}"),
            }
        }
        for bytes in updates {
            match Update::decode_v1(bytes) {
                Ok(update) => {
                    if let Err(e) = txn.apply_update(update) {
                        log::warn!("failed to apply logged update: {e}");
                    }
                }
                Err(e) => log::warn!("failed to decode logged update: {e}"),
            }
        }
    }
    doc
}

/// Squash a snapshot plus update suffix into new snapshot material.
pub fn squash(snapshot: Option<&[u8]>, updates: &[Vec<u8>]) -> SquashedState {
    let doc = reconstruct(snapshot, updates);
    let txn = doc.transact();
    SquashedState {
        snapshot: txn.encode_state_as_update_v1(&StateVector::default()),
        state_vector: txn.state_vector().encode_v1(),
    }
}

/// Encode the delta a peer with `peer_state_vector` is missing from the
/// reconstructed document. An empty state vector yields the full state.
pub fn diff_against(
    snapshot: Option<&[u8]>,
    updates: &[Vec<u8>],
    peer_state_vector: &[u8],
) -> Result<Vec<u8>> {
    let sv = decode_state_vector(peer_state_vector)?;
    let doc = reconstruct(snapshot, updates);
    let txn = doc.transact();
    Ok(txn.encode_state_as_update_v1(&sv))
}

/// Material for a sync-step reply: the diff the peer is missing plus the
/// server's own state vector (sent back so the peer can return its
/// divergence).
#[derive(Debug, Clone)]
pub struct SyncReply {
    pub diff: Vec<u8>,
    pub state_vector: Vec<u8>,
}

/// Like [`diff_against`], but also captures the reconstructed document's
/// state vector in the same pass.
pub fn diff_with_state_vector(
    snapshot: Option<&[u8]>,
    updates: &[Vec<u8>],
    peer_state_vector: &[u8],
) -> Result<SyncReply> {
    let sv = decode_state_vector(peer_state_vector)?;
    let doc = reconstruct(snapshot, updates);
    let txn = doc.transact();
    Ok(SyncReply {
        diff: txn.encode_state_as_update_v1(&sv),
        state_vector: txn.state_vector().encode_v1(),
    })
}

/// Whether `peer` has integrated everything summarized by `horizon`.
///
/// A peer below the snapshot horizon cannot be served a partial diff: the
/// tombstones it needs were garbage-collected into the snapshot. Such a
/// peer must be answered with `ERR_HISTORY_LOST` and recover via an empty
/// state vector.
pub fn covers(peer: &[u8], horizon: &[u8]) -> Result<bool> {
    let peer = decode_state_vector(peer)?;
    let horizon = decode_state_vector(horizon)?;
    for (client, clock) in horizon.iter() {
        if peer.get(client) < *clock {
            return Ok(false);
        }
    }
    Ok(true)
}

/// Whether an update blob carries no operations (the v1 encoding of zero
/// structs and an empty delete set). Peers that are already in sync produce
/// these as diff replies; they are not worth logging or broadcasting.
pub fn is_noop_update(bytes: &[u8]) -> bool {
    bytes.is_empty() || bytes == [0, 0]
}

/// Decode-check a state vector without retaining it.
pub fn validate_state_vector(bytes: &[u8]) -> Result<()> {
    if bytes.is_empty() {
        return Ok(());
    }
    StateVector::decode_v1(bytes)
        .map(|_| ())
        .map_err(|e| SynclineError::Crdt(format!("failed to decode state vector: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crdt::TextCrdt;

    fn updates_from_edits(edits: &[&str]) -> Vec<Vec<u8>> {
        let doc = TextCrdt::new("d");
        let mut updates = Vec::new();
        let mut sv = doc.encode_state_vector();
        for text in edits {
            doc.update(text);
            updates.push(doc.encode_diff(&sv).unwrap());
            sv = doc.encode_state_vector();
        }
        updates
    }

    #[test]
    fn test_squash_preserves_content() {
        let updates = updates_from_edits(&["one", "one two", "one two three"]);
        let squashed = squash(None, &updates);

        let restored = TextCrdt::from_state("d", &squashed.snapshot).unwrap();
        assert_eq!(restored.get_text(), "one two three");
    }

    #[test]
    fn test_squash_tolerates_duplicates() {
        let mut updates = updates_from_edits(&["alpha", "alpha beta"]);
        let dup = updates[0].clone();
        updates.push(dup);

        let squashed = squash(None, &updates);
        let restored = TextCrdt::from_state("d", &squashed.snapshot).unwrap();
        assert_eq!(restored.get_text(), "alpha beta");
    }

    #[test]
    fn test_diff_against_empty_sv_is_full_state() {
        let updates = updates_from_edits(&["hello"]);
        let diff = diff_against(None, &updates, &[]).unwrap();

        let restored = TextCrdt::from_state("d", &diff).unwrap();
        assert_eq!(restored.get_text(), "hello");
    }

    #[test]
    fn test_diff_against_snapshot_plus_suffix() {
        let doc = TextCrdt::new("d");
        doc.update("base");
        let snapshot = squash(None, &[doc.encode_state_as_update()]);

        let peer = TextCrdt::from_state("d", &snapshot.snapshot).unwrap();
        let peer_sv = peer.encode_state_vector();

        doc.update("base extended");
        let suffix = doc.encode_diff(&snapshot.state_vector).unwrap();

        let diff = diff_against(Some(&snapshot.snapshot), &[suffix], &peer_sv).unwrap();
        peer.apply_remote(&diff).unwrap();
        assert_eq!(peer.get_text(), "base extended");
    }

    #[test]
    fn test_covers() {
        let doc = TextCrdt::new("d");
        doc.update("first");
        let early = doc.encode_state_vector();
        doc.update("first second");
        let late = doc.encode_state_vector();

        assert!(covers(&late, &early).unwrap());
        assert!(!covers(&early, &late).unwrap());
        // Everyone covers the zero horizon; an empty peer covers nothing else.
        assert!(covers(&early, &[]).unwrap());
        assert!(!covers(&[], &late).unwrap());
    }

    #[test]
    fn test_validate_state_vector() {
        let doc = TextCrdt::new("d");
        doc.update("x");
        assert!(validate_state_vector(&doc.encode_state_vector()).is_ok());
        assert!(validate_state_vector(&[]).is_ok());
        assert!(validate_state_vector(&[0xff, 0xff, 0xff]).is_err());
    }
}
