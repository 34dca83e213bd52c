//! CRDT document wrappers.
//!
//! Syncline treats the CRDT library (yrs) as a black box providing text
//! documents with state vectors, diffs and change callbacks; this module
//! defines how those primitives are composed: one [`TextCrdt`] per text
//! file, one [`VaultIndex`] for the vault listing, and the [`squash`]
//! helpers the relay uses to reconstruct documents from its log.

mod index;
pub mod squash;
mod text;
mod types;

pub use index::VaultIndex;
pub use squash::{SquashedState, SyncReply};
pub use text::TextCrdt;
pub use types::{EntryKind, IndexChange, IndexEntry, UpdateOrigin};
