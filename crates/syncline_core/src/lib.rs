//! Syncline core library.
//!
//! Shared building blocks for the relay server and the folder daemon:
//!
//! - [`frame`] — the framed binary wire codec and HELLO payloads.
//! - [`crdt`] — text document and vault index wrappers over yrs, plus the
//!   log reconstruction helpers used by the relay.
//! - [`replica`] — the client-side replica engine routing local edits to an
//!   outbound channel.
//!
//! The CRDT primitive itself (merge semantics, update encoding) is owned by
//! yrs; this crate defines how those primitives are transported, persisted
//! and composed.

pub mod crdt;
pub mod error;
pub mod frame;
pub mod replica;

pub use crdt::{EntryKind, IndexChange, IndexEntry, SquashedState, SyncReply, TextCrdt, VaultIndex};
pub use error::{Result, SynclineError};
pub use frame::{ClientHello, Frame, INDEX_DOC_ID, MsgType, ServerHello};
pub use replica::{LocalUpdate, Replica};
