//! Syncline relay server library.
//!
//! The relay owns the authoritative ordered log of per-document CRDT
//! updates and is the message bus between replicas:
//!
//! - [`store`] — durable append-only log, snapshots and blobs (SQLite).
//! - [`hub`] — per-document broadcast channels with subscriber-tied
//!   lifetime.
//! - [`session`] — per-connection protocol state machine and forwarder
//!   tasks.
//! - [`ws`] — the axum `/sync` WebSocket endpoint.
//! - [`compactor`] — background squashing of update runs into snapshots.

pub mod compactor;
pub mod error;
pub mod hub;
pub mod session;
pub mod store;
pub mod ws;

pub use compactor::Compactor;
pub use error::{RelayError, Result};
pub use hub::BroadcastHub;
pub use session::{Relay, Session};
pub use store::UpdateStore;
