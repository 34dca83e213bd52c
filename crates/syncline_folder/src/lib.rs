//! Syncline folder daemon library.
//!
//! A filesystem-backed replica of a vault directory:
//!
//! - [`scan`] — vault enumeration, path filtering and doc-id mapping.
//! - [`watcher`] — notify bridge from the OS thread into the async core.
//! - [`daemon`] — the async core: debouncing, self-echo suppression,
//!   offline bootstrap, remote write-back and deletion handling.
//! - [`blob`] — content addressing and binary conflict resolution.
//! - [`state`] — the `.syncline/state.db` persistence layer.
//! - [`connection`] — relay WebSocket transport with reconnect backoff.
//! - [`status`] — the status lamp.

pub mod blob;
pub mod connection;
pub mod daemon;
pub mod error;
pub mod scan;
pub mod state;
pub mod status;
pub mod watcher;

pub use daemon::{Config, Daemon, IgnoreSet};
pub use error::{FolderError, Result};
pub use status::{LampState, StatusLamp};
