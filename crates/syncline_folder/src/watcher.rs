//! Filesystem watcher bridge.
//!
//! notify fires callbacks on an OS-owned thread; forwarding into the async
//! core goes through an unbounded channel so that thread is never blocked
//! on backpressure during mass changes. Coalescing and self-echo filtering
//! happen on the async side.

use std::path::{Path, PathBuf};

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc::UnboundedSender;

use crate::error::Result;
use crate::scan;

/// A raw change notification for one vault path.
#[derive(Debug, Clone, PartialEq)]
pub enum VaultEvent {
    /// Created or modified; the debouncer decides what it really was.
    Touched(PathBuf),
    /// Removed (possibly an editor's atomic-save dance; the debouncer
    /// re-checks existence before acting).
    Removed(PathBuf),
}

impl VaultEvent {
    pub fn path(&self) -> &Path {
        match self {
            VaultEvent::Touched(path) | VaultEvent::Removed(path) => path,
        }
    }
}

/// Owns the OS watcher; dropping it stops event delivery.
pub struct VaultWatcher {
    _watcher: RecommendedWatcher,
}

impl VaultWatcher {
    /// Watch `root` recursively, forwarding filtered events into `tx`.
    pub fn spawn(root: &Path, tx: UnboundedSender<VaultEvent>) -> Result<Self> {
        let mut watcher =
            notify::recommended_watcher(move |result: notify::Result<Event>| {
                let event = match result {
                    Ok(event) => event,
                    Err(e) => {
                        log::warn!("watcher error: {e}");
                        return;
                    }
                };
                for path in event.paths {
                    if scan::is_excluded(&path) {
                        continue;
                    }
                    let forwarded = match event.kind {
                        EventKind::Create(_) | EventKind::Modify(_) => {
                            VaultEvent::Touched(path)
                        }
                        EventKind::Remove(_) => VaultEvent::Removed(path),
                        _ => continue,
                    };
                    // Unbounded send never blocks the OS thread; kernel
                    // event delivery must not stall during mass changes.
                    if tx.send(forwarded).is_err() {
                        return;
                    }
                }
            })?;
        watcher.watch(root, RecursiveMode::Recursive)?;
        Ok(Self { _watcher: watcher })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::sync::mpsc::unbounded_channel;

    #[tokio::test]
    async fn test_watcher_reports_writes() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut rx) = unbounded_channel();
        let _watcher = VaultWatcher::spawn(dir.path(), tx).unwrap();

        // Give the watcher a moment to arm before mutating.
        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(dir.path().join("note.md"), "hello").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("no event within timeout")
            .expect("channel closed");
        assert!(event.path().ends_with("note.md"));
        assert!(matches!(event, VaultEvent::Touched(_)));
    }

    #[tokio::test]
    async fn test_watcher_filters_syncline_dir() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(".syncline")).unwrap();
        let (tx, mut rx) = unbounded_channel();
        let _watcher = VaultWatcher::spawn(dir.path(), tx).unwrap();

        tokio::time::sleep(Duration::from_millis(200)).await;
        std::fs::write(dir.path().join(".syncline/state.db"), "x").unwrap();

        let got = tokio::time::timeout(Duration::from_millis(700), rx.recv()).await;
        assert!(got.is_err(), "event for excluded path leaked: {got:?}");
    }
}
