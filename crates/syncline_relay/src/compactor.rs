//! Compaction engine.
//!
//! A background task that periodically squashes update runs into
//! snapshots. Each eligible document is reconstructed in memory on a
//! blocking worker and its log prefix atomically replaced; no session
//! locks are held at any point.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::Result;
use crate::store::UpdateStore;

/// Updates since the last snapshot before a document becomes eligible.
pub const DEFAULT_THRESHOLD: usize = 50;

/// Seconds between scans.
const SWEEP_INTERVAL: Duration = Duration::from_secs(30);

pub struct Compactor {
    store: Arc<UpdateStore>,
    threshold: Arc<AtomicUsize>,
    interval: Duration,
}

impl Compactor {
    pub fn new(store: Arc<UpdateStore>) -> Self {
        Self {
            store,
            threshold: Arc::new(AtomicUsize::new(DEFAULT_THRESHOLD)),
            interval: SWEEP_INTERVAL,
        }
    }

    #[cfg(test)]
    fn with_threshold(store: Arc<UpdateStore>, threshold: usize) -> Self {
        let compactor = Self::new(store);
        compactor.threshold.store(threshold, Ordering::Relaxed);
        compactor
    }

    /// Handle for reconfiguring the threshold at runtime. Lowering it makes
    /// already-overshooting documents eligible on the next scan.
    pub fn threshold_handle(&self) -> Arc<AtomicUsize> {
        self.threshold.clone()
    }

    /// Run the periodic sweep until the task is dropped at shutdown.
    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            match self.sweep().await {
                Ok(0) => {}
                Ok(compacted) => debug!(compacted, "compaction sweep finished"),
                Err(e) => warn!(error = %e, "compaction sweep failed"),
            }
        }
    }

    /// One scan over the log: squash every document at or over threshold.
    pub async fn sweep(&self) -> Result<usize> {
        let threshold = self.threshold.load(Ordering::Relaxed).max(1);

        let store = self.store.clone();
        let eligible =
            tokio::task::spawn_blocking(move || store.docs_over_threshold(threshold)).await??;

        let mut compacted = 0;
        for doc_id in eligible {
            let store = self.store.clone();
            let squash_doc = doc_id.clone();
            match tokio::task::spawn_blocking(move || store.compact_doc(&squash_doc)).await? {
                Ok(true) => {
                    debug!(%doc_id, "compacted");
                    compacted += 1;
                }
                Ok(false) => {}
                Err(e) => warn!(%doc_id, error = %e, "compaction failed"),
            }
        }
        Ok(compacted)
    }
}
