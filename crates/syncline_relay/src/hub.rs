//! Broadcast hub.
//!
//! Maps `doc_id` to a broadcast channel carrying `(update_bytes,
//! origin_connection_id)` tuples. A channel lives exactly while at least
//! one subscriber is attached; it is torn down when the last subscriber
//! detaches. Re-creating it on the next demand loses nothing, because
//! everything is replayable from the durable log.
//!
//! Publishing is best-effort with a bounded buffer; a subscriber that lags
//! behind the buffer is dropped from the channel and re-syncs via state
//! vector on its next connection.

use std::collections::HashMap;
use std::sync::RwLock;

use tokio::sync::broadcast;
use tracing::debug;
use uuid::Uuid;

/// Buffered updates per channel before slow subscribers start lagging out.
const CHANNEL_CAPACITY: usize = 1024;

/// Payload fanned out to subscribers: update bytes plus the originating
/// connection, used by forwarders for self-echo filtering.
pub type HubMessage = (Vec<u8>, Uuid);

struct DocChannel {
    tx: broadcast::Sender<HubMessage>,
    subscribers: usize,
}

/// Per-document broadcast channel registry.
pub struct BroadcastHub {
    // Read-mostly: publishes take the read lock, subscription churn takes
    // the write lock.
    channels: RwLock<HashMap<String, DocChannel>>,
}

impl BroadcastHub {
    pub fn new() -> Self {
        Self {
            channels: RwLock::new(HashMap::new()),
        }
    }

    /// Attach a subscriber to a document's channel, creating the channel if
    /// absent. The caller must pair this with [`unsubscribe`] when the
    /// subscription ends.
    ///
    /// [`unsubscribe`]: Self::unsubscribe
    pub fn subscribe(&self, doc_id: &str) -> broadcast::Receiver<HubMessage> {
        let mut channels = self.channels.write().unwrap();
        let channel = channels.entry(doc_id.to_string()).or_insert_with(|| {
            debug!(doc_id, "creating broadcast channel");
            let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
            DocChannel { tx, subscribers: 0 }
        });
        channel.subscribers += 1;
        channel.tx.subscribe()
    }

    /// Detach a subscriber; the channel is removed when the last one leaves.
    pub fn unsubscribe(&self, doc_id: &str) {
        let mut channels = self.channels.write().unwrap();
        if let Some(channel) = channels.get_mut(doc_id) {
            channel.subscribers = channel.subscribers.saturating_sub(1);
            if channel.subscribers == 0 {
                channels.remove(doc_id);
                debug!(doc_id, "removed idle broadcast channel");
            }
        }
    }

    /// Publish an update to a document's channel, creating the channel if
    /// absent so that concurrent subscribers attaching during the publish
    /// see live fanout. Best-effort: with no receivers the update only
    /// lives in the durable log.
    pub fn publish(&self, doc_id: &str, update: Vec<u8>, origin: Uuid) {
        {
            let channels = self.channels.read().unwrap();
            if let Some(channel) = channels.get(doc_id) {
                let _ = channel.tx.send((update, origin));
                return;
            }
        }

        let mut channels = self.channels.write().unwrap();
        let channel = channels.entry(doc_id.to_string()).or_insert_with(|| {
            debug!(doc_id, "creating broadcast channel");
            let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
            DocChannel { tx, subscribers: 0 }
        });
        let _ = channel.tx.send((update, origin));
    }

    /// Number of live channels (leak diagnostics).
    pub fn channel_count(&self) -> usize {
        self.channels.read().unwrap().len()
    }

    /// Total attached subscribers across all channels (leak diagnostics).
    pub fn subscriber_count(&self) -> usize {
        self.channels
            .read()
            .unwrap()
            .values()
            .map(|c| c.subscribers)
            .sum()
    }
}

impl Default for BroadcastHub {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_channel_lifecycle() {
        let hub = BroadcastHub::new();
        assert_eq!(hub.channel_count(), 0);

        let rx1 = hub.subscribe("d");
        let rx2 = hub.subscribe("d");
        assert_eq!(hub.channel_count(), 1);
        assert_eq!(hub.subscriber_count(), 2);

        drop(rx1);
        hub.unsubscribe("d");
        assert_eq!(hub.channel_count(), 1);

        drop(rx2);
        hub.unsubscribe("d");
        assert_eq!(hub.channel_count(), 0);
        assert_eq!(hub.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers_with_origin() {
        let hub = BroadcastHub::new();
        let origin = Uuid::new_v4();

        let mut rx = hub.subscribe("d");
        hub.publish("d", vec![1, 2, 3], origin);

        let (update, from) = rx.recv().await.unwrap();
        assert_eq!(update, vec![1, 2, 3]);
        assert_eq!(from, origin);
    }

    #[test]
    fn test_publish_without_subscribers_is_best_effort() {
        let hub = BroadcastHub::new();
        hub.publish("d", vec![1], Uuid::new_v4());
        // The channel exists for contemporary subscribers; the update itself
        // is only in the log.
        assert_eq!(hub.channel_count(), 1);
    }

    #[tokio::test]
    async fn test_recreated_channel_is_fresh() {
        let hub = BroadcastHub::new();
        let rx = hub.subscribe("d");
        drop(rx);
        hub.unsubscribe("d");

        let mut rx = hub.subscribe("d");
        hub.publish("d", vec![9], Uuid::new_v4());
        let (update, _) = rx.recv().await.unwrap();
        assert_eq!(update, vec![9]);
    }
}
