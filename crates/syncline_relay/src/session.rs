//! Per-connection protocol state machine.
//!
//! A session moves `GREETING → ACTIVE → CLOSED`. In `ACTIVE` it dispatches
//! inbound frames against the store and hub, and owns one forwarder task
//! per subscribed document. Each forwarder waits on the disjunction of
//! `channel.recv()` and `outbound.closed()`; waiting on the channel alone
//! would leak the task across reconnect storms.

use std::collections::HashSet;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use syncline_core::frame::{ClientHello, Frame, INDEX_DOC_ID, MsgType, ServerHello};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{RelayError, Result};
use crate::hub::BroadcastHub;
use crate::store::UpdateStore;

/// Shared relay state handed to every session.
pub struct Relay {
    pub store: Arc<UpdateStore>,
    pub hub: Arc<BroadcastHub>,
    pub banner: String,
}

impl Relay {
    pub fn new(store: Arc<UpdateStore>, hub: Arc<BroadcastHub>) -> Self {
        Self {
            store,
            hub,
            banner: format!("syncline-relay/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionState {
    Greeting,
    Active,
    Closed,
}

/// One live connection's protocol state.
pub struct Session {
    relay: Arc<Relay>,
    connection_id: Uuid,
    client_name: Option<String>,
    state: SessionState,
    outbound: mpsc::Sender<Frame>,
    subscribed: HashSet<String>,
}

impl Session {
    /// Create a session writing replies and fanout into `outbound`.
    ///
    /// Dropping the receiving end of `outbound` is the disconnect signal:
    /// it terminates every forwarder this session spawned.
    pub fn new(relay: Arc<Relay>, outbound: mpsc::Sender<Frame>) -> Self {
        Self {
            relay,
            connection_id: Uuid::new_v4(),
            client_name: None,
            state: SessionState::Greeting,
            outbound,
            subscribed: HashSet::new(),
        }
    }

    pub fn connection_id(&self) -> Uuid {
        self.connection_id
    }

    pub fn client_name(&self) -> Option<&str> {
        self.client_name.as_deref()
    }

    /// Dispatch one inbound frame.
    ///
    /// An `Err` is a protocol violation; the caller must close the
    /// connection. Store failures are logged and the frame dropped, the
    /// connection survives.
    pub async fn handle_frame(&mut self, frame: Frame) -> Result<()> {
        match self.state {
            SessionState::Greeting => self.handle_greeting(frame).await,
            SessionState::Active => self.handle_active(frame).await,
            SessionState::Closed => Err(RelayError::Protocol(
                "frame received after close".to_string(),
            )),
        }
    }

    async fn handle_greeting(&mut self, frame: Frame) -> Result<()> {
        if frame.msg_type != MsgType::Hello {
            return Err(RelayError::Protocol(format!(
                "expected HELLO, got {:?}",
                frame.msg_type
            )));
        }
        let hello = ClientHello::from_payload(&frame.payload)
            .map_err(|e| RelayError::Protocol(format!("bad HELLO payload: {e}")))?;
        info!(connection_id = %self.connection_id, name = %hello.name, "client greeted");
        self.client_name = Some(hello.name);

        let reply = ServerHello {
            banner: self.relay.banner.clone(),
            connection_id: self.connection_id.to_string(),
        };
        self.send(reply.to_frame()?).await;
        self.state = SessionState::Active;
        Ok(())
    }

    async fn handle_active(&mut self, frame: Frame) -> Result<()> {
        match frame.msg_type {
            MsgType::SyncStep1 => self.on_sync_step1(frame.doc_id, frame.payload).await,
            // A SYNC_STEP_2 from the peer is its half of the handshake:
            // the diff we asked for with our state vector. Same handling
            // as a live update.
            MsgType::SyncStep2 | MsgType::Update => {
                self.on_update(frame.doc_id, frame.payload).await
            }
            MsgType::IndexUpdate => {
                let doc_id = if frame.doc_id.is_empty() {
                    INDEX_DOC_ID.to_string()
                } else {
                    frame.doc_id
                };
                self.on_update(doc_id, frame.payload).await
            }
            MsgType::BlobPut => self.on_blob_put(frame.doc_id, frame.payload).await,
            MsgType::BlobGet => self.on_blob_get(frame.doc_id).await,
            MsgType::Hello | MsgType::BlobData | MsgType::ErrHistoryLost => Err(
                RelayError::Protocol(format!("unexpected {:?} in ACTIVE", frame.msg_type)),
            ),
        }
    }

    async fn on_sync_step1(&mut self, doc_id: String, state_vector: Vec<u8>) -> Result<()> {
        if doc_id.is_empty() {
            return Err(RelayError::Protocol("SYNC_STEP_1 without doc_id".into()));
        }

        // Subscribe before computing the diff: updates published while the
        // diff is being built reach the client live, and replay-applying
        // one that also landed in the diff is a no-op.
        if self.subscribed.insert(doc_id.clone()) {
            self.spawn_forwarder(doc_id.clone());
        }

        // Reconstruction is CPU-bound; keep it off the session dispatcher.
        let store = self.relay.store.clone();
        let diff_doc = doc_id.clone();
        let reply =
            tokio::task::spawn_blocking(move || store.sync_reply(&diff_doc, &state_vector)).await?;

        match reply {
            Ok(reply) => {
                debug!(connection_id = %self.connection_id, %doc_id, diff_len = reply.diff.len(), "sync step 2");
                self.send(Frame::new(MsgType::SyncStep2, doc_id.clone(), reply.diff))
                    .await;
                self.send(Frame::new(MsgType::SyncStep1, doc_id, reply.state_vector))
                    .await;
            }
            Err(RelayError::HistoryLost { doc_id }) => {
                info!(connection_id = %self.connection_id, %doc_id, "peer below compaction horizon");
                self.send(Frame::new(MsgType::ErrHistoryLost, doc_id, Vec::new()))
                    .await;
            }
            Err(e) => {
                error!(connection_id = %self.connection_id, error = %e, "sync step failed");
            }
        }
        Ok(())
    }

    async fn on_update(&mut self, doc_id: String, update: Vec<u8>) -> Result<()> {
        if doc_id.is_empty() {
            return Err(RelayError::Protocol("UPDATE without doc_id".into()));
        }
        if syncline_core::crdt::squash::is_noop_update(&update) {
            // A diff reply from a peer that was already in sync.
            return Ok(());
        }

        let store = self.relay.store.clone();
        let append_doc = doc_id.clone();
        let append_bytes = update.clone();
        let appended =
            tokio::task::spawn_blocking(move || store.append_update(&append_doc, &append_bytes))
                .await?;
        match appended {
            Ok(seq) => {
                debug!(connection_id = %self.connection_id, %doc_id, seq, "update appended");
            }
            Err(e) => {
                error!(connection_id = %self.connection_id, %doc_id, error = %e, "append failed");
                return Ok(());
            }
        }

        // The channel must exist even if no one has SYNC_STEP_1'd this doc
        // yet, so subscribers attaching right now get live fanout.
        self.relay.hub.publish(&doc_id, update, self.connection_id);
        Ok(())
    }

    async fn on_blob_put(&mut self, hash: String, bytes: Vec<u8>) -> Result<()> {
        let computed = format!("{:x}", Sha256::digest(&bytes));
        if computed != hash {
            return Err(RelayError::Protocol(format!(
                "blob hash mismatch: declared {hash}, computed {computed}"
            )));
        }

        let store = self.relay.store.clone();
        let put_hash = hash.clone();
        let stored =
            tokio::task::spawn_blocking(move || store.put_blob(&put_hash, &bytes)).await?;
        match stored {
            Ok(()) => {
                debug!(connection_id = %self.connection_id, %hash, "blob stored");
                self.send(Frame::new(MsgType::BlobPut, hash, Vec::new())).await;
            }
            Err(e) => {
                error!(connection_id = %self.connection_id, %hash, error = %e, "blob store failed");
            }
        }
        Ok(())
    }

    async fn on_blob_get(&mut self, hash: String) -> Result<()> {
        let store = self.relay.store.clone();
        let get_hash = hash.clone();
        let fetched = tokio::task::spawn_blocking(move || store.get_blob(&get_hash)).await?;
        let bytes = match fetched {
            Ok(bytes) => bytes.unwrap_or_default(),
            Err(e) => {
                error!(connection_id = %self.connection_id, %hash, error = %e, "blob fetch failed");
                Vec::new()
            }
        };
        self.send(Frame::new(MsgType::BlobData, hash, bytes)).await;
        Ok(())
    }

    /// Relay channel fanout for one document to this connection, filtering
    /// out this connection's own updates.
    fn spawn_forwarder(&self, doc_id: String) {
        let mut rx = self.relay.hub.subscribe(&doc_id);
        let hub = self.relay.hub.clone();
        let outbound = self.outbound.clone();
        let connection_id = self.connection_id;

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    received = rx.recv() => match received {
                        Ok((update, origin)) => {
                            if origin == connection_id {
                                continue;
                            }
                            let msg_type = if doc_id == INDEX_DOC_ID {
                                MsgType::IndexUpdate
                            } else {
                                MsgType::Update
                            };
                            if outbound
                                .send(Frame::new(msg_type, doc_id.clone(), update))
                                .await
                                .is_err()
                            {
                                break;
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(%doc_id, skipped, "subscriber lagged; dropping from channel");
                            break;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                    // Observing outbound closure here is what ties the
                    // forwarder's lifetime to the connection.
                    _ = outbound.closed() => break,
                }
            }
            hub.unsubscribe(&doc_id);
        });
    }

    async fn send(&self, frame: Frame) {
        // A failed send means the connection is tearing down; the reader
        // loop notices on its own.
        let _ = self.outbound.send(frame).await;
    }

    /// Mark the session closed. Forwarders terminate when the outbound
    /// receiver drops; durable writes already committed stay.
    pub fn close(&mut self) {
        if self.state != SessionState::Closed {
            info!(connection_id = %self.connection_id, name = self.client_name.as_deref().unwrap_or("?"), "connection closed");
            self.state = SessionState::Closed;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use syncline_core::TextCrdt;

    fn test_relay() -> Arc<Relay> {
        let store = Arc::new(UpdateStore::in_memory().unwrap());
        let hub = Arc::new(BroadcastHub::new());
        Arc::new(Relay::new(store, hub))
    }

    async fn open_session(relay: &Arc<Relay>) -> (Session, mpsc::Receiver<Frame>) {
        let (tx, mut rx) = mpsc::channel(64);
        let mut session = Session::new(relay.clone(), tx);
        let hello = ClientHello {
            name: "test".to_string(),
        };
        session.handle_frame(hello.to_frame().unwrap()).await.unwrap();
        let reply = rx.recv().await.unwrap();
        assert_eq!(reply.msg_type, MsgType::Hello);
        (session, rx)
    }

    async fn recv_timeout(rx: &mut mpsc::Receiver<Frame>) -> Option<Frame> {
        tokio::time::timeout(Duration::from_millis(500), rx.recv())
            .await
            .ok()
            .flatten()
    }

    /// Wait for the hub to settle back to `expected` subscribers.
    async fn await_subscribers(relay: &Arc<Relay>, expected: usize) {
        for _ in 0..100 {
            if relay.hub.subscriber_count() == expected {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "hub did not settle: {} subscribers, expected {expected}",
            relay.hub.subscriber_count()
        );
    }

    #[tokio::test]
    async fn test_frame_before_hello_is_violation() {
        let relay = test_relay();
        let (tx, _rx) = mpsc::channel(8);
        let mut session = Session::new(relay, tx);

        let result = session
            .handle_frame(Frame::new(MsgType::Update, "d", vec![1]))
            .await;
        assert!(matches!(result, Err(RelayError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_sync_step1_replies_step2_then_step1() {
        let relay = test_relay();
        let author = TextCrdt::new("note.md");
        author.update("Hello");
        relay
            .store
            .append_update("note.md", &author.encode_state_as_update())
            .unwrap();

        let (mut session, mut rx) = open_session(&relay).await;
        session
            .handle_frame(Frame::new(MsgType::SyncStep1, "note.md", Vec::new()))
            .await
            .unwrap();

        let step2 = recv_timeout(&mut rx).await.unwrap();
        assert_eq!(step2.msg_type, MsgType::SyncStep2);
        let reader = TextCrdt::from_state("note.md", &step2.payload).unwrap();
        assert_eq!(reader.get_text(), "Hello");

        let step1 = recv_timeout(&mut rx).await.unwrap();
        assert_eq!(step1.msg_type, MsgType::SyncStep1);
        assert!(!step1.payload.is_empty());
    }

    #[tokio::test]
    async fn test_no_self_echo() {
        let relay = test_relay();
        let (mut session, mut rx) = open_session(&relay).await;

        session
            .handle_frame(Frame::new(MsgType::SyncStep1, "d", Vec::new()))
            .await
            .unwrap();
        // Drain the handshake replies.
        recv_timeout(&mut rx).await.unwrap();
        recv_timeout(&mut rx).await.unwrap();

        let author = TextCrdt::new("d");
        author.update("mine");
        session
            .handle_frame(Frame::new(
                MsgType::Update,
                "d",
                author.encode_state_as_update(),
            ))
            .await
            .unwrap();

        assert!(recv_timeout(&mut rx).await.is_none(), "own update echoed");
    }

    #[tokio::test]
    async fn test_update_fans_out_to_other_session() {
        let relay = test_relay();
        let (mut alice, mut alice_rx) = open_session(&relay).await;
        let (mut bob, mut bob_rx) = open_session(&relay).await;

        for (session, rx) in [(&mut alice, &mut alice_rx), (&mut bob, &mut bob_rx)] {
            session
                .handle_frame(Frame::new(MsgType::SyncStep1, "note.md", Vec::new()))
                .await
                .unwrap();
            recv_timeout(rx).await.unwrap();
            recv_timeout(rx).await.unwrap();
        }

        let author = TextCrdt::new("note.md");
        author.update("Hello");
        alice
            .handle_frame(Frame::new(
                MsgType::Update,
                "note.md",
                author.encode_state_as_update(),
            ))
            .await
            .unwrap();

        let relayed = recv_timeout(&mut bob_rx).await.expect("bob got nothing");
        assert_eq!(relayed.msg_type, MsgType::Update);
        let reader = TextCrdt::from_state("note.md", &relayed.payload).unwrap();
        assert_eq!(reader.get_text(), "Hello");

        assert!(recv_timeout(&mut alice_rx).await.is_none());
    }

    #[tokio::test]
    async fn test_late_subscriber_gets_update_via_log() {
        let relay = test_relay();

        // Alice updates a doc nobody ever subscribed to.
        let (mut alice, _alice_rx) = open_session(&relay).await;
        let author = TextCrdt::new("fresh.md");
        author.update("x");
        alice
            .handle_frame(Frame::new(
                MsgType::Update,
                "fresh.md",
                author.encode_state_as_update(),
            ))
            .await
            .unwrap();

        // Bob subscribes afterwards with an empty state vector.
        let (mut bob, mut bob_rx) = open_session(&relay).await;
        bob.handle_frame(Frame::new(MsgType::SyncStep1, "fresh.md", Vec::new()))
            .await
            .unwrap();

        let step2 = recv_timeout(&mut bob_rx).await.unwrap();
        assert_eq!(step2.msg_type, MsgType::SyncStep2);
        let reader = TextCrdt::from_state("fresh.md", &step2.payload).unwrap();
        assert_eq!(reader.get_text(), "x");
    }

    #[tokio::test]
    async fn test_forwarders_drain_after_disconnect_cycles() {
        let relay = test_relay();

        for _ in 0..5 {
            let (mut session, rx) = open_session(&relay).await;
            session
                .handle_frame(Frame::new(MsgType::SyncStep1, "d", Vec::new()))
                .await
                .unwrap();
            // Dropping the receiver is the disconnect.
            drop(rx);
            session.close();
        }

        await_subscribers(&relay, 0).await;
        assert_eq!(relay.hub.channel_count(), 0);
    }

    #[tokio::test]
    async fn test_blob_put_verifies_hash() {
        let relay = test_relay();
        let (mut session, mut rx) = open_session(&relay).await;

        let bytes = b"binary payload".to_vec();
        let hash = format!("{:x}", Sha256::digest(&bytes));

        session
            .handle_frame(Frame::new(MsgType::BlobPut, hash.clone(), bytes.clone()))
            .await
            .unwrap();
        let ack = recv_timeout(&mut rx).await.unwrap();
        assert_eq!(ack.msg_type, MsgType::BlobPut);
        assert_eq!(ack.doc_id, hash);

        session
            .handle_frame(Frame::new(MsgType::BlobGet, hash.clone(), Vec::new()))
            .await
            .unwrap();
        let data = recv_timeout(&mut rx).await.unwrap();
        assert_eq!(data.msg_type, MsgType::BlobData);
        assert_eq!(data.payload, bytes);

        // A lying hash is a protocol violation.
        let result = session
            .handle_frame(Frame::new(MsgType::BlobPut, "0badc0de".to_string(), bytes))
            .await;
        assert!(matches!(result, Err(RelayError::Protocol(_))));
    }

    #[tokio::test]
    async fn test_blob_get_miss_is_empty_payload() {
        let relay = test_relay();
        let (mut session, mut rx) = open_session(&relay).await;

        session
            .handle_frame(Frame::new(MsgType::BlobGet, "unknown".to_string(), Vec::new()))
            .await
            .unwrap();
        let data = recv_timeout(&mut rx).await.unwrap();
        assert_eq!(data.msg_type, MsgType::BlobData);
        assert!(data.payload.is_empty());
    }

    #[tokio::test]
    async fn test_index_update_with_empty_doc_id_routes_to_index() {
        let relay = test_relay();
        let (mut session, _rx) = open_session(&relay).await;

        let index = syncline_core::VaultIndex::new();
        index
            .insert("a.md", &syncline_core::IndexEntry::text())
            .unwrap();
        session
            .handle_frame(Frame::global(
                MsgType::IndexUpdate,
                index.encode_state_as_update(),
            ))
            .await
            .unwrap();

        assert!(relay.store.doc_exists(INDEX_DOC_ID).unwrap());
    }
}
