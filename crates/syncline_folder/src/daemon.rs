//! The folder daemon core.
//!
//! A filesystem-backed replica: one watcher thread (bridged through an
//! unbounded channel), one async core multiplexing the relay socket, the
//! debounce queue and locally generated updates, and a short-lived task per
//! remote write to disk.
//!
//! The trickiest contract here is feedback-loop avoidance between the
//! watcher and the writer: every self-initiated write enters the path into
//! the [`IgnoreSet`] before touching disk and keeps it fenced until a grace
//! period after the write, longer than the watcher's coalescing window.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use syncline_core::crdt::squash;
use syncline_core::frame::{Frame, INDEX_DOC_ID, MsgType};
use syncline_core::{EntryKind, IndexChange, IndexEntry, LocalUpdate, Replica, VaultIndex};
use tokio::sync::mpsc::{UnboundedReceiver, unbounded_channel};
use tokio_tungstenite::tungstenite::Message;

use crate::blob::{self, BlobAction};
use crate::connection::{self, Backoff, WsStream};
use crate::error::Result;
use crate::scan;
use crate::state::FolderState;
use crate::status::{LampState, StatusLamp};
use crate::watcher::{VaultEvent, VaultWatcher};

type WsSink = SplitSink<WsStream, Message>;

/// Editor burst-writes within this window collapse into one diff.
const DEBOUNCE_WINDOW: Duration = Duration::from_millis(300);

/// How long a path stays fenced after a self-initiated write completes.
/// Must exceed the watcher's coalescing window.
const IGNORE_GRACE: Duration = Duration::from_millis(100);

/// Fence applied while a write is still in flight.
const WRITE_SHIELD: Duration = Duration::from_secs(3600);

/// Cadence of the debounce flush scan.
const FLUSH_TICK: Duration = Duration::from_millis(100);

/// Paths the daemon is currently writing itself, with fence expiry.
///
/// Shared between the writer tasks and the watcher side; a timestamped map
/// rather than a per-doc boolean, so overlapping writes to the same path
/// are fenced correctly.
#[derive(Clone)]
pub struct IgnoreSet {
    inner: Arc<DashMap<PathBuf, Instant>>,
}

impl IgnoreSet {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(DashMap::new()),
        }
    }

    /// Fence a path before starting a write.
    pub fn shield(&self, path: &Path) {
        self.inner
            .insert(path.to_path_buf(), Instant::now() + WRITE_SHIELD);
    }

    /// Re-arm the fence to expire after the grace period; call once the
    /// write has completed.
    pub fn release(&self, path: &Path) {
        self.inner
            .insert(path.to_path_buf(), Instant::now() + IGNORE_GRACE);
    }

    /// Whether watcher events for this path should be discarded.
    pub fn is_ignored(&self, path: &Path) -> bool {
        if let Some(expiry) = self.inner.get(path).map(|entry| *entry.value()) {
            if Instant::now() < expiry {
                return true;
            }
            self.inner.remove(path);
        }
        false
    }
}

impl Default for IgnoreSet {
    fn default() -> Self {
        Self::new()
    }
}

/// Daemon configuration from the CLI.
#[derive(Debug, Clone)]
pub struct Config {
    pub dir: PathBuf,
    pub url: String,
    pub name: String,
}

pub struct Daemon {
    cfg: Config,
    state: Arc<FolderState>,
    replica: Replica,
    ignore: IgnoreSet,
    lamp: StatusLamp,
    /// Debounce deadlines per touched path.
    pending: HashMap<PathBuf, Instant>,
    /// Outstanding BLOB_GET requests: hash to destination vault paths.
    pending_blob_gets: HashMap<String, Vec<String>>,
    /// Binary paths found during the bootstrap walk, reconciled against the
    /// index once the handshake reply lands.
    local_blobs: HashSet<String>,
    /// Whether this session still owes the post-handshake index reconcile.
    bootstrap_reconciled: bool,
}

impl Daemon {
    /// Open the vault, restoring persisted CRDT state.
    ///
    /// Returns the daemon plus the channel on which locally generated
    /// updates arrive for forwarding.
    pub fn new(cfg: Config) -> Result<(Self, UnboundedReceiver<LocalUpdate>)> {
        let state = Arc::new(FolderState::open(&cfg.dir)?);
        let (updates_tx, updates_rx) = unbounded_channel();

        let index = match state.load_doc(INDEX_DOC_ID)? {
            Some(bytes) => VaultIndex::from_state(&bytes)?,
            None => VaultIndex::new(),
        };
        let mut replica = Replica::with_index(index, updates_tx);

        for doc_id in state.list_docs()? {
            if doc_id == INDEX_DOC_ID {
                continue;
            }
            match state.load_doc(&doc_id)? {
                Some(bytes) => {
                    if let Err(e) = replica.restore_doc(&doc_id, &bytes) {
                        log::warn!("dropping corrupt persisted state for {doc_id}: {e}");
                        state.delete_doc(&doc_id)?;
                    }
                }
                None => {}
            }
        }

        let daemon = Self {
            cfg,
            state,
            replica,
            ignore: IgnoreSet::new(),
            lamp: StatusLamp::new(),
            pending: HashMap::new(),
            pending_blob_gets: HashMap::new(),
            local_blobs: HashSet::new(),
            bootstrap_reconciled: true,
        };
        Ok((daemon, updates_rx))
    }

    pub fn status(&self) -> &StatusLamp {
        &self.lamp
    }

    /// Run until the process is stopped: connect, sync, reconnect with
    /// backoff on every failure.
    pub async fn run(mut self, mut updates_rx: UnboundedReceiver<LocalUpdate>) -> Result<()> {
        let (watch_tx, mut watch_rx) = unbounded_channel();
        let _watcher = VaultWatcher::spawn(&self.cfg.dir, watch_tx)?;
        let mut backoff = Backoff::new();

        loop {
            self.lamp.set(LampState::Disconnected);
            let (ws, _server) = match connection::connect(&self.cfg.url, &self.cfg.name).await {
                Ok(connected) => connected,
                Err(e) => {
                    let delay = backoff.next_delay();
                    log::warn!("connect failed ({e}); retrying in {delay:?}");
                    tokio::time::sleep(delay).await;
                    continue;
                }
            };
            backoff.reset();
            self.lamp.set(LampState::Syncing);

            match self.run_session(ws, &mut updates_rx, &mut watch_rx).await {
                Ok(()) => log::info!("connection closed; reconnecting"),
                Err(e) => {
                    log::warn!("session failed: {e}");
                    self.lamp.set(LampState::Error);
                }
            }
        }
    }

    async fn run_session(
        &mut self,
        ws: WsStream,
        updates_rx: &mut UnboundedReceiver<LocalUpdate>,
        watch_rx: &mut UnboundedReceiver<VaultEvent>,
    ) -> Result<()> {
        let (mut sink, mut stream) = ws.split();
        self.bootstrap(&mut sink).await?;

        let mut ticker = tokio::time::interval(FLUSH_TICK);
        loop {
            tokio::select! {
                inbound = stream.next() => match inbound {
                    Some(Ok(Message::Binary(data))) => {
                        let frame = Frame::decode(&data)?;
                        self.handle_frame(frame, &mut sink).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => return Ok(()),
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(e.into()),
                },
                Some(update) = updates_rx.recv() => {
                    self.forward_local_update(update, &mut sink).await?;
                }
                Some(event) = watch_rx.recv() => self.on_vault_event(event),
                _ = ticker.tick() => self.flush_due(&mut sink).await?,
            }
        }
    }

    /// Offline bootstrap: reconcile the vault directory against the
    /// replica, announce every known document, then open the index
    /// handshake.
    async fn bootstrap(&mut self, sink: &mut WsSink) -> Result<()> {
        self.local_blobs.clear();
        let mut on_disk_text = HashSet::new();

        for path in scan::walk(&self.cfg.dir) {
            let Some(doc_id) = scan::doc_id_for(&self.cfg.dir, &path) else {
                continue;
            };

            if scan::is_text_path(&path) {
                // Reading is best-effort: one unreadable file never aborts
                // the walk.
                let content = match std::fs::read_to_string(&path) {
                    Ok(content) => content,
                    Err(e) => {
                        log::warn!("skipping unreadable file {path:?}: {e}");
                        continue;
                    }
                };
                on_disk_text.insert(doc_id.clone());

                if self.replica.contains_doc(&doc_id) {
                    // Offline edits become real operations against the
                    // persisted state.
                    if self.replica.get_text(&doc_id).as_deref() != Some(content.as_str()) {
                        self.replica.update(&doc_id, &content);
                    }
                } else {
                    self.replica.set_text(&doc_id, &content);
                }
                self.persist_doc(&doc_id);

                let sv = self
                    .replica
                    .doc(&doc_id)
                    .map(|doc| doc.encode_state_vector())
                    .unwrap_or_default();
                send_frame(sink, Frame::new(MsgType::SyncStep1, doc_id.clone(), sv)).await?;

                if !self.replica.index().contains(&doc_id) {
                    if let Err(e) = self.replica.index().insert(&doc_id, &IndexEntry::text()) {
                        log::warn!("failed to index {doc_id}: {e}");
                    }
                }
            } else {
                self.local_blobs.insert(doc_id);
            }
        }

        // A restored text document with no file on disk was deleted while
        // the daemon was down.
        for doc_id in self.replica.doc_ids() {
            if !on_disk_text.contains(&doc_id)
                && !scan::path_for(&self.cfg.dir, &doc_id).exists()
            {
                log::info!("{doc_id} deleted while offline");
                self.replica.index().remove(&doc_id);
                self.replica.drop_doc(&doc_id);
                if let Err(e) = self.state.delete_doc(&doc_id) {
                    log::warn!("failed to forget {doc_id}: {e}");
                }
            }
        }

        // The index handshake goes last: its SYNC_STEP_2 reply drives blob
        // reconciliation and fetches for docs we have never seen.
        self.bootstrap_reconciled = false;
        let sv = self.replica.index().encode_state_vector();
        send_frame(sink, Frame::new(MsgType::SyncStep1, INDEX_DOC_ID, sv)).await?;
        Ok(())
    }

    async fn handle_frame(&mut self, frame: Frame, sink: &mut WsSink) -> Result<()> {
        match frame.msg_type {
            MsgType::SyncStep1 => {
                // The relay's state vector: answer with our divergence.
                let diff = if frame.doc_id == INDEX_DOC_ID {
                    self.replica.index().encode_diff(&frame.payload)
                } else if let Some(doc) = self.replica.doc(&frame.doc_id) {
                    doc.encode_diff(&frame.payload)
                } else {
                    return Ok(());
                };
                match diff {
                    Ok(diff) if !squash::is_noop_update(&diff) => {
                        send_frame(sink, Frame::new(MsgType::SyncStep2, frame.doc_id, diff))
                            .await?;
                    }
                    Ok(_) => {}
                    Err(e) => log::warn!("cannot answer sync step for {}: {e}", frame.doc_id),
                }
                Ok(())
            }
            MsgType::SyncStep2 | MsgType::Update if frame.doc_id == INDEX_DOC_ID => {
                self.on_index_update(&frame.payload, sink).await
            }
            MsgType::IndexUpdate => self.on_index_update(&frame.payload, sink).await,
            MsgType::SyncStep2 | MsgType::Update => {
                self.on_doc_update(&frame.doc_id, &frame.payload);
                Ok(())
            }
            MsgType::BlobData => {
                self.on_blob_data(frame.doc_id, frame.payload);
                Ok(())
            }
            MsgType::BlobPut => {
                log::debug!("blob {} acknowledged", frame.doc_id);
                Ok(())
            }
            MsgType::ErrHistoryLost => self.on_history_lost(frame.doc_id, sink).await,
            MsgType::Hello | MsgType::BlobGet => {
                log::warn!("unexpected {:?} from relay", frame.msg_type);
                Ok(())
            }
        }
    }

    async fn forward_local_update(&mut self, update: LocalUpdate, sink: &mut WsSink) -> Result<()> {
        let msg_type = if update.doc_id == INDEX_DOC_ID {
            MsgType::IndexUpdate
        } else {
            MsgType::Update
        };
        self.persist_doc(&update.doc_id);
        send_frame(sink, Frame::new(msg_type, update.doc_id, update.update)).await
    }

    fn on_doc_update(&mut self, doc_id: &str, update: &[u8]) {
        if squash::is_noop_update(update) {
            return;
        }
        if let Err(e) = self.replica.apply_remote(doc_id, update) {
            log::warn!("dropping bad update for {doc_id}: {e}");
            return;
        }
        self.persist_doc(doc_id);
        if let Some(content) = self.replica.get_text(doc_id) {
            self.write_text_file(doc_id, content);
        }
    }

    async fn on_index_update(&mut self, update: &[u8], sink: &mut WsSink) -> Result<()> {
        let mut changes = Vec::new();
        if !squash::is_noop_update(update) {
            changes = match self.replica.apply_index_remote(update) {
                Ok(changes) => changes,
                Err(e) => {
                    log::warn!("dropping bad index update: {e}");
                    return Ok(());
                }
            };
            self.persist_doc(INDEX_DOC_ID);
        }

        for change in changes {
            match change {
                IndexChange::Added { path, entry } => {
                    self.on_index_entry(path, entry, sink).await?;
                }
                IndexChange::Updated { path, new, .. } => {
                    self.on_index_entry(path, new, sink).await?;
                }
                IndexChange::Removed { path, .. } => self.on_remote_deletion(&path),
            }
        }

        if !self.bootstrap_reconciled {
            self.bootstrap_reconciled = true;
            self.reconcile_index(sink).await?;
        }
        Ok(())
    }

    /// One-shot pass after the index handshake: walk the merged index,
    /// fetch what is missing locally, detect offline blob deletions, and
    /// publish local binaries the index has never seen.
    async fn reconcile_index(&mut self, sink: &mut WsSink) -> Result<()> {
        for (path, entry) in self.replica.index().entries() {
            match entry.kind {
                EntryKind::Text => {
                    let file = scan::path_for(&self.cfg.dir, &path);
                    if !self.replica.contains_doc(&path) && !file.exists() {
                        send_frame(sink, Frame::new(MsgType::SyncStep1, path, Vec::new()))
                            .await?;
                    }
                }
                EntryKind::Blob => {
                    let file = scan::path_for(&self.cfg.dir, &path);
                    let synced_before = self.state.blob_state(&path).ok().flatten().is_some();
                    if !file.exists() && synced_before {
                        log::info!("{path} deleted while offline");
                        self.replica.index().remove(&path);
                        if let Err(e) = self.state.delete_blob_state(&path) {
                            log::warn!("failed to forget blob state for {path}: {e}");
                        }
                        continue;
                    }
                    self.on_remote_blob_entry(path, entry, sink).await?;
                }
            }
        }

        // Local binaries the index has never seen.
        let fresh: Vec<String> = self.local_blobs.drain().collect();
        for path in fresh {
            if !self.replica.index().contains(&path) {
                log::info!("publishing local binary {path}");
                self.upload_blob(&path, sink).await?;
            }
        }
        Ok(())
    }

    async fn on_index_entry(
        &mut self,
        path: String,
        entry: IndexEntry,
        sink: &mut WsSink,
    ) -> Result<()> {
        match entry.kind {
            EntryKind::Text => {
                let file = scan::path_for(&self.cfg.dir, &path);
                if !self.replica.contains_doc(&path) && !file.exists() {
                    // A document we have never seen: fetch it whole.
                    send_frame(sink, Frame::new(MsgType::SyncStep1, path, Vec::new())).await?;
                }
                Ok(())
            }
            EntryKind::Blob => self.on_remote_blob_entry(path, entry, sink).await,
        }
    }

    async fn on_remote_blob_entry(
        &mut self,
        path: String,
        entry: IndexEntry,
        sink: &mut WsSink,
    ) -> Result<()> {
        self.local_blobs.remove(&path);
        let Some(remote_hash) = entry.hash.clone() else {
            log::warn!("blob index entry for {path} lacks a hash");
            return Ok(());
        };

        let file = scan::path_for(&self.cfg.dir, &path);
        let (local_hash, local_mtime) = match std::fs::read(&file) {
            Ok(bytes) => (Some(blob::hash_bytes(&bytes)), scan::mtime_ms(&file)),
            Err(_) => (None, None),
        };
        let last = self.state.blob_state(&path).ok().flatten();

        match blob::classify(
            local_hash.as_deref(),
            local_mtime,
            last.as_ref().map(|b| b.hash.as_str()),
            &entry,
        ) {
            BlobAction::UpToDate => {
                let mtime = entry.mtime_ms.or(local_mtime).unwrap_or(0);
                if let Err(e) = self.state.set_blob_state(&path, &remote_hash, mtime) {
                    log::warn!("failed to record blob state for {path}: {e}");
                }
                Ok(())
            }
            BlobAction::Download => self.request_blob(&remote_hash, path, sink).await,
            BlobAction::Conflict { local_wins } => {
                log::info!(
                    "binary conflict on {path} (local wins: {local_wins}); keeping both versions"
                );
                self.resolve_blob_conflict(path, entry, local_wins, sink).await
            }
        }
    }

    /// Last-writer-wins with loser renaming: the later mtime keeps the
    /// name, the loser's bytes survive under `"<stem> (<host>)<ext>"`.
    async fn resolve_blob_conflict(
        &mut self,
        path: String,
        remote: IndexEntry,
        local_wins: bool,
        sink: &mut WsSink,
    ) -> Result<()> {
        let remote_hash = remote.hash.clone().unwrap_or_default();
        let remote_host = remote
            .origin_host
            .clone()
            .unwrap_or_else(|| "remote".to_string());

        if local_wins {
            // The remote version loses its name; park its bytes under the
            // conflict name and reassert ours.
            let loser = blob::conflict_name(&path, &remote_host);
            let loser_entry =
                IndexEntry::blob(remote_hash.clone(), remote.mtime_ms.unwrap_or(0), remote_host);
            if let Err(e) = self.replica.index().insert(&loser, &loser_entry) {
                log::warn!("failed to index conflict copy {loser}: {e}");
            }
            self.request_blob(&remote_hash, loser, sink).await?;
            self.upload_blob(&path, sink).await
        } else {
            // We lose the name: move our copy aside, publish it, then
            // fetch the winner under the original name.
            let loser = blob::conflict_name(&path, &self.cfg.name);
            let from = scan::path_for(&self.cfg.dir, &path);
            let to = scan::path_for(&self.cfg.dir, &loser);

            self.ignore.shield(&from);
            self.ignore.shield(&to);
            let renamed = std::fs::rename(&from, &to);
            self.ignore.release(&from);
            self.ignore.release(&to);
            if let Err(e) = renamed {
                log::warn!("failed to park conflict copy of {path}: {e}");
                return Ok(());
            }
            if let Err(e) = self.state.delete_blob_state(&path) {
                log::warn!("failed to reset blob state for {path}: {e}");
            }

            self.upload_blob(&loser, sink).await?;
            self.request_blob(&remote_hash, path, sink).await
        }
    }

    /// Read, hash, upload and index a binary path.
    async fn upload_blob(&mut self, path: &str, sink: &mut WsSink) -> Result<()> {
        let file = scan::path_for(&self.cfg.dir, path);
        let bytes = match std::fs::read(&file) {
            Ok(bytes) => bytes,
            Err(e) => {
                log::warn!("skipping unreadable file {file:?}: {e}");
                return Ok(());
            }
        };
        let hash = blob::hash_bytes(&bytes);
        let mtime =
            scan::mtime_ms(&file).unwrap_or_else(|| chrono::Utc::now().timestamp_millis());

        send_frame(sink, Frame::new(MsgType::BlobPut, hash.clone(), bytes)).await?;
        let entry = IndexEntry::blob(hash.clone(), mtime, self.cfg.name.clone());
        if let Err(e) = self.replica.index().insert(path, &entry) {
            log::warn!("failed to index {path}: {e}");
        }
        if let Err(e) = self.state.set_blob_state(path, &hash, mtime) {
            log::warn!("failed to record blob state for {path}: {e}");
        }
        Ok(())
    }

    async fn request_blob(&mut self, hash: &str, dest: String, sink: &mut WsSink) -> Result<()> {
        let pending = self.pending_blob_gets.entry(hash.to_string()).or_default();
        let already_requested = !pending.is_empty();
        if !pending.contains(&dest) {
            pending.push(dest);
        }
        if !already_requested {
            send_frame(sink, Frame::new(MsgType::BlobGet, hash, Vec::new())).await?;
        }
        Ok(())
    }

    fn on_blob_data(&mut self, hash: String, bytes: Vec<u8>) {
        let destinations = self.pending_blob_gets.remove(&hash).unwrap_or_default();
        if destinations.is_empty() {
            log::debug!("unsolicited blob data for {hash}");
            return;
        }
        if bytes.is_empty() && hash != blob::empty_hash() {
            log::warn!("relay has no blob {hash}");
            return;
        }
        if blob::hash_bytes(&bytes) != hash {
            log::warn!("discarding corrupt blob data for {hash}");
            return;
        }

        for dest in destinations {
            let path = scan::path_for(&self.cfg.dir, &dest);
            let ignore = self.ignore.clone();
            let state = self.state.clone();
            let bytes = bytes.clone();
            let hash = hash.clone();
            tokio::spawn(async move {
                ignore.shield(&path);
                if let Some(parent) = path.parent() {
                    let _ = tokio::fs::create_dir_all(parent).await;
                }
                match tokio::fs::write(&path, &bytes).await {
                    Ok(()) => {
                        let mtime = scan::mtime_ms(&path)
                            .unwrap_or_else(|| chrono::Utc::now().timestamp_millis());
                        if let Err(e) = state.set_blob_state(&dest, &hash, mtime) {
                            log::warn!("failed to record blob state for {dest}: {e}");
                        }
                    }
                    Err(e) => log::warn!("failed to write {path:?}: {e}"),
                }
                ignore.release(&path);
            });
        }
    }

    /// The index removed a path: delete everywhere, undo-friendly.
    fn on_remote_deletion(&mut self, path: &str) {
        self.replica.drop_doc(path);
        if let Err(e) = self.state.delete_doc(path) {
            log::warn!("failed to forget {path}: {e}");
        }
        if let Err(e) = self.state.delete_blob_state(path) {
            log::warn!("failed to forget blob state for {path}: {e}");
        }

        let file = scan::path_for(&self.cfg.dir, path);
        if !file.exists() {
            return;
        }

        let trash_dir = self.cfg.dir.join(".syncline").join("trash");
        if let Err(e) = std::fs::create_dir_all(&trash_dir) {
            log::warn!("cannot create trash directory: {e}");
        }
        let file_name = file
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let trashed = trash_dir.join(format!(
            "{}-{}",
            chrono::Utc::now().timestamp_millis(),
            file_name
        ));

        self.ignore.shield(&file);
        match std::fs::rename(&file, &trashed) {
            Ok(()) => log::info!("deleted {path} (kept in trash)"),
            Err(e) => {
                log::warn!("trash move failed for {path} ({e}); removing in place");
                if let Err(e) = std::fs::remove_file(&file) {
                    log::warn!("failed to delete {path}: {e}");
                }
            }
        }
        self.ignore.release(&file);
    }

    async fn on_history_lost(&mut self, doc_id: String, sink: &mut WsSink) -> Result<()> {
        log::warn!("relay lost history for {doc_id}; re-seeding from its snapshot");
        if doc_id != INDEX_DOC_ID {
            // Discard local state and accept the relay snapshot as ground
            // truth; the re-fetched content overwrites the disk copy.
            self.replica.drop_doc(&doc_id);
            if let Err(e) = self.state.delete_doc(&doc_id) {
                log::warn!("failed to forget {doc_id}: {e}");
            }
        }
        send_frame(sink, Frame::new(MsgType::SyncStep1, doc_id, Vec::new())).await
    }

    /// Watcher event: queue the path for a debounced flush.
    fn on_vault_event(&mut self, event: VaultEvent) {
        let path = event.path();
        if self.ignore.is_ignored(path) {
            return;
        }
        if scan::doc_id_for(&self.cfg.dir, path).is_none() {
            return;
        }
        self.pending
            .insert(path.to_path_buf(), Instant::now() + DEBOUNCE_WINDOW);
        self.lamp.set(LampState::Syncing);
    }

    /// Flush every debounced path whose window elapsed.
    async fn flush_due(&mut self, sink: &mut WsSink) -> Result<()> {
        let now = Instant::now();
        let due: Vec<PathBuf> = self
            .pending
            .iter()
            .filter(|(_, deadline)| **deadline <= now)
            .map(|(path, _)| path.clone())
            .collect();

        for path in due {
            self.pending.remove(&path);
            self.flush_path(&path, sink).await?;
        }

        if self.pending.is_empty()
            && self.pending_blob_gets.is_empty()
            && self.lamp.get() == LampState::Syncing
        {
            self.lamp.set(LampState::Synced);
        }
        Ok(())
    }

    /// Reconcile one settled path. Filesystem problems log and skip; only
    /// transport failures propagate (and trigger a reconnect).
    async fn flush_path(&mut self, path: &Path, sink: &mut WsSink) -> Result<()> {
        let Some(doc_id) = scan::doc_id_for(&self.cfg.dir, path) else {
            return Ok(());
        };

        if !path.exists() {
            // Deletion propagates through the index only.
            if self.replica.index().contains(&doc_id) {
                log::info!("{doc_id} deleted locally");
                self.replica.index().remove(&doc_id);
            }
            self.replica.drop_doc(&doc_id);
            if let Err(e) = self.state.delete_doc(&doc_id) {
                log::warn!("failed to forget {doc_id}: {e}");
            }
            if let Err(e) = self.state.delete_blob_state(&doc_id) {
                log::warn!("failed to forget blob state for {doc_id}: {e}");
            }
            return Ok(());
        }
        if path.is_dir() {
            return Ok(());
        }

        if scan::is_text_path(path) {
            let content = match std::fs::read_to_string(path) {
                Ok(content) => content,
                Err(e) => {
                    log::warn!("skipping unreadable file {path:?}: {e}");
                    return Ok(());
                }
            };
            let known = self.replica.contains_doc(&doc_id);
            self.replica.update(&doc_id, &content);
            if !known {
                self.persist_doc(&doc_id);
                let sv = self
                    .replica
                    .doc(&doc_id)
                    .map(|doc| doc.encode_state_vector())
                    .unwrap_or_default();
                send_frame(sink, Frame::new(MsgType::SyncStep1, doc_id.clone(), sv)).await?;
            }
            if !self.replica.index().contains(&doc_id) {
                if let Err(e) = self.replica.index().insert(&doc_id, &IndexEntry::text()) {
                    log::warn!("failed to index {doc_id}: {e}");
                }
            }
        } else {
            let bytes = match std::fs::read(path) {
                Ok(bytes) => bytes,
                Err(e) => {
                    log::warn!("skipping unreadable file {path:?}: {e}");
                    return Ok(());
                }
            };
            let hash = blob::hash_bytes(&bytes);
            let unchanged = self
                .state
                .blob_state(&doc_id)
                .ok()
                .flatten()
                .is_some_and(|last| last.hash == hash);
            if unchanged {
                return Ok(());
            }
            self.upload_blob(&doc_id, sink).await?;
        }
        Ok(())
    }

    /// Write remote text content to disk on a short-lived task, fenced
    /// against the watcher.
    fn write_text_file(&self, doc_id: &str, content: String) {
        let path = scan::path_for(&self.cfg.dir, doc_id);
        let ignore = self.ignore.clone();
        tokio::spawn(async move {
            ignore.shield(&path);
            if let Some(parent) = path.parent() {
                let _ = tokio::fs::create_dir_all(parent).await;
            }
            if let Err(e) = tokio::fs::write(&path, content.as_bytes()).await {
                log::warn!("failed to write {path:?}: {e}");
            }
            ignore.release(&path);
        });
    }

    /// Persist a document's (or the index's) encoded state.
    fn persist_doc(&self, doc_id: &str) {
        let state = if doc_id == INDEX_DOC_ID {
            Some(self.replica.index().encode_state_as_update())
        } else {
            self.replica
                .doc(doc_id)
                .map(|doc| doc.encode_state_as_update())
        };
        if let Some(state) = state
            && let Err(e) = self.state.save_doc(doc_id, &state)
        {
            log::warn!("failed to persist {doc_id}: {e}");
        }
    }
}

async fn send_frame(sink: &mut WsSink, frame: Frame) -> Result<()> {
    sink.send(Message::Binary(frame.encode().into())).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_daemon(dir: &Path) -> (Daemon, UnboundedReceiver<LocalUpdate>) {
        Daemon::new(Config {
            dir: dir.to_path_buf(),
            url: "ws://127.0.0.1:1/sync".to_string(),
            name: "testhost".to_string(),
        })
        .unwrap()
    }

    #[test]
    fn test_ignore_set_fences_until_grace_expires() {
        let ignore = IgnoreSet::new();
        let path = Path::new("/vault/a.md");
        assert!(!ignore.is_ignored(path));

        ignore.shield(path);
        assert!(ignore.is_ignored(path));

        // Still fenced during the grace period right after release.
        ignore.release(path);
        assert!(ignore.is_ignored(path));
    }

    #[tokio::test]
    async fn test_restores_persisted_docs() {
        let dir = tempfile::tempdir().unwrap();
        {
            let state = FolderState::open(dir.path()).unwrap();
            let doc = syncline_core::TextCrdt::new("a.md");
            doc.set_text("persisted");
            state.save_doc("a.md", &doc.encode_state_as_update()).unwrap();
        }
        // The file is still on disk, so the restore is not a deletion.
        std::fs::write(dir.path().join("a.md"), "persisted").unwrap();

        let (daemon, _rx) = test_daemon(dir.path());
        assert_eq!(daemon.replica.get_text("a.md").unwrap(), "persisted");
    }

    #[tokio::test]
    async fn test_vault_events_are_debounced_per_path() {
        let dir = tempfile::tempdir().unwrap();
        let (mut daemon, _rx) = test_daemon(dir.path());
        let path = dir.path().join("a.md");

        daemon.on_vault_event(VaultEvent::Touched(path.clone()));
        daemon.on_vault_event(VaultEvent::Touched(path.clone()));
        daemon.on_vault_event(VaultEvent::Touched(path));
        assert_eq!(daemon.pending.len(), 1);
        assert_eq!(daemon.lamp.get(), LampState::Syncing);
    }

    #[tokio::test]
    async fn test_vault_events_respect_ignore_set() {
        let dir = tempfile::tempdir().unwrap();
        let (mut daemon, _rx) = test_daemon(dir.path());
        let path = dir.path().join("a.md");

        daemon.ignore.shield(&path);
        daemon.on_vault_event(VaultEvent::Touched(path));
        assert!(daemon.pending.is_empty());
    }

    #[tokio::test]
    async fn test_remote_deletion_moves_file_to_trash() {
        let dir = tempfile::tempdir().unwrap();
        let (mut daemon, _rx) = test_daemon(dir.path());
        let file = dir.path().join("gone.md");
        std::fs::write(&file, "bye").unwrap();

        daemon.on_remote_deletion("gone.md");

        assert!(!file.exists());
        let trash = dir.path().join(".syncline/trash");
        let trashed: Vec<_> = std::fs::read_dir(&trash).unwrap().collect();
        assert_eq!(trashed.len(), 1);
    }

    #[tokio::test]
    async fn test_blob_data_writes_and_records_state() {
        let dir = tempfile::tempdir().unwrap();
        let (mut daemon, _rx) = test_daemon(dir.path());

        let bytes = b"\x89PNG payload".to_vec();
        let hash = blob::hash_bytes(&bytes);
        daemon
            .pending_blob_gets
            .insert(hash.clone(), vec!["img/logo.png".to_string()]);

        daemon.on_blob_data(hash.clone(), bytes.clone());

        // The write runs on a spawned task.
        for _ in 0..50 {
            if dir.path().join("img/logo.png").exists() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(std::fs::read(dir.path().join("img/logo.png")).unwrap(), bytes);

        for _ in 0..50 {
            if daemon.state.blob_state("img/logo.png").unwrap().is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        let recorded = daemon.state.blob_state("img/logo.png").unwrap().unwrap();
        assert_eq!(recorded.hash, hash);
    }

    #[tokio::test]
    async fn test_corrupt_blob_data_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let (mut daemon, _rx) = test_daemon(dir.path());

        daemon
            .pending_blob_gets
            .insert("nothexofthis".to_string(), vec!["x.bin".to_string()]);
        daemon.on_blob_data("nothexofthis".to_string(), b"bytes".to_vec());

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!dir.path().join("x.bin").exists());
    }
}
