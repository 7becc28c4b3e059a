//! The synchronization hub.
//!
//! Owns the file set, the connection-ID map, the peer table and the pull
//! machinery. Protocol callbacks (`index`, `index_update`, `request`,
//! `close`) and scanner callbacks (`replace_local`, `seed_local`,
//! `current_file`) all land here. A model starts read-only: it serves its
//! index and file data but never alters the repository until `start_rw`.
//!
//! Lock ordering, top-down: peer-connection lock, then the file-set lock,
//! then the run-state lock. Wire I/O always happens outside all of them.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::{Arc, Weak};
use std::time::Instant;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt, SeekFrom};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, info, warn};

use crate::cid::{self, LOCAL_ID};
use crate::files::{FileRecord, Set};
use crate::limiter::RateLimiter;
use crate::paths;
use crate::proto::{file_from_info, info_from_file, Connection, FileInfo, DEFAULT_REPO};
use crate::puller::{run_worker, BlockQueue, CompletionSink, PeerDirectory, Puller};
use crate::scanner::{self, CurrentFiler};

/// Wait at least this long after the last index change before broadcasting.
pub const IDX_BCAST_HOLDTIME: Duration = Duration::from_secs(15);
/// Broadcast pending changes no later than this, even under constant churn.
pub const IDX_BCAST_MAX_DELAY: Duration = Duration::from_secs(120);

const BCAST_TICK: Duration = Duration::from_secs(5);

/// Typed refusals surfaced to a requesting peer.
#[derive(Debug, Error)]
pub enum RequestError {
    #[error("no such file")]
    NoSuchFile,

    #[error("file is invalid")]
    Invalid,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

struct IndexState {
    cm: cid::Map,
    fs: Set,
}

#[derive(Default)]
struct RunState {
    rw_running: bool,
    delete: bool,
    parallel_requests: usize,
}

pub struct Model {
    dir: PathBuf,

    /// The coarse lock over the file set and the connection-ID map.
    index: Mutex<IndexState>,

    conns: RwLock<HashMap<String, Arc<dyn Connection>>>,

    bq: Arc<BlockQueue>,
    puller: Arc<Puller>,

    delete_tx: mpsc::UnboundedSender<FileRecord>,
    delete_rx: Mutex<Option<mpsc::UnboundedReceiver<FileRecord>>>,

    run: Mutex<RunState>,
    limiter: Mutex<Option<Arc<RateLimiter>>>,
}

impl Model {
    /// Creates a model for the repository at `dir` and starts its broadcast
    /// and monitor tasks. The model is read-only until [`Model::start_rw`].
    pub fn new(dir: impl Into<PathBuf>) -> Arc<Self> {
        let dir = dir.into();
        let (delete_tx, delete_rx) = mpsc::unbounded_channel();

        let model = Arc::new_cyclic(|weak: &Weak<Model>| Model {
            puller: Puller::new(dir.clone(), Arc::new(ModelSink(weak.clone()))),
            dir,
            index: Mutex::new(IndexState {
                cm: cid::Map::new(),
                fs: Set::new(),
            }),
            conns: RwLock::new(HashMap::new()),
            bq: Arc::new(BlockQueue::new()),
            delete_tx,
            delete_rx: Mutex::new(Some(delete_rx)),
            run: Mutex::new(RunState::default()),
            limiter: Mutex::new(None),
        });

        tokio::spawn(broadcast_loop(Arc::downgrade(&model)));
        model
    }

    /// Switches on read/write processing: pulling needed files from peers
    /// and, when `delete` is set, honouring cluster deletions.
    ///
    /// Panics if called twice; that is a caller bug.
    pub fn start_rw(self: &Arc<Self>, delete: bool, parallel_requests: usize) {
        {
            let mut run = self.run.lock();
            if run.rw_running {
                panic!("start_rw on an already running model");
            }
            run.rw_running = true;
            run.delete = delete;
            run.parallel_requests = parallel_requests.max(1);
        }

        if delete {
            if let Some(rx) = self.delete_rx.lock().take() {
                tokio::spawn(delete_loop(Arc::downgrade(self), rx));
            }
        }
    }

    /// Caps outbound request serving to `kbps` kilobytes per second.
    pub fn limit_send_rate(&self, kbps: u64) {
        *self.limiter.lock() = Some(RateLimiter::new(kbps));
    }

    // =========================================================================
    // Protocol surface
    // =========================================================================

    /// Full index from a freshly connected peer.
    pub fn index(&self, node_id: &str, files: Vec<FileInfo>) {
        let records: Vec<FileRecord> = files.into_iter().map(file_from_info).collect();
        debug!(node = node_id, files = records.len(), "index received");

        let mut index = self.index.lock();
        let slot = index.cm.get(node_id);
        index.fs.set_remote(slot, records);
        self.queue_needed(&mut index);
    }

    /// Incremental update to a connected peer's index.
    pub fn index_update(&self, node_id: &str, files: Vec<FileInfo>) {
        let records: Vec<FileRecord> = files.into_iter().map(file_from_info).collect();
        debug!(node = node_id, files = records.len(), "index update received");

        let mut index = self.index.lock();
        let slot = index.cm.get(node_id);
        index.fs.add_remote(slot, records);
        self.queue_needed(&mut index);
    }

    /// Serves a data segment from the local repository.
    pub async fn request(
        &self,
        node_id: &str,
        _repo: &str,
        name: &str,
        offset: u64,
        size: u32,
    ) -> Result<Bytes, RequestError> {
        let local = self.index.lock().fs.get(LOCAL_ID, name);
        if offset > local.size {
            warn!(
                node = node_id,
                name, offset, size, "SECURITY: request outside local file"
            );
            return Err(RequestError::NoSuchFile);
        }
        if local.suppressed {
            return Err(RequestError::Invalid);
        }

        debug!(node = node_id, name, offset, size, "serving request");
        let path = paths::validate(&self.dir, name).map_err(|_| RequestError::NoSuchFile)?;
        let mut fd = tokio::fs::File::open(&path).await?;
        fd.seek(SeekFrom::Start(offset)).await?;
        let mut buf = vec![0u8; size as usize];
        fd.read_exact(&mut buf).await?;

        let limiter = self.limiter.lock().clone();
        if let Some(limiter) = limiter {
            limiter.take(buf.len()).await;
        }

        Ok(Bytes::from(buf))
    }

    /// Removes a peer: its slot is reset (re-triggering need and
    /// availability computation) and its workers wind down on their own.
    pub fn close(&self, node_id: &str, reason: &str) {
        warn!(node = node_id, reason, "connection closed");

        self.conns.write().remove(node_id);

        let mut index = self.index.lock();
        let slot = index.cm.get(node_id);
        index.fs.set_remote(slot, Vec::new());
        index.cm.clear(node_id);
    }

    /// Registers a peer connection and sends it our full index.
    pub fn add_connection(self: &Arc<Self>, conn: Arc<dyn Connection>) {
        let node_id = conn.id();
        self.conns
            .write()
            .insert(node_id.clone(), Arc::clone(&conn));

        let index = self.protocol_index();
        {
            let conn = Arc::clone(&conn);
            tokio::spawn(async move {
                debug!(node = %conn.id(), files = index.len(), "sending initial index");
                conn.index(DEFAULT_REPO, index).await;
            });
        }

        let run = self.run.lock();
        if run.rw_running {
            let directory: Arc<dyn PeerDirectory> = Arc::clone(self) as _;
            for _ in 0..run.parallel_requests {
                tokio::spawn(run_worker(
                    node_id.clone(),
                    Arc::clone(&self.bq),
                    Arc::clone(&self.puller),
                    Arc::clone(&directory),
                ));
            }
        }
    }

    pub fn connected_to(&self, node_id: &str) -> bool {
        self.conns.read().contains_key(node_id)
    }

    /// The current local index in wire form.
    pub fn protocol_index(&self) -> Vec<FileInfo> {
        let have = self.index.lock().fs.have(LOCAL_ID);
        have.iter().map(info_from_file).collect()
    }

    // =========================================================================
    // Scanner surface
    // =========================================================================

    /// Replaces the local index after a scan; vanished names become
    /// tombstones.
    pub fn replace_local(&self, files: Vec<FileRecord>) {
        let mut index = self.index.lock();
        index.fs.set_local(files);
        self.queue_needed(&mut index);
    }

    /// Seeds the local index from the persisted cache at startup, without
    /// tombstone synthesis.
    pub fn seed_local(&self, files: Vec<FileInfo>) {
        let records: Vec<FileRecord> = files.into_iter().map(file_from_info).collect();
        self.index.lock().fs.set_local_no_delete(records);
    }

    /// The local record for `name` as of the last scan, letting the walker
    /// skip rehashing when the modification time is unchanged.
    pub fn current_file(&self, name: &str) -> Option<FileRecord> {
        let f = self.index.lock().fs.get(LOCAL_ID, name);
        (f.version > 0).then_some(f)
    }

    // =========================================================================
    // Aggregates
    // =========================================================================

    /// An opaque value guaranteed to change whenever the local repository or
    /// the global view does.
    pub fn generation(&self) -> u64 {
        self.index.lock().fs.changes()
    }

    /// Files, deleted entries and bytes in the global view.
    pub fn global_size(&self) -> (usize, usize, u64) {
        size_of(&self.index.lock().fs.global())
    }

    /// Files, deleted entries and bytes in the local repository.
    pub fn local_size(&self) -> (usize, usize, u64) {
        size_of(&self.index.lock().fs.have(LOCAL_ID))
    }

    /// Currently needed files and their total size.
    pub fn need_files(&self) -> (Vec<FileRecord>, u64) {
        let need = self.index.lock().fs.need(LOCAL_ID);
        let bytes = need.iter().map(|f| f.size).sum::<u64>();
        (need, bytes)
    }

    // =========================================================================
    // Internals
    // =========================================================================

    /// Turns the need list into block plans. Tombstones go to the delete
    /// queue, suppressed records are skipped, everything else is diffed
    /// against the current local blocks and queued once.
    fn queue_needed(&self, index: &mut IndexState) {
        let run = self.run.lock();
        if !run.rw_running {
            return;
        }
        let allow_delete = run.delete;
        drop(run);

        for needed in index.fs.need(LOCAL_ID) {
            if needed.suppressed {
                continue;
            }
            if needed.is_deleted() {
                if allow_delete {
                    let _ = self.delete_tx.send(needed);
                }
                continue;
            }
            if self.bq.contains(&needed.name) {
                continue;
            }

            let local = index.fs.get(LOCAL_ID, &needed.name);
            let availability = index.fs.availability(&needed.name);
            let (have, need) = scanner::block_diff(&local.blocks, &needed.blocks);
            debug!(
                name = %needed.name,
                version = needed.version,
                copy = have.len(),
                fetch = need.len(),
                "queueing blocks"
            );
            self.bq.add(needed, have, need, availability);
        }
    }

    fn update_local(&self, file: FileRecord) {
        let mut index = self.index.lock();
        index.fs.add_local(vec![file]);
    }
}

impl CurrentFiler for Model {
    fn current_file(&self, name: &str) -> Option<FileRecord> {
        Model::current_file(self, name)
    }
}

#[async_trait::async_trait]
impl PeerDirectory for Model {
    fn holders(&self, availability: u64) -> Vec<String> {
        let conns = self.conns.read();
        let index = self.index.lock();
        conns
            .keys()
            .filter(|name| {
                matches!(index.cm.lookup(name), Some(slot) if availability & (1u64 << slot) != 0)
            })
            .cloned()
            .collect()
    }

    fn is_connected(&self, node: &str) -> bool {
        self.connected_to(node)
    }

    async fn request(
        &self,
        node: &str,
        name: &str,
        offset: u64,
        size: u32,
    ) -> anyhow::Result<Bytes> {
        let conn = self
            .conns
            .read()
            .get(node)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("not connected: {}", node))?;
        debug!(node, name, offset, size, "requesting block");
        conn.request(DEFAULT_REPO, name, offset, size).await
    }
}

/// Routes verified files back into the local index without keeping the
/// model alive from inside its own monitor task.
struct ModelSink(Weak<Model>);

impl CompletionSink for ModelSink {
    fn file_completed(&self, file: FileRecord) {
        if let Some(model) = self.0.upgrade() {
            model.update_local(file);
        }
    }
}

fn size_of(files: &[FileRecord]) -> (usize, usize, u64) {
    let mut live = 0;
    let mut deleted = 0;
    let mut bytes = 0;
    for f in files {
        if f.is_deleted() {
            deleted += 1;
        } else {
            live += 1;
            bytes += f.size;
        }
    }
    (live, deleted, bytes)
}

/// Broadcasts the local index to every connected peer once changes go quiet
/// for the hold time, or unconditionally after the max delay. Coalesces
/// scanner bursts into one index message.
async fn broadcast_loop(model: Weak<Model>) {
    let mut tick = tokio::time::interval(BCAST_TICK);
    let mut last_sent: u64 = 0;
    let mut observed: u64 = 0;
    let mut last_change = Instant::now();
    let mut last_broadcast = Instant::now();

    loop {
        tick.tick().await;
        let Some(model) = model.upgrade() else { return };

        let current = model.generation();
        if current != observed {
            observed = current;
            last_change = Instant::now();
        }
        if current == last_sent {
            continue;
        }
        let now = Instant::now();
        if now.duration_since(last_change) < IDX_BCAST_HOLDTIME
            && now.duration_since(last_broadcast) < IDX_BCAST_MAX_DELAY
        {
            continue;
        }

        last_sent = current;
        last_broadcast = now;

        let index = model.protocol_index();
        let conns: Vec<Arc<dyn Connection>> = model.conns.read().values().cloned().collect();
        drop(model);

        let mut sends = Vec::with_capacity(conns.len());
        for conn in conns {
            let index = index.clone();
            sends.push(tokio::spawn(async move {
                debug!(node = %conn.id(), files = index.len(), "broadcasting index");
                conn.index(DEFAULT_REPO, index).await;
            }));
        }
        for send in sends {
            let _ = send.await;
        }
    }
}

/// Unlinks cluster-deleted files and records their tombstones locally.
async fn delete_loop(model: Weak<Model>, mut rx: mpsc::UnboundedReceiver<FileRecord>) {
    while let Some(file) = rx.recv().await {
        let Some(model) = model.upgrade() else { return };

        info!(name = %file.name, "deleting per cluster state");
        match paths::validate(&model.dir, &file.name) {
            Ok(path) => {
                if let Err(e) = tokio::fs::remove_file(&path).await {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        warn!(name = %file.name, error = %e, "delete failed");
                    }
                }
            }
            Err(e) => warn!(name = %file.name, error = %e, "refusing delete"),
        }

        model.update_local(file);
    }
}
