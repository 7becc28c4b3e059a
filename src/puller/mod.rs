//! Block pullers and the per-file write monitor.
//!
//! Workers drain the block queue. Copy orders and fetch results funnel into
//! a single monitor task that owns every open temp file, so per-file state
//! needs no locking. Fetches go to the least-busy connected peer advertising
//! the block; a sticky per-file error cancels the rest of a failed transfer
//! cooperatively.

mod queue;

pub use queue::{BlockQueue, CopyOrder, FetchOrder, WorkItem};

use anyhow::Context;
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};
use tokio::sync::mpsc;
use tokio::time::Duration;
use tracing::{debug, warn};

use crate::files::{Block, FileRecord};
use crate::paths;
use crate::scanner::{hash_blocks, BLOCK_SIZE};
use crate::temp_file::{TempFileGuard, TempNamer};

/// How long to park a fetch when no connected peer has the block, and how
/// many times to retry before abandoning it for the next need recomputation.
const PARK_DELAY: Duration = Duration::from_secs(1);
const PARK_ATTEMPTS: usize = 60;

/// Directory of currently connected peers, as the pullers see it.
#[async_trait]
pub trait PeerDirectory: Send + Sync {
    /// Connected peers whose slot bit is set in `availability`.
    fn holders(&self, availability: u64) -> Vec<String>;

    /// True while the named peer remains connected.
    fn is_connected(&self, node: &str) -> bool;

    /// Issues a block request to the named peer.
    async fn request(
        &self,
        node: &str,
        name: &str,
        offset: u64,
        size: u32,
    ) -> anyhow::Result<Bytes>;
}

/// Receives files that were written, verified and renamed into place.
pub trait CompletionSink: Send + Sync {
    fn file_completed(&self, file: FileRecord);
}

enum MonitorMsg {
    Copy(CopyOrder),
    Fetched { order: FetchOrder, data: Bytes },
    Failed { order: FetchOrder, error: String },
}

/// Shared puller state: per-peer outstanding counters and the monitor inlet.
pub struct Puller {
    outstanding: Mutex<HashMap<String, usize>>,
    monitor_tx: mpsc::UnboundedSender<MonitorMsg>,
}

impl Puller {
    /// Starts the monitor task writing under `dir` and returns the shared
    /// handle.
    pub fn new(dir: PathBuf, sink: Arc<dyn CompletionSink>) -> Arc<Self> {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(
            Monitor {
                dir,
                namer: TempNamer,
                sink,
                open: HashMap::new(),
            }
            .run(rx),
        );
        Arc::new(Self {
            outstanding: Mutex::new(HashMap::new()),
            monitor_tx: tx,
        })
    }

    /// Least-busy selection: the candidate with the fewest outstanding
    /// requests, ties broken by iteration order.
    pub fn select_peer(&self, candidates: &[String]) -> Option<String> {
        let outstanding = self.outstanding.lock();
        candidates
            .iter()
            .min_by_key(|node| outstanding.get(node.as_str()).copied().unwrap_or(0))
            .cloned()
    }

    pub fn begin(&self, node: &str) {
        *self.outstanding.lock().entry(node.to_string()).or_insert(0) += 1;
    }

    pub fn finish(&self, node: &str) {
        if let Some(count) = self.outstanding.lock().get_mut(node) {
            *count = count.saturating_sub(1);
        }
    }

    pub fn outstanding_for(&self, node: &str) -> usize {
        self.outstanding.lock().get(node).copied().unwrap_or(0)
    }
}

/// Runs one puller worker bound to `peer`. The binding controls lifecycle
/// and parallelism only; each fetch is dispatched to the least-busy peer
/// advertising the block. Exits when the peer disconnects or the queue
/// closes.
pub async fn run_worker(
    peer: String,
    queue: Arc<BlockQueue>,
    puller: Arc<Puller>,
    directory: Arc<dyn PeerDirectory>,
) {
    debug!(peer = %peer, "puller worker started");
    loop {
        if !directory.is_connected(&peer) {
            debug!(peer = %peer, "puller worker exiting");
            return;
        }
        let Some(item) = queue.get().await else { return };
        match item {
            WorkItem::Copy(order) => {
                if puller.monitor_tx.send(MonitorMsg::Copy(order)).is_err() {
                    return;
                }
            }
            WorkItem::Fetch(order) => fetch_block(&puller, &directory, order).await,
        }
    }
}

async fn fetch_block(puller: &Puller, directory: &Arc<dyn PeerDirectory>, order: FetchOrder) {
    let mut attempts = 0;
    let node = loop {
        let holders = directory.holders(order.availability);
        if let Some(node) = puller.select_peer(&holders) {
            break node;
        }
        attempts += 1;
        if attempts >= PARK_ATTEMPTS {
            let _ = puller.monitor_tx.send(MonitorMsg::Failed {
                order,
                error: "no connected peer has the block".to_string(),
            });
            return;
        }
        tokio::time::sleep(PARK_DELAY).await;
    };

    puller.begin(&node);
    let res = directory
        .request(&node, &order.file.name, order.block.offset, order.block.size)
        .await;
    puller.finish(&node);

    let msg = match res {
        Ok(data) => MonitorMsg::Fetched { order, data },
        Err(e) => {
            debug!(node = %node, error = %e, "block request failed");
            MonitorMsg::Failed {
                order,
                error: e.to_string(),
            }
        }
    };
    let _ = puller.monitor_tx.send(msg);
}

/// Per-file transfer state, owned exclusively by the monitor task.
struct OpenFile {
    record: Arc<FileRecord>,
    real_path: PathBuf,
    temp_path: PathBuf,
    file: Option<File>,
    guard: Option<TempFileGuard>,

    /// Sticky: the first error cancels everything that follows for this
    /// file until a fresh global update re-queues it.
    error: Option<String>,

    /// Set once the copy order has been processed; carries the number of
    /// fetch results to wait for.
    expected: Option<usize>,
    results: usize,
    copied: bool,
}

struct Monitor {
    dir: PathBuf,
    namer: TempNamer,
    sink: Arc<dyn CompletionSink>,
    open: HashMap<String, OpenFile>,
}

impl Monitor {
    async fn run(mut self, mut rx: mpsc::UnboundedReceiver<MonitorMsg>) {
        while let Some(msg) = rx.recv().await {
            match msg {
                MonitorMsg::Copy(order) => self.handle_copy(order).await,
                MonitorMsg::Fetched { order, data } => self.handle_fetched(order, data).await,
                MonitorMsg::Failed { order, error } => self.handle_failed(order, error).await,
            }
        }
    }

    async fn handle_copy(&mut self, order: CopyOrder) {
        let name = order.file.name.clone();
        self.ensure_open(&order.file).await;
        if let Some(of) = self.open.get_mut(&name) {
            of.copied = true;
            of.expected = Some(order.fetches);

            if of.error.is_none() && !order.have.is_empty() {
                let src = of.real_path.clone();
                let res = match of.file.as_mut() {
                    Some(temp) => copy_blocks(&src, temp, &order.have).await,
                    None => Ok(()),
                };
                if let Err(e) = res {
                    warn!(name = %name, error = %e, "block copy failed");
                    of.error = Some(e.to_string());
                }
            }
        }
        self.maybe_finalize(&name).await;
    }

    async fn handle_fetched(&mut self, order: FetchOrder, data: Bytes) {
        let name = order.file.name.clone();
        self.ensure_open(&order.file).await;
        if let Some(of) = self.open.get_mut(&name) {
            of.results += 1;
            if of.error.is_none() {
                if data.len() != order.block.size as usize {
                    of.error = Some(format!(
                        "short block at {}: got {} bytes, want {}",
                        order.block.offset,
                        data.len(),
                        order.block.size
                    ));
                } else if let Some(temp) = of.file.as_mut() {
                    let res = async {
                        temp.seek(SeekFrom::Start(order.block.offset)).await?;
                        temp.write_all(&data).await
                    }
                    .await;
                    if let Err(e) = res {
                        warn!(name = %name, error = %e, "block write failed");
                        of.error = Some(e.to_string());
                    }
                }
            }
        }
        self.maybe_finalize(&name).await;
    }

    async fn handle_failed(&mut self, order: FetchOrder, error: String) {
        let name = order.file.name.clone();
        self.ensure_open(&order.file).await;
        if let Some(of) = self.open.get_mut(&name) {
            of.results += 1;
            if of.error.is_none() {
                warn!(name = %name, error = %error, "fetch failed; abandoning file until next update");
                of.error = Some(error);
            }
        }
        self.maybe_finalize(&name).await;
    }

    /// Creates the open-file entry on the first work item for a file,
    /// whichever item that turns out to be.
    async fn ensure_open(&mut self, record: &Arc<FileRecord>) {
        if self.open.contains_key(&record.name) {
            return;
        }
        let of = match self.open_file(record).await {
            Ok(of) => of,
            Err(e) => {
                warn!(name = %record.name, error = %e, "cannot start transfer");
                OpenFile {
                    record: Arc::clone(record),
                    real_path: PathBuf::new(),
                    temp_path: PathBuf::new(),
                    file: None,
                    guard: None,
                    error: Some(e.to_string()),
                    expected: None,
                    results: 0,
                    copied: false,
                }
            }
        };
        self.open.insert(record.name.clone(), of);
    }

    async fn open_file(&self, record: &Arc<FileRecord>) -> anyhow::Result<OpenFile> {
        let real_path = paths::validate(&self.dir, &record.name)?;
        if let Some(parent) = real_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let temp_path = self.namer.temp_name(&real_path);
        let guard = TempFileGuard::new(&temp_path);

        let mut opts = OpenOptions::new();
        opts.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            let mode = record.mode();
            opts.mode(if mode == 0 { 0o644 } else { mode });
        }
        let file = opts.open(&temp_path).await.context("open temp file")?;

        debug!(name = %record.name, temp = %temp_path.display(), "transfer started");
        Ok(OpenFile {
            record: Arc::clone(record),
            real_path,
            temp_path,
            file: Some(file),
            guard: Some(guard),
            error: None,
            expected: None,
            results: 0,
            copied: false,
        })
    }

    /// Once the copy has run and every fetch result is in: close, verify,
    /// rename, report. On a sticky error the entry just drops and the guard
    /// removes the temp.
    async fn maybe_finalize(&mut self, name: &str) {
        let ready = match self.open.get(name) {
            Some(of) => of.copied && of.expected == Some(of.results),
            None => false,
        };
        if !ready {
            return;
        }
        let Some(mut of) = self.open.remove(name) else {
            return;
        };

        if let Some(error) = &of.error {
            warn!(name, error = %error, "transfer abandoned");
            return;
        }

        if let Some(mut file) = of.file.take() {
            let res = async {
                file.flush().await?;
                file.sync_all().await
            }
            .await;
            if let Err(e) = res {
                warn!(name = %name, error = %e, "finalize failed");
                return;
            }
        }

        // Rehash the temp file; the rename is gated on the content matching
        // the record block for block. The record's own blocking dictates the
        // chunk size: every block but the final one is full-sized.
        let temp = of.temp_path.clone();
        let want = of.record.blocks.clone();
        let block_size = match want.first() {
            Some(first) if want.len() > 1 => first.size as usize,
            _ => BLOCK_SIZE,
        };
        let verified = tokio::task::spawn_blocking(move || {
            let fd = std::fs::File::open(&temp)?;
            let got = hash_blocks(fd, block_size)?;
            Ok::<bool, std::io::Error>(
                got.len() == want.len()
                    && got
                        .iter()
                        .zip(&want)
                        .all(|(g, w)| g.size == w.size && g.hash == w.hash),
            )
        })
        .await;

        match verified {
            Ok(Ok(true)) => {}
            Ok(Ok(false)) => {
                warn!(name, "content hash mismatch after transfer");
                return;
            }
            Ok(Err(e)) => {
                warn!(name = %name, error = %e, "verification failed");
                return;
            }
            Err(e) => {
                warn!(name = %name, error = %e, "verification task failed");
                return;
            }
        }

        if let Err(e) = fs::rename(&of.temp_path, &of.real_path).await {
            warn!(name = %name, error = %e, "rename failed");
            return;
        }
        if let Some(guard) = of.guard.take() {
            guard.defuse();
        }

        let mtime = filetime::FileTime::from_unix_time(of.record.modified, 0);
        let real = of.real_path.clone();
        let _ = tokio::task::spawn_blocking(move || filetime::set_file_mtime(&real, mtime)).await;

        debug!(name, "transfer complete");
        self.sink.file_completed((*of.record).clone());
    }
}

/// Lifts reusable blocks out of the previous version of the file into the
/// temp file, offset for offset.
async fn copy_blocks(src_path: &Path, temp: &mut File, have: &[Block]) -> anyhow::Result<()> {
    let mut src = File::open(src_path)
        .await
        .context("open previous version for block reuse")?;

    let mut buf = Vec::new();
    for block in have {
        buf.resize(block.size as usize, 0);
        src.seek(SeekFrom::Start(block.offset)).await?;
        src.read_exact(&mut buf).await?;
        temp.seek(SeekFrom::Start(block.offset)).await?;
        temp.write_all(&buf).await?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::fs as stdfs;
    use tempfile::TempDir;
    use tokio::time::sleep;

    struct RecordingSink(Mutex<Vec<FileRecord>>);
    impl CompletionSink for RecordingSink {
        fn file_completed(&self, file: FileRecord) {
            self.0.lock().push(file);
        }
    }

    fn target_record(name: &str, content: &[u8]) -> FileRecord {
        FileRecord {
            name: name.to_string(),
            version: 42,
            size: content.len() as u64,
            modified: 1_400_000_000,
            blocks: hash_blocks(content, BLOCK_SIZE).unwrap(),
            ..Default::default()
        }
    }

    async fn settle() {
        // Let the monitor task drain its inbox.
        for _ in 0..50 {
            sleep(Duration::from_millis(10)).await;
        }
    }

    #[tokio::test]
    async fn test_select_peer_least_busy() {
        let dir = TempDir::new().unwrap();
        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let puller = Puller::new(dir.path().to_path_buf(), sink);

        let a = "peer-a".to_string();
        let b = "peer-b".to_string();
        for _ in 0..3 {
            puller.begin(&a);
        }
        puller.begin(&b);

        let picked = puller.select_peer(&[a.clone(), b.clone()]).unwrap();
        assert_eq!(picked, b);
        puller.begin(&picked);
        assert_eq!(puller.outstanding_for(&b), 2);
        assert_eq!(puller.outstanding_for(&a), 3);

        // Ties go to iteration order.
        let empty = puller.select_peer(&[]);
        assert!(empty.is_none());
    }

    #[tokio::test]
    async fn test_fetch_then_copy_completes_and_reports() {
        let dir = TempDir::new().unwrap();
        let content = b"0123456789abcdef".to_vec();
        let record = Arc::new(target_record("sub/out.bin", &content));

        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let puller = Puller::new(dir.path().to_path_buf(), Arc::clone(&sink) as _);

        // Results may reach the monitor before the copy order; both orders
        // must converge on the same open file.
        puller
            .monitor_tx
            .send(MonitorMsg::Fetched {
                order: FetchOrder {
                    file: Arc::clone(&record),
                    block: record.blocks[0].clone(),
                    last: true,
                    availability: 1 << 1,
                },
                data: Bytes::from(content.clone()),
            })
            .unwrap();
        puller
            .monitor_tx
            .send(MonitorMsg::Copy(CopyOrder {
                file: Arc::clone(&record),
                have: Vec::new(),
                last: false,
                fetches: 1,
            }))
            .unwrap();

        settle().await;

        let final_path = dir.path().join("sub/out.bin");
        assert_eq!(stdfs::read(&final_path).unwrap(), content);
        assert_eq!(sink.0.lock().len(), 1);
        assert_eq!(sink.0.lock()[0].version, 42);
        assert!(!dir.path().join("sub/.weave.out.bin.tmp").exists());
    }

    #[tokio::test]
    async fn test_failed_fetch_leaves_no_trace() {
        let dir = TempDir::new().unwrap();
        let content = b"will not arrive".to_vec();
        let record = Arc::new(target_record("gone.txt", &content));

        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let puller = Puller::new(dir.path().to_path_buf(), Arc::clone(&sink) as _);

        puller
            .monitor_tx
            .send(MonitorMsg::Copy(CopyOrder {
                file: Arc::clone(&record),
                have: Vec::new(),
                last: false,
                fetches: 1,
            }))
            .unwrap();
        puller
            .monitor_tx
            .send(MonitorMsg::Failed {
                order: FetchOrder {
                    file: Arc::clone(&record),
                    block: record.blocks[0].clone(),
                    last: true,
                    availability: 0,
                },
                error: "connection reset".to_string(),
            })
            .unwrap();

        settle().await;

        assert!(!dir.path().join("gone.txt").exists());
        assert!(!dir.path().join(".weave.gone.txt.tmp").exists());
        assert!(sink.0.lock().is_empty());
    }

    #[tokio::test]
    async fn test_copy_reuses_blocks_from_previous_version() {
        let dir = TempDir::new().unwrap();
        let old = b"KEEP-THIS-PART--".to_vec();
        stdfs::write(dir.path().join("doc"), &old).unwrap();

        // New version: same first block, one appended block.
        let mut content = old.clone();
        content.extend_from_slice(b"NEW-TAIL");
        let record = Arc::new(FileRecord {
            name: "doc".to_string(),
            version: 7,
            size: content.len() as u64,
            modified: 1_400_000_000,
            blocks: {
                let mut blocks = hash_blocks(&old[..], 16).unwrap();
                blocks.extend(hash_blocks(&content[16..], 16).unwrap().into_iter().map(
                    |mut b| {
                        b.offset += 16;
                        b
                    },
                ));
                blocks
            },
            ..Default::default()
        });

        let sink = Arc::new(RecordingSink(Mutex::new(Vec::new())));
        let puller = Puller::new(dir.path().to_path_buf(), Arc::clone(&sink) as _);

        puller
            .monitor_tx
            .send(MonitorMsg::Copy(CopyOrder {
                file: Arc::clone(&record),
                have: vec![record.blocks[0].clone()],
                last: false,
                fetches: 1,
            }))
            .unwrap();
        puller
            .monitor_tx
            .send(MonitorMsg::Fetched {
                order: FetchOrder {
                    file: Arc::clone(&record),
                    block: record.blocks[1].clone(),
                    last: true,
                    availability: 0,
                },
                data: Bytes::copy_from_slice(&content[16..]),
            })
            .unwrap();

        settle().await;

        // Verification hashes at the standard block size, so the whole file
        // is one block there; content equality is what matters.
        assert_eq!(stdfs::read(dir.path().join("doc")).unwrap(), content);
        assert_eq!(sink.0.lock().len(), 1);
    }
}
