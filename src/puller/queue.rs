//! Queue of per-file copy and fetch work feeding the pullers.

use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use tokio::sync::Semaphore;

use crate::files::{Block, FileRecord};

/// Reusable blocks to lift from the previous version of the file. Queued
/// first for its file; carries the terminal marker when there is nothing to
/// fetch at all.
#[derive(Debug, Clone)]
pub struct CopyOrder {
    pub file: Arc<FileRecord>,
    pub have: Vec<Block>,
    pub last: bool,

    /// How many fetch orders follow for this file; the monitor finalizes
    /// once that many results have come back.
    pub fetches: usize,
}

/// One remote block to fetch, with the availability snapshot taken when the
/// plan was queued.
#[derive(Debug, Clone)]
pub struct FetchOrder {
    pub file: Arc<FileRecord>,
    pub block: Block,
    pub last: bool,
    pub availability: u64,
}

#[derive(Debug, Clone)]
pub enum WorkItem {
    Copy(CopyOrder),
    Fetch(FetchOrder),
}

impl WorkItem {
    pub fn name(&self) -> &str {
        match self {
            WorkItem::Copy(c) => &c.file.name,
            WorkItem::Fetch(f) => &f.file.name,
        }
    }
}

struct Inner {
    queued: VecDeque<WorkItem>,
    pending: HashMap<String, usize>,
}

/// FIFO of block work items. The model enqueues whole per-file plans; puller
/// workers drain one item at a time. Per-file ordering is the insertion
/// order, interleaving between files is free.
pub struct BlockQueue {
    inner: Mutex<Inner>,
    available: Semaphore,
}

impl BlockQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                queued: VecDeque::new(),
                pending: HashMap::new(),
            }),
            available: Semaphore::new(0),
        }
    }

    /// Queues the copy-then-fetch plan for one file: a single copy order
    /// bearing `have`, then one fetch order per entry of `need` in block
    /// order, the final item marked terminal.
    pub fn add(&self, file: FileRecord, have: Vec<Block>, need: Vec<Block>, availability: u64) {
        let file = Arc::new(file);
        let fetches = need.len();

        let mut items = Vec::with_capacity(1 + fetches);
        items.push(WorkItem::Copy(CopyOrder {
            file: Arc::clone(&file),
            have,
            last: fetches == 0,
            fetches,
        }));
        for (i, block) in need.into_iter().enumerate() {
            items.push(WorkItem::Fetch(FetchOrder {
                file: Arc::clone(&file),
                block,
                last: i == fetches - 1,
                availability,
            }));
        }

        let count = items.len();
        {
            let mut inner = self.inner.lock();
            *inner.pending.entry(file.name.clone()).or_insert(0) += count;
            inner.queued.extend(items);
        }
        self.available.add_permits(count);
    }

    /// True while any queued work remains for `name`; used to avoid queueing
    /// a file twice before its prior plan drained.
    pub fn contains(&self, name: &str) -> bool {
        self.inner.lock().pending.contains_key(name)
    }

    /// Waits for and returns the next work item, or `None` once the queue is
    /// closed.
    pub async fn get(&self) -> Option<WorkItem> {
        let permit = self.available.acquire().await.ok()?;
        permit.forget();

        let mut inner = self.inner.lock();
        let item = inner.queued.pop_front()?;
        let name = item.name().to_string();
        if let Some(count) = inner.pending.get_mut(&name) {
            *count -= 1;
            if *count == 0 {
                inner.pending.remove(&name);
            }
        }
        Some(item)
    }

    /// Closes the queue; pending and subsequent `get` calls return `None`.
    pub fn close(&self) {
        self.available.close();
    }
}

impl Default for BlockQueue {
    fn default() -> Self {
        Self::new()
    }
}
