//! Wire-facing index types and the peer connection contract.
//!
//! The codec, framing, compression and TLS live outside this crate; the
//! model sees a peer only through [`Connection`]. Index payloads use
//! [`FileInfo`], where block offsets are implicit in list order.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::files::{Block, FileFlags, FileRecord};

/// Repository name carried on the wire. A single literal for now.
pub const DEFAULT_REPO: &str = "default";

// =============================================================================
// Index payload
// =============================================================================

/// Block metadata as carried in index messages: size and hash only. Offsets
/// are reconstructed from the running sum of preceding sizes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockInfo {
    pub size: u32,
    pub hash: Vec<u8>,
}

/// One index entry as exchanged with peers.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct FileInfo {
    pub name: String,
    pub flags: u32,
    pub modified: i64,
    pub version: u32,
    pub blocks: Vec<BlockInfo>,
}

/// A full index for one repository; also the persisted cache format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IndexMessage {
    pub repository: String,
    pub files: Vec<FileInfo>,
}

/// Builds the in-memory record for a wire entry. Size and block offsets come
/// from the cumulative sum of block sizes; the invalid flag maps onto the
/// suppressed attribute.
pub fn file_from_info(f: FileInfo) -> FileRecord {
    let mut blocks = Vec::with_capacity(f.blocks.len());
    let mut offset = 0u64;
    for b in f.blocks {
        blocks.push(Block {
            offset,
            size: b.size,
            hash: b.hash,
        });
        offset += b.size as u64;
    }
    FileRecord {
        name: f.name,
        size: offset,
        flags: FileFlags::from_bits_retain(f.flags) & !FileFlags::INVALID,
        modified: f.modified,
        version: f.version,
        blocks,
        suppressed: f.flags & FileFlags::INVALID.bits() != 0,
    }
}

/// The wire form of a record.
pub fn info_from_file(f: &FileRecord) -> FileInfo {
    let blocks = f
        .blocks
        .iter()
        .map(|b| BlockInfo {
            size: b.size,
            hash: b.hash.clone(),
        })
        .collect();
    let mut flags = f.flags.bits();
    if f.suppressed {
        flags |= FileFlags::INVALID.bits();
    }
    FileInfo {
        name: f.name.clone(),
        flags,
        modified: f.modified,
        version: f.version,
        blocks,
    }
}

// =============================================================================
// Connection contract
// =============================================================================

/// Transfer statistics as reported by the transport.
#[derive(Debug, Clone, Copy, Default)]
pub struct Statistics {
    pub in_bytes_total: u64,
    pub out_bytes_total: u64,
}

/// What the model knows about a connected peer. Implemented by the external
/// protocol/transport layer.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Stable opaque identity of the remote node.
    fn id(&self) -> String;

    /// Sends a full index for `repo`.
    async fn index(&self, repo: &str, files: Vec<FileInfo>);

    /// Sends an incremental index update for `repo`.
    async fn index_update(&self, repo: &str, files: Vec<FileInfo>);

    /// Requests a data segment from the remote node.
    async fn request(&self, repo: &str, name: &str, offset: u64, size: u32)
        -> anyhow::Result<Bytes>;

    fn statistics(&self) -> Statistics;

    /// Opaque key/value options negotiated at connect time.
    fn option(&self, key: &str) -> Option<String>;
}
