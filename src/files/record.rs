//! File records, block descriptors and record keys.

use bitflags::bitflags;

bitflags! {
    /// Marker bits in a record's flag word. Bits below [`FileFlags::DELETED`]
    /// carry the Unix permission mode reported by the scanner.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct FileFlags: u32 {
        const DELETED = 1 << 12;
        const INVALID = 1 << 13;

        // Permission bits travel in the same word.
        const _ = !0;
    }
}

/// A contiguous piece of a file: where it sits, how long it is, and the hash
/// of its content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Block {
    pub offset: u64,
    pub size: u32,
    pub hash: Vec<u8>,
}

/// A single entry in a repository index.
///
/// The block list is dense and contiguous: each block's offset is the sum of
/// the sizes before it, and `size` is the sum of all block sizes. Tombstones
/// carry the deleted flag, no blocks, size zero and a bumped version.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct FileRecord {
    pub name: String,
    pub flags: FileFlags,
    pub modified: i64,
    pub version: u32,
    pub size: u64,
    pub blocks: Vec<Block>,

    /// Local churn suppression; travels as the invalid flag on the wire.
    pub suppressed: bool,
}

impl FileRecord {
    pub fn is_deleted(&self) -> bool {
        self.flags.contains(FileFlags::DELETED)
    }

    /// Unix permission bits carried in the flag word.
    pub fn mode(&self) -> u32 {
        self.flags.bits() & 0o7777
    }
}

/// Identity of one version of one file. Key equality implies record equality
/// for everything the protocol exposes; "newer" is version comparison only.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default)]
pub struct Key {
    pub name: String,
    pub version: u32,
}

impl Key {
    pub fn of(f: &FileRecord) -> Self {
        Self {
            name: f.name.clone(),
            version: f.version,
        }
    }

    pub fn newer_than(&self, other: &Key) -> bool {
        self.version > other.version
    }
}
