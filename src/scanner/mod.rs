//! Repository scanning: directory walking, block hashing, block diffing.

mod blocks;
mod walk;

pub use blocks::{block_diff, hash_blocks, BLOCK_SIZE};
pub use walk::{CurrentFiler, Suppress, Walker};
