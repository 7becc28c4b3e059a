//! Blockwise hashing and block-list comparison.

use sha2::{Digest, Sha256};
use std::io::Read;

use crate::files::Block;

/// Standard block size used when hashing repository files.
pub const BLOCK_SIZE: usize = 128 * 1024;

/// Splits `r` into `block_size` chunks and hashes each one. An empty reader
/// yields an empty list.
pub fn hash_blocks<R: Read>(mut r: R, block_size: usize) -> std::io::Result<Vec<Block>> {
    let mut blocks = Vec::new();
    let mut buf = vec![0u8; block_size];
    let mut offset = 0u64;

    loop {
        let n = read_full(&mut r, &mut buf)?;
        if n == 0 {
            break;
        }
        blocks.push(Block {
            offset,
            size: n as u32,
            hash: Sha256::digest(&buf[..n]).to_vec(),
        });
        offset += n as u64;
        if n < block_size {
            break;
        }
    }

    Ok(blocks)
}

fn read_full<R: Read>(r: &mut R, buf: &mut [u8]) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match r.read(&mut buf[filled..])? {
            0 => break,
            n => filled += n,
        }
    }
    Ok(filled)
}

/// Compares the existing block list against the target one. The matching
/// prefix can be copied from the existing file (offsets coincide only while
/// sizes match position for position); the tail must be fetched.
pub fn block_diff(existing: &[Block], target: &[Block]) -> (Vec<Block>, Vec<Block>) {
    let mut i = 0;
    while i < existing.len()
        && i < target.len()
        && existing[i].size == target[i].size
        && existing[i].hash == target[i].hash
    {
        i += 1;
    }
    (target[..i].to_vec(), target[i..].to_vec())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_blocks_chunks_and_offsets() {
        let data = vec![0xaau8; 2500];
        let blocks = hash_blocks(&data[..], 1024).unwrap();

        assert_eq!(blocks.len(), 3);
        assert_eq!(blocks[0].offset, 0);
        assert_eq!(blocks[1].offset, 1024);
        assert_eq!(blocks[2].offset, 2048);
        assert_eq!(blocks[2].size, 452);

        // Identical content hashes identically at matching positions.
        assert_eq!(blocks[0].hash, blocks[1].hash);
        assert_ne!(blocks[1].hash, blocks[2].hash);
    }

    #[test]
    fn test_hash_blocks_empty_input() {
        let blocks = hash_blocks(&[][..], 1024).unwrap();
        assert!(blocks.is_empty());
    }

    #[test]
    fn test_block_diff_common_prefix() {
        let old = hash_blocks(&[1u8, 2, 3, 4, 5, 6][..], 2).unwrap();
        let mut new_data = vec![1u8, 2, 3, 4, 9, 9, 7, 7];
        let new = hash_blocks(&new_data[..], 2).unwrap();

        let (have, need) = block_diff(&old, &new);
        assert_eq!(have.len(), 2);
        assert_eq!(need.len(), 2);
        assert_eq!(need[0].offset, 4);

        // A change in the first block forces a full fetch.
        new_data[0] = 0;
        let changed = hash_blocks(&new_data[..], 2).unwrap();
        let (have, need) = block_diff(&old, &changed);
        assert!(have.is_empty());
        assert_eq!(need.len(), 4);
    }

    #[test]
    fn test_block_diff_no_existing_file() {
        let target = hash_blocks(&[1u8, 2, 3][..], 2).unwrap();
        let (have, need) = block_diff(&[], &target);
        assert!(have.is_empty());
        assert_eq!(need, target);
    }
}
