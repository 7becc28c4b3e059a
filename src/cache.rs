//! Warm-start index cache.
//!
//! One gzip-compressed index message per repository, keyed by a hash of the
//! repository ID and directory, written atomically. Only ever a hint: any
//! read problem means a cold rescan, never an error.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use sha2::{Digest, Sha256};
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use crate::proto::{FileInfo, IndexMessage};

fn cache_name(repo: &str, dir: &Path) -> String {
    let digest = Sha256::digest(format!("{}|{}", repo, dir.display()).as_bytes());
    let mut name = String::with_capacity(digest.len() * 2 + 7);
    for b in digest {
        let _ = write!(name, "{:02x}", b);
    }
    name.push_str(".idx.gz");
    name
}

/// Persists the index for `repo` under `conf_dir`, atomically.
pub fn save_index(
    conf_dir: &Path,
    repo: &str,
    dir: &Path,
    files: Vec<FileInfo>,
) -> anyhow::Result<()> {
    let full = conf_dir.join(cache_name(repo, dir));
    let tmp = full.with_extension("tmp");

    let msg = IndexMessage {
        repository: repo.to_string(),
        files,
    };

    let fd = fs::File::create(&tmp)?;
    let mut gz = GzEncoder::new(fd, Compression::default());
    serde_json::to_writer(&mut gz, &msg)?;
    gz.finish()?;
    fs::rename(&tmp, &full)?;
    Ok(())
}

/// Loads the cached index for `repo`, or nothing if absent or unreadable.
pub fn load_index(conf_dir: &Path, repo: &str, dir: &Path) -> Option<Vec<FileInfo>> {
    let full = conf_dir.join(cache_name(repo, dir));
    let fd = fs::File::open(full).ok()?;
    let msg: IndexMessage = serde_json::from_reader(GzDecoder::new(fd)).ok()?;
    (msg.repository == repo).then_some(msg.files)
}
