//! Repository walker.
//!
//! Walks the repository, blockwise-hashes changed files, honours ignore
//! files and skips in-progress temporaries. Walking is blocking; callers run
//! it under `spawn_blocking`.

use anyhow::{Context, Result};
use glob::Pattern;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;
use tracing::{debug, info, warn};

use crate::files::{FileFlags, FileRecord};
use crate::paths;
use crate::scanner::blocks::{hash_blocks, BLOCK_SIZE};
use crate::temp_file::TempNamer;

/// Queried for the record of a file as of the last scan, so unchanged files
/// skip rehashing.
pub trait CurrentFiler: Send + Sync {
    fn current_file(&self, name: &str) -> Option<FileRecord>;
}

/// Queried for suppression of modified files. Suppressed files are returned
/// with their previous metadata and the suppressed flag set.
pub trait Suppress: Send + Sync {
    fn suppress(&self, name: &str, size: u64) -> bool;
}

pub struct Walker {
    dir: PathBuf,
    block_size: usize,
    follow_symlinks: bool,
    ignore_file: String,
    temp_namer: TempNamer,
    current_filer: Option<std::sync::Arc<dyn CurrentFiler>>,
    suppressor: Option<std::sync::Arc<dyn Suppress>>,

    suppressed: HashSet<String>,
}

impl Walker {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            block_size: BLOCK_SIZE,
            follow_symlinks: false,
            ignore_file: ".stignore".to_string(),
            temp_namer: TempNamer,
            current_filer: None,
            suppressor: None,
            suppressed: HashSet::new(),
        }
    }

    pub fn block_size(mut self, size: usize) -> Self {
        self.block_size = size;
        self
    }

    /// Follow symbolic links directly under the root. Links at deeper levels
    /// are never followed.
    pub fn follow_symlinks(mut self, yes: bool) -> Self {
        self.follow_symlinks = yes;
        self
    }

    pub fn with_current_filer(mut self, filer: std::sync::Arc<dyn CurrentFiler>) -> Self {
        self.current_filer = Some(filer);
        self
    }

    pub fn with_suppressor(mut self, sup: std::sync::Arc<dyn Suppress>) -> Self {
        self.suppressor = Some(sup);
        self
    }

    /// Scans the repository and returns the records found, blockwise hashed.
    /// Unreadable entries are logged and skipped.
    pub fn walk(&mut self) -> Result<Vec<FileRecord>> {
        let root = self.dir.clone();
        fs::read_dir(&root).with_context(|| format!("scan {}", root.display()))?;

        let mut ignores = HashMap::new();
        let mut records = Vec::new();
        self.walk_dir(&root, 0, &mut ignores, &mut records);
        Ok(records)
    }

    /// Removes leftover temporaries from interrupted transfers.
    pub fn clean_temp_files(&self) {
        self.sweep(&self.dir);
    }

    fn walk_dir(
        &mut self,
        dir: &Path,
        depth: usize,
        ignores: &mut HashMap<String, Vec<Pattern>>,
        records: &mut Vec<FileRecord>,
    ) {
        // Load this directory's ignore patterns before visiting its entries.
        let ignore_path = dir.join(&self.ignore_file);
        if let Ok(text) = fs::read_to_string(&ignore_path) {
            let patterns: Vec<Pattern> = text
                .lines()
                .map(str::trim)
                .filter(|l| !l.is_empty())
                .filter_map(|l| match Pattern::new(l) {
                    Ok(p) => Some(p),
                    Err(e) => {
                        warn!(path = %ignore_path.display(), pattern = l, error = %e, "bad ignore pattern");
                        None
                    }
                })
                .collect();
            if let Some(prefix) = self.rel_name(dir) {
                ignores.insert(prefix, patterns);
            }
        }

        let entries = match fs::read_dir(dir) {
            Ok(entries) => entries,
            Err(e) => {
                debug!(dir = %dir.display(), error = %e, "skipping unreadable directory");
                return;
            }
        };

        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(ft) = entry.file_type() else { continue };
            let Some(rel) = self.rel_name(&path) else { continue };

            if self.temp_namer.is_temporary(&path) {
                debug!(name = %rel, "temporary");
                continue;
            }
            if entry.file_name().to_string_lossy() == self.ignore_file.as_str() {
                continue;
            }
            if self.ignored(ignores, &rel) {
                debug!(name = %rel, "ignored");
                continue;
            }

            if ft.is_dir() {
                self.walk_dir(&path, depth + 1, ignores, records);
            } else if ft.is_file() {
                self.scan_file(&path, &rel, records);
            } else if ft.is_symlink() && depth == 0 && self.follow_symlinks {
                if fs::metadata(&path).map(|m| m.is_dir()).unwrap_or(false) {
                    self.walk_dir(&path, depth + 1, ignores, records);
                }
            }
        }
    }

    fn scan_file(&mut self, path: &Path, rel: &str, records: &mut Vec<FileRecord>) {
        let meta = match fs::metadata(path) {
            Ok(m) => m,
            Err(e) => {
                debug!(name = %rel, error = %e, "stat failed");
                return;
            }
        };
        let modified = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map_or(0, |d| d.as_secs() as i64);

        let mut version = 0;
        if let Some(filer) = &self.current_filer {
            let cf = filer.current_file(rel).unwrap_or_default();

            if cf.version > 0 && cf.modified == modified {
                // Unchanged since the last scan; keep the hashed record.
                records.push(cf);
                return;
            }

            if let Some(sup) = &self.suppressor {
                if sup.suppress(rel, meta.len()) {
                    let mut masked = cf.clone();
                    masked.name = rel.to_string();
                    if self.suppressed.insert(rel.to_string()) {
                        info!(
                            name = %rel,
                            "changes are being temporarily suppressed; the file is changing too frequently"
                        );
                        masked.suppressed = true;
                        masked.version += 1;
                    }
                    records.push(masked);
                    return;
                }
                if self.suppressed.remove(rel) {
                    info!(name = %rel, "changes are no longer suppressed");
                }
            }

            version = cf.version + 1;
        }

        let fd = match fs::File::open(path) {
            Ok(fd) => fd,
            Err(e) => {
                debug!(name = %rel, error = %e, "open failed");
                return;
            }
        };
        let blocks = match hash_blocks(fd, self.block_size) {
            Ok(blocks) => blocks,
            Err(e) => {
                debug!(name = %rel, error = %e, "hash failed");
                return;
            }
        };

        #[cfg(unix)]
        let mode = {
            use std::os::unix::fs::PermissionsExt;
            meta.permissions().mode() & 0o7777
        };
        #[cfg(not(unix))]
        let mode = 0o644;

        records.push(FileRecord {
            name: rel.to_string(),
            flags: FileFlags::from_bits_retain(mode),
            modified,
            version,
            size: meta.len(),
            blocks,
            suppressed: false,
        });
    }

    fn sweep(&self, dir: &Path) {
        let Ok(entries) = fs::read_dir(dir) else {
            return;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            let Ok(ft) = entry.file_type() else { continue };
            if ft.is_dir() {
                self.sweep(&path);
            } else if ft.is_file() && self.temp_namer.is_temporary(&path) {
                debug!(path = %path.display(), "removing stale temp file");
                let _ = fs::remove_file(&path);
            }
        }
    }

    /// Repository-relative name in NFC, `/`-separated. Empty for the root.
    fn rel_name(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.dir).ok()?;
        let s = rel.to_string_lossy();
        Some(paths::nfc(&s))
    }

    fn ignored(&self, ignores: &HashMap<String, Vec<Pattern>>, rel: &str) -> bool {
        let (dirname, basename) = match rel.rsplit_once('/') {
            Some((d, b)) => (d, b),
            None => ("", rel),
        };
        for (prefix, patterns) in ignores {
            let applies = prefix.is_empty()
                || dirname == prefix
                || dirname.starts_with(&format!("{}/", prefix));
            if applies && patterns.iter().any(|p| p.matches(basename)) {
                return true;
            }
        }
        false
    }
}
