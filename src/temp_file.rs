//! Temporary-file naming and cleanup.
//!
//! In-progress fetches are written to a recognizable temp path next to the
//! final one and renamed into place only after verification. The scanner
//! skips these paths and sweeps leftovers from interrupted transfers.

use std::path::{Path, PathBuf};

const TEMP_PREFIX: &str = ".weave.";
const TEMP_SUFFIX: &str = ".tmp";

/// Produces and recognizes temporary paths for in-progress transfers.
#[derive(Debug, Clone, Copy, Default)]
pub struct TempNamer;

impl TempNamer {
    /// Temp path for the file at `path`: same directory, marked name.
    pub fn temp_name(&self, path: &Path) -> PathBuf {
        let file = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = format!("{}{}{}", TEMP_PREFIX, file, TEMP_SUFFIX);
        match path.parent() {
            Some(dir) => dir.join(tmp),
            None => PathBuf::from(tmp),
        }
    }

    /// True if `path` names one of our temporaries.
    pub fn is_temporary(&self, path: &Path) -> bool {
        match path.file_name() {
            Some(name) => {
                let name = name.to_string_lossy();
                name.starts_with(TEMP_PREFIX) && name.ends_with(TEMP_SUFFIX)
            }
            None => false,
        }
    }
}

/// Removes the guarded file on drop unless defused after a successful rename.
pub struct TempFileGuard {
    path: Option<PathBuf>,
}

impl TempFileGuard {
    pub fn new(path: &Path) -> Self {
        Self {
            path: Some(path.to_path_buf()),
        }
    }

    /// Disarms the guard; the file is now owned by its final path.
    pub fn defuse(mut self) {
        self.path = None;
    }
}

impl Drop for TempFileGuard {
    fn drop(&mut self) {
        if let Some(p) = self.path.take() {
            let _ = std::fs::remove_file(&p);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_temp_name_roundtrip() {
        let namer = TempNamer;
        let tmp = namer.temp_name(Path::new("/repo/dir/file.txt"));
        assert_eq!(tmp, PathBuf::from("/repo/dir/.weave.file.txt.tmp"));
        assert!(namer.is_temporary(&tmp));
        assert!(!namer.is_temporary(Path::new("/repo/dir/file.txt")));
    }

    #[test]
    fn test_guard_removes_on_drop() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".weave.x.tmp");
        fs::write(&path, b"partial").unwrap();
        {
            let _guard = TempFileGuard::new(&path);
        }
        assert!(!path.exists());
    }

    #[test]
    fn test_guard_defused_keeps_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".weave.y.tmp");
        fs::write(&path, b"done").unwrap();
        let guard = TempFileGuard::new(&path);
        guard.defuse();
        assert!(path.exists());
    }
}
