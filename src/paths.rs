//! Validation of repository-relative names.
//!
//! Names arrive from the wire and from the scanner; both must resolve to
//! paths strictly inside the repository root.

use anyhow::Result;
use std::path::{Component, Path, PathBuf};
use unicode_normalization::UnicodeNormalization;

/// Normalize a repository-relative name to Unicode NFC.
pub fn nfc(name: &str) -> String {
    name.nfc().collect()
}

/// Validate that a relative name is safe and doesn't escape the root.
/// Returns the full path if valid.
pub fn validate(root: &Path, relative: &str) -> Result<PathBuf> {
    if relative.is_empty() {
        anyhow::bail!("Empty path not allowed");
    }

    let rel_path = Path::new(relative);
    if rel_path.is_absolute() {
        anyhow::bail!("Absolute paths not allowed: {}", relative);
    }

    for component in rel_path.components() {
        match component {
            Component::ParentDir => {
                anyhow::bail!("Path traversal not allowed: {}", relative);
            }
            Component::Prefix(_) => {
                anyhow::bail!("Windows prefix paths not allowed: {}", relative);
            }
            _ => {}
        }
    }

    let full = root.join(rel_path);

    // Normalize and check (handles edge cases like "foo/../bar")
    let normalized = normalize(&full);
    let root_normalized = normalize(root);

    if !normalized.starts_with(&root_normalized) {
        anyhow::bail!("Path escapes root directory: {}", relative);
    }

    Ok(full)
}

/// Normalize a path without requiring it to exist (unlike canonicalize)
fn normalize(path: &Path) -> PathBuf {
    let mut normalized = PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                normalized.pop();
            }
            Component::CurDir => {}
            c => normalized.push(c),
        }
    }
    normalized
}
