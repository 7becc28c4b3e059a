//! Node configuration.
//!
//! A TOML file in the configuration directory. Every option has a default;
//! none of them changes wire behavior.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case")]
pub struct Config {
    /// The directory tree being synchronized.
    pub repository: PathBuf,

    /// Serve index and data only; never alter the repository.
    pub read_only: bool,

    /// Honour deletions announced by the cluster.
    pub allow_delete: bool,

    pub rescan_interval_s: u64,
    pub reconnect_interval_s: u64,

    /// Puller workers per connected peer.
    pub parallel_requests: usize,

    /// Outbound request serving cap; zero means unlimited.
    pub max_send_kbps: u64,

    /// Per-file change rate beyond which updates are suppressed; zero
    /// disables suppression.
    pub max_change_kbps: u64,

    pub follow_symlinks: bool,

    pub listen_address: Vec<String>,

    pub local_announce_enabled: bool,
    pub global_announce_enabled: bool,
    pub global_announce_server: String,

    pub gui_enabled: bool,
    pub gui_address: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            repository: PathBuf::from("~/Sync"),
            read_only: false,
            allow_delete: true,
            rescan_interval_s: 60,
            reconnect_interval_s: 60,
            parallel_requests: 16,
            max_send_kbps: 0,
            max_change_kbps: 10_000,
            follow_symlinks: true,
            listen_address: vec![":22000".to_string()],
            local_announce_enabled: true,
            global_announce_enabled: true,
            global_announce_server: "announce.example.net:22026".to_string(),
            gui_enabled: true,
            gui_address: "127.0.0.1:8080".to_string(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
        toml::from_str(&text).map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self)
            .map_err(|e| Error::Config(e.to_string()))?;
        let tmp = path.with_extension("tmp");
        std::fs::write(&tmp, text)?;
        std::fs::rename(&tmp, path)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert!(!cfg.read_only);
        assert!(cfg.allow_delete);
        assert_eq!(cfg.parallel_requests, 16);
        assert_eq!(cfg.rescan_interval_s, 60);
        assert_eq!(cfg.max_send_kbps, 0);
    }

    #[test]
    fn test_partial_file_fills_in_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(
            &path,
            "repository = \"/data/stuff\"\nread-only = true\nmax-send-kbps = 500\n",
        )
        .unwrap();

        let cfg = Config::load(&path).unwrap();
        assert_eq!(cfg.repository, PathBuf::from("/data/stuff"));
        assert!(cfg.read_only);
        assert_eq!(cfg.max_send_kbps, 500);
        assert_eq!(cfg.parallel_requests, 16);
    }

    #[test]
    fn test_save_load_roundtrip() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.toml");

        let mut cfg = Config::default();
        cfg.repository = PathBuf::from("/tmp/r");
        cfg.parallel_requests = 4;
        cfg.save(&path).unwrap();

        let loaded = Config::load(&path).unwrap();
        assert_eq!(loaded.repository, cfg.repository);
        assert_eq!(loaded.parallel_requests, 4);
    }

    #[test]
    fn test_unreadable_config_is_a_config_error() {
        let err = Config::load(Path::new("/definitely/not/here.toml")).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }
}
