//! weave — a peer-to-peer file synchronization node.
//!
//! Every node advertises an index of the files it holds, ingests peer
//! indexes into a newest-version-wins global view, and (in read/write mode)
//! pulls blocks of needed files from the peers that have them until the
//! local repository matches the cluster. Deletions propagate as tombstones
//! with bumped versions.

pub mod cache;
pub mod cid;
pub mod config;
pub mod error;
pub mod files;
pub mod limiter;
pub mod model;
pub mod paths;
pub mod proto;
pub mod puller;
pub mod scanner;
pub mod suppressor;
pub mod temp_file;
