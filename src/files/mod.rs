//! File records and the multi-peer index set.

mod record;
mod set;

pub use record::{Block, FileFlags, FileRecord, Key};
pub use set::Set;
