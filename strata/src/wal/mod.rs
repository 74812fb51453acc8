//! Write-ahead log capability
//!
//! Transactions append one encoded command batch per commit; the scheduler
//! later marks prefixes of each group as checkpointed so they can be dropped.

mod file;
mod mem;

pub use file::FileWal;
pub use mem::MemWal;

use serde::{Deserialize, Serialize};

use crate::Result;

/// Position of a record in the log: a group plus a per-group sequence number
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct WalIndex {
    pub group: u32,
    /// Starts at 1 within each group
    pub lsn: u64,
}

impl WalIndex {
    pub fn new(group: u32, lsn: u64) -> Self {
        Self { group, lsn }
    }
}

/// Log persistence consumed by the transaction manager and the scheduler
pub trait LogStore: Send + Sync {
    /// Append a record and make it durable
    fn append(&self, group: u32, payload: &[u8]) -> Result<WalIndex>;

    /// Record that everything up to `index` in its group is reclaimable.
    /// Lower or equal indices are a no-op.
    fn checkpoint(&self, index: &WalIndex) -> Result<()>;

    /// Highest checkpointed lsn of `group` (0 if none)
    fn checkpointed(&self, group: u32) -> u64;

    /// Records of `group` not yet checkpointed, in lsn order
    fn replay(&self, group: u32) -> Result<Vec<(u64, Vec<u8>)>>;

    /// Reclaim storage of checkpointed records, returning how many units
    /// (segments or records) were released
    fn truncate(&self) -> Result<usize>;
}
