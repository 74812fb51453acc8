//! Buffer pool for block data
//!
//! The `NodeManager` bounds the bytes of block data held in memory. Users pin
//! a node before touching its data; pinned nodes are never evicted. Unpinned
//! resident nodes are unloaded oldest-unpin first when a pin needs room.

mod lru;
mod manager;
mod stats;

pub use lru::LruList;
pub use manager::{NodeHandle, NodeManager};
pub use stats::{BufferStats, BufferStatsSnapshot};

use crate::Result;

/// Identifies a node inside one manager
pub type NodeKey = u64;

/// Data the manager can move in and out of memory
pub trait BufferNode: Send + Sync {
    fn key(&self) -> NodeKey;

    /// Bytes charged against the budget while resident
    fn size(&self) -> u64;

    /// Bring the data into memory
    fn load(&self) -> Result<()>;

    /// Persist the data and release it from memory
    fn unload(&self) -> Result<()>;
}
