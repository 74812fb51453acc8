//! Engine configuration

use std::path::PathBuf;

use crate::{Result, StrataError};

// ============================================================================
// Defaults
// ============================================================================

/// Default row capacity of a block
const DEFAULT_BLOCK_MAX_ROWS: u32 = 1024;
/// Default number of blocks per segment
const DEFAULT_SEGMENT_MAX_BLOCKS: u32 = 4;
/// Default buffer pool budget (256 MB)
const DEFAULT_MEMORY_BUDGET: u64 = 256 * 1024 * 1024;
/// Default scheduler queue capacity
const DEFAULT_QUEUE_CAPACITY: usize = 1024;

/// How `TryUpdate` treats a row whose newest version is already committed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum WriteConflictPolicy {
    /// Always layer a new version on top; visibility is resolved at read time.
    #[default]
    Permissive,
    /// Reject the write when the committed head is newer than the writer's snapshot.
    FirstCommitterWins,
}

/// Engine configuration
#[derive(Debug, Clone)]
pub struct StrataConfig {
    /// Row capacity of each block
    pub block_max_rows: u32,
    /// Blocks per segment before the segment is closed
    pub segment_max_blocks: u32,
    /// Resident byte budget of the node manager
    pub memory_budget: u64,
    /// Scheduler worker threads
    pub workers: usize,
    /// Bounded queue size of the scheduler
    pub queue_capacity: usize,
    /// Block the submitter when the queue is full instead of failing
    pub blocking_submit: bool,
    pub write_conflict: WriteConflictPolicy,
    /// Root directory for block files and the WAL; in-memory when `None`
    pub data_dir: Option<PathBuf>,
}

impl Default for StrataConfig {
    fn default() -> Self {
        let workers = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        Self {
            block_max_rows: DEFAULT_BLOCK_MAX_ROWS,
            segment_max_blocks: DEFAULT_SEGMENT_MAX_BLOCKS,
            memory_budget: DEFAULT_MEMORY_BUDGET,
            workers,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            blocking_submit: true,
            write_conflict: WriteConflictPolicy::Permissive,
            data_dir: None,
        }
    }
}

impl StrataConfig {
    pub fn with_block_max_rows(mut self, rows: u32) -> Self {
        self.block_max_rows = rows;
        self
    }

    pub fn with_segment_max_blocks(mut self, blocks: u32) -> Self {
        self.segment_max_blocks = blocks;
        self
    }

    pub fn with_memory_budget(mut self, bytes: u64) -> Self {
        self.memory_budget = bytes;
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers;
        self
    }

    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = capacity;
        self
    }

    pub fn with_blocking_submit(mut self, blocking: bool) -> Self {
        self.blocking_submit = blocking;
        self
    }

    pub fn with_write_conflict(mut self, policy: WriteConflictPolicy) -> Self {
        self.write_conflict = policy;
        self
    }

    pub fn with_data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.data_dir = Some(dir.into());
        self
    }

    /// Reject configurations the engine cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.block_max_rows == 0 {
            return Err(StrataError::InvalidState("block_max_rows must be positive".into()));
        }
        if self.segment_max_blocks == 0 {
            return Err(StrataError::InvalidState("segment_max_blocks must be positive".into()));
        }
        if self.workers == 0 {
            return Err(StrataError::InvalidState("workers must be positive".into()));
        }
        if self.queue_capacity == 0 {
            return Err(StrataError::InvalidState("queue_capacity must be positive".into()));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        let cfg = StrataConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.write_conflict, WriteConflictPolicy::Permissive);
        assert!(cfg.data_dir.is_none());
    }

    #[test]
    fn test_builder_and_validation() {
        let cfg = StrataConfig::default()
            .with_block_max_rows(8)
            .with_workers(2)
            .with_write_conflict(WriteConflictPolicy::FirstCommitterWins);
        assert_eq!(cfg.block_max_rows, 8);
        assert_eq!(cfg.workers, 2);
        assert!(cfg.validate().is_ok());

        assert!(StrataConfig::default().with_block_max_rows(0).validate().is_err());
        assert!(StrataConfig::default().with_workers(0).validate().is_err());
    }
}
