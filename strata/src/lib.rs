//! Strata Mutation Core
//!
//! The versioning layer of a transactional columnar block store: per-column
//! update chains, per-block delete chains, a bounded buffer pool for block
//! data, the append path, block compaction and the background task scheduler
//! that runs flush/compact/checkpoint work off the commit path.

pub mod buffer;
pub mod catalog;
pub mod compaction;
pub mod config;
pub mod data;
pub mod dataio;
pub mod db;
pub mod index;
pub mod tables;
pub mod tasks;
pub mod txn;
pub mod updates;
pub mod wal;

use std::sync::Arc;

// Re-export main types
pub use config::{StrataConfig, WriteConflictPolicy};
pub use data::{ColumnDef, DataType, Schema, Value};
pub use db::Db;
pub use txn::{Timestamp, TimestampAllocator, Txn, TxnState};

/// Storage engine error type
#[derive(Debug, thiserror::Error)]
pub enum StrataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    /// Write-write collision on a row/range, or a double delete.
    #[error("Write conflict: {0}")]
    Conflict(String),

    #[error("Block is not appendable")]
    NotAppendable,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Duplicate primary key: {0}")]
    Duplicate(String),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Corrupted data: {0}")]
    Corrupted(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A broken internal invariant. Never retried.
    #[error("Invariant violation: {0}")]
    Invariant(String),

    #[error("Buffer exhausted: requested {requested} bytes with budget {budget}")]
    BufferExhausted { requested: u64, budget: u64 },

    #[error("Task queue is full")]
    QueueFull,

    #[error("Scheduler stopped")]
    SchedulerStopped,

    #[error("Scope already has a task in flight: {0}")]
    ScopeConflict(String),

    #[error("{kind:?} task failed: {source}")]
    TaskFailed {
        kind: tasks::TaskKind,
        #[source]
        source: Arc<StrataError>,
    },
}

impl StrataError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, StrataError::Conflict(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StrataError::NotFound(_))
    }

    pub fn is_duplicate(&self) -> bool {
        matches!(self, StrataError::Duplicate(_))
    }
}

impl From<bincode::Error> for StrataError {
    fn from(e: bincode::Error) -> Self {
        StrataError::Serialization(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, StrataError>;
