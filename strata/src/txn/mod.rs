//! Transactions
//!
//! This module provides:
//! - `TimestampAllocator`: injected monotonic timestamp source
//! - `Txn`: handle carrying start/commit timestamps and lifecycle state
//! - `TxnEntry`: two-phase commit participant produced by chains and compaction
//! - `TxnManager`: drives Preparing → log → ApplyCommit under one serialization point

mod context;
mod entry;
mod manager;
mod store;
mod timestamp;

pub use context::{Txn, TxnId, TxnState};
pub use entry::TxnEntry;
pub use manager::{TxnManager, TXN_LOG_GROUP};
pub use store::{NodeSlot, TxnStore};
pub use timestamp::{Timestamp, TimestampAllocator};
