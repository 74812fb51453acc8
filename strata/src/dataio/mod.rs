//! Block file capability
//!
//! A block's backing storage receives the resident batch together with the
//! deltas visible at the moment it was written. Deltas are not folded into the
//! batch; readers reapply them.

mod local;
mod mock;

pub use local::{LocalBlockFile, LocalFileFactory};
pub use mock::{MockBlockFile, MockFileFactory};

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use roaring::RoaringBitmap;

use crate::catalog::BlockId;
use crate::txn::Timestamp;
use crate::updates::{BlockDelta, ColumnDelta};
use crate::{Result, Value};

pub trait BlockFile: Send + Sync {
    /// Replace the stored batch and deltas
    fn write_data(
        &self,
        batch: &RecordBatch,
        visible_ts: Timestamp,
        update_masks: &BTreeMap<u16, RoaringBitmap>,
        update_values: &BTreeMap<u16, BTreeMap<u32, Value>>,
        delete_mask: Option<&RoaringBitmap>,
    ) -> Result<()>;

    /// Stored batch, `None` if nothing was ever written
    fn load_data(&self) -> Result<Option<RecordBatch>>;

    /// Deltas stored alongside the batch
    fn load_deltas(&self) -> Result<BlockDelta>;

    /// Make the last write durable
    fn sync(&self) -> Result<()>;

    /// Timestamp the stored deltas were collected at
    fn max_visible(&self) -> Timestamp;

    /// Remove the stored data
    fn destroy(&self) -> Result<()>;
}

/// Opens the backing file of a block; chosen when blocks are constructed
pub trait FileFactory: Send + Sync {
    fn block_file(&self, block: BlockId) -> Result<Arc<dyn BlockFile>>;
}

/// Write a whole `BlockDelta` through a block file
pub fn write_with_delta(
    file: &dyn BlockFile,
    batch: &RecordBatch,
    visible_ts: Timestamp,
    delta: &BlockDelta,
) -> Result<()> {
    file.write_data(
        batch,
        visible_ts,
        &delta.update_masks(),
        &delta.update_values(),
        delta.deletes.as_ref(),
    )
}

pub(crate) fn assemble_delta(
    update_masks: &BTreeMap<u16, RoaringBitmap>,
    update_values: &BTreeMap<u16, BTreeMap<u32, Value>>,
    delete_mask: Option<&RoaringBitmap>,
) -> BlockDelta {
    let mut delta = BlockDelta::default();
    for (col, mask) in update_masks {
        let values = update_values.get(col).cloned().unwrap_or_default();
        delta.columns.insert(*col, ColumnDelta { mask: mask.clone(), values });
    }
    delta.deletes = delete_mask.filter(|m| !m.is_empty()).cloned();
    delta
}
