//! Resident data of one block, managed by the buffer pool

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use arrow::compute::concat_batches;
use arrow::record_batch::RecordBatch;
use parking_lot::RwLock;

use crate::buffer::{BufferNode, NodeKey};
use crate::catalog::BlockId;
use crate::dataio::{write_with_delta, BlockFile};
use crate::txn::Timestamp;
use crate::updates::MutationController;
use crate::{Result, Schema, StrataError};

/// The block's column batch plus the file it spills to
///
/// The batch holds rows exactly as appended; updates and deletes stay in the
/// controller's chains and are persisted beside the batch on unload.
pub struct BlockNode {
    id: BlockId,
    schema: Arc<Schema>,
    ctrl: Arc<MutationController>,
    file: Arc<dyn BlockFile>,
    batch: RwLock<Option<RecordBatch>>,
    /// Memory of the last resident batch
    bytes: AtomicU64,
}

impl BlockNode {
    pub fn new(
        id: BlockId,
        schema: Arc<Schema>,
        ctrl: Arc<MutationController>,
        file: Arc<dyn BlockFile>,
        size_hint: u64,
    ) -> Self {
        Self {
            id,
            schema,
            ctrl,
            file,
            batch: RwLock::new(None),
            bytes: AtomicU64::new(size_hint),
        }
    }

    pub fn file(&self) -> &Arc<dyn BlockFile> {
        &self.file
    }

    pub fn is_loaded(&self) -> bool {
        self.batch.read().is_some()
    }

    /// Current batch; the caller must hold a pin
    pub fn batch(&self) -> Result<RecordBatch> {
        self.batch.read().clone().ok_or_else(|| {
            StrataError::Invariant(format!("block {} data accessed while not resident", self.id))
        })
    }

    /// Expected resident size before the first load
    pub(crate) fn set_size_hint(&self, bytes: u64) {
        self.bytes.store(bytes, Ordering::Release);
    }

    /// Append rows to the resident batch; the caller holds the block write lock
    pub(crate) fn append(&self, rows: &RecordBatch) -> Result<()> {
        let mut guard = self.batch.write();
        let current = guard.as_ref().ok_or_else(|| {
            StrataError::Invariant(format!("append to block {} while not resident", self.id))
        })?;
        let merged = concat_batches(&self.schema.arrow_schema(), [current, rows])?;
        self.bytes.store(merged.get_array_memory_size() as u64, Ordering::Release);
        *guard = Some(merged);
        Ok(())
    }

    /// Write the batch and the deltas visible at `ts` to the block file
    pub(crate) fn persist(&self, ts: Timestamp) -> Result<()> {
        let batch = self.batch()?;
        let delta = self.ctrl.collect_at(ts);
        write_with_delta(self.file.as_ref(), &batch, ts, &delta)?;
        self.file.sync()?;
        log::debug!(
            "block {} persisted {} rows, {} updated columns at ts {}",
            self.id,
            batch.num_rows(),
            delta.columns.len(),
            ts
        );
        Ok(())
    }
}

impl BufferNode for BlockNode {
    fn key(&self) -> NodeKey {
        self.id
    }

    fn size(&self) -> u64 {
        self.bytes.load(Ordering::Acquire)
    }

    fn load(&self) -> Result<()> {
        let batch = match self.file.load_data()? {
            Some(batch) => {
                self.schema.check_batch(&batch)?;
                batch
            }
            None => RecordBatch::new_empty(self.schema.arrow_schema()),
        };
        self.bytes.store(batch.get_array_memory_size() as u64, Ordering::Release);
        *self.batch.write() = Some(batch);
        Ok(())
    }

    fn unload(&self) -> Result<()> {
        if !self.is_loaded() {
            return Ok(());
        }
        self.persist(self.ctrl.max_visible())?;
        *self.batch.write() = None;
        Ok(())
    }
}
