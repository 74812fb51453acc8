//! In-memory block files that keep whatever they are given verbatim

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use parking_lot::Mutex;
use roaring::RoaringBitmap;

use super::{assemble_delta, BlockFile, FileFactory};
use crate::catalog::BlockId;
use crate::txn::Timestamp;
use crate::updates::BlockDelta;
use crate::{Result, Value};

#[derive(Default)]
struct MockState {
    batch: Option<RecordBatch>,
    delta: BlockDelta,
    max_visible: Timestamp,
    writes: u64,
    syncs: u64,
    destroyed: bool,
}

#[derive(Default)]
pub struct MockBlockFile {
    state: Mutex<MockState>,
}

impl MockBlockFile {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn write_count(&self) -> u64 {
        self.state.lock().writes
    }

    pub fn sync_count(&self) -> u64 {
        self.state.lock().syncs
    }

    pub fn is_destroyed(&self) -> bool {
        self.state.lock().destroyed
    }
}

impl BlockFile for MockBlockFile {
    fn write_data(
        &self,
        batch: &RecordBatch,
        visible_ts: Timestamp,
        update_masks: &BTreeMap<u16, RoaringBitmap>,
        update_values: &BTreeMap<u16, BTreeMap<u32, Value>>,
        delete_mask: Option<&RoaringBitmap>,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.batch = Some(batch.clone());
        state.delta = assemble_delta(update_masks, update_values, delete_mask);
        state.max_visible = visible_ts;
        state.writes += 1;
        state.destroyed = false;
        Ok(())
    }

    fn load_data(&self) -> Result<Option<RecordBatch>> {
        Ok(self.state.lock().batch.clone())
    }

    fn load_deltas(&self) -> Result<BlockDelta> {
        Ok(self.state.lock().delta.clone())
    }

    fn sync(&self) -> Result<()> {
        self.state.lock().syncs += 1;
        Ok(())
    }

    fn max_visible(&self) -> Timestamp {
        self.state.lock().max_visible
    }

    fn destroy(&self) -> Result<()> {
        let mut state = self.state.lock();
        state.batch = None;
        state.delta = BlockDelta::default();
        state.destroyed = true;
        Ok(())
    }
}

/// Hands out one shared `MockBlockFile` per block id
#[derive(Default)]
pub struct MockFileFactory {
    files: Mutex<HashMap<BlockId, Arc<MockBlockFile>>>,
}

impl MockFileFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// The mock behind `block`, if one was opened
    pub fn file(&self, block: BlockId) -> Option<Arc<MockBlockFile>> {
        self.files.lock().get(&block).cloned()
    }
}

impl FileFactory for MockFileFactory {
    fn block_file(&self, block: BlockId) -> Result<Arc<dyn BlockFile>> {
        let file: Arc<dyn BlockFile> = self
            .files
            .lock()
            .entry(block)
            .or_insert_with(|| Arc::new(MockBlockFile::new()))
            .clone();
        Ok(file)
    }
}
