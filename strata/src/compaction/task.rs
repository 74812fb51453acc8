//! Compact one block: drop deleted rows, sort by primary key, write a new block

use std::sync::Arc;

use arrow::array::{ArrayRef, UInt32Array};
use arrow::compute::take;
use arrow::record_batch::RecordBatch;
use rayon::prelude::*;

use super::entry::CompactBlockEntry;
use super::sort::{check_sorted, sort_by_primary_key, RowMapping};
use super::CompactionContext;
use crate::catalog::EntryVersion;
use crate::data::apply_updates;
use crate::dataio::write_with_delta;
use crate::tables::DataBlock;
use crate::tasks::TaskKind;
use crate::txn::{Timestamp, Txn};
use crate::updates::{BlockDelta, NodeTarget};
use crate::{Result, StrataError};

/// Live rows above which columns are materialized in parallel
const PARALLEL_ROWS: u64 = 100_000;

/// Sorted live rows of the old block and where each old row went
pub struct PreparedData {
    pub batch: RecordBatch,
    pub mapping: RowMapping,
}

/// Rewrites a sealed block as a new non-appendable block in primary-key order
///
/// `prepare_data` reads the block at `view_ts`, `execute` writes the result and
/// logs a [`CompactBlockEntry`] so the swap commits or rolls back with the
/// owning transaction.
pub struct CompactBlockTask {
    block: Arc<DataBlock>,
    view_ts: Timestamp,
    ctx: CompactionContext,
    created: Option<Arc<DataBlock>>,
}

impl CompactBlockTask {
    /// `view_ts` must be at least the owning transaction's start timestamp and
    /// cover every commit already applied to the block.
    pub fn new(block: Arc<DataBlock>, view_ts: Timestamp, ctx: CompactionContext) -> Self {
        Self { block, view_ts, ctx, created: None }
    }

    /// The replacement block once `execute` succeeded
    pub fn new_block(&self) -> Option<&Arc<DataBlock>> {
        self.created.as_ref()
    }

    /// Seal the block and build its dense, primary-key sorted batch
    pub fn prepare_data(&self) -> Result<PreparedData> {
        let block = &self.block;
        {
            let mut state = block.controller().write();
            if state.appends.has_pending() {
                return Err(StrataError::Conflict(format!(
                    "block {} has uncommitted appends",
                    block.id()
                )));
            }
            state.sealed = true;
        }
        block.meta().seal();

        let _pin = block.pin()?;
        let base = block.node().batch()?;
        let visible = block.visible_rows(self.view_ts);
        let delta = block.controller().collect_at(self.view_ts);
        let schema = block.schema();

        let indices = UInt32Array::from_iter_values(visible.iter());
        let densify = |(i, array): (usize, &ArrayRef)| -> Result<ArrayRef> {
            let array = match delta.columns.get(&(i as u16)) {
                Some(d) => apply_updates(array, schema.data_type(i as u16)?, &d.values)?,
                None => array.clone(),
            };
            Ok(take(array.as_ref(), &indices, None)?)
        };
        let columns = if visible.len() > PARALLEL_ROWS {
            base.columns().par_iter().enumerate().map(densify).collect::<Result<Vec<_>>>()?
        } else {
            base.columns().iter().enumerate().map(densify).collect::<Result<Vec<_>>>()?
        };
        let dense = RecordBatch::try_new(schema.arrow_schema(), columns)?;

        let pk = schema.primary_key as usize;
        let (batch, order) = sort_by_primary_key(&dense, pk)?;
        check_sorted(batch.column(pk))?;
        let mapping = RowMapping::new(base.num_rows() as u32, &visible, &order)?;
        log::debug!(
            "block {} prepared for compaction: {} of {} rows live at ts {}",
            block.id(),
            batch.num_rows(),
            base.num_rows(),
            self.view_ts
        );
        Ok(PreparedData { batch, mapping })
    }

    /// Run both phases and log the swap into `txn`
    pub fn execute(&mut self, txn: &Txn) -> Result<Arc<DataBlock>> {
        txn.check_active()?;
        if self.view_ts < txn.start_ts() {
            return Err(StrataError::InvalidState(format!(
                "compaction view {} older than txn start {}",
                self.view_ts,
                txn.start_ts()
            )));
        }
        let prepared = self.prepare_data()?;
        let new = self.create_block(txn, &prepared.batch)?;

        if let Err(e) = self.install(txn, &new, prepared) {
            self.discard(&new);
            return Err(e);
        }
        self.created = Some(new.clone());
        Ok(new)
    }

    fn create_block(&self, txn: &Txn, batch: &RecordBatch) -> Result<Arc<DataBlock>> {
        let ctx = &self.ctx;
        let meta = ctx
            .catalog
            .create_block(self.block.meta().segment, false, EntryVersion::pending(txn))?;
        let built = ctx.files.block_file(meta.id).and_then(|file| {
            DataBlock::create(
                meta.clone(),
                self.block.schema().clone(),
                (batch.num_rows() as u32).max(1),
                ctx.policy,
                file,
                ctx.buffer.clone(),
            )
        });
        match built {
            Ok(block) => Ok(block),
            Err(e) => {
                let _ = ctx.catalog.remove_block(meta.id);
                Err(e)
            }
        }
    }

    /// Write the sorted batch, soft-delete the old block and log the entry
    fn install(&self, txn: &Txn, new: &Arc<DataBlock>, prepared: PreparedData) -> Result<()> {
        let PreparedData { batch, mapping } = prepared;
        let rows = batch.num_rows() as u32;
        new.node().set_size_hint(batch.get_array_memory_size() as u64);
        self.write_file(new, batch.clone())?;

        let pk = batch.column(new.schema().primary_key as usize);
        new.index().batch_insert(pk.as_ref(), 0, rows as usize, 0, true)?;

        let append = {
            let mut state = new.controller().write();
            state.rows = rows;
            state.sealed = true;
            NodeTarget::Append(state.appends.add_node(txn, 0, rows))
        };

        self.ctx.catalog.soft_delete_block(self.block.id(), txn)?;
        self.ctx.blocks.insert(new.clone());

        let entry = CompactBlockEntry::new(
            self.block.clone(),
            new.clone(),
            mapping,
            self.view_ts,
            self.ctx.clone(),
            append,
        );
        let table = self.block.meta().table;
        txn.with_store(|s| {
            s.log_entry(table, Box::new(entry), vec![self.block.id(), new.id()])
        });
        log::info!(
            "txn {} compacting block {} into block {} ({} rows)",
            txn.id(),
            self.block.id(),
            new.id(),
            rows
        );
        Ok(())
    }

    /// Persist the sorted batch through the new block's file, on the I/O pool if there is one
    fn write_file(&self, new: &Arc<DataBlock>, batch: RecordBatch) -> Result<()> {
        let file = new.file().clone();
        let ts = self.view_ts;
        let write = move || {
            write_with_delta(file.as_ref(), &batch, ts, &BlockDelta::default())?;
            file.sync()
        };
        match &self.ctx.scheduler {
            Some(scheduler) => scheduler.schedule_fn(TaskKind::Io, write)?.wait_done(),
            None => write(),
        }
    }

    fn discard(&self, new: &Arc<DataBlock>) {
        let _ = self.ctx.catalog.remove_block(new.id());
        self.ctx.blocks.remove(new.id());
        if let Err(e) = new.destroy() {
            log::warn!("could not remove block {} after failed compaction: {}", new.id(), e);
        }
    }
}
