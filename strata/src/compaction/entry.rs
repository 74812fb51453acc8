//! Transaction entry that swaps a compacted block for its sorted replacement

use std::sync::Arc;

use roaring::RoaringBitmap;

use super::CompactionContext;
use super::sort::RowMapping;
use crate::tables::DataBlock;
use crate::tasks::{FnTask, TaskKind};
use crate::txn::{Timestamp, Txn, TxnEntry};
use crate::updates::{NodeTarget, UpdateCmd};
use crate::wal::WalIndex;
use crate::{Result, StrataError};

/// Commits the replacement block, or tears it down on rollback
///
/// Changes other transactions committed to the old block after the view the
/// sorted data was built from are replayed onto the new block at prepare time,
/// followed by the owning transaction's own uncommitted changes to it.
pub struct CompactBlockEntry {
    old: Arc<DataBlock>,
    new: Arc<DataBlock>,
    mapping: RowMapping,
    view_ts: Timestamp,
    ctx: CompactionContext,
    /// The append node covering every row of the new block
    append: NodeTarget,
    /// Nodes created on the new block while replaying
    replayed: Vec<NodeTarget>,
}

impl CompactBlockEntry {
    pub(crate) fn new(
        old: Arc<DataBlock>,
        new: Arc<DataBlock>,
        mapping: RowMapping,
        view_ts: Timestamp,
        ctx: CompactionContext,
        append: NodeTarget,
    ) -> Self {
        Self { old, new, mapping, view_ts, ctx, append, replayed: Vec::new() }
    }

    fn replay(&mut self, txn: &Txn, commit_ts: Timestamp) -> Result<()> {
        let old = self.old.controller();
        let mut delta = old.collect_changes_in_range(self.view_ts, commit_ts);
        delta.overlay(old.collect_pending_of(txn.id()));
        if delta.is_empty() {
            return Ok(());
        }
        let ctrl = self.new.controller();

        for (column, changes) in &delta.columns {
            let mut state = ctrl.column(*column)?.write();
            let node = state.add_node(txn);
            self.replayed.push(NodeTarget::Column { column: *column, node });
            for (row, value) in &changes.values {
                if let Some(new_row) = self.mapping.get(*row) {
                    state.try_update(new_row, value.clone(), node)?;
                }
            }
        }

        if let Some(deletes) = &delta.deletes {
            let rows = self.mapping.remap(deletes);
            if !rows.is_empty() {
                let mut state = ctrl.deletes().write();
                let node = state.add_node(txn);
                self.replayed.push(NodeTarget::Delete(node));
                for (from, to) in runs(&rows) {
                    state.range_delete(node, from, to)?;
                }
            }
        }

        log::debug!(
            "compaction of block {} replayed {} columns, {} deletes from ({}, {}] and own writes",
            self.old.id(),
            delta.columns.len(),
            delta.deletes.as_ref().map(|d| d.len()).unwrap_or(0),
            self.view_ts,
            commit_ts
        );
        Ok(())
    }

    /// Runs under the commit lock, so the queue is never waited on: a full
    /// queue makes the checkpoint run inline instead.
    fn schedule_old_checkpoint(&self, ts: Timestamp) {
        let id = self.old.id();
        let checkpoint_inline = || {
            if let Err(e) = self.old.checkpoint(ts) {
                log::warn!("checkpoint of compacted block {} failed: {}", id, e);
            }
        };
        let Some(scheduler) = &self.ctx.scheduler else {
            checkpoint_inline();
            return;
        };
        let old = self.old.clone();
        match scheduler.try_schedule_scoped_fn(TaskKind::Checkpoint, id, move || old.checkpoint(ts)) {
            Ok(_) => {}
            Err(StrataError::ScopeConflict(_)) => {
                log::debug!("checkpoint of block {} already in flight", id)
            }
            Err(StrataError::QueueFull) => {
                log::debug!("task queue full, checkpointing block {} inline", id);
                checkpoint_inline();
            }
            Err(e) => log::warn!("could not schedule checkpoint of block {}: {}", id, e),
        }
    }
}

/// Contiguous `[from, to]` runs of a bitmap
fn runs(rows: &RoaringBitmap) -> Vec<(u32, u32)> {
    let mut out: Vec<(u32, u32)> = Vec::new();
    for row in rows {
        match out.last_mut() {
            Some((_, to)) if *to + 1 == row => *to = row,
            _ => out.push((row, row)),
        }
    }
    out
}

impl TxnEntry for CompactBlockEntry {
    fn prepare_commit(&mut self, txn: &Txn) -> Result<()> {
        let commit_ts = txn
            .commit_ts()
            .ok_or_else(|| StrataError::Invariant(format!("txn {} has no commit ts", txn.id())))?;
        self.replay(txn, commit_ts)?;

        let ctrl = self.new.controller();
        ctrl.prepare_node(self.append)?;
        for target in &self.replayed {
            ctrl.prepare_node(*target)?;
        }
        Ok(())
    }

    fn apply_commit(&mut self, txn: &Txn, index: &WalIndex) -> Result<()> {
        let commit_ts = txn
            .commit_ts()
            .ok_or_else(|| StrataError::Invariant(format!("txn {} has no commit ts", txn.id())))?;
        let ctrl = self.new.controller();
        ctrl.commit_node(self.append, commit_ts)?;
        for target in &self.replayed {
            ctrl.commit_node(*target, commit_ts)?;
            if let NodeTarget::Delete(node) = target {
                let mask = ctrl.deletes().read().node_mask(*node)?;
                self.new.index().retire_rows(&mask);
            }
        }
        self.new.meta().commit_create(commit_ts);
        self.old.meta().commit_delete(commit_ts);

        if let Some(scheduler) = &self.ctx.scheduler {
            scheduler.checkpoint(&[*index])?;
        }
        self.schedule_old_checkpoint(commit_ts);
        log::info!(
            "block {} compacted into block {} at ts {}",
            self.old.id(),
            self.new.id(),
            commit_ts
        );
        Ok(())
    }

    fn apply_rollback(&mut self, txn: &Txn) -> Result<()> {
        let ctrl = self.new.controller();
        let mut first_err = None;
        for target in self.replayed.iter().chain(std::iter::once(&self.append)) {
            if let Err(e) = ctrl.rollback_node(*target) {
                first_err.get_or_insert(e);
            }
        }

        self.ctx.catalog.undo_soft_delete(self.old.id())?;
        self.ctx.catalog.remove_block(self.new.id())?;
        self.ctx.blocks.remove(self.new.id());

        let new = self.new.clone();
        let destroy = move || new.destroy();
        match &self.ctx.scheduler {
            Some(scheduler) => {
                match scheduler.try_schedule(Box::new(FnTask::new(TaskKind::Io, destroy)), false) {
                    Ok(_) => {}
                    Err(StrataError::QueueFull) => self.new.destroy()?,
                    Err(e) => log::warn!("could not schedule removal of block {}: {}", self.new.id(), e),
                }
            }
            None => destroy()?,
        }
        log::info!("txn {} rolled back compaction of block {}", txn.id(), self.old.id());
        first_err.map_or(Ok(()), Err)
    }

    fn make_command(&self, _txn: &Txn, id: u32) -> Result<Option<UpdateCmd>> {
        Ok(Some(UpdateCmd::CompactBlock { id, from: self.old.id(), to: self.new.id() }))
    }
}
