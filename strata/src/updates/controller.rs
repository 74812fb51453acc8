//! Mutation controller: every version chain of one block plus its row counters
//!
//! The controller's `RwLock<BlockState>` is the block's lock. Appends take it
//! exclusively; snapshot reads and unload delta collection take it shared.
//! Column and delete chains keep their own locks underneath.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use roaring::RoaringBitmap;

use super::append_chain::AppendChain;
use super::column_chain::{ColumnChain, ColumnDelta};
use super::delete_chain::DeleteChain;
use super::node::NodeId;
use crate::config::WriteConflictPolicy;
use crate::txn::{Timestamp, TxnId};
use crate::{Result, StrataError, Value};

/// Row accounting of a block, guarded by the block lock
pub struct BlockState {
    /// Rows physically present in the resident batch
    pub rows: u32,
    /// Slots promised to appenders but not yet written
    pub reserved: u32,
    pub capacity: u32,
    /// No further appends accepted
    pub sealed: bool,
    pub appends: AppendChain,
}

impl BlockState {
    /// Capacity not yet written nor reserved
    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.rows).saturating_sub(self.reserved)
    }

    pub fn is_full(&self) -> bool {
        self.rows >= self.capacity
    }
}

/// A version node of one of the block's chains
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeTarget {
    Column { column: u16, node: NodeId },
    Delete(NodeId),
    Append(NodeId),
}

/// Materialized changes of a block: per-column updates and deleted rows
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BlockDelta {
    pub columns: BTreeMap<u16, ColumnDelta>,
    pub deletes: Option<RoaringBitmap>,
}

impl BlockDelta {
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.deletes.as_ref().map(|d| d.is_empty()).unwrap_or(true)
    }

    /// Layer `newer` on top: its values win per row, deleted rows are unioned
    pub fn overlay(&mut self, newer: BlockDelta) {
        for (column, delta) in newer.columns {
            let target = self.columns.entry(column).or_default();
            for (row, value) in delta.values {
                target.insert(row, value);
            }
        }
        if let Some(rows) = newer.deletes {
            *self.deletes.get_or_insert_with(RoaringBitmap::new) |= rows;
        }
    }

    pub fn update_masks(&self) -> BTreeMap<u16, RoaringBitmap> {
        self.columns.iter().map(|(c, d)| (*c, d.mask.clone())).collect()
    }

    pub fn update_values(&self) -> BTreeMap<u16, BTreeMap<u32, Value>> {
        self.columns.iter().map(|(c, d)| (*c, d.values.clone())).collect()
    }
}

pub struct MutationController {
    columns: Vec<ColumnChain>,
    deletes: DeleteChain,
    state: RwLock<BlockState>,
    /// Newest commit timestamp applied to any chain of the block
    max_visible: AtomicU64,
}

impl MutationController {
    pub fn new(num_columns: usize, capacity: u32, policy: WriteConflictPolicy) -> Self {
        Self {
            columns: (0..num_columns).map(|c| ColumnChain::new(c as u16, policy)).collect(),
            deletes: DeleteChain::new(),
            state: RwLock::new(BlockState {
                rows: 0,
                reserved: 0,
                capacity,
                sealed: false,
                appends: AppendChain::new(),
            }),
            max_visible: AtomicU64::new(0),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, BlockState> {
        self.state.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, BlockState> {
        self.state.write()
    }

    pub fn column(&self, column: u16) -> Result<&ColumnChain> {
        self.columns
            .get(column as usize)
            .ok_or_else(|| StrataError::NotFound(format!("column chain {}", column)))
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn deletes(&self) -> &DeleteChain {
        &self.deletes
    }

    pub fn max_visible(&self) -> Timestamp {
        self.max_visible.load(Ordering::Acquire)
    }

    pub(crate) fn advance_max_visible(&self, ts: Timestamp) {
        self.max_visible.fetch_max(ts, Ordering::AcqRel);
    }

    /// Updates and deletes visible at `read_ts`
    pub fn collect_at(&self, read_ts: Timestamp) -> BlockDelta {
        let _block = self.state.read();
        let mut delta = BlockDelta::default();
        for chain in &self.columns {
            let chain = chain.read();
            if let Some(d) = chain.collect_updates(read_ts) {
                delta.columns.insert(chain.column(), d);
            }
        }
        delta.deletes = self.deletes.read().collect_deletes(read_ts);
        delta
    }

    /// Updates and deletes committed in `(start, end]`
    pub fn collect_changes_in_range(&self, start: Timestamp, end: Timestamp) -> BlockDelta {
        let _block = self.state.read();
        let mut delta = BlockDelta::default();
        for chain in &self.columns {
            let chain = chain.read();
            if let Some(d) = chain.collect_committed_in(start, end) {
                delta.columns.insert(chain.column(), d);
            }
        }
        delta.deletes = self.deletes.read().collect_committed_in(start, end);
        delta
    }

    /// Uncommitted updates and deletes of transaction `txn`
    pub fn collect_pending_of(&self, txn: TxnId) -> BlockDelta {
        let _block = self.state.read();
        let mut delta = BlockDelta::default();
        for chain in &self.columns {
            let chain = chain.read();
            if let Some(d) = chain.collect_pending_of(txn) {
                delta.columns.insert(chain.column(), d);
            }
        }
        delta.deletes = self.deletes.read().collect_pending_of(txn);
        delta
    }

    /// Rows a reader at `read_ts` sees: visible appends minus visible deletes
    pub fn visible_rows(&self, read_ts: Timestamp) -> RoaringBitmap {
        let mut rows = self.state.read().appends.visible_rows(read_ts);
        if let Some(deleted) = self.deletes.read().collect_deletes(read_ts) {
            rows -= deleted;
        }
        rows
    }

    /// Value of `row` in `column` at `read_ts` if the chain overrides the base data
    pub fn get_value(&self, column: u16, row: u32, read_ts: Timestamp) -> Result<Value> {
        self.column(column)?.get_value(row, read_ts)
    }

    /// Any chain holding an uncommitted node
    pub fn has_pending(&self) -> bool {
        self.state.read().appends.has_pending()
            || self.deletes.read().has_pending()
            || self.columns.iter().any(|c| c.read().has_pending())
    }

    // ========================================================================
    // Node lifecycle
    // ========================================================================

    pub fn prepare_node(&self, target: NodeTarget) -> Result<()> {
        match target {
            NodeTarget::Column { column, node } => self.column(column)?.write().prepare(node),
            NodeTarget::Delete(node) => self.deletes.write().prepare(node),
            NodeTarget::Append(node) => self.state.write().appends.prepare(node),
        }
    }

    pub fn commit_node(&self, target: NodeTarget, commit_ts: Timestamp) -> Result<()> {
        match target {
            NodeTarget::Column { column, node } => {
                self.column(column)?.write().commit(node, commit_ts)?
            }
            NodeTarget::Delete(node) => self.deletes.write().commit(node, commit_ts)?,
            NodeTarget::Append(node) => self.state.write().appends.commit(node, commit_ts)?,
        }
        self.advance_max_visible(commit_ts);
        Ok(())
    }

    pub fn rollback_node(&self, target: NodeTarget) -> Result<()> {
        match target {
            NodeTarget::Column { column, node } => self.column(column)?.write().rollback(node),
            NodeTarget::Delete(node) => self.deletes.write().rollback(node),
            NodeTarget::Append(node) => self.state.write().appends.rollback(node),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::txn::Txn;

    fn controller() -> MutationController {
        MutationController::new(2, 8, WriteConflictPolicy::Permissive)
    }

    #[test]
    fn test_capacity_accounting() {
        let ctrl = controller();
        let mut state = ctrl.write();
        assert_eq!(state.remaining(), 8);
        state.reserved = 3;
        state.rows = 4;
        assert_eq!(state.remaining(), 1);
        state.rows = 8;
        assert!(state.is_full());
        assert_eq!(state.remaining(), 0);
    }

    #[test]
    fn test_commit_advances_max_visible_and_collects() {
        let ctrl = controller();
        let t1 = Txn::new(1, 1);
        let col = ctrl.column(1).unwrap().add_node(&t1);
        ctrl.column(1).unwrap().try_update(3, Value::Int64(9), col).unwrap();
        let del = ctrl.deletes().add_node(&t1);
        ctrl.deletes().range_delete(del, 5, 6).unwrap();
        let app = ctrl.write().appends.add_node(&t1, 0, 8);

        assert!(ctrl.has_pending());
        assert!(ctrl.collect_at(10).is_empty());

        for target in [
            NodeTarget::Column { column: 1, node: col },
            NodeTarget::Delete(del),
            NodeTarget::Append(app),
        ] {
            ctrl.prepare_node(target).unwrap();
            ctrl.commit_node(target, 4).unwrap();
        }
        assert_eq!(ctrl.max_visible(), 4);
        assert!(!ctrl.has_pending());

        let delta = ctrl.collect_at(ctrl.max_visible());
        assert_eq!(delta.columns[&1].values[&3], Value::Int64(9));
        assert_eq!(delta.deletes.as_ref().unwrap().len(), 2);
        assert_eq!(delta.update_masks()[&1].len(), 1);

        assert_eq!(ctrl.collect_changes_in_range(1, 4), delta);
        assert!(ctrl.collect_changes_in_range(4, 9).is_empty());

        let visible = ctrl.visible_rows(4);
        assert_eq!(visible.iter().collect::<Vec<_>>(), vec![0, 1, 2, 3, 4, 7]);
        assert!(ctrl.visible_rows(3).is_empty());
        assert!(ctrl.column(2).is_err());
    }

    #[test]
    fn test_pending_of_one_txn_overlays_committed() {
        let ctrl = controller();
        let t1 = Txn::new(1, 1);
        let n1 = ctrl.column(1).unwrap().add_node(&t1);
        ctrl.column(1).unwrap().try_update(2, Value::Int64(1), n1).unwrap();
        ctrl.column(1).unwrap().try_update(3, Value::Int64(1), n1).unwrap();
        let d1 = ctrl.deletes().add_node(&t1);
        ctrl.deletes().range_delete(d1, 0, 0).unwrap();
        for target in [NodeTarget::Column { column: 1, node: n1 }, NodeTarget::Delete(d1)] {
            ctrl.prepare_node(target).unwrap();
            ctrl.commit_node(target, 2).unwrap();
        }

        let own = Txn::new(2, 3);
        let other = Txn::new(3, 4);
        let n2 = ctrl.column(1).unwrap().add_node(&own);
        ctrl.column(1).unwrap().try_update(3, Value::Int64(7), n2).unwrap();
        let d2 = ctrl.deletes().add_node(&own);
        ctrl.deletes().range_delete(d2, 5, 5).unwrap();
        let n3 = ctrl.column(0).unwrap().add_node(&other);
        ctrl.column(0).unwrap().try_update(4, Value::Int64(8), n3).unwrap();

        let pending = ctrl.collect_pending_of(own.id());
        assert!(!pending.columns.contains_key(&0));
        assert_eq!(pending.columns[&1].values.len(), 1);
        assert_eq!(pending.deletes.as_ref().unwrap().iter().collect::<Vec<_>>(), vec![5]);

        let mut delta = ctrl.collect_changes_in_range(1, 2);
        delta.overlay(pending);
        assert_eq!(delta.columns[&1].values[&2], Value::Int64(1));
        assert_eq!(delta.columns[&1].values[&3], Value::Int64(7));
        assert_eq!(delta.deletes.unwrap().iter().collect::<Vec<_>>(), vec![0, 5]);
        assert!(ctrl.collect_pending_of(9).is_empty());
    }

    #[test]
    fn test_rollback_node() {
        let ctrl = controller();
        let t1 = Txn::new(1, 1);
        let col = ctrl.column(0).unwrap().add_node(&t1);
        ctrl.column(0).unwrap().try_update(0, Value::Int64(1), col).unwrap();
        ctrl.rollback_node(NodeTarget::Column { column: 0, node: col }).unwrap();
        assert!(!ctrl.has_pending());
        assert!(ctrl.get_value(0, 0, 1).unwrap_err().is_not_found());
        assert_eq!(ctrl.max_visible(), 0);
    }
}
