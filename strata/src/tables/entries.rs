//! Transaction entry driving one version node of a block

use std::sync::Arc;

use roaring::RoaringBitmap;

use super::block::DataBlock;
use crate::txn::{Txn, TxnEntry};
use crate::updates::{NodeTarget, UpdateCmd};
use crate::wal::WalIndex;
use crate::{Result, StrataError};

/// Commits or rolls back the node a transaction holds in one of a block's chains
pub struct UpdateEntry {
    block: Arc<DataBlock>,
    target: NodeTarget,
}

impl UpdateEntry {
    pub fn new(block: Arc<DataBlock>, target: NodeTarget) -> Self {
        Self { block, target }
    }

    pub fn target(&self) -> NodeTarget {
        self.target
    }
}

impl TxnEntry for UpdateEntry {
    fn prepare_commit(&mut self, txn: &Txn) -> Result<()> {
        // a compaction that already committed took the rows elsewhere
        if let Some(deleted) = self.block.meta().deleted() {
            if deleted.commit_ts.is_some() {
                return Err(StrataError::Conflict(format!(
                    "block {} was replaced before txn {} committed",
                    self.block.id(),
                    txn.id()
                )));
            }
        }
        self.block.controller().prepare_node(self.target)
    }

    fn apply_commit(&mut self, txn: &Txn, _index: &WalIndex) -> Result<()> {
        let commit_ts = txn
            .commit_ts()
            .ok_or_else(|| StrataError::Invariant(format!("txn {} has no commit ts", txn.id())))?;
        let ctrl = self.block.controller();
        ctrl.commit_node(self.target, commit_ts)?;
        if let NodeTarget::Delete(node) = self.target {
            let mask = ctrl.deletes().read().node_mask(node)?;
            self.block.index().retire_rows(&mask);
        }
        Ok(())
    }

    fn apply_rollback(&mut self, _txn: &Txn) -> Result<()> {
        let ctrl = self.block.controller();
        if let NodeTarget::Append(node) = self.target {
            let range = ctrl.read().appends.range(node)?;
            let mut rows = RoaringBitmap::new();
            rows.insert_range(range.start_row..range.end_row());
            self.block.index().remove_rows(&rows);
        }
        ctrl.rollback_node(self.target)
    }

    fn make_command(&self, _txn: &Txn, id: u32) -> Result<Option<UpdateCmd>> {
        let ctrl = self.block.controller();
        let block = self.block.id();
        let cmd = match self.target {
            NodeTarget::Column { column, node } => {
                let delta = ctrl.column(column)?.read().node_delta(node)?;
                if delta.is_empty() {
                    return Ok(None);
                }
                UpdateCmd::Update { id, block, column, delta }
            }
            NodeTarget::Delete(node) => {
                let mask = ctrl.deletes().read().node_mask(node)?;
                if mask.is_empty() {
                    return Ok(None);
                }
                UpdateCmd::Delete { id, block, mask }
            }
            NodeTarget::Append(node) => {
                let range = ctrl.read().appends.range(node)?;
                UpdateCmd::Append { id, block, start_row: range.start_row, rows: range.rows }
            }
        };
        Ok(Some(cmd))
    }
}
