//! Per-transaction write set

use std::collections::HashMap;

use super::entry::TxnEntry;
use crate::catalog::{BlockId, TableId};
use crate::updates::NodeId;

/// Chain a transaction holds an open version node on
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NodeSlot {
    Update { block: BlockId, column: u16 },
    Delete { block: BlockId },
}

/// Entries logged by a transaction plus the version nodes it already owns
///
/// A transaction keeps a single node per chain; later writes to the same chain
/// reuse it.
#[derive(Default)]
pub struct TxnStore {
    entries: Vec<Box<dyn TxnEntry>>,
    nodes: HashMap<NodeSlot, NodeId>,
}

impl TxnStore {
    /// Register an entry to be driven through commit or rollback
    pub fn log_entry(&mut self, table: TableId, entry: Box<dyn TxnEntry>, affected: Vec<BlockId>) {
        log::trace!("logged entry {} on table {} over blocks {:?}", self.entries.len(), table, affected);
        self.entries.push(entry);
    }

    pub fn node(&self, slot: NodeSlot) -> Option<NodeId> {
        self.nodes.get(&slot).copied()
    }

    pub fn bind_node(&mut self, slot: NodeSlot, node: NodeId) {
        self.nodes.insert(slot, node);
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn take_entries(&mut self) -> Vec<Box<dyn TxnEntry>> {
        self.nodes.clear();
        std::mem::take(&mut self.entries)
    }
}
