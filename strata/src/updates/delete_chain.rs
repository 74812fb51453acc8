//! Per-block delete chain
//!
//! Each node carries the bitmap of rows its transaction deleted. Merging
//! folds every committed top-level node into one committed node; the folded
//! nodes stay in the arena as sources so readers older than the merge still
//! resolve them, until `prune_merged` proves no such reader exists.

use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use roaring::RoaringBitmap;

use super::node::{NodeId, NodeState, VersionChain, VersionNode};
use crate::txn::{Timestamp, Txn, TxnId};
use crate::{Result, StrataError};

#[derive(Debug, Clone, Default)]
pub struct DeleteNodeData {
    pub mask: RoaringBitmap,
    /// Nodes folded into this one (merge nodes only)
    sources: Vec<NodeId>,
    merged: bool,
    subsumed_by: Option<NodeId>,
}

impl DeleteNodeData {
    pub fn is_merge(&self) -> bool {
        self.merged
    }
}

fn range_bitmap(from: u32, to: u32) -> RoaringBitmap {
    let mut range = RoaringBitmap::new();
    range.insert_range(from..=to);
    range
}

/// Delete chain contents, reachable only through a lock guard
pub struct DeleteChainState {
    chain: VersionChain<DeleteNodeData>,
}

impl DeleteChainState {
    pub fn add_node(&mut self, txn: &Txn) -> NodeId {
        self.chain.add_node(txn, DeleteNodeData::default())
    }

    fn top_level(&self) -> impl Iterator<Item = &VersionNode<DeleteNodeData>> {
        self.chain
            .iter_newest_first()
            .filter(|n| n.payload.subsumed_by.is_none() && n.state() != NodeState::RolledBack)
    }

    /// Check `[from, to]` can be deleted by the transaction that started at `start_ts`.
    ///
    /// Any overlap with a live range conflicts: a pending range of another
    /// transaction, the caller's own pending range, or a committed one.
    pub fn prepare_range_delete(&self, from: u32, to: u32, start_ts: Timestamp) -> Result<()> {
        if from > to {
            return Err(StrataError::InvalidState(format!("empty delete range [{}, {}]", from, to)));
        }
        let range = range_bitmap(from, to);
        for node in self.top_level() {
            if node.payload.mask.is_disjoint(&range) {
                continue;
            }
            let reason = match node.state() {
                NodeState::Active | NodeState::Preparing if node.start_ts() == start_ts => {
                    "already deleted by this transaction".to_string()
                }
                NodeState::Active | NodeState::Preparing => {
                    format!("pending delete by txn {}", node.txn_id())
                }
                _ => format!("already deleted at {}", node.commit_ts().unwrap_or_default()),
            };
            return Err(StrataError::Conflict(format!("rows [{}, {}] {}", from, to, reason)));
        }
        Ok(())
    }

    /// Record `[from, to]` on `node`; call `prepare_range_delete` first
    pub fn apply_range_delete(&mut self, node: NodeId, from: u32, to: u32) -> Result<()> {
        let node = self.chain.node_mut(node)?;
        node.check_writable()?;
        node.payload.mask.insert_range(from..=to);
        Ok(())
    }

    /// Check then record in one step under the same guard
    pub fn range_delete(&mut self, node: NodeId, from: u32, to: u32) -> Result<()> {
        let start_ts = self.chain.node(node)?.start_ts();
        self.prepare_range_delete(from, to, start_ts)?;
        self.apply_range_delete(node, from, to)
    }

    fn resolve_into(&self, id: NodeId, read_ts: Timestamp, out: &mut RoaringBitmap) {
        let Ok(node) = self.chain.node(id) else { return };
        if node.visible_to(read_ts) {
            *out |= &node.payload.mask;
        } else if node.payload.merged {
            for &src in &node.payload.sources {
                self.resolve_into(src, read_ts, out);
            }
        }
    }

    fn resolve_row(&self, id: NodeId, row: u32, read_ts: Timestamp) -> bool {
        let Ok(node) = self.chain.node(id) else { return false };
        if node.visible_to(read_ts) {
            node.payload.mask.contains(row)
        } else if node.payload.merged {
            node.payload.sources.iter().any(|&src| self.resolve_row(src, row, read_ts))
        } else {
            false
        }
    }

    /// Rows deleted as seen at `read_ts`; `None` when nothing is visible
    pub fn collect_deletes(&self, read_ts: Timestamp) -> Option<RoaringBitmap> {
        let mut out = RoaringBitmap::new();
        for node in self.top_level() {
            self.resolve_into(node.id(), read_ts, &mut out);
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    pub fn is_deleted(&self, row: u32, read_ts: Timestamp) -> bool {
        self.top_level().any(|n| self.resolve_row(n.id(), row, read_ts))
    }

    /// Rows of deletes committed in `(start, end]`
    pub fn collect_committed_in(&self, start: Timestamp, end: Timestamp) -> Option<RoaringBitmap> {
        let mut out = RoaringBitmap::new();
        for node in self.chain.iter() {
            if !node.payload.merged && node.committed_in(start, end) {
                out |= &node.payload.mask;
            }
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Rows deleted by the uncommitted nodes of transaction `txn`
    pub fn collect_pending_of(&self, txn: TxnId) -> Option<RoaringBitmap> {
        let mut out = RoaringBitmap::new();
        for node in self.top_level().filter(|n| n.is_pending() && n.txn_id() == txn) {
            out |= &node.payload.mask;
        }
        if out.is_empty() {
            None
        } else {
            Some(out)
        }
    }

    /// Rows carried by `node`
    pub fn node_mask(&self, node: NodeId) -> Result<RoaringBitmap> {
        Ok(self.chain.node(node)?.payload.mask.clone())
    }

    /// Fold all committed top-level nodes into one committed node.
    ///
    /// Returns `None` when fewer than two committed nodes exist. Pending nodes
    /// stay on top untouched.
    pub fn add_merge_node(&mut self) -> Option<NodeId> {
        let sources: Vec<NodeId> = self
            .top_level()
            .filter(|n| n.is_committed())
            .map(|n| n.id())
            .collect();
        if sources.len() < 2 {
            return None;
        }

        let mut mask = RoaringBitmap::new();
        let mut commit_ts = 0;
        for &id in &sources {
            if let Ok(node) = self.chain.node(id) {
                mask |= &node.payload.mask;
                commit_ts = commit_ts.max(node.commit_ts().unwrap_or_default());
            }
        }

        let merged = self.chain.add_committed(
            commit_ts,
            DeleteNodeData { mask, sources: sources.clone(), merged: true, subsumed_by: None },
        );
        for id in sources {
            if let Ok(node) = self.chain.node_mut(id) {
                node.payload.subsumed_by = Some(merged);
            }
        }
        log::debug!("delete chain merged into node {} at {}", merged, commit_ts);
        Some(merged)
    }

    /// Release the sources of merge nodes no running reader can need.
    ///
    /// Returns the number of nodes whose payload was dropped.
    pub fn prune_merged(&mut self, oldest_active_ts: Timestamp) -> usize {
        let prunable: Vec<NodeId> = self
            .top_level()
            .filter(|n| n.payload.merged && !n.payload.sources.is_empty())
            .filter(|n| n.commit_ts().map(|ts| ts <= oldest_active_ts).unwrap_or(false))
            .map(|n| n.id())
            .collect();

        let mut released = 0;
        let mut stack = Vec::new();
        for id in prunable {
            if let Ok(node) = self.chain.node_mut(id) {
                stack.append(&mut node.payload.sources);
            }
            while let Some(src) = stack.pop() {
                if let Ok(node) = self.chain.node_mut(src) {
                    node.payload.mask = RoaringBitmap::new();
                    stack.append(&mut node.payload.sources);
                    released += 1;
                }
            }
        }
        released
    }

    pub fn prepare(&mut self, node: NodeId) -> Result<()> {
        self.chain.prepare(node)
    }

    pub fn commit(&mut self, node: NodeId, commit_ts: Timestamp) -> Result<()> {
        self.chain.commit(node, commit_ts)
    }

    pub fn rollback(&mut self, node: NodeId) -> Result<()> {
        self.chain.rollback(node)
    }

    /// Live nodes not folded into a merge node
    pub fn depth(&self) -> usize {
        self.top_level().count()
    }

    pub fn has_pending(&self) -> bool {
        self.chain.has_pending()
    }
}

/// Delete chain of one block
pub struct DeleteChain {
    inner: RwLock<DeleteChainState>,
}

impl Default for DeleteChain {
    fn default() -> Self {
        Self::new()
    }
}

impl DeleteChain {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(DeleteChainState { chain: VersionChain::new() }),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, DeleteChainState> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, DeleteChainState> {
        self.inner.write()
    }

    pub fn add_node(&self, txn: &Txn) -> NodeId {
        self.write().add_node(txn)
    }

    pub fn prepare_range_delete(&self, from: u32, to: u32, start_ts: Timestamp) -> Result<()> {
        self.write().prepare_range_delete(from, to, start_ts)
    }

    pub fn range_delete(&self, node: NodeId, from: u32, to: u32) -> Result<()> {
        self.write().range_delete(node, from, to)
    }

    pub fn collect_deletes(&self, read_ts: Timestamp) -> Option<RoaringBitmap> {
        self.read().collect_deletes(read_ts)
    }

    pub fn add_merge_node(&self) -> Option<NodeId> {
        self.write().add_merge_node()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_overlap_and_disjoint_ranges() {
        let chain = DeleteChain::new();
        let t1 = Txn::new(1, 1);
        let t2 = Txn::new(2, 2);

        let n1 = chain.add_node(&t1);
        chain.range_delete(n1, 1, 10).unwrap();
        let err = chain.range_delete(n1, 10, 10).unwrap_err();
        assert!(err.is_conflict());

        // disjoint range from a concurrent txn is fine
        let n2 = chain.add_node(&t2);
        chain.range_delete(n2, 20, 30).unwrap();
        // overlapping a pending range of another txn conflicts
        assert!(chain.prepare_range_delete(5, 6, t2.start_ts()).unwrap_err().is_conflict());
    }

    #[test]
    fn test_collect_deletes_after_commit() {
        let chain = DeleteChain::new();
        let t1 = Txn::new(1, 1);
        let t2 = Txn::new(2, 2);
        let n1 = chain.add_node(&t1);
        let n2 = chain.add_node(&t2);
        chain.range_delete(n1, 1, 10).unwrap();
        chain.range_delete(n2, 20, 30).unwrap();

        assert!(chain.collect_deletes(100).is_none());

        chain.write().commit(n1, 3).unwrap();
        chain.write().commit(n2, 4).unwrap();
        assert_eq!(chain.collect_deletes(3).unwrap().len(), 10);
        assert_eq!(chain.collect_deletes(100).unwrap().len(), 21);
        assert!(chain.read().is_deleted(25, 4));
        assert!(!chain.read().is_deleted(25, 3));
        assert_eq!(chain.read().collect_committed_in(3, 4).unwrap().len(), 11);
    }

    #[test]
    fn test_double_delete_conflicts() {
        let chain = DeleteChain::new();
        let t1 = Txn::new(1, 1);
        let n1 = chain.add_node(&t1);
        chain.range_delete(n1, 3, 3).unwrap();
        chain.write().commit(n1, 2).unwrap();

        let t2 = Txn::new(2, 5);
        let n2 = chain.add_node(&t2);
        assert!(chain.range_delete(n2, 0, 5).unwrap_err().is_conflict());
        chain.range_delete(n2, 4, 5).unwrap();
    }

    #[test]
    fn test_rolled_back_range_is_free_again() {
        let chain = DeleteChain::new();
        let t1 = Txn::new(1, 1);
        let n1 = chain.add_node(&t1);
        chain.range_delete(n1, 0, 9).unwrap();
        chain.write().rollback(n1).unwrap();

        let t2 = Txn::new(2, 2);
        let n2 = chain.add_node(&t2);
        chain.range_delete(n2, 0, 9).unwrap();
        assert_eq!(chain.read().depth(), 1);
    }

    #[test]
    fn test_merge_needs_two_committed() {
        let chain = DeleteChain::new();
        let t1 = Txn::new(1, 1);
        let n1 = chain.add_node(&t1);
        chain.range_delete(n1, 0, 0).unwrap();
        assert!(chain.add_merge_node().is_none());
        chain.write().commit(n1, 2).unwrap();
        assert!(chain.add_merge_node().is_none());
    }

    #[test]
    fn test_merge_with_pending_on_top() {
        let chain = DeleteChain::new();
        let t1 = Txn::new(1, 1);
        let t2 = Txn::new(2, 2);
        let t3 = Txn::new(3, 3);
        let n1 = chain.add_node(&t1);
        let n2 = chain.add_node(&t2);
        let n3 = chain.add_node(&t3);
        chain.range_delete(n1, 1, 10).unwrap();
        chain.range_delete(n2, 20, 30).unwrap();
        chain.range_delete(n3, 40, 50).unwrap();
        chain.write().commit(n1, 4).unwrap();
        chain.write().commit(n2, 5).unwrap();
        assert_eq!(chain.read().depth(), 3);

        let merged = chain.add_merge_node().unwrap();
        {
            let state = chain.read();
            assert_eq!(state.node_mask(merged).unwrap().len(), 21);
            // merge node plus the pending node layered on top
            assert_eq!(state.depth(), 2);
            // readers between the two commits still see only the first range
            assert_eq!(state.collect_deletes(4).unwrap().len(), 10);
            assert_eq!(state.collect_deletes(5).unwrap().len(), 21);
            // the pending node is visible to its owner
            assert_eq!(state.collect_deletes(3).unwrap().len(), 11);
        }

        chain.write().commit(n3, 6).unwrap();
        assert_eq!(chain.collect_deletes(6).unwrap().len(), 32);
        assert!(chain.prepare_range_delete(25, 25, 7).unwrap_err().is_conflict());
    }

    #[test]
    fn test_prune_merged() {
        let chain = DeleteChain::new();
        for i in 0..3u64 {
            let txn = Txn::new(i + 1, i * 10 + 1);
            let n = chain.add_node(&txn);
            chain.range_delete(n, i as u32 * 10, i as u32 * 10 + 4).unwrap();
            chain.write().commit(n, i * 10 + 2).unwrap();
        }
        let merged = chain.add_merge_node().unwrap();
        let merge_ts = 22;

        assert_eq!(chain.write().prune_merged(merge_ts - 1), 0);
        assert_eq!(chain.write().prune_merged(merge_ts), 3);
        let state = chain.read();
        assert_eq!(state.node_mask(merged).unwrap().len(), 15);
        assert_eq!(state.collect_deletes(merge_ts).unwrap().len(), 15);
    }
}
