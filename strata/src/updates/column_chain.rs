//! Per-column update chain
//!
//! ```text
//!   arena:  [n0][n1][n2][n3]        (creation order, ids are indices)
//!   rows:   7  -> [n0, n2]          (oldest → newest link per row)
//!           12 -> [n1]
//! ```
//!
//! Point lookups walk only the links of one row. All mutation goes through
//! `ColumnChain::write()`; the guard derefs to `ColumnChainState`, which is the
//! only place the locked operations exist.

use std::collections::BTreeMap;

use ahash::AHashMap;
use parking_lot::{RwLock, RwLockReadGuard, RwLockWriteGuard};
use roaring::RoaringBitmap;

use super::node::{NodeId, NodeState, VersionChain};
use crate::config::WriteConflictPolicy;
use crate::txn::{Timestamp, Txn, TxnId};
use crate::{Result, StrataError, Value};

/// Materialized updates of one column: row mask plus the value of each masked row
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ColumnDelta {
    pub mask: RoaringBitmap,
    pub values: BTreeMap<u32, Value>,
}

impl ColumnDelta {
    pub fn insert(&mut self, row: u32, value: Value) {
        self.mask.insert(row);
        self.values.insert(row, value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Column chain contents, reachable only through a lock guard
pub struct ColumnChainState {
    column: u16,
    policy: WriteConflictPolicy,
    chain: VersionChain<BTreeMap<u32, Value>>,
    rows: AHashMap<u32, Vec<NodeId>>,
}

impl ColumnChainState {
    pub fn column(&self) -> u16 {
        self.column
    }

    /// Open a node for `txn`; no conflict check happens until a row is written
    pub fn add_node(&mut self, txn: &Txn) -> NodeId {
        self.chain.add_node(txn, BTreeMap::new())
    }

    /// Write `value` to `row` through `node`
    pub fn try_update(&mut self, row: u32, value: Value, node: NodeId) -> Result<()> {
        let writer_start = {
            let writer = self.chain.node(node)?;
            writer.check_writable()?;
            writer.start_ts()
        };

        let head = self.rows.get(&row).and_then(|links| links.last().copied());
        if let Some(head) = head {
            if head == node {
                self.chain.node_mut(node)?.payload.insert(row, value);
                return Ok(());
            }
            let head = self.chain.node(head)?;
            match head.state() {
                NodeState::Active | NodeState::Preparing => {
                    return Err(StrataError::Conflict(format!(
                        "row {} of column {} is being updated by txn {}",
                        row,
                        self.column,
                        head.txn_id()
                    )));
                }
                NodeState::Committed => {
                    let newer = head.commit_ts().map(|ts| ts > writer_start).unwrap_or(false);
                    if self.policy == WriteConflictPolicy::FirstCommitterWins && newer {
                        return Err(StrataError::Conflict(format!(
                            "row {} of column {} was updated after snapshot {}",
                            row, self.column, writer_start
                        )));
                    }
                }
                NodeState::RolledBack => {}
            }
        }

        self.chain.node_mut(node)?.payload.insert(row, value);
        self.rows.entry(row).or_default().push(node);
        Ok(())
    }

    /// Newest value of `row` visible at `read_ts`; `NotFound` means the base
    /// column holds the value
    pub fn get_value(&self, row: u32, read_ts: Timestamp) -> Result<Value> {
        let not_found = || StrataError::NotFound(format!("no version of row {} at {}", row, read_ts));
        let links = self.rows.get(&row).ok_or_else(not_found)?;
        for &id in links.iter().rev() {
            let node = self.chain.node(id)?;
            if node.visible_to(read_ts) {
                if let Some(v) = node.payload.get(&row) {
                    return Ok(v.clone());
                }
            }
        }
        Err(not_found())
    }

    /// Every row's visible value at `read_ts`; `None` when nothing is visible
    pub fn collect_updates(&self, read_ts: Timestamp) -> Option<ColumnDelta> {
        self.collect_by(|n| n.visible_to(read_ts))
    }

    /// Newest value per row among nodes committed in `(start, end]`
    pub fn collect_committed_in(&self, start: Timestamp, end: Timestamp) -> Option<ColumnDelta> {
        self.collect_by(|n| n.committed_in(start, end))
    }

    /// Newest value per row among the uncommitted nodes of transaction `txn`
    pub fn collect_pending_of(&self, txn: TxnId) -> Option<ColumnDelta> {
        self.collect_by(|n| n.is_pending() && n.txn_id() == txn)
    }

    fn collect_by(
        &self,
        pick: impl Fn(&super::node::VersionNode<BTreeMap<u32, Value>>) -> bool,
    ) -> Option<ColumnDelta> {
        let mut delta = ColumnDelta::default();
        for (&row, links) in &self.rows {
            let found = links
                .iter()
                .rev()
                .filter_map(|&id| self.chain.node(id).ok())
                .find(|n| pick(n));
            if let Some(v) = found.and_then(|n| n.payload.get(&row)) {
                delta.insert(row, v.clone());
            }
        }
        if delta.is_empty() {
            None
        } else {
            Some(delta)
        }
    }

    /// Rows written by `node`
    pub fn node_rows(&self, node: NodeId) -> Result<Vec<u32>> {
        Ok(self.chain.node(node)?.payload.keys().copied().collect())
    }

    /// Updates carried by `node`, used to build its redo command
    pub fn node_delta(&self, node: NodeId) -> Result<ColumnDelta> {
        let mut delta = ColumnDelta::default();
        for (&row, v) in &self.chain.node(node)?.payload {
            delta.insert(row, v.clone());
        }
        Ok(delta)
    }

    pub fn prepare(&mut self, node: NodeId) -> Result<()> {
        self.chain.prepare(node)
    }

    pub fn commit(&mut self, node: NodeId, commit_ts: Timestamp) -> Result<()> {
        self.chain.commit(node, commit_ts)
    }

    /// Mark `node` rolled back and detach its row links
    pub fn rollback(&mut self, node: NodeId) -> Result<()> {
        self.chain.rollback(node)?;
        let rows: Vec<u32> = self.chain.node(node)?.payload.keys().copied().collect();
        for row in rows {
            if let Some(links) = self.rows.get_mut(&row) {
                links.retain(|&id| id != node);
                if links.is_empty() {
                    self.rows.remove(&row);
                }
            }
        }
        Ok(())
    }

    /// Nodes that were not rolled back
    pub fn depth(&self) -> usize {
        self.chain.live_len()
    }

    /// Number of versions layered on `row`
    pub fn row_depth(&self, row: u32) -> usize {
        self.rows.get(&row).map(|l| l.len()).unwrap_or(0)
    }

    pub fn has_pending(&self) -> bool {
        self.chain.has_pending()
    }
}

/// Update chain of one column of one block
pub struct ColumnChain {
    inner: RwLock<ColumnChainState>,
}

impl ColumnChain {
    pub fn new(column: u16, policy: WriteConflictPolicy) -> Self {
        Self {
            inner: RwLock::new(ColumnChainState {
                column,
                policy,
                chain: VersionChain::new(),
                rows: AHashMap::new(),
            }),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, ColumnChainState> {
        self.inner.read()
    }

    pub fn write(&self) -> RwLockWriteGuard<'_, ColumnChainState> {
        self.inner.write()
    }

    pub fn add_node(&self, txn: &Txn) -> NodeId {
        self.write().add_node(txn)
    }

    pub fn try_update(&self, row: u32, value: Value, node: NodeId) -> Result<()> {
        self.write().try_update(row, value, node)
    }

    pub fn get_value(&self, row: u32, read_ts: Timestamp) -> Result<Value> {
        self.read().get_value(row, read_ts)
    }

    pub fn collect_updates(&self, read_ts: Timestamp) -> Option<ColumnDelta> {
        self.read().collect_updates(read_ts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chain() -> ColumnChain {
        ColumnChain::new(0, WriteConflictPolicy::Permissive)
    }

    #[test]
    fn test_write_then_read_at_snapshots() {
        let chain = chain();
        let t1 = Txn::new(1, 1);
        let n1 = chain.add_node(&t1);
        chain.try_update(5, Value::Int64(50), n1).unwrap();

        // own write visible to itself only
        assert_eq!(chain.get_value(5, 1).unwrap(), Value::Int64(50));
        assert!(chain.get_value(5, 2).unwrap_err().is_not_found());

        chain.write().commit(n1, 4).unwrap();
        assert!(chain.get_value(5, 3).unwrap_err().is_not_found());
        for ts in 4..10 {
            assert_eq!(chain.get_value(5, ts).unwrap(), Value::Int64(50));
        }
        assert!(chain.get_value(6, 9).unwrap_err().is_not_found());
    }

    #[test]
    fn test_same_node_overwrites() {
        let chain = chain();
        let t1 = Txn::new(1, 1);
        let n1 = chain.add_node(&t1);
        chain.try_update(3, Value::from("a"), n1).unwrap();
        chain.try_update(3, Value::from("b"), n1).unwrap();
        assert_eq!(chain.read().row_depth(3), 1);
        assert_eq!(chain.get_value(3, 1).unwrap(), Value::from("b"));
    }

    #[test]
    fn test_conflict_then_new_link_after_commit() {
        let chain = chain();
        let t1 = Txn::new(1, 1);
        let t2 = Txn::new(2, 2);
        let n1 = chain.add_node(&t1);
        let n2 = chain.add_node(&t2);

        chain.try_update(7, Value::Int32(1), n1).unwrap();
        let err = chain.try_update(7, Value::Int32(2), n2).unwrap_err();
        assert!(err.is_conflict());
        // untouched rows stay writable for the loser
        chain.try_update(8, Value::Int32(2), n2).unwrap();

        chain.write().commit(n1, 3).unwrap();
        let depth_before = chain.read().row_depth(7);

        let t3 = Txn::new(3, 4);
        let n3 = chain.add_node(&t3);
        chain.try_update(7, Value::Int32(3), n3).unwrap();
        assert_eq!(chain.read().row_depth(7), depth_before + 1);

        chain.write().commit(n3, 5).unwrap();
        assert_eq!(chain.get_value(7, 3).unwrap(), Value::Int32(1));
        assert_eq!(chain.get_value(7, 4).unwrap(), Value::Int32(1));
        assert_eq!(chain.get_value(7, 5).unwrap(), Value::Int32(3));
    }

    #[test]
    fn test_permissive_vs_first_committer_wins() {
        for (policy, expect_ok) in [
            (WriteConflictPolicy::Permissive, true),
            (WriteConflictPolicy::FirstCommitterWins, false),
        ] {
            let chain = ColumnChain::new(1, policy);
            let early = Txn::new(1, 1);
            let writer = Txn::new(2, 2);
            let n_writer = chain.add_node(&writer);
            let n_early = chain.add_node(&early);
            chain.try_update(0, Value::Int64(1), n_writer).unwrap();
            chain.write().commit(n_writer, 3).unwrap();

            // early snapshot (1) overwrites a value committed at 3
            let res = chain.try_update(0, Value::Int64(2), n_early);
            assert_eq!(res.is_ok(), expect_ok, "{:?}", policy);
            if let Err(e) = res {
                assert!(e.is_conflict());
            }
        }
    }

    #[test]
    fn test_rollback_detaches_links() {
        let chain = chain();
        let t1 = Txn::new(1, 1);
        let n1 = chain.add_node(&t1);
        chain.try_update(1, Value::Int64(10), n1).unwrap();
        chain.write().rollback(n1).unwrap();
        assert_eq!(chain.read().row_depth(1), 0);
        assert_eq!(chain.read().depth(), 0);

        let t2 = Txn::new(2, 2);
        let n2 = chain.add_node(&t2);
        chain.try_update(1, Value::Int64(20), n2).unwrap();
        chain.write().commit(n2, 3).unwrap();
        assert_eq!(chain.get_value(1, 3).unwrap(), Value::Int64(20));
    }

    #[test]
    fn test_write_through_finished_node_is_invariant_violation() {
        let chain = chain();
        let t1 = Txn::new(1, 1);
        let n1 = chain.add_node(&t1);
        chain.write().commit(n1, 2).unwrap();
        let err = chain.try_update(0, Value::Null, n1).unwrap_err();
        assert!(matches!(err, StrataError::Invariant(_)));
    }

    #[test]
    fn test_collect_updates() {
        let chain = chain();
        assert!(chain.collect_updates(100).is_none());

        let t1 = Txn::new(1, 1);
        let n1 = chain.add_node(&t1);
        for row in [2u32, 4, 6] {
            chain.try_update(row, Value::UInt32(row * 10), n1).unwrap();
        }
        assert!(chain.collect_updates(100).is_none());
        chain.write().commit(n1, 3).unwrap();

        let t2 = Txn::new(2, 4);
        let n2 = chain.add_node(&t2);
        chain.try_update(4, Value::UInt32(44), n2).unwrap();
        chain.write().commit(n2, 6).unwrap();

        let at5 = chain.collect_updates(5).unwrap();
        assert_eq!(at5.mask.iter().collect::<Vec<_>>(), vec![2, 4, 6]);
        assert_eq!(at5.values[&4], Value::UInt32(40));
        let at6 = chain.collect_updates(6).unwrap();
        assert_eq!(at6.values[&4], Value::UInt32(44));

        let range = chain.read().collect_committed_in(3, 6).unwrap();
        assert_eq!(range.mask.iter().collect::<Vec<_>>(), vec![4]);
        assert!(chain.read().collect_committed_in(6, 10).is_none());
    }

    #[test]
    fn test_concurrent_writers_one_winner() {
        use std::sync::atomic::{AtomicUsize, Ordering};
        use std::sync::Arc;

        let chain = Arc::new(chain());
        let wins = AtomicUsize::new(0);
        let conflicts = AtomicUsize::new(0);
        std::thread::scope(|s| {
            for i in 0..8u64 {
                let chain = chain.clone();
                let wins = &wins;
                let conflicts = &conflicts;
                s.spawn(move || {
                    let txn = Txn::new(i + 1, i + 1);
                    let node = chain.add_node(&txn);
                    match chain.try_update(42, Value::UInt64(i), node) {
                        Ok(()) => wins.fetch_add(1, Ordering::SeqCst),
                        Err(e) => {
                            assert!(e.is_conflict());
                            conflicts.fetch_add(1, Ordering::SeqCst)
                        }
                    };
                });
            }
        });
        assert_eq!(wins.load(Ordering::SeqCst), 1);
        assert_eq!(conflicts.load(Ordering::SeqCst), 7);
        assert_eq!(chain.read().row_depth(42), 1);
    }
}
