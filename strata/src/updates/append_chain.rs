//! Append nodes: which row ranges of a block each transaction appended

use roaring::RoaringBitmap;

use super::node::{NodeId, VersionChain};
use crate::txn::{Timestamp, Txn};
use crate::Result;

/// Row range `[start_row, start_row + rows)` written by one append
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AppendRange {
    pub start_row: u32,
    pub rows: u32,
}

impl AppendRange {
    pub fn end_row(&self) -> u32 {
        self.start_row + self.rows
    }
}

#[derive(Default)]
pub struct AppendChain {
    chain: VersionChain<AppendRange>,
}

impl AppendChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_node(&mut self, txn: &Txn, start_row: u32, rows: u32) -> NodeId {
        self.chain.add_node(txn, AppendRange { start_row, rows })
    }

    pub fn range(&self, node: NodeId) -> Result<AppendRange> {
        Ok(*self.chain.node(node)?.payload())
    }

    /// Rows whose append is visible at `read_ts`
    pub fn visible_rows(&self, read_ts: Timestamp) -> RoaringBitmap {
        let mut rows = RoaringBitmap::new();
        for node in self.chain.iter().filter(|n| n.visible_to(read_ts)) {
            let r = node.payload();
            if r.rows > 0 {
                rows.insert_range(r.start_row..r.end_row());
            }
        }
        rows
    }

    /// Rows appended by transactions committed in `(start, end]`
    pub fn committed_rows_in(&self, start: Timestamp, end: Timestamp) -> RoaringBitmap {
        let mut rows = RoaringBitmap::new();
        for node in self.chain.iter().filter(|n| n.committed_in(start, end)) {
            let r = node.payload();
            if r.rows > 0 {
                rows.insert_range(r.start_row..r.end_row());
            }
        }
        rows
    }

    pub fn has_pending(&self) -> bool {
        self.chain.has_pending()
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

    pub fn len(&self) -> usize {
        self.chain.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chain.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_visible_rows() {
        let mut chain = AppendChain::new();
        let t1 = Txn::new(1, 1);
        let t2 = Txn::new(2, 2);
        let t3 = Txn::new(3, 3);
        let a = chain.add_node(&t1, 0, 4);
        let b = chain.add_node(&t2, 4, 2);
        let c = chain.add_node(&t3, 6, 3);

        chain.commit(b, 5).unwrap();
        chain.rollback(c).unwrap();
        assert_eq!(chain.visible_rows(5).iter().collect::<Vec<_>>(), vec![4, 5]);
        // t1 sees its own pending rows
        assert_eq!(chain.visible_rows(1).len(), 4);
        assert!(chain.has_pending());

        chain.commit(a, 6).unwrap();
        assert_eq!(chain.visible_rows(10).len(), 6);
        assert_eq!(chain.committed_rows_in(5, 6).len(), 4);
        assert!(!chain.has_pending());
        assert_eq!(chain.range(c).unwrap().end_row(), 9);
    }
}
