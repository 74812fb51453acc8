//! Append path: reserve capacity in a block, then copy rows into it

use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use roaring::RoaringBitmap;

use super::block::DataBlock;
use super::entries::UpdateEntry;
use crate::txn::Txn;
use crate::updates::NodeTarget;
use crate::{Result, StrataError};

/// One writer's handle for appending into a block
///
/// Slots reserved with `prepare_append` are held until consumed by
/// `apply_append` or given back on drop.
pub struct BlockAppender {
    block: Arc<DataBlock>,
    placeholder: u32,
}

impl BlockAppender {
    pub fn new(block: Arc<DataBlock>) -> Self {
        Self { block, placeholder: 0 }
    }

    pub fn block(&self) -> &Arc<DataBlock> {
        &self.block
    }

    /// Slots reserved by this appender and not yet written
    pub fn reserved(&self) -> u32 {
        self.placeholder
    }

    /// Reserve up to `rows` slots; 0 when the block is full or sealed
    pub fn prepare_append(&mut self, rows: u32) -> u32 {
        let mut state = self.block.controller().write();
        if state.sealed {
            return 0;
        }
        let n = rows.min(state.remaining());
        state.reserved += n;
        self.placeholder += n;
        n
    }

    /// Copy `batch[offset..offset + length]` into the block as rows owned by `txn`
    ///
    /// Returns the append node and the first row written. Keys are checked
    /// against the block's primary-key index before anything is written.
    pub fn apply_append(
        &mut self,
        batch: &RecordBatch,
        offset: usize,
        length: usize,
        txn: &Txn,
    ) -> Result<(NodeTarget, u32)> {
        txn.check_active()?;
        let block = &self.block;
        let schema = block.schema();
        schema.check_batch(batch)?;
        if offset + length > batch.num_rows() {
            return Err(StrataError::InvalidState(format!(
                "append slice {}..{} beyond batch of {} rows",
                offset,
                offset + length,
                batch.num_rows()
            )));
        }
        let rows = u32::try_from(length)
            .map_err(|_| StrataError::InvalidState(format!("append of {} rows", length)))?;

        // pin before the block lock; loading never waits on it
        let _pin = block.pin()?;
        let ctrl = block.controller();
        let mut state = ctrl.write();
        if state.sealed || rows > state.remaining() + self.placeholder {
            return Err(StrataError::NotAppendable);
        }

        let start_row = state.rows;
        let keys = batch.column(schema.primary_key as usize);
        block.index().batch_insert(keys.as_ref(), offset, length, start_row, false)?;
        if let Err(e) = block.node().append(&batch.slice(offset, length)) {
            let mut written = RoaringBitmap::new();
            written.insert_range(start_row..start_row + rows);
            block.index().remove_rows(&written);
            return Err(e);
        }

        state.rows += rows;
        let consumed = rows.min(self.placeholder);
        state.reserved = state.reserved.saturating_sub(consumed);
        self.placeholder -= consumed;
        let node = state.appends.add_node(txn, start_row, rows);
        if state.is_full() {
            state.sealed = true;
            block.meta().seal();
        }
        drop(state);

        let target = NodeTarget::Append(node);
        let entry = UpdateEntry::new(block.clone(), target);
        txn.with_store(|s| s.log_entry(block.meta().table, Box::new(entry), vec![block.id()]));
        log::trace!("txn {} appended rows {}..{} to block {}", txn.id(), start_row, start_row + rows, block.id());
        Ok((target, start_row))
    }

    /// Give unused reserved slots back to the block
    pub fn release(&mut self) {
        if self.placeholder > 0 {
            let mut state = self.block.controller().write();
            state.reserved = state.reserved.saturating_sub(self.placeholder);
            self.placeholder = 0;
        }
    }
}

impl Drop for BlockAppender {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::testing::{batch, TestTable};
    use crate::{Value, StrataError};

    #[test]
    fn test_prepare_reserves_capacity() {
        let t = TestTable::new(10, 1 << 20);
        let block = t.block(true);
        let mut a = BlockAppender::new(block.clone());
        let mut b = BlockAppender::new(block.clone());

        assert_eq!(a.prepare_append(6), 6);
        assert_eq!(b.prepare_append(6), 4);
        assert_eq!(BlockAppender::new(block.clone()).prepare_append(1), 0);

        b.release();
        assert_eq!(block.controller().read().remaining(), 4);
        drop(a);
        assert_eq!(block.controller().read().remaining(), 10);
    }

    #[test]
    fn test_apply_append_and_visibility() {
        let t = TestTable::new(10, 1 << 20);
        let block = t.block(true);
        let mgr = t.txn_manager();
        let txn = mgr.begin();

        let mut appender = BlockAppender::new(block.clone());
        assert_eq!(appender.prepare_append(3), 3);
        let data = batch(&[7, 8, 9, 10], &["a", "b", "c", "d"]);
        let (target, start) = appender.apply_append(&data, 1, 3, &txn).unwrap();
        assert_eq!(start, 0);
        assert!(matches!(target, NodeTarget::Append(_)));
        assert_eq!(appender.reserved(), 0);
        assert_eq!(block.rows(), 3);
        assert_eq!(block.controller().read().reserved, 0);

        let other = mgr.begin();
        assert!(block.visible_rows(other.start_ts()).is_empty());
        assert_eq!(block.visible_rows(txn.start_ts()).len(), 3);

        let ts = mgr.commit(&txn).unwrap();
        assert_eq!(block.get_value(0, 0, ts).unwrap(), Value::Int64(8));
        assert_eq!(block.find_row(&Value::Int64(10), ts), Some(2));
        assert!(block.visible_rows(other.start_ts()).is_empty());
    }

    #[test]
    fn test_duplicate_key_writes_nothing() {
        let t = TestTable::new(10, 1 << 20);
        let block = t.block(true);
        let mgr = t.txn_manager();
        let txn = mgr.begin();
        let mut appender = BlockAppender::new(block.clone());
        appender.apply_append(&batch(&[1, 2], &["a", "b"]), 0, 2, &txn).unwrap();

        let err = appender.apply_append(&batch(&[3, 2], &["c", "b"]), 0, 2, &txn).unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(block.rows(), 2);
        assert!(!block.index().contains(&Value::Int64(3)));
    }

    #[test]
    fn test_full_block_seals() {
        let t = TestTable::new(4, 1 << 20);
        let block = t.block(true);
        let mgr = t.txn_manager();
        let txn = mgr.begin();
        let mut appender = BlockAppender::new(block.clone());

        assert!(matches!(
            appender.apply_append(&batch(&[1, 2, 3, 4, 5], &["a", "b", "c", "d", "e"]), 0, 5, &txn),
            Err(StrataError::NotAppendable)
        ));
        appender.apply_append(&batch(&[1, 2, 3, 4], &["a", "b", "c", "d"]), 0, 4, &txn).unwrap();
        assert!(!block.meta().is_appendable());
        assert_eq!(appender.prepare_append(1), 0);
        assert!(matches!(
            appender.apply_append(&batch(&[5], &["e"]), 0, 1, &txn),
            Err(StrataError::NotAppendable)
        ));
    }

    #[test]
    fn test_rollback_removes_keys() {
        let t = TestTable::new(10, 1 << 20);
        let block = t.block(true);
        let mgr = t.txn_manager();
        let txn = mgr.begin();
        BlockAppender::new(block.clone())
            .apply_append(&batch(&[1, 2], &["a", "b"]), 0, 2, &txn)
            .unwrap();
        mgr.rollback(&txn).unwrap();

        assert!(block.index().is_empty());
        let txn = mgr.begin();
        assert!(block.visible_rows(txn.start_ts()).is_empty());
        // the key may be appended again; the rolled back rows stay as dead space
        let (_, start) = BlockAppender::new(block.clone())
            .apply_append(&batch(&[1], &["a"]), 0, 1, &txn)
            .unwrap();
        assert_eq!(start, 2);
    }

    #[test]
    fn test_concurrent_appenders_get_disjoint_ranges() {
        use rand::Rng;

        let t = TestTable::new(4096, 1 << 24);
        let block = t.block(true);
        let mgr = t.txn_manager();
        let ranges = parking_lot::Mutex::new(Vec::new());

        std::thread::scope(|s| {
            for worker in 0..8i64 {
                let block = block.clone();
                let mgr = &mgr;
                let ranges = &ranges;
                s.spawn(move || {
                    let mut rng = rand::thread_rng();
                    for round in 0..20i64 {
                        let len = rng.gen_range(1..=8usize);
                        let base = (worker * 1000 + round) * 10;
                        let ids: Vec<i64> = (0..len as i64).map(|i| base + i).collect();
                        let names: Vec<&str> = ids.iter().map(|_| "x").collect();
                        let txn = mgr.begin();
                        let mut appender = BlockAppender::new(block.clone());
                        assert_eq!(appender.prepare_append(len as u32), len as u32);
                        let (_, start) = appender.apply_append(&batch(&ids, &names), 0, len, &txn).unwrap();
                        ranges.lock().push((start, start + len as u32));
                        mgr.commit(&txn).unwrap();
                    }
                });
            }
        });

        let mut ranges = ranges.into_inner();
        ranges.sort();
        for pair in ranges.windows(2) {
            assert!(pair[0].1 <= pair[1].0, "overlap {:?} {:?}", pair[0], pair[1]);
        }
        let total: u32 = ranges.iter().map(|(s, e)| e - s).sum();
        assert_eq!(block.rows(), total);
        let reader = mgr.begin();
        assert_eq!(block.visible_rows(reader.start_ts()).len() as u32, total);
    }
}
