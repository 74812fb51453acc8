//! A data block: catalog entry, version chains, resident data, PK index

use std::sync::Arc;

use arrow::array::{ArrayRef, UInt32Array};
use arrow::compute::take;
use arrow::record_batch::RecordBatch;
use roaring::RoaringBitmap;

use super::entries::UpdateEntry;
use super::node::BlockNode;
use crate::buffer::{NodeHandle, NodeManager};
use crate::catalog::{BlockEntry, BlockId};
use crate::config::WriteConflictPolicy;
use crate::data::{apply_updates, value_at};
use crate::dataio::BlockFile;
use crate::index::{HashPkIndex, PrimaryKeyIndex};
use crate::txn::{NodeSlot, Timestamp, Txn};
use crate::updates::{MutationController, NodeId, NodeTarget};
use crate::{Result, Schema, StrataError, Value};

pub struct DataBlock {
    meta: Arc<BlockEntry>,
    schema: Arc<Schema>,
    ctrl: Arc<MutationController>,
    node: Arc<BlockNode>,
    index: Arc<dyn PrimaryKeyIndex>,
    buffer: NodeManager,
}

impl DataBlock {
    /// Build a block over `file` and register its data with the buffer pool
    pub fn create(
        meta: Arc<BlockEntry>,
        schema: Arc<Schema>,
        capacity: u32,
        policy: WriteConflictPolicy,
        file: Arc<dyn BlockFile>,
        buffer: NodeManager,
    ) -> Result<Arc<Self>> {
        let ctrl = Arc::new(MutationController::new(schema.num_columns(), capacity, policy));
        let node = Arc::new(BlockNode::new(meta.id, schema.clone(), ctrl.clone(), file, 0));
        buffer.register(node.clone())?;
        Ok(Arc::new(Self {
            meta,
            schema,
            ctrl,
            node,
            index: Arc::new(HashPkIndex::with_capacity(capacity as usize)),
            buffer,
        }))
    }

    pub fn id(&self) -> BlockId {
        self.meta.id
    }

    pub fn meta(&self) -> &Arc<BlockEntry> {
        &self.meta
    }

    pub fn schema(&self) -> &Arc<Schema> {
        &self.schema
    }

    pub fn controller(&self) -> &Arc<MutationController> {
        &self.ctrl
    }

    pub fn node(&self) -> &Arc<BlockNode> {
        &self.node
    }

    pub fn index(&self) -> &Arc<dyn PrimaryKeyIndex> {
        &self.index
    }

    pub fn file(&self) -> &Arc<dyn BlockFile> {
        self.node.file()
    }

    /// Keep the block's data resident while the handle lives
    pub fn pin(&self) -> Result<NodeHandle> {
        self.buffer.pin(self.id())
    }

    /// Rows physically present, committed or not
    pub fn rows(&self) -> u32 {
        self.ctrl.read().rows
    }

    pub fn visible_rows(&self, read_ts: Timestamp) -> RoaringBitmap {
        self.ctrl.visible_rows(read_ts)
    }

    fn check_visible(&self, row: u32, read_ts: Timestamp) -> Result<()> {
        if self.ctrl.visible_rows(read_ts).contains(row) {
            Ok(())
        } else {
            Err(StrataError::NotFound(format!("row {} of block {} at ts {}", row, self.id(), read_ts)))
        }
    }

    /// Value of one cell as seen at `read_ts`
    pub fn get_value(&self, column: u16, row: u32, read_ts: Timestamp) -> Result<Value> {
        self.check_visible(row, read_ts)?;
        match self.ctrl.get_value(column, row, read_ts) {
            Err(e) if e.is_not_found() => {}
            other => return other,
        }
        let _pin = self.pin()?;
        let batch = self.node.batch()?;
        value_at(batch.column(column as usize).as_ref(), row as usize)
    }

    /// Row holding primary key `key` at `read_ts`
    ///
    /// Walks every row the key has had so a snapshot older than a committed
    /// delete still finds the row it can see.
    pub fn find_row(&self, key: &Value, read_ts: Timestamp) -> Option<u32> {
        let held = self.index.rows_of(key);
        if held.is_empty() {
            return None;
        }
        let visible = self.ctrl.visible_rows(read_ts);
        held.into_iter().find(|row| visible.contains(*row))
    }

    /// Rows visible at `read_ts` with their updates applied, `None` when nothing is visible
    pub fn scan(&self, read_ts: Timestamp) -> Result<Option<RecordBatch>> {
        let _pin = self.pin()?;
        let batch = self.node.batch()?;
        let delta = self.ctrl.collect_at(read_ts);
        let rows = self.ctrl.visible_rows(read_ts);
        if rows.is_empty() {
            return Ok(None);
        }
        if rows.max().unwrap_or(0) as usize >= batch.num_rows() {
            return Err(StrataError::Invariant(format!(
                "block {} has visible rows beyond its {} resident rows",
                self.id(),
                batch.num_rows()
            )));
        }

        let indices = UInt32Array::from_iter_values(rows.iter());
        let mut columns: Vec<ArrayRef> = Vec::with_capacity(batch.num_columns());
        for (i, array) in batch.columns().iter().enumerate() {
            let array = match delta.columns.get(&(i as u16)) {
                Some(d) => apply_updates(array, self.schema.data_type(i as u16)?, &d.values)?,
                None => array.clone(),
            };
            columns.push(take(array.as_ref(), &indices, None)?);
        }
        Ok(Some(RecordBatch::try_new(self.schema.arrow_schema(), columns)?))
    }

    /// Node `txn` owns in the chain behind `slot`, created and logged on first use
    fn txn_node(self: &Arc<Self>, txn: &Txn, slot: NodeSlot, add: impl FnOnce() -> NodeId) -> NodeId {
        if let Some(node) = txn.with_store(|s| s.node(slot)) {
            return node;
        }
        let node = add();
        let target = match slot {
            NodeSlot::Update { column, .. } => NodeTarget::Column { column, node },
            NodeSlot::Delete { .. } => NodeTarget::Delete(node),
        };
        let entry = UpdateEntry::new(self.clone(), target);
        txn.with_store(|s| {
            s.bind_node(slot, node);
            s.log_entry(self.meta.table, Box::new(entry), vec![self.id()]);
        });
        node
    }

    /// Set `row` of `column` to `value` within `txn`
    pub fn update(self: &Arc<Self>, txn: &Txn, column: u16, row: u32, value: Value) -> Result<()> {
        txn.check_active()?;
        if column == self.schema.primary_key {
            return Err(StrataError::InvalidState(format!(
                "primary key column {} cannot be updated",
                self.schema.pk_column().name
            )));
        }
        let def = self
            .schema
            .columns
            .get(column as usize)
            .ok_or_else(|| StrataError::NotFound(format!("column index {}", column)))?;
        match value.data_type() {
            Some(dt) if dt != def.data_type => {
                return Err(StrataError::InvalidState(format!(
                    "column {} expects {:?}, got {:?}",
                    def.name, def.data_type, dt
                )))
            }
            None if !def.nullable => {
                return Err(StrataError::InvalidState(format!("column {} is not nullable", def.name)))
            }
            _ => {}
        }
        self.check_visible(row, txn.start_ts())?;

        let chain = self.ctrl.column(column)?;
        let mut state = chain.write();
        let slot = NodeSlot::Update { block: self.id(), column };
        let node = self.txn_node(txn, slot, || state.add_node(txn));
        state.try_update(row, value, node)
    }

    /// Delete rows `[from, to]` within `txn`
    pub fn range_delete(self: &Arc<Self>, txn: &Txn, from: u32, to: u32) -> Result<()> {
        txn.check_active()?;
        if from > to {
            return Err(StrataError::InvalidState(format!("empty delete range [{}, {}]", from, to)));
        }
        let appended = self.ctrl.read().appends.visible_rows(txn.start_ts());
        let mut range = RoaringBitmap::new();
        range.insert_range(from..=to);
        if !appended.is_superset(&range) {
            return Err(StrataError::NotFound(format!(
                "rows [{}, {}] of block {} not all visible",
                from,
                to,
                self.id()
            )));
        }

        let mut state = self.ctrl.deletes().write();
        state.prepare_range_delete(from, to, txn.start_ts())?;
        let slot = NodeSlot::Delete { block: self.id() };
        let node = self.txn_node(txn, slot, || state.add_node(txn));
        state.apply_range_delete(node, from, to)
    }

    /// Fold committed delete nodes into one; see `DeleteChainState::add_merge_node`
    pub fn merge_deletes(&self) -> Option<NodeId> {
        self.ctrl.deletes().add_merge_node()
    }

    /// Release merged delete payloads no reader at or after `oldest_active_ts` needs
    pub fn prune_deletes(&self, oldest_active_ts: Timestamp) -> usize {
        self.ctrl.deletes().write().prune_merged(oldest_active_ts)
    }

    /// Drop index entries of rows whose delete every running reader already sees
    pub fn purge_index(&self, oldest_active_ts: Timestamp) -> usize {
        match self.ctrl.deletes().collect_deletes(oldest_active_ts) {
            Some(rows) => self.index.remove_rows(&rows),
            None => 0,
        }
    }

    /// Persist data and deltas visible at `ts` through the block file
    pub fn checkpoint(&self, ts: Timestamp) -> Result<()> {
        let _pin = self.pin()?;
        self.node.persist(ts)
    }

    /// Forget the block: drop it from the buffer pool and remove its file
    pub fn destroy(&self) -> Result<()> {
        self.buffer.unregister(self.id())?;
        self.file().destroy()?;
        log::debug!("destroyed block {}", self.id());
        Ok(())
    }
}

impl std::fmt::Debug for DataBlock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataBlock")
            .field("id", &self.id())
            .field("rows", &self.rows())
            .field("max_visible", &self.ctrl.max_visible())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tables::testing::{batch, TestTable};
    use crate::tables::BlockAppender;
    use crate::txn::TxnManager;

    fn commit(mgr: &TxnManager, txn: &Txn) -> Timestamp {
        mgr.commit(txn).unwrap()
    }

    #[test]
    fn test_update_visibility() {
        let t = TestTable::new(16, 1 << 20);
        let block = t.block(true);
        let mgr = t.txn_manager();

        let txn = mgr.begin();
        BlockAppender::new(block.clone())
            .apply_append(&batch(&[1, 2, 3], &["a", "b", "c"]), 0, 3, &txn)
            .unwrap();
        commit(&mgr, &txn);

        let reader = mgr.begin();
        let writer = mgr.begin();
        block.update(&writer, 1, 1, Value::from("B")).unwrap();
        // own write visible, others still see the base value
        assert_eq!(block.get_value(1, 1, writer.start_ts()).unwrap(), Value::from("B"));
        assert_eq!(block.get_value(1, 1, reader.start_ts()).unwrap(), Value::from("b"));
        let ts = commit(&mgr, &writer);

        assert_eq!(block.get_value(1, 1, reader.start_ts()).unwrap(), Value::from("b"));
        assert_eq!(block.get_value(1, 1, ts).unwrap(), Value::from("B"));

        let scanned = block.scan(ts).unwrap().unwrap();
        assert_eq!(scanned.num_rows(), 3);
        assert_eq!(value_at(scanned.column(1).as_ref(), 1).unwrap(), Value::from("B"));
    }

    #[test]
    fn test_update_rejects_pk_and_bad_types() {
        let t = TestTable::new(16, 1 << 20);
        let block = t.block(true);
        let mgr = t.txn_manager();
        let txn = mgr.begin();
        BlockAppender::new(block.clone())
            .apply_append(&batch(&[1], &["a"]), 0, 1, &txn)
            .unwrap();

        assert!(block.update(&txn, 0, 0, Value::Int64(9)).is_err());
        assert!(block.update(&txn, 1, 0, Value::Int64(9)).is_err());
        assert!(block.update(&txn, 1, 5, Value::from("x")).unwrap_err().is_not_found());
        block.update(&txn, 1, 0, Value::from("x")).unwrap();
    }

    #[test]
    fn test_range_delete_commit_retires_keys() {
        let t = TestTable::new(16, 1 << 20);
        let block = t.block(true);
        let mgr = t.txn_manager();

        let txn = mgr.begin();
        BlockAppender::new(block.clone())
            .apply_append(&batch(&[1, 2, 3, 4], &["a", "b", "c", "d"]), 0, 4, &txn)
            .unwrap();
        commit(&mgr, &txn);

        let txn = mgr.begin();
        block.range_delete(&txn, 1, 2).unwrap();
        // self overlap
        assert!(block.range_delete(&txn, 2, 2).unwrap_err().is_conflict());
        block.range_delete(&txn, 3, 3).unwrap();
        let ts = commit(&mgr, &txn);

        assert_eq!(block.visible_rows(ts).iter().collect::<Vec<_>>(), vec![0]);
        assert!(!block.index().contains(&Value::Int64(2)));
        assert!(block.index().contains(&Value::Int64(1)));
        assert_eq!(block.find_row(&Value::Int64(1), ts), Some(0));
        // an older snapshot still finds the deleted key
        assert_eq!(block.find_row(&Value::Int64(2), ts), None);
        assert_eq!(block.find_row(&Value::Int64(2), txn.start_ts()), Some(1));
        assert_eq!(block.purge_index(txn.start_ts()), 0);
        assert_eq!(block.purge_index(ts), 3);
        assert!(block.index().rows_of(&Value::Int64(2)).is_empty());

        let again = mgr.begin();
        assert!(block.range_delete(&again, 1, 1).unwrap_err().is_conflict());
        assert!(block.range_delete(&again, 8, 9).unwrap_err().is_not_found());
    }

    #[test]
    fn test_rollback_discards_updates() {
        let t = TestTable::new(16, 1 << 20);
        let block = t.block(true);
        let mgr = t.txn_manager();

        let txn = mgr.begin();
        BlockAppender::new(block.clone())
            .apply_append(&batch(&[1, 2], &["a", "b"]), 0, 2, &txn)
            .unwrap();
        commit(&mgr, &txn);

        let txn = mgr.begin();
        block.update(&txn, 1, 0, Value::from("z")).unwrap();
        block.range_delete(&txn, 1, 1).unwrap();
        mgr.rollback(&txn).unwrap();

        let after = mgr.begin();
        assert_eq!(block.get_value(1, 0, after.start_ts()).unwrap(), Value::from("a"));
        assert_eq!(block.visible_rows(after.start_ts()).len(), 2);
        // the rolled back node no longer blocks writers
        block.update(&after, 1, 0, Value::from("y")).unwrap();
    }

    #[test]
    fn test_checkpoint_and_reload() {
        let t = TestTable::new(16, 1 << 20);
        let block = t.block(true);
        let mgr = t.txn_manager();

        let txn = mgr.begin();
        BlockAppender::new(block.clone())
            .apply_append(&batch(&[1, 2], &["a", "b"]), 0, 2, &txn)
            .unwrap();
        let ts = commit(&mgr, &txn);
        let txn = mgr.begin();
        block.update(&txn, 1, 1, Value::from("bb")).unwrap();
        let ts2 = commit(&mgr, &txn);
        assert!(ts2 > ts);

        block.checkpoint(ts2).unwrap();
        let file = t.files.file(block.id()).unwrap();
        assert_eq!(file.max_visible(), ts2);
        let delta = file.load_deltas().unwrap();
        assert_eq!(delta.columns[&1].values[&1], Value::from("bb"));

        // evict and read back through the file
        t.buffer.unload(block.id()).unwrap();
        assert!(!block.node().is_loaded());
        assert_eq!(block.get_value(0, 1, ts2).unwrap(), Value::Int64(2));
        assert!(block.node().is_loaded());
    }
}
