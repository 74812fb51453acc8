//! Table data: blocks, their resident nodes, the append path and the
//! transaction entries that commit block-level changes

mod appender;
mod block;
mod entries;
mod node;

pub use appender::BlockAppender;
pub use block::DataBlock;
pub use entries::UpdateEntry;
pub use node::BlockNode;

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::catalog::BlockId;
use crate::{Result, StrataError};

/// Live blocks by id, shared between the facade and compaction entries
#[derive(Default, Clone)]
pub struct BlockSet {
    blocks: Arc<RwLock<HashMap<BlockId, Arc<DataBlock>>>>,
}

impl BlockSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, block: Arc<DataBlock>) {
        self.blocks.write().insert(block.id(), block);
    }

    pub fn get(&self, id: BlockId) -> Result<Arc<DataBlock>> {
        self.blocks
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StrataError::NotFound(format!("block {}", id)))
    }

    pub fn remove(&self, id: BlockId) -> Option<Arc<DataBlock>> {
        self.blocks.write().remove(&id)
    }

    /// Snapshot of every block, in no particular order
    pub fn all(&self) -> Vec<Arc<DataBlock>> {
        self.blocks.read().values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.blocks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blocks.read().is_empty()
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Arc;

    use arrow::record_batch::RecordBatch;

    use super::DataBlock;
    use crate::buffer::NodeManager;
    use crate::catalog::{Catalog, EntryVersion, SegmentEntry, TableEntry};
    use crate::data::build_array;
    use crate::dataio::{FileFactory, MockFileFactory};
    use crate::txn::{TimestampAllocator, TxnManager};
    use crate::wal::MemWal;
    use crate::{DataType, Schema, Value, WriteConflictPolicy};

    pub(crate) fn schema() -> Schema {
        Schema::new("t")
            .column("id", DataType::Int64)
            .column("name", DataType::String)
            .primary_key("id")
            .unwrap()
    }

    pub(crate) fn batch(ids: &[i64], names: &[&str]) -> RecordBatch {
        let ids: Vec<Value> = ids.iter().map(|v| Value::Int64(*v)).collect();
        let names: Vec<Value> = names.iter().map(|s| Value::from(*s)).collect();
        RecordBatch::try_new(
            schema().arrow_schema(),
            vec![
                build_array(DataType::Int64, ids.iter()).unwrap(),
                build_array(DataType::String, names.iter()).unwrap(),
            ],
        )
        .unwrap()
    }

    /// One table with one segment over mock files
    pub(crate) struct TestTable {
        pub catalog: Arc<Catalog>,
        pub table: Arc<TableEntry>,
        pub segment: Arc<SegmentEntry>,
        pub buffer: NodeManager,
        pub files: Arc<MockFileFactory>,
        pub timestamps: Arc<TimestampAllocator>,
        pub wal: Arc<MemWal>,
        pub capacity: u32,
    }

    impl TestTable {
        pub(crate) fn new(capacity: u32, budget: u64) -> Self {
            let catalog = Arc::new(Catalog::new());
            let db = catalog.create_database("db").unwrap();
            let table = catalog.create_table(db.id, schema()).unwrap();
            let segment = catalog.create_segment(table.id, false).unwrap();
            Self {
                catalog,
                table,
                segment,
                buffer: NodeManager::new(budget),
                files: Arc::new(MockFileFactory::new()),
                timestamps: Arc::new(TimestampAllocator::new()),
                wal: Arc::new(MemWal::new()),
                capacity,
            }
        }

        pub(crate) fn block(&self, appendable: bool) -> Arc<DataBlock> {
            let meta = self
                .catalog
                .create_block(self.segment.id, appendable, EntryVersion::committed(0))
                .unwrap();
            let file = self.files.block_file(meta.id).unwrap();
            DataBlock::create(
                meta,
                self.table.schema.clone(),
                self.capacity,
                WriteConflictPolicy::Permissive,
                file,
                self.buffer.clone(),
            )
            .unwrap()
        }

        pub(crate) fn txn_manager(&self) -> TxnManager {
            TxnManager::new(self.timestamps.clone(), self.wal.clone())
        }
    }
}
