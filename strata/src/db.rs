//! Database facade
//!
//! Wires the catalog, transactions, buffer pool, block files, scheduler and
//! compaction into table-level operations. Each table appends into one current
//! block at a time and opens a new block (and segment) when it fills up.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use arrow::record_batch::RecordBatch;
use parking_lot::{Mutex, RwLock};

use crate::buffer::{BufferStatsSnapshot, NodeManager};
use crate::catalog::{BlockId, Catalog, DbId, EntryVersion, SegmentEntry, TableEntry, TableId};
use crate::compaction::{CompactBlockTask, CompactionContext};
use crate::config::StrataConfig;
use crate::data::slice_values;
use crate::dataio::{FileFactory, LocalFileFactory, MockFileFactory};
use crate::index::IndexKey;
use crate::tables::{BlockAppender, BlockSet, DataBlock};
use crate::tasks::{TaskHandle, TaskKind, TaskScheduler};
use crate::txn::{Timestamp, Txn, TxnManager};
use crate::wal::{FileWal, LogStore, MemWal};
use crate::{Result, Schema, StrataError, Value};

/// Where a table's next rows go
#[derive(Default)]
struct AppendCursor {
    segment: Option<Arc<SegmentEntry>>,
    block: Option<Arc<DataBlock>>,
}

struct TableData {
    entry: Arc<TableEntry>,
    /// Held for a whole append so key checks and block choice see one state
    cursor: Mutex<AppendCursor>,
}

/// Engine counters
#[derive(Debug, Clone)]
pub struct DbStats {
    pub committed: u64,
    pub aborted: u64,
    pub active: usize,
    pub blocks: usize,
    pub resident_bytes: u64,
    pub buffer: BufferStatsSnapshot,
}

pub struct Db {
    config: StrataConfig,
    catalog: Arc<Catalog>,
    txns: Arc<TxnManager>,
    files: Arc<dyn FileFactory>,
    buffer: NodeManager,
    scheduler: Arc<TaskScheduler>,
    blocks: BlockSet,
    tables: RwLock<HashMap<TableId, Arc<TableData>>>,
}

impl Db {
    /// Open an engine; on disk under `data_dir` when set, in memory otherwise
    pub fn open(config: StrataConfig) -> Result<Self> {
        config.validate()?;
        let (wal, files): (Arc<dyn LogStore>, Arc<dyn FileFactory>) = match &config.data_dir {
            Some(dir) => {
                let wal: Arc<dyn LogStore> = Arc::new(FileWal::open(&dir.join("wal"))?);
                let files: Arc<dyn FileFactory> = Arc::new(LocalFileFactory::new(dir.join("blocks"))?);
                (wal, files)
            }
            None => (Arc::new(MemWal::new()), Arc::new(MockFileFactory::new())),
        };
        let scheduler = Arc::new(TaskScheduler::new(
            config.workers,
            config.queue_capacity,
            config.blocking_submit,
            wal.clone(),
        )?);
        log::info!(
            "opened strata ({}), block rows {}, budget {} bytes",
            config
                .data_dir
                .as_ref()
                .map(|d| d.display().to_string())
                .unwrap_or_else(|| "in memory".into()),
            config.block_max_rows,
            config.memory_budget
        );

        Ok(Self {
            catalog: Arc::new(Catalog::new()),
            txns: Arc::new(TxnManager::new(Arc::new(crate::TimestampAllocator::new()), wal)),
            files,
            buffer: NodeManager::new(config.memory_budget),
            scheduler,
            blocks: BlockSet::new(),
            tables: RwLock::new(HashMap::new()),
            config,
        })
    }

    pub fn config(&self) -> &StrataConfig {
        &self.config
    }

    pub fn catalog(&self) -> &Arc<Catalog> {
        &self.catalog
    }

    pub fn buffer(&self) -> &NodeManager {
        &self.buffer
    }

    pub fn scheduler(&self) -> &Arc<TaskScheduler> {
        &self.scheduler
    }

    pub fn txn_manager(&self) -> &TxnManager {
        &self.txns
    }

    // ========================================================================
    // DDL
    // ========================================================================

    pub fn create_database(&self, name: &str) -> Result<DbId> {
        Ok(self.catalog.create_database(name)?.id)
    }

    pub fn create_table(&self, db: DbId, schema: Schema) -> Result<TableId> {
        let entry = self.catalog.create_table(db, schema)?;
        let id = entry.id;
        self.tables
            .write()
            .insert(id, Arc::new(TableData { entry, cursor: Mutex::new(AppendCursor::default()) }));
        Ok(id)
    }

    fn table(&self, id: TableId) -> Result<Arc<TableData>> {
        self.tables
            .read()
            .get(&id)
            .cloned()
            .ok_or_else(|| StrataError::NotFound(format!("table {}", id)))
    }

    pub fn schema(&self, table: TableId) -> Result<Arc<Schema>> {
        Ok(self.table(table)?.entry.schema.clone())
    }

    // ========================================================================
    // Transactions
    // ========================================================================

    pub fn begin(&self) -> Arc<Txn> {
        self.txns.begin()
    }

    pub fn commit(&self, txn: &Txn) -> Result<Timestamp> {
        self.txns.commit(txn)
    }

    pub fn rollback(&self, txn: &Txn) -> Result<()> {
        self.txns.rollback(txn)
    }

    // ========================================================================
    // Writes
    // ========================================================================

    /// Append every row of `batch` to `table` within `txn`
    ///
    /// Keys are checked against every block of the table first. A failure
    /// after some rows landed leaves them owned by `txn`, which must roll back.
    pub fn append(&self, txn: &Txn, table: TableId, batch: &RecordBatch) -> Result<()> {
        txn.check_active()?;
        let data = self.table(table)?;
        data.entry.schema.check_batch(batch)?;
        let mut cursor = data.cursor.lock();
        self.check_unique(&data, txn, batch)?;

        let total = batch.num_rows();
        let mut offset = 0;
        while offset < total {
            let current = cursor.block.clone().filter(|b| b.meta().is_appendable());
            let block = match current {
                Some(b) => b,
                None => self.open_block(&data, &mut cursor)?,
            };
            let mut appender = BlockAppender::new(block);
            let wanted = u32::try_from(total - offset).unwrap_or(u32::MAX);
            let n = appender.prepare_append(wanted);
            if n == 0 {
                cursor.block = None;
                continue;
            }
            match appender.apply_append(batch, offset, n as usize, txn) {
                Ok(_) => offset += n as usize,
                Err(StrataError::NotAppendable) => cursor.block = None,
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Keys of `batch` must be unique among themselves and absent from every live block
    fn check_unique(&self, data: &TableData, txn: &Txn, batch: &RecordBatch) -> Result<()> {
        let schema = &data.entry.schema;
        let keys = slice_values(batch.column(schema.primary_key as usize).as_ref(), 0, batch.num_rows())?;
        let mut seen = HashSet::with_capacity(keys.len());
        for key in &keys {
            if !seen.insert(IndexKey::from_value(key)) {
                return Err(StrataError::Duplicate(format!("{:?} repeats within the batch", key)));
            }
        }
        for meta in self.catalog.table_blocks(data.entry.id, txn.start_ts())? {
            let block = self.blocks.get(meta.id)?;
            if let Some(key) = keys.iter().find(|k| block.index().contains(k)) {
                return Err(StrataError::Duplicate(format!("{:?} already in block {}", key, meta.id)));
            }
        }
        Ok(())
    }

    fn open_block(&self, data: &TableData, cursor: &mut AppendCursor) -> Result<Arc<DataBlock>> {
        let max_blocks = self.config.segment_max_blocks as usize;
        let reuse = cursor
            .segment
            .as_ref()
            .filter(|s| !s.is_closed() && s.block_count() < max_blocks)
            .cloned();
        let segment = match reuse {
            Some(s) => s,
            None => {
                if let Some(prev) = cursor.segment.take() {
                    prev.close();
                }
                let s = self.catalog.create_segment(data.entry.id, false)?;
                cursor.segment = Some(s.clone());
                s
            }
        };

        // appendable blocks exist for every snapshot; their rows carry visibility
        let meta = self.catalog.create_block(segment.id, true, EntryVersion::committed(0))?;
        let file = self.files.block_file(meta.id)?;
        let block = DataBlock::create(
            meta,
            data.entry.schema.clone(),
            self.config.block_max_rows,
            self.config.write_conflict,
            file,
            self.buffer.clone(),
        )?;
        self.blocks.insert(block.clone());
        cursor.block = Some(block.clone());
        log::debug!("table {} opened block {} in segment {}", data.entry.id, block.id(), segment.id);
        Ok(block)
    }

    /// Block and row holding `key` as seen by `txn`
    fn locate(&self, txn: &Txn, table: TableId, key: &Value) -> Result<Option<(Arc<DataBlock>, u32)>> {
        for meta in self.catalog.table_blocks(table, txn.start_ts())? {
            let block = self.blocks.get(meta.id)?;
            if let Some(row) = block.find_row(key, txn.start_ts()) {
                return Ok(Some((block, row)));
            }
        }
        Ok(None)
    }

    fn column_index(&self, table: TableId, column: &str) -> Result<u16> {
        self.schema(table)?
            .column_index(column)
            .ok_or_else(|| StrataError::NotFound(format!("column {}", column)))
    }

    /// Set `column` of the row with primary key `key`
    pub fn update(&self, txn: &Txn, table: TableId, key: &Value, column: &str, value: Value) -> Result<()> {
        let col = self.column_index(table, column)?;
        let (block, row) = self
            .locate(txn, table, key)?
            .ok_or_else(|| StrataError::NotFound(format!("key {:?}", key)))?;
        block.update(txn, col, row, value)
    }

    /// Delete the row with primary key `key`
    pub fn delete(&self, txn: &Txn, table: TableId, key: &Value) -> Result<()> {
        let (block, row) = self
            .locate(txn, table, key)?
            .ok_or_else(|| StrataError::NotFound(format!("key {:?}", key)))?;
        block.range_delete(txn, row, row)
    }

    /// Delete rows `[from, to]` of one block
    pub fn range_delete(&self, txn: &Txn, block: BlockId, from: u32, to: u32) -> Result<()> {
        self.blocks.get(block)?.range_delete(txn, from, to)
    }

    // ========================================================================
    // Reads
    // ========================================================================

    /// Row with primary key `key`, all columns
    pub fn get(&self, txn: &Txn, table: TableId, key: &Value) -> Result<Option<Vec<Value>>> {
        let Some((block, row)) = self.locate(txn, table, key)? else {
            return Ok(None);
        };
        let columns = block.schema().num_columns() as u16;
        (0..columns)
            .map(|c| block.get_value(c, row, txn.start_ts()))
            .collect::<Result<Vec<_>>>()
            .map(Some)
    }

    /// Every row of `table` visible to `txn`, one batch per block
    pub fn scan(&self, txn: &Txn, table: TableId) -> Result<Vec<RecordBatch>> {
        let mut out = Vec::new();
        for meta in self.catalog.table_blocks(table, txn.start_ts())? {
            if let Some(batch) = self.blocks.get(meta.id)?.scan(txn.start_ts())? {
                out.push(batch);
            }
        }
        Ok(out)
    }

    /// Blocks of `table` visible to `txn`
    pub fn block_ids(&self, txn: &Txn, table: TableId) -> Result<Vec<BlockId>> {
        Ok(self.catalog.table_blocks(table, txn.start_ts())?.iter().map(|b| b.id).collect())
    }

    // ========================================================================
    // Maintenance
    // ========================================================================

    fn compaction_context(&self) -> CompactionContext {
        CompactionContext {
            catalog: self.catalog.clone(),
            files: self.files.clone(),
            buffer: self.buffer.clone(),
            blocks: self.blocks.clone(),
            scheduler: Some(self.scheduler.clone()),
            policy: self.config.write_conflict,
        }
    }

    /// Rewrite `block` sorted and without deleted rows; the swap commits with `txn`
    pub fn compact_block(&self, txn: &Txn, block: BlockId) -> Result<BlockId> {
        let target = self.blocks.get(block)?;
        let data = self.table(target.meta().table)?;
        compact(&self.txns, &data, target, self.compaction_context(), txn)
    }

    /// Compact `block` in its own transaction on the scheduler
    ///
    /// The task writes the new block inline since it already runs on a worker;
    /// the log is checkpointed by the next `flush`. A second request for the
    /// same block while one is in flight fails with `ScopeConflict`.
    pub fn schedule_compaction(&self, block: BlockId) -> Result<TaskHandle> {
        let target = self.blocks.get(block)?;
        let data = self.table(target.meta().table)?;
        let txns = self.txns.clone();
        let ctx = CompactionContext { scheduler: None, ..self.compaction_context() };

        self.scheduler.schedule_scoped_fn(TaskKind::Compact, block, move || {
            let txn = txns.begin();
            let result = compact(&txns, &data, target, ctx, &txn).and_then(|_| txns.commit(&txn));
            match result {
                Ok(ts) => {
                    log::debug!("background compaction of block {} committed at {}", block, ts);
                    Ok(())
                }
                Err(e) => {
                    if txn.is_active() {
                        txns.rollback(&txn)?;
                    }
                    Err(e)
                }
            }
        })
    }

    /// Blocks of `table` that no longer take appends and were not compacted yet
    pub fn sealed_blocks(&self, table: TableId) -> Result<Vec<BlockId>> {
        let ts = self.txns.visible_watermark();
        Ok(self
            .catalog
            .table_blocks(table, ts)?
            .iter()
            .filter(|b| b.created_appendable && !b.is_appendable() && !b.is_soft_deleted())
            .map(|b| b.id)
            .collect())
    }

    /// Persist every live block, checkpoint the log and trim memory
    ///
    /// Returns the number of blocks written.
    pub fn flush(&self) -> Result<usize> {
        let (ts, index) = self.txns.flush_point();
        let live: Vec<_> = self
            .blocks
            .all()
            .into_iter()
            .filter(|b| b.meta().deleted().map_or(true, |d| d.commit_ts.is_none()))
            .collect();

        let mut handles = Vec::with_capacity(live.len());
        for block in &live {
            let block = block.clone();
            handles.push(self.scheduler.schedule_fn(TaskKind::Flush, move || block.checkpoint(ts))?);
        }
        for handle in handles {
            handle.wait_done()?;
        }
        if let Some(index) = index {
            self.scheduler.checkpoint(&[index])?;
        }
        let released = self.txns.wal().truncate()?;

        let oldest = self.txns.oldest_active_ts().unwrap_or(ts);
        let mut purged = 0;
        for block in &live {
            block.merge_deletes();
            block.prune_deletes(oldest);
            purged += block.purge_index(oldest);
        }
        let evicted = self.buffer.evict_to_budget()?;
        log::info!(
            "flushed {} blocks at ts {}, released {} log segments, purged {} index rows, evicted {}",
            live.len(),
            ts,
            released,
            purged,
            evicted
        );
        Ok(live.len())
    }

    pub fn stats(&self) -> DbStats {
        DbStats {
            committed: self.txns.total_committed(),
            aborted: self.txns.total_aborted(),
            active: self.txns.active_count(),
            blocks: self.blocks.len(),
            resident_bytes: self.buffer.resident_bytes(),
            buffer: self.buffer.stats(),
        }
    }

    /// Finish queued background work and stop the workers
    pub fn close(&self) {
        self.scheduler.stop();
    }
}

/// Compact under the table's append lock so no appender picks the block meanwhile
fn compact(
    txns: &TxnManager,
    data: &TableData,
    target: Arc<DataBlock>,
    ctx: CompactionContext,
    txn: &Txn,
) -> Result<BlockId> {
    let block = target.id();
    let mut cursor = data.cursor.lock();
    let view = txns.visible_watermark();
    let new = CompactBlockTask::new(target, view, ctx).execute(txn)?;
    if cursor.block.as_ref().map(|b| b.id()) == Some(block) {
        cursor.block = None;
    }
    Ok(new.id())
}
