//! In-memory catalog: database → table → segment → block
//!
//! Entries carry a create version and an optional delete version so that
//! block swaps made by compaction become visible atomically with the owning
//! transaction's commit.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::data::Schema;
use crate::txn::{Timestamp, Txn};
use crate::{Result, StrataError};

pub type DbId = u64;
pub type TableId = u64;
pub type SegmentId = u64;
pub type BlockId = u64;

// ============================================================================
// Entry versions
// ============================================================================

/// Creation or deletion stamp of a catalog entry
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryVersion {
    /// Start timestamp of the writing transaction
    pub start_ts: Timestamp,
    pub commit_ts: Option<Timestamp>,
}

impl EntryVersion {
    pub fn committed(ts: Timestamp) -> Self {
        Self { start_ts: ts, commit_ts: Some(ts) }
    }

    pub fn pending(txn: &Txn) -> Self {
        Self { start_ts: txn.start_ts(), commit_ts: None }
    }

    pub fn visible_to(&self, read_ts: Timestamp) -> bool {
        match self.commit_ts {
            Some(ts) => ts <= read_ts,
            None => self.start_ts == read_ts,
        }
    }
}

// ============================================================================
// Entries
// ============================================================================

pub struct BlockEntry {
    pub id: BlockId,
    pub segment: SegmentId,
    pub table: TableId,
    /// Took appends when created; compaction outputs never do
    pub created_appendable: bool,
    appendable: AtomicBool,
    created: Mutex<EntryVersion>,
    deleted: Mutex<Option<EntryVersion>>,
}

impl BlockEntry {
    pub fn is_appendable(&self) -> bool {
        self.appendable.load(Ordering::Acquire)
    }

    /// Stop accepting appends; one-way
    pub fn seal(&self) {
        self.appendable.store(false, Ordering::Release);
    }

    pub fn created(&self) -> EntryVersion {
        *self.created.lock()
    }

    pub fn deleted(&self) -> Option<EntryVersion> {
        *self.deleted.lock()
    }

    /// Created and not deleted as seen at `read_ts`
    pub fn visible(&self, read_ts: Timestamp) -> bool {
        self.created().visible_to(read_ts)
            && !self.deleted().map(|d| d.visible_to(read_ts)).unwrap_or(false)
    }

    pub fn is_soft_deleted(&self) -> bool {
        self.deleted().is_some()
    }

    pub fn commit_create(&self, ts: Timestamp) {
        self.created.lock().commit_ts = Some(ts);
    }

    pub fn commit_delete(&self, ts: Timestamp) {
        if let Some(d) = self.deleted.lock().as_mut() {
            d.commit_ts = Some(ts);
        }
    }
}

impl std::fmt::Debug for BlockEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BlockEntry")
            .field("id", &self.id)
            .field("segment", &self.segment)
            .field("appendable", &self.is_appendable())
            .field("created", &self.created())
            .field("deleted", &self.deleted())
            .finish()
    }
}

pub struct SegmentEntry {
    pub id: SegmentId,
    pub table: TableId,
    /// Blocks written by compaction are sorted by primary key
    pub sorted: bool,
    closed: AtomicBool,
    blocks: RwLock<Vec<BlockId>>,
}

impl SegmentEntry {
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }

    pub fn blocks(&self) -> Vec<BlockId> {
        self.blocks.read().clone()
    }

    pub fn block_count(&self) -> usize {
        self.blocks.read().len()
    }
}

pub struct TableEntry {
    pub id: TableId,
    pub db: DbId,
    pub schema: Arc<Schema>,
    segments: RwLock<Vec<SegmentId>>,
}

impl TableEntry {
    pub fn segments(&self) -> Vec<SegmentId> {
        self.segments.read().clone()
    }
}

#[derive(Debug)]
pub struct DatabaseEntry {
    pub id: DbId,
    pub name: String,
    tables: RwLock<Vec<TableId>>,
}

impl DatabaseEntry {
    pub fn tables(&self) -> Vec<TableId> {
        self.tables.read().clone()
    }
}

// ============================================================================
// Catalog
// ============================================================================

#[derive(Default)]
pub struct Catalog {
    next_id: AtomicU64,
    databases: RwLock<HashMap<DbId, Arc<DatabaseEntry>>>,
    tables: RwLock<HashMap<TableId, Arc<TableEntry>>>,
    segments: RwLock<HashMap<SegmentId, Arc<SegmentEntry>>>,
    blocks: RwLock<HashMap<BlockId, Arc<BlockEntry>>>,
}

fn not_found(kind: &str, id: u64) -> StrataError {
    StrataError::NotFound(format!("{} {}", kind, id))
}

impl Catalog {
    pub fn new() -> Self {
        Self::default()
    }

    fn alloc_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    pub fn create_database(&self, name: &str) -> Result<Arc<DatabaseEntry>> {
        let mut dbs = self.databases.write();
        if dbs.values().any(|d| d.name == name) {
            return Err(StrataError::Duplicate(format!("database {}", name)));
        }
        let entry = Arc::new(DatabaseEntry {
            id: self.alloc_id(),
            name: name.to_string(),
            tables: RwLock::new(Vec::new()),
        });
        dbs.insert(entry.id, entry.clone());
        Ok(entry)
    }

    pub fn get_database(&self, id: DbId) -> Result<Arc<DatabaseEntry>> {
        self.databases.read().get(&id).cloned().ok_or_else(|| not_found("database", id))
    }

    pub fn database_by_name(&self, name: &str) -> Option<Arc<DatabaseEntry>> {
        self.databases.read().values().find(|d| d.name == name).cloned()
    }

    pub fn create_table(&self, db: DbId, schema: Schema) -> Result<Arc<TableEntry>> {
        let db = self.get_database(db)?;
        let entry = Arc::new(TableEntry {
            id: self.alloc_id(),
            db: db.id,
            schema: Arc::new(schema),
            segments: RwLock::new(Vec::new()),
        });
        self.tables.write().insert(entry.id, entry.clone());
        db.tables.write().push(entry.id);
        Ok(entry)
    }

    pub fn get_table(&self, id: TableId) -> Result<Arc<TableEntry>> {
        self.tables.read().get(&id).cloned().ok_or_else(|| not_found("table", id))
    }

    pub fn create_segment(&self, table: TableId, sorted: bool) -> Result<Arc<SegmentEntry>> {
        let table = self.get_table(table)?;
        let entry = Arc::new(SegmentEntry {
            id: self.alloc_id(),
            table: table.id,
            sorted,
            closed: AtomicBool::new(false),
            blocks: RwLock::new(Vec::new()),
        });
        self.segments.write().insert(entry.id, entry.clone());
        table.segments.write().push(entry.id);
        Ok(entry)
    }

    pub fn get_segment(&self, id: SegmentId) -> Result<Arc<SegmentEntry>> {
        self.segments.read().get(&id).cloned().ok_or_else(|| not_found("segment", id))
    }

    pub fn create_block(
        &self,
        segment: SegmentId,
        appendable: bool,
        created: EntryVersion,
    ) -> Result<Arc<BlockEntry>> {
        let seg = self.get_segment(segment)?;
        let entry = Arc::new(BlockEntry {
            id: self.alloc_id(),
            segment: seg.id,
            table: seg.table,
            created_appendable: appendable,
            appendable: AtomicBool::new(appendable),
            created: Mutex::new(created),
            deleted: Mutex::new(None),
        });
        self.blocks.write().insert(entry.id, entry.clone());
        seg.blocks.write().push(entry.id);
        Ok(entry)
    }

    pub fn get_block(&self, id: BlockId) -> Result<Arc<BlockEntry>> {
        self.blocks.read().get(&id).cloned().ok_or_else(|| not_found("block", id))
    }

    /// Mark a block deleted by `txn`; visible once `commit_delete` stamps it
    pub fn soft_delete_block(&self, id: BlockId, txn: &Txn) -> Result<()> {
        let block = self.get_block(id)?;
        let mut deleted = block.deleted.lock();
        if let Some(existing) = *deleted {
            return Err(StrataError::Conflict(format!(
                "block {} already deleted (start {}, commit {:?})",
                id, existing.start_ts, existing.commit_ts
            )));
        }
        *deleted = Some(EntryVersion::pending(txn));
        Ok(())
    }

    /// Remove a pending soft-delete marker
    pub fn undo_soft_delete(&self, id: BlockId) -> Result<()> {
        let block = self.get_block(id)?;
        let mut deleted = block.deleted.lock();
        match *deleted {
            Some(d) if d.commit_ts.is_none() => {
                *deleted = None;
                Ok(())
            }
            Some(_) => Err(StrataError::Invariant(format!("block {} delete already committed", id))),
            None => Ok(()),
        }
    }

    /// Drop a block entry entirely (rollback of its creation)
    pub fn remove_block(&self, id: BlockId) -> Result<()> {
        let block = self.blocks.write().remove(&id).ok_or_else(|| not_found("block", id))?;
        if let Ok(seg) = self.get_segment(block.segment) {
            seg.blocks.write().retain(|b| *b != id);
        }
        Ok(())
    }

    /// Blocks of `table` visible at `read_ts`, in creation order
    pub fn table_blocks(&self, table: TableId, read_ts: Timestamp) -> Result<Vec<Arc<BlockEntry>>> {
        let table = self.get_table(table)?;
        let mut out = Vec::new();
        for seg in table.segments() {
            let seg = self.get_segment(seg)?;
            for id in seg.blocks() {
                let block = self.get_block(id)?;
                if block.visible(read_ts) {
                    out.push(block);
                }
            }
        }
        Ok(out)
    }
}
