//! Block compaction
//!
//! A sealed block is rewritten without its deleted rows, sorted by primary
//! key, into a new non-appendable block of the same segment. The expensive part
//! (read, sort, write) runs outside any commit; only replaying changes that
//! committed meanwhile happens inside the owning transaction's commit.
//!
//! ```text
//! PrepareData ──► Execute(write) ──► PrepareCommit ──┬─► ApplyCommit
//!                                                    └─► ApplyRollback
//! ```

mod entry;
mod sort;
mod task;

pub use entry::CompactBlockEntry;
pub use sort::{check_sorted, sort_by_primary_key, RowMapping};
pub use task::{CompactBlockTask, PreparedData};

use std::sync::Arc;

use crate::buffer::NodeManager;
use crate::catalog::Catalog;
use crate::config::WriteConflictPolicy;
use crate::dataio::FileFactory;
use crate::tables::BlockSet;
use crate::tasks::TaskScheduler;

/// Everything a compaction needs besides the block itself
///
/// Without a scheduler the new block's file is written on the calling thread.
/// With one, the write runs as an `Io` task the caller waits on, so a
/// compaction must not itself run on a single-worker scheduler.
#[derive(Clone)]
pub struct CompactionContext {
    pub catalog: Arc<Catalog>,
    pub files: Arc<dyn FileFactory>,
    pub buffer: NodeManager,
    pub blocks: BlockSet,
    pub scheduler: Option<Arc<TaskScheduler>>,
    pub policy: WriteConflictPolicy,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::value_at;
    use crate::dataio::BlockFile;
    use crate::tables::testing::{batch, TestTable};
    use crate::tables::{BlockAppender, DataBlock};
    use crate::tasks::TaskKind;
    use crate::txn::{TxnManager, TXN_LOG_GROUP};
    use crate::Value;

    fn context(t: &TestTable, scheduler: Option<Arc<TaskScheduler>>) -> CompactionContext {
        CompactionContext {
            catalog: t.catalog.clone(),
            files: t.files.clone(),
            buffer: t.buffer.clone(),
            blocks: BlockSet::new(),
            scheduler,
            policy: WriteConflictPolicy::Permissive,
        }
    }

    fn filled(t: &TestTable, mgr: &TxnManager, ids: &[i64], names: &[&str]) -> Arc<DataBlock> {
        let block = t.block(true);
        let txn = mgr.begin();
        BlockAppender::new(block.clone())
            .apply_append(&batch(ids, names), 0, ids.len(), &txn)
            .unwrap();
        mgr.commit(&txn).unwrap();
        block
    }

    fn rows(block: &DataBlock, ts: u64) -> Vec<(i64, String)> {
        let Some(b) = block.scan(ts).unwrap() else { return Vec::new() };
        (0..b.num_rows())
            .map(|i| {
                let id = value_at(b.column(0).as_ref(), i).unwrap().as_i64().unwrap();
                let name = value_at(b.column(1).as_ref(), i).unwrap();
                (id, name.as_str().unwrap().to_string())
            })
            .collect()
    }

    fn compact(
        mgr: &TxnManager,
        block: &Arc<DataBlock>,
        ctx: &CompactionContext,
    ) -> (Arc<crate::Txn>, Arc<DataBlock>) {
        let txn = mgr.begin();
        let view = mgr.visible_watermark();
        let mut task = CompactBlockTask::new(block.clone(), view, ctx.clone());
        let new = task.execute(&txn).unwrap();
        assert_eq!(task.new_block().map(|b| b.id()), Some(new.id()));
        (txn, new)
    }

    #[test]
    fn test_compaction_drops_deleted_and_sorts() {
        let t = TestTable::new(4, 1 << 20);
        let mgr = t.txn_manager();
        let ctx = context(&t, None);
        let old = filled(&t, &mgr, &[3, 1, 4, 2], &["c", "a", "d", "b"]);

        let txn = mgr.begin();
        old.range_delete(&txn, 2, 2).unwrap();
        mgr.commit(&txn).unwrap();
        let reader = mgr.begin();

        let (txn, new) = compact(&mgr, &old, &ctx);
        let ts = mgr.commit(&txn).unwrap();

        let expected = vec![(1, "a".to_string()), (2, "b".to_string()), (3, "c".to_string())];
        assert_eq!(rows(&new, ts), expected);
        assert!(!new.meta().is_appendable());
        assert_eq!(new.meta().created().commit_ts, Some(ts));
        assert_eq!(old.meta().deleted().and_then(|d| d.commit_ts), Some(ts));
        assert!(!old.meta().visible(ts));

        let live: Vec<u64> = t.catalog.table_blocks(t.table.id, ts).unwrap().iter().map(|b| b.id).collect();
        assert_eq!(live, vec![new.id()]);
        assert_eq!(new.find_row(&Value::Int64(2), ts), Some(1));
        assert!(!new.index().contains(&Value::Int64(4)));

        // an older snapshot still reads the old block
        assert_eq!(rows(&old, reader.start_ts()).len(), 3);
        assert!(t.catalog.table_blocks(t.table.id, reader.start_ts()).unwrap().iter().any(|b| b.id == old.id()));
    }

    #[test]
    fn test_changes_committed_during_compaction_are_replayed() {
        let t = TestTable::new(3, 1 << 20);
        let mgr = t.txn_manager();
        let ctx = context(&t, None);
        let old = filled(&t, &mgr, &[3, 1, 2], &["c", "a", "b"]);

        let (compaction, new) = compact(&mgr, &old, &ctx);

        let writer = mgr.begin();
        old.update(&writer, 1, 0, Value::from("C")).unwrap();
        old.range_delete(&writer, 1, 1).unwrap();
        mgr.commit(&writer).unwrap();

        let late = mgr.begin();
        old.update(&late, 1, 2, Value::from("B")).unwrap();

        let ts = mgr.commit(&compaction).unwrap();
        assert_eq!(rows(&new, ts), vec![(2, "b".to_string()), (3, "C".to_string())]);
        assert!(!new.index().contains(&Value::Int64(1)));

        // the block it wrote to is gone
        assert!(mgr.commit(&late).unwrap_err().is_conflict());
    }

    #[test]
    fn test_own_writes_to_old_block_are_replayed() {
        let t = TestTable::new(3, 1 << 20);
        let mgr = t.txn_manager();
        let ctx = context(&t, None);
        let old = filled(&t, &mgr, &[3, 1, 2], &["c", "a", "b"]);

        let txn = mgr.begin();
        old.update(&txn, 1, 1, Value::from("A")).unwrap();
        old.range_delete(&txn, 2, 2).unwrap();
        // another commit moves the view past the txn's snapshot
        let other = mgr.begin();
        old.update(&other, 1, 0, Value::from("C")).unwrap();
        mgr.commit(&other).unwrap();

        let view = mgr.visible_watermark();
        let new = CompactBlockTask::new(old.clone(), view, ctx).execute(&txn).unwrap();
        let ts = mgr.commit(&txn).unwrap();

        assert_eq!(rows(&new, ts), vec![(1, "A".to_string()), (3, "C".to_string())]);
        assert_eq!(new.find_row(&Value::Int64(2), ts), None);
        assert!(!new.index().contains(&Value::Int64(2)));
        assert!(new.index().contains(&Value::Int64(1)));
    }

    #[test]
    fn test_commit_does_not_wait_on_full_queue() {
        let t = TestTable::new(3, 1 << 20);
        let mgr = t.txn_manager();
        let scheduler = Arc::new(TaskScheduler::new(1, 1, true, t.wal.clone()).unwrap());
        let ctx = context(&t, Some(scheduler.clone()));
        let old = filled(&t, &mgr, &[2, 1, 3], &["b", "a", "c"]);
        let (txn, new) = compact(&mgr, &old, &ctx);

        // occupy the only worker and the only queue slot
        let (release_tx, release_rx) = crossbeam_channel::bounded::<()>(0);
        let (started_tx, started_rx) = crossbeam_channel::bounded::<()>(1);
        let busy = scheduler
            .schedule_fn(TaskKind::Custom, move || {
                let _ = started_tx.send(());
                let _ = release_rx.recv();
                Ok(())
            })
            .unwrap();
        started_rx.recv().unwrap();
        let queued = scheduler.schedule_fn(TaskKind::Custom, || Ok(())).unwrap();

        let ts = mgr.commit(&txn).unwrap();
        // the old block was checkpointed on the committing thread
        assert_eq!(t.files.file(old.id()).unwrap().max_visible(), ts);
        assert_eq!(scheduler.stats(TaskKind::Checkpoint).scheduled, 0);
        assert_eq!(rows(&new, ts).len(), 3);

        release_tx.send(()).unwrap();
        busy.wait_done().unwrap();
        queued.wait_done().unwrap();
        scheduler.stop();
    }

    #[test]
    fn test_rollback_restores_old_block() {
        let t = TestTable::new(2, 1 << 20);
        let mgr = t.txn_manager();
        let ctx = context(&t, None);
        let old = filled(&t, &mgr, &[2, 1], &["b", "a"]);

        let (txn, new) = compact(&mgr, &old, &ctx);
        let new_id = new.id();
        assert!(ctx.blocks.get(new_id).is_ok());
        assert_eq!(t.buffer.node_count(), 2);

        mgr.rollback(&txn).unwrap();
        assert!(old.meta().deleted().is_none());
        assert!(t.catalog.get_block(new_id).is_err());
        assert!(ctx.blocks.get(new_id).unwrap_err().is_not_found());
        assert_eq!(t.buffer.node_count(), 1);
        assert!(t.files.file(new_id).unwrap().is_destroyed());

        let after = mgr.begin();
        assert_eq!(rows(&old, after.start_ts()), vec![(2, "b".to_string()), (1, "a".to_string())]);
    }

    #[test]
    fn test_pending_append_blocks_compaction() {
        let t = TestTable::new(8, 1 << 20);
        let mgr = t.txn_manager();
        let ctx = context(&t, None);
        let block = t.block(true);

        let appender = mgr.begin();
        BlockAppender::new(block.clone())
            .apply_append(&batch(&[1], &["a"]), 0, 1, &appender)
            .unwrap();

        let txn = mgr.begin();
        let view = mgr.visible_watermark();
        let err = CompactBlockTask::new(block.clone(), view, ctx).execute(&txn).unwrap_err();
        assert!(err.is_conflict());
        assert!(block.meta().is_appendable());
        mgr.commit(&appender).unwrap();
    }

    #[test]
    fn test_compaction_on_scheduler_checkpoints() {
        let t = TestTable::new(3, 1 << 20);
        let mgr = t.txn_manager();
        let scheduler = Arc::new(TaskScheduler::new(2, 16, true, t.wal.clone()).unwrap());
        let ctx = context(&t, Some(scheduler.clone()));
        let old = filled(&t, &mgr, &[5, 4, 6], &["e", "d", "f"]);

        let (txn, new) = compact(&mgr, &old, &ctx);
        let ts = mgr.commit(&txn).unwrap();
        scheduler.stop();

        assert_eq!(scheduler.stats(TaskKind::Io).completed, 1);
        assert_eq!(scheduler.stats(TaskKind::Checkpoint).completed, 1);
        assert!(scheduler.checkpointer().checkpointed(TXN_LOG_GROUP) >= 2);
        assert_eq!(t.files.file(old.id()).unwrap().max_visible(), ts);
        assert_eq!(rows(&new, ts).first(), Some(&(4, "d".to_string())));
    }
}
