//! Transaction Manager - begin / commit / rollback driver
//!
//! Commit protocol, all under one commit lock so commits are totally ordered:
//! 1. allocate `commit_ts`, move the txn to `Preparing`
//! 2. `prepare_commit` every entry (compaction replays its delta here)
//! 3. encode every entry's command into one batch and append it to the WAL
//! 4. `apply_commit(wal_index)` every entry, txn becomes `Committed`
//!
//! Any failure before step 4 rolls every entry back. Once the batch is in the
//! log the commit stands: an apply failure is reported as `Invariant` and the
//! remaining entries are still applied.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use super::context::{Txn, TxnId, TxnState};
use super::entry::TxnEntry;
use super::timestamp::{Timestamp, TimestampAllocator};
use crate::updates::CommandBatch;
use crate::wal::{LogStore, WalIndex};
use crate::{Result, StrataError};

/// WAL group that carries transaction command batches
pub const TXN_LOG_GROUP: u32 = 1;

// ============================================================================
// Transaction Manager
// ============================================================================

pub struct TxnManager {
    ts: Arc<TimestampAllocator>,
    wal: Arc<dyn LogStore>,
    /// Serializes begin against commit so no snapshot lands inside a half-applied commit
    commit_lock: Mutex<()>,
    /// Active transactions: txn_id → start_ts
    active: RwLock<HashMap<TxnId, Timestamp>>,
    next_txn_id: AtomicU64,
    /// Index of the newest command batch in the log
    last_logged: Mutex<Option<WalIndex>>,
    total_committed: AtomicU64,
    total_aborted: AtomicU64,
}

impl TxnManager {
    pub fn new(ts: Arc<TimestampAllocator>, wal: Arc<dyn LogStore>) -> Self {
        Self {
            ts,
            wal,
            commit_lock: Mutex::new(()),
            active: RwLock::new(HashMap::new()),
            next_txn_id: AtomicU64::new(1),
            last_logged: Mutex::new(None),
            total_committed: AtomicU64::new(0),
            total_aborted: AtomicU64::new(0),
        }
    }

    pub fn timestamps(&self) -> &Arc<TimestampAllocator> {
        &self.ts
    }

    pub fn wal(&self) -> &Arc<dyn LogStore> {
        &self.wal
    }

    // ========================================================================
    // Transaction Lifecycle
    // ========================================================================

    /// Start a transaction reading at a fresh snapshot
    pub fn begin(&self) -> Arc<Txn> {
        let _guard = self.commit_lock.lock();
        let id = self.next_txn_id.fetch_add(1, Ordering::SeqCst);
        let start_ts = self.ts.next();
        self.active.write().insert(id, start_ts);
        Arc::new(Txn::new(id, start_ts))
    }

    /// Commit `txn`, returning its commit timestamp
    pub fn commit(&self, txn: &Txn) -> Result<Timestamp> {
        txn.check_active()?;
        let _guard = self.commit_lock.lock();

        let mut entries = txn.with_store(|s| s.take_entries());
        let commit_ts = self.ts.next();
        txn.begin_prepare(commit_ts)?;

        let index = match self.prepare_and_log(txn, &mut entries) {
            Ok(index) => index,
            Err(e) => {
                log::warn!("txn {} commit failed at ts {}: {}", txn.id(), commit_ts, e);
                self.rollback_entries(txn, &mut entries);
                return Err(e);
            }
        };

        let mut first_err = None;
        if let Some(index) = index {
            for entry in entries.iter_mut() {
                if let Err(e) = entry.apply_commit(txn, &index) {
                    log::error!("txn {} apply_commit failed after logging at {:?}: {}", txn.id(), index, e);
                    first_err.get_or_insert(e);
                }
            }
        }

        txn.set_state(TxnState::Committed);
        self.active.write().remove(&txn.id());
        self.total_committed.fetch_add(1, Ordering::Relaxed);
        if let Some(e) = first_err {
            return Err(StrataError::Invariant(format!(
                "txn {} committed at {} but did not fully apply: {}",
                txn.id(),
                commit_ts,
                e
            )));
        }
        log::debug!("txn {} committed at {} ({} entries)", txn.id(), commit_ts, entries.len());
        Ok(commit_ts)
    }

    /// Prepare every entry and log their commands; `None` when there is nothing to log
    fn prepare_and_log(&self, txn: &Txn, entries: &mut [Box<dyn TxnEntry>]) -> Result<Option<WalIndex>> {
        for entry in entries.iter_mut() {
            entry.prepare_commit(txn)?;
        }
        if entries.is_empty() {
            return Ok(None);
        }

        let mut batch = CommandBatch::new(txn.id(), txn.commit_ts().unwrap_or_default());
        for (id, entry) in entries.iter().enumerate() {
            if let Some(cmd) = entry.make_command(txn, id as u32)? {
                batch.push(cmd);
            }
        }
        let index = self.wal.append(TXN_LOG_GROUP, &batch.encode()?)?;
        *self.last_logged.lock() = Some(index);
        Ok(Some(index))
    }

    /// Abort `txn`, undoing every entry it logged
    pub fn rollback(&self, txn: &Txn) -> Result<()> {
        txn.check_active()?;
        let mut entries = txn.with_store(|s| s.take_entries());
        self.rollback_entries(txn, &mut entries);
        Ok(())
    }

    fn rollback_entries(&self, txn: &Txn, entries: &mut [Box<dyn TxnEntry>]) {
        for entry in entries.iter_mut() {
            if let Err(e) = entry.prepare_rollback(txn) {
                log::error!("txn {} prepare_rollback failed: {}", txn.id(), e);
            }
        }
        for entry in entries.iter_mut() {
            if let Err(e) = entry.apply_rollback(txn) {
                log::error!("txn {} apply_rollback failed: {}", txn.id(), e);
            }
        }
        txn.set_state(TxnState::RolledBack);
        self.active.write().remove(&txn.id());
        self.total_aborted.fetch_add(1, Ordering::Relaxed);
    }

    /// A fresh timestamp every commit at or below it has fully applied
    ///
    /// Compaction reads at this watermark and replays anything committed after it.
    pub fn visible_watermark(&self) -> Timestamp {
        let _guard = self.commit_lock.lock();
        self.ts.next()
    }

    /// Watermark plus the newest log index of any commit at or below it
    ///
    /// Once all data visible at the watermark is persisted the log can be
    /// checkpointed up to that index.
    pub fn flush_point(&self) -> (Timestamp, Option<WalIndex>) {
        let _guard = self.commit_lock.lock();
        (self.ts.next(), *self.last_logged.lock())
    }

    // ========================================================================
    // Monitoring
    // ========================================================================

    /// Smallest start timestamp among running transactions
    pub fn oldest_active_ts(&self) -> Option<Timestamp> {
        self.active.read().values().min().copied()
    }

    pub fn active_count(&self) -> usize {
        self.active.read().len()
    }

    pub fn total_committed(&self) -> u64 {
        self.total_committed.load(Ordering::Relaxed)
    }

    pub fn total_aborted(&self) -> u64 {
        self.total_aborted.load(Ordering::Relaxed)
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::updates::UpdateCmd;
    use crate::wal::MemWal;

    #[derive(Clone, Default)]
    struct Trace(Arc<Mutex<Vec<String>>>);

    impl Trace {
        fn push(&self, s: impl Into<String>) {
            self.0.lock().push(s.into());
        }
        fn get(&self) -> Vec<String> {
            self.0.lock().clone()
        }
    }

    struct RecordingEntry {
        name: &'static str,
        trace: Trace,
        fail_prepare: bool,
        fail_apply: bool,
    }

    impl TxnEntry for RecordingEntry {
        fn prepare_commit(&mut self, txn: &Txn) -> Result<()> {
            assert_eq!(txn.state(), TxnState::Preparing);
            self.trace.push(format!("{}:prepare", self.name));
            if self.fail_prepare {
                return Err(StrataError::Conflict("injected".into()));
            }
            Ok(())
        }

        fn apply_commit(&mut self, _txn: &Txn, index: &WalIndex) -> Result<()> {
            self.trace.push(format!("{}:apply@{}", self.name, index.lsn));
            if self.fail_apply {
                return Err(StrataError::Io(std::io::Error::other("injected")));
            }
            Ok(())
        }

        fn apply_rollback(&mut self, _txn: &Txn) -> Result<()> {
            self.trace.push(format!("{}:rollback", self.name));
            Ok(())
        }

        fn make_command(&self, _txn: &Txn, id: u32) -> Result<Option<UpdateCmd>> {
            Ok(Some(UpdateCmd::Append { id, block: 1, start_row: 0, rows: 1 }))
        }
    }

    fn manager() -> (TxnManager, Arc<MemWal>) {
        let wal = Arc::new(MemWal::new());
        (TxnManager::new(Arc::new(TimestampAllocator::new()), wal.clone()), wal)
    }

    fn entry(name: &'static str, trace: &Trace, fail: bool) -> Box<dyn TxnEntry> {
        Box::new(RecordingEntry { name, trace: trace.clone(), fail_prepare: fail, fail_apply: false })
    }

    #[test]
    fn test_begin_commit() {
        let (mgr, wal) = manager();
        let trace = Trace::default();
        let txn = mgr.begin();
        assert_eq!(mgr.active_count(), 1);
        txn.with_store(|s| {
            s.log_entry(1, entry("a", &trace, false), vec![1]);
            s.log_entry(1, entry("b", &trace, false), vec![1]);
        });

        let commit_ts = mgr.commit(&txn).unwrap();
        assert!(commit_ts > txn.start_ts());
        assert_eq!(txn.state(), TxnState::Committed);
        assert_eq!(txn.commit_ts(), Some(commit_ts));
        assert_eq!(mgr.active_count(), 0);
        assert_eq!(mgr.total_committed(), 1);
        assert_eq!(trace.get(), vec!["a:prepare", "b:prepare", "a:apply@1", "b:apply@1"]);

        let logged = wal.replay(TXN_LOG_GROUP).unwrap();
        assert_eq!(logged.len(), 1);
        let batch = CommandBatch::decode(&logged[0].1).unwrap();
        assert_eq!(batch.txn, txn.id());
        assert_eq!(batch.cmds.len(), 2);
    }

    #[test]
    fn test_prepare_failure_rolls_back_everything() {
        let (mgr, wal) = manager();
        let trace = Trace::default();
        let txn = mgr.begin();
        txn.with_store(|s| {
            s.log_entry(1, entry("a", &trace, false), vec![]);
            s.log_entry(1, entry("b", &trace, true), vec![]);
        });

        let err = mgr.commit(&txn).unwrap_err();
        assert!(err.is_conflict());
        assert_eq!(txn.state(), TxnState::RolledBack);
        assert_eq!(mgr.total_aborted(), 1);
        assert_eq!(
            trace.get(),
            vec!["a:prepare", "b:prepare", "a:rollback", "b:rollback"]
        );
        assert!(wal.replay(TXN_LOG_GROUP).unwrap().is_empty());
    }

    #[test]
    fn test_apply_failure_after_logging_keeps_commit() {
        let (mgr, wal) = manager();
        let trace = Trace::default();
        let txn = mgr.begin();
        txn.with_store(|s| {
            s.log_entry(1, entry("a", &trace, false), vec![]);
            s.log_entry(
                1,
                Box::new(RecordingEntry { name: "b", trace: trace.clone(), fail_prepare: false, fail_apply: true }),
                vec![],
            );
            s.log_entry(1, entry("c", &trace, false), vec![]);
        });

        let err = mgr.commit(&txn).unwrap_err();
        assert!(matches!(err, StrataError::Invariant(_)));
        // logged, so nothing is undone and later entries still apply
        assert_eq!(txn.state(), TxnState::Committed);
        assert_eq!(mgr.total_committed(), 1);
        assert_eq!(mgr.total_aborted(), 0);
        assert_eq!(
            trace.get(),
            vec!["a:prepare", "b:prepare", "c:prepare", "a:apply@1", "b:apply@1", "c:apply@1"]
        );
        assert_eq!(wal.replay(TXN_LOG_GROUP).unwrap().len(), 1);
    }

    #[test]
    fn test_rollback_and_finished_state() {
        let (mgr, _) = manager();
        let trace = Trace::default();
        let txn = mgr.begin();
        txn.with_store(|s| s.log_entry(1, entry("a", &trace, false), vec![]));
        mgr.rollback(&txn).unwrap();
        assert_eq!(trace.get(), vec!["a:rollback"]);
        assert!(mgr.commit(&txn).is_err());
        assert!(mgr.rollback(&txn).is_err());
    }

    #[test]
    fn test_oldest_active() {
        let (mgr, _) = manager();
        assert_eq!(mgr.oldest_active_ts(), None);
        let t1 = mgr.begin();
        let t2 = mgr.begin();
        assert_eq!(mgr.oldest_active_ts(), Some(t1.start_ts()));
        mgr.commit(&t1).unwrap();
        assert_eq!(mgr.oldest_active_ts(), Some(t2.start_ts()));
    }

    #[test]
    fn test_flush_point_covers_logged_commits() {
        let (mgr, _) = manager();
        let trace = Trace::default();
        assert_eq!(mgr.flush_point().1, None);

        let txn = mgr.begin();
        txn.with_store(|s| s.log_entry(1, entry("a", &trace, false), vec![]));
        let commit_ts = mgr.commit(&txn).unwrap();

        let (ts, index) = mgr.flush_point();
        assert!(ts > commit_ts);
        assert_eq!(index, Some(WalIndex::new(TXN_LOG_GROUP, 1)));
        assert!(mgr.visible_watermark() > ts);
    }
}
