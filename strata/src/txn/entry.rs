//! Two-phase commit participants

use super::context::Txn;
use crate::updates::UpdateCmd;
use crate::wal::WalIndex;
use crate::Result;

/// A unit of transactional state change
///
/// Entries are driven by `TxnManager::commit` in this order:
/// `prepare_commit` (commit timestamp assigned) → `make_command` (logged) →
/// `apply_commit(index)`. On any failure the manager calls `prepare_rollback`
/// then `apply_rollback` on every entry.
pub trait TxnEntry: Send {
    fn prepare_commit(&mut self, txn: &Txn) -> Result<()>;

    fn apply_commit(&mut self, txn: &Txn, index: &WalIndex) -> Result<()>;

    fn prepare_rollback(&mut self, _txn: &Txn) -> Result<()> {
        Ok(())
    }

    fn apply_rollback(&mut self, txn: &Txn) -> Result<()>;

    /// Redo command for the WAL; `None` when nothing needs logging
    fn make_command(&self, txn: &Txn, id: u32) -> Result<Option<UpdateCmd>>;
}
