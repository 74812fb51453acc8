//! Transaction handle - per-transaction timestamps, state and write set

use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use super::store::TxnStore;
use super::timestamp::Timestamp;
use crate::{Result, StrataError};

/// Unique transaction identifier
pub type TxnId = u64;

/// Lifecycle of a transaction; only moves forward
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxnState {
    Active,
    Preparing,
    Committed,
    RolledBack,
}

/// A running transaction
///
/// `start_ts` is the snapshot read point; `commit_ts` is assigned when the
/// transaction enters `Preparing`.
pub struct Txn {
    id: TxnId,
    start_ts: Timestamp,
    /// 0 while uncommitted
    commit_ts: AtomicU64,
    state: Mutex<TxnState>,
    store: Mutex<TxnStore>,
}

impl Txn {
    pub fn new(id: TxnId, start_ts: Timestamp) -> Self {
        Self {
            id,
            start_ts,
            commit_ts: AtomicU64::new(0),
            state: Mutex::new(TxnState::Active),
            store: Mutex::new(TxnStore::default()),
        }
    }

    pub fn id(&self) -> TxnId {
        self.id
    }

    pub fn start_ts(&self) -> Timestamp {
        self.start_ts
    }

    pub fn commit_ts(&self) -> Option<Timestamp> {
        match self.commit_ts.load(Ordering::Acquire) {
            0 => None,
            ts => Some(ts),
        }
    }

    pub fn state(&self) -> TxnState {
        *self.state.lock()
    }

    pub fn is_active(&self) -> bool {
        self.state() == TxnState::Active
    }

    /// Fail unless the transaction still accepts writes
    pub fn check_active(&self) -> Result<()> {
        match self.state() {
            TxnState::Active => Ok(()),
            other => Err(StrataError::InvalidState(format!(
                "transaction {} is {:?}",
                self.id, other
            ))),
        }
    }

    /// Active → Preparing, stamping the commit timestamp
    pub(crate) fn begin_prepare(&self, commit_ts: Timestamp) -> Result<()> {
        let mut state = self.state.lock();
        if *state != TxnState::Active {
            return Err(StrataError::InvalidState(format!(
                "cannot prepare transaction {} in state {:?}",
                self.id, *state
            )));
        }
        self.commit_ts.store(commit_ts, Ordering::Release);
        *state = TxnState::Preparing;
        Ok(())
    }

    pub(crate) fn set_state(&self, next: TxnState) {
        *self.state.lock() = next;
    }

    /// Access the write set
    pub fn with_store<R>(&self, f: impl FnOnce(&mut TxnStore) -> R) -> R {
        f(&mut self.store.lock())
    }
}

impl std::fmt::Debug for Txn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Txn")
            .field("id", &self.id)
            .field("start_ts", &self.start_ts)
            .field("commit_ts", &self.commit_ts())
            .field("state", &self.state())
            .finish()
    }
}
