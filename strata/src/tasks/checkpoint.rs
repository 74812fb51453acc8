//! Monotonic WAL checkpoint tracking

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::wal::{LogStore, WalIndex};
use crate::Result;

/// Forwards checkpoints to the log, skipping any index not above the last one
/// seen for its group
pub struct Checkpointer {
    wal: Arc<dyn LogStore>,
    /// group → highest checkpointed lsn
    marks: Mutex<HashMap<u32, u64>>,
}

impl Checkpointer {
    pub fn new(wal: Arc<dyn LogStore>) -> Self {
        Self { wal, marks: Mutex::new(HashMap::new()) }
    }

    /// Mark every index as reclaimable; returns how many advanced a group
    pub fn checkpoint(&self, indices: &[WalIndex]) -> Result<usize> {
        let mut marks = self.marks.lock();
        let mut advanced = 0;
        for index in indices {
            let mark = marks.entry(index.group).or_insert(0);
            if index.lsn <= *mark {
                continue;
            }
            self.wal.checkpoint(index)?;
            *mark = index.lsn;
            advanced += 1;
            log::debug!("checkpointed wal group {} up to {}", index.group, index.lsn);
        }
        Ok(advanced)
    }

    /// Highest lsn checkpointed through this tracker for `group`
    pub fn checkpointed(&self, group: u32) -> u64 {
        self.marks.lock().get(&group).copied().unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wal::MemWal;

    #[test]
    fn test_monotonic_and_idempotent() {
        let wal = Arc::new(MemWal::new());
        for _ in 0..5 {
            wal.append(1, b"x").unwrap();
        }
        let ckp = Checkpointer::new(wal.clone());

        assert_eq!(ckp.checkpoint(&[WalIndex::new(1, 3)]).unwrap(), 1);
        assert_eq!(wal.retained(), 2);
        // lower and equal indices are no-ops
        assert_eq!(ckp.checkpoint(&[WalIndex::new(1, 2), WalIndex::new(1, 3)]).unwrap(), 0);
        assert_eq!(ckp.checkpointed(1), 3);

        assert_eq!(ckp.checkpoint(&[WalIndex::new(1, 5), WalIndex::new(2, 1)]).unwrap(), 2);
        assert_eq!(wal.retained(), 0);
        assert_eq!(wal.checkpointed(1), 5);
        assert_eq!(ckp.checkpointed(2), 1);
    }
}
