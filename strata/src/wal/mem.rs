//! In-memory log for tests and ephemeral databases

use std::collections::{BTreeMap, HashMap};

use parking_lot::Mutex;

use super::{LogStore, WalIndex};
use crate::Result;

#[derive(Default)]
struct Group {
    next_lsn: u64,
    checkpointed: u64,
    records: BTreeMap<u64, Vec<u8>>,
}

/// Log kept entirely in memory; checkpointing drops the covered records
#[derive(Default)]
pub struct MemWal {
    groups: Mutex<HashMap<u32, Group>>,
}

impl MemWal {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records currently retained across all groups
    pub fn retained(&self) -> usize {
        self.groups.lock().values().map(|g| g.records.len()).sum()
    }
}

impl LogStore for MemWal {
    fn append(&self, group: u32, payload: &[u8]) -> Result<WalIndex> {
        let mut groups = self.groups.lock();
        let g = groups.entry(group).or_default();
        g.next_lsn += 1;
        g.records.insert(g.next_lsn, payload.to_vec());
        Ok(WalIndex::new(group, g.next_lsn))
    }

    fn checkpoint(&self, index: &WalIndex) -> Result<()> {
        let mut groups = self.groups.lock();
        let g = groups.entry(index.group).or_default();
        if index.lsn <= g.checkpointed {
            return Ok(());
        }
        g.checkpointed = index.lsn;
        g.records = g.records.split_off(&(index.lsn + 1));
        Ok(())
    }

    fn checkpointed(&self, group: u32) -> u64 {
        self.groups.lock().get(&group).map(|g| g.checkpointed).unwrap_or(0)
    }

    fn replay(&self, group: u32) -> Result<Vec<(u64, Vec<u8>)>> {
        Ok(self
            .groups
            .lock()
            .get(&group)
            .map(|g| g.records.iter().map(|(lsn, p)| (*lsn, p.clone())).collect())
            .unwrap_or_default())
    }

    /// Checkpointing already drops records
    fn truncate(&self) -> Result<usize> {
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_append_checkpoint_replay() {
        let wal = MemWal::new();
        for i in 0..5u8 {
            let idx = wal.append(7, &[i]).unwrap();
            assert_eq!(idx, WalIndex::new(7, i as u64 + 1));
        }
        wal.append(8, b"other").unwrap();

        wal.checkpoint(&WalIndex::new(7, 3)).unwrap();
        assert_eq!(wal.checkpointed(7), 3);
        let left: Vec<u64> = wal.replay(7).unwrap().into_iter().map(|(l, _)| l).collect();
        assert_eq!(left, vec![4, 5]);

        // lower index is a no-op
        wal.checkpoint(&WalIndex::new(7, 2)).unwrap();
        assert_eq!(wal.checkpointed(7), 3);
        assert_eq!(wal.retained(), 3);
    }
}
