//! In-memory hash index for primary-key uniqueness and point lookups

use ahash::{AHashMap, AHashSet};
use arrow::array::Array;
use parking_lot::RwLock;
use roaring::RoaringBitmap;

use super::{IndexKey, PrimaryKeyIndex};
use crate::data::value_at;
use crate::{Result, StrataError, Value};

#[derive(Default)]
struct PkMaps {
    /// key → rows in insertion order
    keys: AHashMap<IndexKey, Vec<u32>>,
    /// row → key, for removal by row
    rows: AHashMap<u32, IndexKey>,
    /// rows whose delete has committed
    retired: RoaringBitmap,
    /// keys with at least one live row
    live: usize,
}

impl PkMaps {
    fn is_live(&self, key: &IndexKey) -> bool {
        self.keys
            .get(key)
            .is_some_and(|rows| rows.iter().any(|r| !self.retired.contains(*r)))
    }
}

#[derive(Default)]
pub struct HashPkIndex {
    maps: RwLock<PkMaps>,
}

impl HashPkIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            maps: RwLock::new(PkMaps {
                keys: AHashMap::with_capacity(capacity),
                rows: AHashMap::with_capacity(capacity),
                ..Default::default()
            }),
        }
    }
}

impl PrimaryKeyIndex for HashPkIndex {
    fn batch_insert(
        &self,
        keys: &dyn Array,
        offset: usize,
        length: usize,
        start_row: u32,
        allow_dup: bool,
    ) -> Result<()> {
        if offset + length > keys.len() {
            return Err(StrataError::InvalidState(format!(
                "key slice {}..{} out of range ({} keys)",
                offset,
                offset + length,
                keys.len()
            )));
        }

        let mut batch = Vec::with_capacity(length);
        let mut seen = AHashSet::with_capacity(length);
        for i in offset..offset + length {
            let key = IndexKey::from_value(&value_at(keys, i)?);
            if key.is_null() {
                return Err(StrataError::InvalidState("null primary key".into()));
            }
            if !seen.insert(key.clone()) {
                return Err(StrataError::Duplicate(key.to_string()));
            }
            batch.push(key);
        }

        let mut maps = self.maps.write();
        if !allow_dup {
            if let Some(dup) = batch.iter().find(|k| maps.is_live(k)) {
                return Err(StrataError::Duplicate(dup.to_string()));
            }
        }
        maps.keys.reserve(batch.len());
        for (i, key) in batch.into_iter().enumerate() {
            let row = start_row + i as u32;
            if !maps.is_live(&key) {
                maps.live += 1;
            }
            maps.keys.entry(key.clone()).or_default().push(row);
            maps.rows.insert(row, key);
        }
        Ok(())
    }

    fn contains(&self, key: &Value) -> bool {
        self.maps.read().is_live(&IndexKey::from_value(key))
    }

    fn rows_of(&self, key: &Value) -> Vec<u32> {
        self.maps
            .read()
            .keys
            .get(&IndexKey::from_value(key))
            .map(|rows| rows.iter().rev().copied().collect())
            .unwrap_or_default()
    }

    fn retire_rows(&self, rows: &RoaringBitmap) -> usize {
        let mut maps = self.maps.write();
        let mut retired = 0;
        for row in rows {
            let Some(key) = maps.rows.get(&row).cloned() else {
                continue;
            };
            if !maps.retired.insert(row) {
                continue;
            }
            retired += 1;
            if !maps.is_live(&key) {
                maps.live -= 1;
            }
        }
        retired
    }

    fn remove_rows(&self, rows: &RoaringBitmap) -> usize {
        let mut maps = self.maps.write();
        let mut removed = 0;
        for row in rows {
            let Some(key) = maps.rows.remove(&row) else {
                continue;
            };
            removed += 1;
            let was_live = maps.is_live(&key);
            maps.retired.remove(row);
            if let Some(held) = maps.keys.get_mut(&key) {
                held.retain(|r| *r != row);
                if held.is_empty() {
                    maps.keys.remove(&key);
                }
            }
            if was_live && !maps.is_live(&key) {
                maps.live -= 1;
            }
        }
        removed
    }

    fn len(&self) -> usize {
        self.maps.read().live
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::{Int64Array, StringArray};

    #[test]
    fn test_insert_and_lookup() {
        let index = HashPkIndex::new();
        let keys = Int64Array::from(vec![10, 20, 30, 40]);
        index.batch_insert(&keys, 1, 2, 100, false).unwrap();

        assert_eq!(index.len(), 2);
        assert_eq!(index.rows_of(&Value::Int64(20)), vec![100]);
        assert_eq!(index.rows_of(&Value::Int64(30)), vec![101]);
        assert!(!index.contains(&Value::Int64(10)));
        // Int32 and Int64 of the same number are one key
        assert!(index.contains(&Value::Int32(20)));
    }

    #[test]
    fn test_duplicate_leaves_index_unchanged() {
        let index = HashPkIndex::new();
        index.batch_insert(&StringArray::from(vec!["a", "b"]), 0, 2, 0, false).unwrap();

        let err = index
            .batch_insert(&StringArray::from(vec!["c", "b"]), 0, 2, 2, false)
            .unwrap_err();
        assert!(err.is_duplicate());
        assert!(!index.contains(&Value::from("c")));
        assert_eq!(index.len(), 2);

        // repeat inside one batch
        let err = index
            .batch_insert(&StringArray::from(vec!["x", "x"]), 0, 2, 2, false)
            .unwrap_err();
        assert!(err.is_duplicate());
        assert_eq!(index.len(), 2);

        index.batch_insert(&StringArray::from(vec!["b"]), 0, 1, 7, true).unwrap();
        assert_eq!(index.rows_of(&Value::from("b")), vec![7, 1]);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_retired_rows_stay_reachable() {
        let index = HashPkIndex::new();
        index.batch_insert(&Int64Array::from(vec![1, 2]), 0, 2, 0, false).unwrap();

        let rows: RoaringBitmap = [0u32].into_iter().collect();
        assert_eq!(index.retire_rows(&rows), 1);
        assert_eq!(index.retire_rows(&rows), 0);
        assert!(!index.contains(&Value::Int64(1)));
        assert_eq!(index.rows_of(&Value::Int64(1)), vec![0]);
        assert_eq!(index.len(), 1);

        // the key is free again and both generations are kept
        index.batch_insert(&Int64Array::from(vec![1]), 0, 1, 2, false).unwrap();
        assert!(index.contains(&Value::Int64(1)));
        assert_eq!(index.rows_of(&Value::Int64(1)), vec![2, 0]);
        assert_eq!(index.len(), 2);

        // purging the retired row keeps the live one
        assert_eq!(index.remove_rows(&rows), 1);
        assert_eq!(index.rows_of(&Value::Int64(1)), vec![2]);
        assert_eq!(index.len(), 2);
    }

    #[test]
    fn test_remove_rows() {
        let index = HashPkIndex::with_capacity(8);
        index.batch_insert(&Int64Array::from(vec![1, 2, 3]), 0, 3, 0, false).unwrap();
        let rows: RoaringBitmap = [0u32, 2, 9].into_iter().collect();
        assert_eq!(index.remove_rows(&rows), 2);
        assert_eq!(index.len(), 1);
        assert!(index.contains(&Value::Int64(2)));
        assert!(index.rows_of(&Value::Int64(1)).is_empty());
        // a removed key may be inserted again
        index.batch_insert(&Int64Array::from(vec![1]), 0, 1, 3, false).unwrap();
        assert_eq!(index.rows_of(&Value::Int64(1)), vec![3]);
    }

    #[test]
    fn test_null_key_rejected() {
        let index = HashPkIndex::new();
        let keys = Int64Array::from(vec![Some(1), None]);
        assert!(index.batch_insert(&keys, 0, 2, 0, false).is_err());
        assert!(index.is_empty());
    }
}
