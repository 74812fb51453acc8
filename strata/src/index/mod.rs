//! Primary-key indexes of appendable blocks
//!
//! Every block owns one index over its primary-key column. The append path
//! inserts a batch's keys before the rows land so a duplicate aborts the
//! append with nothing written.
//!
//! A key may map to several rows over time. A committed delete only retires
//! its rows: older snapshots still reach them by key, while uniqueness checks
//! ignore them. Retired rows are removed once no snapshot can see them.

mod hash;
mod key;

pub use hash::HashPkIndex;
pub use key::IndexKey;

use arrow::array::Array;
use roaring::RoaringBitmap;

use crate::{Result, Value};

pub trait PrimaryKeyIndex: Send + Sync {
    /// Index `keys[offset..offset + length]` as rows `start_row..`
    ///
    /// Fails with `Duplicate` without changing the index when a key already
    /// has a live row (unless `allow_dup`) or repeats within the slice.
    fn batch_insert(
        &self,
        keys: &dyn Array,
        offset: usize,
        length: usize,
        start_row: u32,
        allow_dup: bool,
    ) -> Result<()>;

    /// Whether `key` has a row that is not retired
    fn contains(&self, key: &Value) -> bool;

    /// Every row that has held `key`, newest first, retired rows included
    fn rows_of(&self, key: &Value) -> Vec<u32>;

    /// Mark `rows` deleted, returning how many were indexed and live
    fn retire_rows(&self, rows: &RoaringBitmap) -> usize;

    /// Drop `rows` entirely, returning how many were present
    fn remove_rows(&self, rows: &RoaringBitmap) -> usize;

    /// Number of keys with a live row
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
