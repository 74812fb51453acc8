//! Primary-key sort of a dense batch and the old → new row mapping

use std::sync::Arc;

use arrow::array::{Array, ArrayRef, UInt32Array};
use arrow::compute::kernels::cmp::lt;
use arrow::compute::{lexsort_to_indices, take, SortColumn};
use arrow::record_batch::RecordBatch;
use roaring::RoaringBitmap;

use crate::{Result, StrataError};

/// Where each row of the compacted block ended up
///
/// Rows that were not visible when the dense batch was built map to nothing.
#[derive(Debug, Clone, Default)]
pub struct RowMapping {
    map: Vec<Option<u32>>,
    new_rows: u32,
}

impl RowMapping {
    /// `visible` are the old rows kept, in ascending order they form the dense
    /// batch; `sorted` gives, for each new row, its dense position.
    pub fn new(old_rows: u32, visible: &RoaringBitmap, sorted: &UInt32Array) -> Result<Self> {
        let dense_len = visible.len() as usize;
        if sorted.len() != dense_len {
            return Err(StrataError::Invariant(format!(
                "sort permutation has {} entries for {} rows",
                sorted.len(),
                dense_len
            )));
        }
        let mut new_of_dense = vec![0u32; dense_len];
        for (new_row, dense) in sorted.values().iter().enumerate() {
            let slot = new_of_dense.get_mut(*dense as usize).ok_or_else(|| {
                StrataError::Invariant(format!("sort index {} out of range", dense))
            })?;
            *slot = new_row as u32;
        }

        let mut map = vec![None; old_rows as usize];
        for (dense, old_row) in visible.iter().enumerate() {
            let slot = map.get_mut(old_row as usize).ok_or_else(|| {
                StrataError::Invariant(format!("visible row {} beyond {} rows", old_row, old_rows))
            })?;
            *slot = Some(new_of_dense[dense]);
        }
        Ok(Self { map, new_rows: dense_len as u32 })
    }

    pub fn get(&self, old_row: u32) -> Option<u32> {
        self.map.get(old_row as usize).copied().flatten()
    }

    /// Rows in the new block
    pub fn new_rows(&self) -> u32 {
        self.new_rows
    }

    /// Translate a set of old rows, dropping rows with no new position
    pub fn remap(&self, rows: &RoaringBitmap) -> RoaringBitmap {
        rows.iter().filter_map(|r| self.get(r)).collect()
    }
}

/// Sort `batch` by column `pk`, ties kept in input order
///
/// Returns the sorted batch and, for each output row, its input position.
pub fn sort_by_primary_key(batch: &RecordBatch, pk: usize) -> Result<(RecordBatch, UInt32Array)> {
    let order: ArrayRef = Arc::new(UInt32Array::from_iter_values(0..batch.num_rows() as u32));
    let columns = [
        SortColumn { values: batch.column(pk).clone(), options: None },
        SortColumn { values: order, options: None },
    ];
    let indices = lexsort_to_indices(&columns, None)?;
    let sorted = batch
        .columns()
        .iter()
        .map(|c| take(c.as_ref(), &indices, None))
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok((RecordBatch::try_new(batch.schema(), sorted)?, indices))
}

/// Fail unless `keys` is non-decreasing
pub fn check_sorted(keys: &ArrayRef) -> Result<()> {
    if keys.len() < 2 {
        return Ok(());
    }
    let n = keys.len() - 1;
    let next = keys.slice(1, n);
    let prev = keys.slice(0, n);
    let out_of_order = lt(&next, &prev)?;
    if out_of_order.true_count() > 0 {
        return Err(StrataError::Invariant(format!(
            "{} keys out of order after sort",
            out_of_order.true_count()
        )));
    }
    Ok(())
}
