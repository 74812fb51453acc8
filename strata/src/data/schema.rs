//! Table schema

use std::sync::Arc;

use arrow::datatypes::{Schema as ArrowSchema, SchemaRef};
use arrow::record_batch::RecordBatch;
use serde::{Deserialize, Serialize};

use super::{ColumnDef, DataType};
use crate::{Result, StrataError};

/// Table schema: ordered columns plus the primary-key column
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Schema {
    pub name: String,
    pub columns: Vec<ColumnDef>,
    /// Index of the primary-key column
    pub primary_key: u16,
}

impl Schema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            columns: Vec::new(),
            primary_key: 0,
        }
    }

    /// Append a column; its index is its position
    pub fn column(mut self, name: impl Into<String>, data_type: DataType) -> Self {
        let idx = self.columns.len() as u16;
        self.columns.push(ColumnDef::new(idx, name, data_type));
        self
    }

    /// Mark the named column as primary key
    pub fn primary_key(mut self, name: &str) -> Result<Self> {
        let idx = self
            .column_index(name)
            .ok_or_else(|| StrataError::NotFound(format!("column {}", name)))?;
        self.primary_key = idx;
        self.columns[idx as usize].nullable = false;
        Ok(self)
    }

    pub fn column_index(&self, name: &str) -> Option<u16> {
        self.columns.iter().position(|c| c.name == name).map(|i| i as u16)
    }

    pub fn num_columns(&self) -> usize {
        self.columns.len()
    }

    pub fn pk_column(&self) -> &ColumnDef {
        &self.columns[self.primary_key as usize]
    }

    pub fn data_type(&self, col: u16) -> Result<DataType> {
        self.columns
            .get(col as usize)
            .map(|c| c.data_type)
            .ok_or_else(|| StrataError::NotFound(format!("column index {}", col)))
    }

    pub fn arrow_schema(&self) -> SchemaRef {
        Arc::new(ArrowSchema::new(
            self.columns.iter().map(|c| c.to_arrow_field()).collect::<Vec<_>>(),
        ))
    }

    /// Approximate resident size of a block holding `rows` rows
    pub fn estimated_block_bytes(&self, rows: u32) -> u64 {
        let width: u64 = self.columns.iter().map(|c| c.data_type.estimated_width()).sum();
        width.max(1) * rows as u64
    }

    /// Check a batch has this schema's column types in order
    pub fn check_batch(&self, batch: &RecordBatch) -> Result<()> {
        if batch.num_columns() != self.columns.len() {
            return Err(StrataError::InvalidState(format!(
                "batch has {} columns, table {} has {}",
                batch.num_columns(),
                self.name,
                self.columns.len()
            )));
        }
        for (col, def) in batch.columns().iter().zip(&self.columns) {
            if col.data_type() != &def.data_type.to_arrow() {
                return Err(StrataError::InvalidState(format!(
                    "column {} expects {:?}, batch has {:?}",
                    def.name,
                    def.data_type,
                    col.data_type()
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::build_array;
    use crate::Value;

    #[test]
    fn test_schema_builder() {
        let schema = Schema::new("users")
            .column("id", DataType::Int64)
            .column("name", DataType::String)
            .primary_key("id")
            .unwrap();
        assert_eq!(schema.num_columns(), 2);
        assert_eq!(schema.pk_column().name, "id");
        assert!(!schema.pk_column().nullable);
        assert_eq!(schema.column_index("name"), Some(1));
        assert_eq!(schema.estimated_block_bytes(10), 320);
        assert!(Schema::new("t").primary_key("nope").is_err());
    }

    #[test]
    fn test_check_batch() {
        let schema = Schema::new("t").column("id", DataType::Int32).primary_key("id").unwrap();
        let ids = build_array(DataType::Int32, [Value::Int32(1)].iter()).unwrap();
        let batch = RecordBatch::try_new(schema.arrow_schema(), vec![ids]).unwrap();
        assert!(schema.check_batch(&batch).is_ok());

        let other = Schema::new("t").column("id", DataType::Int64);
        assert!(other.check_batch(&batch).is_err());
    }
}
