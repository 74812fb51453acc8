//! Column definitions

use super::DataType;
use serde::{Deserialize, Serialize};

/// Column definition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ColumnDef {
    /// Column index within the table (also the column chain index)
    pub idx: u16,
    pub name: String,
    pub data_type: DataType,
    pub nullable: bool,
}

impl ColumnDef {
    pub fn new(idx: u16, name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            idx,
            name: name.into(),
            data_type,
            nullable: true,
        }
    }

    /// Set nullable flag
    pub fn nullable(mut self, nullable: bool) -> Self {
        self.nullable = nullable;
        self
    }

    pub fn to_arrow_field(&self) -> arrow::datatypes::Field {
        arrow::datatypes::Field::new(&self.name, self.data_type.to_arrow(), self.nullable)
    }
}
