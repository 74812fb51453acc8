//! Conversions between `Value` cells and Arrow arrays

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{
    Array, ArrayRef, BooleanArray, Float64Array, Int32Array, Int64Array, StringArray,
    UInt32Array, UInt64Array,
};

use super::{DataType, Value};
use crate::{Result, StrataError};

macro_rules! downcast {
    ($array:expr, $ty:ty) => {
        $array.as_any().downcast_ref::<$ty>().ok_or_else(|| {
            StrataError::InvalidState(format!("expected {} column", stringify!($ty)))
        })?
    };
}

macro_rules! build_typed {
    ($values:expr, $variant:ident, $array:ty) => {{
        let mut out = Vec::new();
        for v in $values {
            match v {
                Value::Null => out.push(None),
                Value::$variant(x) => out.push(Some(x.clone())),
                other => return Err(type_mismatch(stringify!($variant), other)),
            }
        }
        Arc::new(<$array>::from(out)) as ArrayRef
    }};
}

fn type_mismatch(expected: &str, got: &Value) -> StrataError {
    StrataError::InvalidState(format!("type mismatch: expected {}, got {:?}", expected, got))
}

/// Read one cell of an Arrow array as a `Value`
pub fn value_at(array: &dyn Array, row: usize) -> Result<Value> {
    if row >= array.len() {
        return Err(StrataError::NotFound(format!(
            "row {} out of range ({} rows)",
            row,
            array.len()
        )));
    }
    if array.is_null(row) {
        return Ok(Value::Null);
    }

    use arrow::datatypes::DataType as A;
    let value = match array.data_type() {
        A::Boolean => Value::Bool(downcast!(array, BooleanArray).value(row)),
        A::Int32 => Value::Int32(downcast!(array, Int32Array).value(row)),
        A::Int64 => Value::Int64(downcast!(array, Int64Array).value(row)),
        A::UInt32 => Value::UInt32(downcast!(array, UInt32Array).value(row)),
        A::UInt64 => Value::UInt64(downcast!(array, UInt64Array).value(row)),
        A::Float64 => Value::Float64(downcast!(array, Float64Array).value(row)),
        A::Utf8 => Value::String(downcast!(array, StringArray).value(row).to_string()),
        other => {
            return Err(StrataError::InvalidState(format!(
                "unsupported column type {:?}",
                other
            )))
        }
    };
    Ok(value)
}

/// Build an Arrow array of `data_type` from values; nulls are allowed everywhere
pub fn build_array<'a>(
    data_type: DataType,
    values: impl IntoIterator<Item = &'a Value>,
) -> Result<ArrayRef> {
    let values = values.into_iter();
    let array = match data_type {
        DataType::Bool => build_typed!(values, Bool, BooleanArray),
        DataType::Int32 => build_typed!(values, Int32, Int32Array),
        DataType::Int64 => build_typed!(values, Int64, Int64Array),
        DataType::UInt32 => build_typed!(values, UInt32, UInt32Array),
        DataType::UInt64 => build_typed!(values, UInt64, UInt64Array),
        DataType::Float64 => build_typed!(values, Float64, Float64Array),
        DataType::String => build_typed!(values, String, StringArray),
    };
    Ok(array)
}

/// Materialize `len` values starting at `offset`
pub fn slice_values(array: &dyn Array, offset: usize, len: usize) -> Result<Vec<Value>> {
    (offset..offset + len).map(|row| value_at(array, row)).collect()
}

/// Return a copy of `array` with the given row overrides applied
pub fn apply_updates(
    array: &ArrayRef,
    data_type: DataType,
    updates: &BTreeMap<u32, Value>,
) -> Result<ArrayRef> {
    if updates.is_empty() {
        return Ok(array.clone());
    }
    let mut values = slice_values(array.as_ref(), 0, array.len())?;
    for (&row, value) in updates {
        let slot = values.get_mut(row as usize).ok_or_else(|| {
            StrataError::NotFound(format!("update for row {} beyond column end", row))
        })?;
        *slot = value.clone();
    }
    build_array(data_type, values.iter())
}
