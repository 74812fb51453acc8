//! Hashable key extracted from a cell value

use std::hash::{Hash, Hasher};

use serde::{Deserialize, Serialize};

use crate::Value;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum IndexKey {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    /// Float stored as its bit pattern
    Float(u64),
    Str(String),
}

impl IndexKey {
    pub fn from_value(val: &Value) -> Self {
        match val {
            Value::Null => IndexKey::Null,
            Value::Bool(b) => IndexKey::Bool(*b),
            Value::Int32(v) => IndexKey::Int(*v as i64),
            Value::Int64(v) => IndexKey::Int(*v),
            Value::UInt32(v) => IndexKey::UInt(*v as u64),
            Value::UInt64(v) => IndexKey::UInt(*v),
            // -0.0 and 0.0 are one key
            Value::Float64(f) if *f == 0.0 => IndexKey::Float(0),
            Value::Float64(f) => IndexKey::Float(f.to_bits()),
            Value::String(s) => IndexKey::Str(s.clone()),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, IndexKey::Null)
    }
}

impl From<&Value> for IndexKey {
    fn from(v: &Value) -> Self {
        IndexKey::from_value(v)
    }
}

impl Hash for IndexKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        std::mem::discriminant(self).hash(state);
        match self {
            IndexKey::Null => {}
            IndexKey::Bool(b) => b.hash(state),
            IndexKey::Int(v) => v.hash(state),
            IndexKey::UInt(v) => v.hash(state),
            IndexKey::Float(v) => v.hash(state),
            IndexKey::Str(s) => s.hash(state),
        }
    }
}

impl std::fmt::Display for IndexKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IndexKey::Null => write!(f, "NULL"),
            IndexKey::Bool(b) => write!(f, "{}", b),
            IndexKey::Int(v) => write!(f, "{}", v),
            IndexKey::UInt(v) => write!(f, "{}", v),
            IndexKey::Float(bits) => write!(f, "{}", f64::from_bits(*bits)),
            IndexKey::Str(s) => write!(f, "{:?}", s),
        }
    }
}
