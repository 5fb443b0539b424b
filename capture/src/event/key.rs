use crate::error::{CaptureError, CaptureResult};
use crate::event::table_id::TableId;
use crate::event::Row;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt::{self, Display};

/// A single key column value.
///
/// Variant order is the sort order across types; within a type values sort
/// naturally. This must agree with the order the source scans keys in.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(untagged)]
pub enum KeyValue {
    Null,
    Bool(bool),
    Int(i64),
    UInt(u64),
    Text(String),
    Bytes(Vec<u8>),
}

impl KeyValue {
    pub fn from_json(value: &Value) -> Self {
        match value {
            Value::Null => KeyValue::Null,
            Value::Bool(b) => KeyValue::Bool(*b),
            Value::Number(n) => {
                if let Some(i) = n.as_i64() {
                    KeyValue::Int(i)
                } else if let Some(u) = n.as_u64() {
                    KeyValue::UInt(u)
                } else {
                    // Sorts as text; fractional key columns are refused
                    // before capture starts.
                    KeyValue::Text(n.to_string())
                }
            }
            Value::String(s) => KeyValue::Text(s.clone()),
            other => KeyValue::Text(other.to_string()),
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            KeyValue::Null => Value::Null,
            KeyValue::Bool(b) => Value::Bool(*b),
            KeyValue::Int(i) => Value::from(*i),
            KeyValue::UInt(u) => Value::from(*u),
            KeyValue::Text(s) => Value::String(s.clone()),
            KeyValue::Bytes(b) => Value::from(b.clone()),
        }
    }
}

impl From<i64> for KeyValue {
    fn from(v: i64) -> Self {
        KeyValue::Int(v)
    }
}

impl From<u64> for KeyValue {
    fn from(v: u64) -> Self {
        match i64::try_from(v) {
            Ok(i) => KeyValue::Int(i),
            Err(_) => KeyValue::UInt(v),
        }
    }
}

impl From<&str> for KeyValue {
    fn from(v: &str) -> Self {
        KeyValue::Text(v.to_string())
    }
}

/// Ordered mapping of key column to value, in key-column order.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Key(Vec<(String, KeyValue)>);

impl Key {
    pub fn new(columns: Vec<(String, KeyValue)>) -> Self {
        Key(columns)
    }

    pub fn single(column: &str, value: impl Into<KeyValue>) -> Self {
        Key(vec![(column.to_string(), value.into())])
    }

    pub fn from_row(table: &TableId, row: &Row, key_columns: &[String]) -> CaptureResult<Self> {
        let mut columns = Vec::with_capacity(key_columns.len());
        for column in key_columns {
            let value = row
                .get(column)
                .ok_or_else(|| CaptureError::MetadataCorruption {
                    table: Some(table.clone()),
                    position: None,
                    detail: format!("row is missing key column '{}'", column),
                })?;
            columns.push((column.clone(), KeyValue::from_json(value)));
        }
        Ok(Key(columns))
    }

    pub fn columns(&self) -> &[(String, KeyValue)] {
        &self.0
    }

    pub fn values(&self) -> impl Iterator<Item = &KeyValue> {
        self.0.iter().map(|(_, v)| v)
    }

    pub fn to_json(&self) -> Value {
        let mut object = serde_json::Map::new();
        for (column, value) in &self.0 {
            object.insert(column.clone(), value.to_json());
        }
        Value::Object(object)
    }
}

impl Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}", self.to_json())
    }
}
