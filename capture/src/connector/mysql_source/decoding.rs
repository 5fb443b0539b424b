use crate::event::key::KeyValue;
use crate::event::Row;
use mysql_async::binlog::row::BinlogRow;
use mysql_async::binlog::value::BinlogValue;
use mysql_async::Value;
use serde_json::json;

/// Column values as they appear in change events.
pub fn value_to_json(value: &Value) -> serde_json::Value {
    match value {
        Value::NULL => json!(null),
        Value::Bytes(v) => match std::str::from_utf8(v) {
            Ok(s) => json!(s),
            Err(_) => json!(v),
        },
        Value::Int(v) => json!(v),
        Value::UInt(v) => json!(v),
        Value::Float(v) => json!(v),
        Value::Double(v) => json!(v),
        v => {
            let v = v.as_sql(true);
            json!(v.trim_matches('\''))
        }
    }
}

pub fn key_value_to_sql(value: &KeyValue) -> Value {
    match value {
        KeyValue::Null => Value::NULL,
        KeyValue::Bool(b) => Value::Int(*b as i64),
        KeyValue::Int(i) => Value::Int(*i),
        KeyValue::UInt(u) => Value::UInt(*u),
        KeyValue::Text(s) => Value::Bytes(s.as_bytes().to_vec()),
        KeyValue::Bytes(b) => Value::Bytes(b.clone()),
    }
}

/// Decodes a binlog row image against the table's column names.
///
/// JSON columns are rejected: their binary form is not decoded, so emitting
/// the row would silently drop the column.
pub fn binlog_row_to_json(row: &BinlogRow, columns: &[String]) -> Result<Row, String> {
    let mut payload = Row::new();
    for (n, column) in columns.iter().enumerate() {
        let value = match row.as_ref(n) {
            Some(value) => value,
            None => return Err(format!("row image is missing column '{}'", column)),
        };
        match value {
            BinlogValue::Value(v) => {
                payload.insert(column.clone(), value_to_json(v));
            }
            BinlogValue::Jsonb(_) | BinlogValue::JsonDiff(_) => {
                return Err(format!("JSON column '{}' is not supported", column))
            }
        }
    }
    Ok(payload)
}

/// Decodes a row read with the binary protocol during a table scan.
pub fn sql_row_to_json(row: &mysql_async::Row) -> Row {
    let mut payload = Row::new();
    for (n, column) in row.columns_ref().iter().enumerate() {
        let value = row.as_ref(n).map(value_to_json).unwrap_or(json!(null));
        payload.insert(column.name_str().to_string(), value);
    }
    payload
}
