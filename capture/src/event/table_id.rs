use crate::error::CaptureError;
use serde::{Deserialize, Serialize};
use std::fmt::{self, Display};
use std::str::FromStr;

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct TableId {
    pub schema: String,
    pub table: String,
}

impl TableId {
    pub fn new(schema: &str, table: &str) -> Self {
        TableId {
            schema: schema.to_string(),
            table: table.to_string(),
        }
    }
}

impl Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.table)
    }
}

impl FromStr for TableId {
    type Err = CaptureError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.split_once('.') {
            Some((schema, table)) if !schema.is_empty() && !table.is_empty() => {
                Ok(TableId::new(schema, table))
            }
            _ => Err(CaptureError::InvalidConfig(format!(
                "Invalid table name '{}', expected <schema>.<table>",
                s
            ))),
        }
    }
}

impl From<TableId> for String {
    fn from(id: TableId) -> Self {
        id.to_string()
    }
}

impl TryFrom<String> for TableId {
    type Error = CaptureError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    #[test]
    fn test_parse_and_display() {
        let id: TableId = "shop.orders".parse().unwrap();
        assert_eq!(id, TableId::new("shop", "orders"));
        assert_eq!(id.to_string(), "shop.orders");
        assert!("orders".parse::<TableId>().is_err());
        assert!(".orders".parse::<TableId>().is_err());
    }

    #[test]
    fn test_usable_as_json_map_key() {
        let mut map = BTreeMap::new();
        map.insert(TableId::new("shop", "orders"), 1);
        let json = serde_json::to_string(&map).unwrap();
        assert_eq!(json, r#"{"shop.orders":1}"#);
        let back: BTreeMap<TableId, i32> = serde_json::from_str(&json).unwrap();
        assert_eq!(back, map);
    }
}
