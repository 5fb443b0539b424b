pub mod event;
pub mod key;
pub mod log_entry;
pub mod operation;
pub mod table_id;

pub type Row = serde_json::Map<String, serde_json::Value>;
