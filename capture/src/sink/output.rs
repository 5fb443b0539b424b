use crate::error::CaptureResult;
use crate::event::event::ChangeEvent;
use crate::event::operation::Operation;
use crate::kafka::message::KafkaMessage;
use crate::position::LogPosition;
use serde::{Deserialize, Serialize};
use serde_json::Value;

#[derive(Debug, PartialEq, Deserialize, Serialize, Clone)]
pub struct ChangeEventSource {
    pub capture: String,
    pub schema: String,
    pub table: String,
    pub position: LogPosition,
}

#[derive(Debug, PartialEq, Deserialize, Serialize, Clone)]
pub struct ChangeEventOutput {
    pub before: Option<Value>,
    pub after: Option<Value>,
    pub op: Operation,
    pub ts_ms: u64,
    pub source: ChangeEventSource,
}

impl ChangeEventOutput {
    pub fn new(capture: &str, event: &ChangeEvent) -> Self {
        ChangeEventOutput {
            before: event.before().cloned().map(Value::Object),
            after: event.after().cloned().map(Value::Object),
            op: event.operation(),
            ts_ms: event.source_timestamp(),
            source: ChangeEventSource {
                capture: capture.to_string(),
                schema: event.table_id().schema.clone(),
                table: event.table_id().table.clone(),
                position: event.log_position().clone(),
            },
        }
    }

    pub fn topic(topic_prefix: &str, event: &ChangeEvent) -> String {
        format!("{}.{}", topic_prefix, event.table_id())
    }

    pub fn to_kafka_message(
        capture: &str,
        topic_prefix: &str,
        event: &ChangeEvent,
    ) -> CaptureResult<KafkaMessage> {
        let value = serde_json::to_string(&ChangeEventOutput::new(capture, event))?;
        let key = serde_json::to_string(&event.key().to_json())?;
        Ok(KafkaMessage::new(
            Self::topic(topic_prefix, event),
            Some(key),
            value,
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::key::Key;
    use crate::event::table_id::TableId;
    use serde_json::json;

    #[test]
    fn test_to_kafka_message_update() {
        let event = ChangeEvent::update(
            TableId::new("shop", "orders"),
            Key::single("id", 1i64),
            Some(json!({"id": 1, "name": "before"}).as_object().unwrap().clone()),
            json!({"id": 1, "name": "after"}).as_object().unwrap().clone(),
            LogPosition::binlog("mysql-bin.000001", 777, 0),
            12345,
        );
        let msg = ChangeEventOutput::to_kafka_message("orders-capture", "cdc", &event).unwrap();
        assert_eq!(msg.topic, "cdc.shop.orders");
        assert_eq!(msg.key, Some(r#"{"id":1}"#.to_string()));
        assert_eq!(
            msg.value,
            r#"{"before":{"id":1,"name":"before"},"after":{"id":1,"name":"after"},"op":"u","ts_ms":12345,"source":{"capture":"orders-capture","schema":"shop","table":"orders","position":{"kind":"binlog","file":"mysql-bin.000001","offset":777,"index":0}}}"#
        );
    }

    #[test]
    fn test_delete_has_null_after() {
        let event = ChangeEvent::delete(
            TableId::new("shop", "orders"),
            Key::single("id", 1i64),
            None,
            LogPosition::sequence(3),
            1,
        );
        let output = ChangeEventOutput::new("c", &event);
        assert_eq!(output.op, Operation::Delete);
        assert_eq!(output.after, None);
        assert_eq!(output.before, None);
    }
}
