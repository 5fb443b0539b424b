use capture::config::CaptureConfig;
use capture::connector::mysql_source::MySQLSourceConfig;
use capture::kafka::config::KafkaConfig;
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CheckpointConfig {
    File { path: String },
    /// Defaults to the sink's offset topic.
    Kafka { topic: Option<String> },
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct AppConfig {
    pub capture: CaptureConfig,
    pub source: MySQLSourceConfig,
    pub sink: KafkaConfig,
    pub checkpoint: CheckpointConfig,
}

#[cfg(test)]
mod tests {
    use super::*;

    const YAML: &str = r#"
capture:
  name: shop
  bindings:
    - schema: shop
      table: orders
      key_columns: [id]
  backfill:
    chunk_size: 500
source:
  host: localhost
  port: 3306
  user: capture
  password: secret
  db: shop
  server_id: 4242
sink:
  bootstrap_servers: localhost:9092
  topic_prefix: cdc
checkpoint:
  kind: file
  path: /var/lib/capture/shop.json
"#;

    #[test]
    fn test_parse_app_config() {
        let config: AppConfig = serde_yaml::from_str(YAML).unwrap();
        assert_eq!(config.capture.name, "shop");
        assert_eq!(config.capture.slot_id, "capture");
        assert_eq!(config.capture.backfill.chunk_size, 500);
        assert_eq!(config.capture.backfill.concurrency, 2);
        assert_eq!(config.capture.bindings[0].key_columns, vec!["id".to_string()]);
        assert_eq!(config.source.watermarks_table, "flow_watermarks");
        assert_eq!(config.sink.offset_topic, "capture-offsets");
        assert_eq!(
            config.checkpoint,
            CheckpointConfig::File {
                path: "/var/lib/capture/shop.json".into()
            }
        );
        assert!(config.capture.validate().is_ok());
    }

    #[test]
    fn test_kafka_checkpoint_topic_is_optional() {
        let config: CheckpointConfig = serde_yaml::from_str("kind: kafka").unwrap();
        assert_eq!(config, CheckpointConfig::Kafka { topic: None });
    }
}
