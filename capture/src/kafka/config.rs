use serde::{Deserialize, Serialize};

fn default_offset_topic() -> String {
    "capture-offsets".to_string()
}

#[derive(Deserialize, Serialize, Debug, Clone, PartialEq)]
pub struct KafkaConfig {
    pub bootstrap_servers: String,
    pub topic_prefix: String,
    #[serde(default = "default_offset_topic")]
    pub offset_topic: String,
}

impl KafkaConfig {
    pub fn new(bootstrap_servers: String, topic_prefix: String, offset_topic: String) -> Self {
        KafkaConfig {
            bootstrap_servers,
            topic_prefix,
            offset_topic,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_offset_topic_default() {
        let config: KafkaConfig = serde_json::from_str(
            r#"{"bootstrap_servers":"localhost:9092","topic_prefix":"capture"}"#,
        )
        .unwrap();
        assert_eq!(config.offset_topic, "capture-offsets");
        assert_eq!(config.topic_prefix, "capture");
    }
}
