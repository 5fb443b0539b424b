use crate::checkpoint::store::CheckpointStore;
use crate::checkpoint::Checkpoint;
use crate::error::CaptureResult;
use crate::kafka::kafka_client::Kafka;
use crate::kafka::message::{KafkaMessage, RawKafkaMessageKeyValue};
use async_trait::async_trait;
use log::info;
use std::time::Duration;

/// Checkpoints stored on a compacted topic, keyed by capture name.
pub struct KafkaCheckpointStore {
    name: String,
    topic: String,
    kafka: Kafka,
    read_timeout: Duration,
}

impl KafkaCheckpointStore {
    pub fn new(name: &str, topic: &str, kafka: Kafka) -> Self {
        KafkaCheckpointStore {
            name: name.to_string(),
            topic: topic.to_string(),
            kafka,
            read_timeout: Duration::from_secs(10),
        }
    }

    pub async fn ensure_topic(&self) -> CaptureResult<()> {
        self.kafka.create_topic(&self.topic, "compact").await
    }
}

/// The latest value written under `name`; a tombstone clears it.
fn latest_for(name: &str, messages: Vec<RawKafkaMessageKeyValue>) -> CaptureResult<Option<Checkpoint>> {
    let mut latest = None;
    for message in messages {
        if message.key.as_deref() != Some(name) {
            continue;
        }
        latest = match message.value {
            Some(value) if !value.is_empty() => Some(serde_json::from_str(&value)?),
            _ => None,
        };
    }
    Ok(latest)
}

#[async_trait]
impl CheckpointStore for KafkaCheckpointStore {
    async fn load(&self) -> CaptureResult<Option<Checkpoint>> {
        let messages = self
            .kafka
            .read_to_end(&self.topic, self.read_timeout)
            .await?;
        let checkpoint = latest_for(&self.name, messages)?;
        if let Some(checkpoint) = &checkpoint {
            info!(
                "Loaded checkpoint for {} from {}: {:?}",
                self.name, self.topic, checkpoint.log_position
            );
        }
        Ok(checkpoint)
    }

    async fn save(&self, checkpoint: &Checkpoint) -> CaptureResult<()> {
        let value = serde_json::to_string(checkpoint)?;
        let message = KafkaMessage::new(self.topic.clone(), Some(self.name.clone()), value);
        self.kafka.produce(&message).await
    }
}
