use crate::error::CaptureResult;
use crate::event::event::ChangeEvent;
use crate::kafka::kafka_client::Kafka;
use crate::sink::output::ChangeEventOutput;
use crate::sink::Sink;
use async_trait::async_trait;
use log::debug;

/// Publishes every event to `{topic_prefix}.{schema}.{table}`, keyed by the
/// row key so one key always lands on one partition.
pub struct KafkaSink {
    capture: String,
    kafka: Kafka,
}

impl KafkaSink {
    pub fn new(capture: &str, kafka: Kafka) -> Self {
        KafkaSink {
            capture: capture.to_string(),
            kafka,
        }
    }
}

#[async_trait]
impl Sink for KafkaSink {
    async fn deliver(&self, batch: &[ChangeEvent]) -> CaptureResult<()> {
        for event in batch {
            let message = ChangeEventOutput::to_kafka_message(
                &self.capture,
                &self.kafka.config.topic_prefix,
                event,
            )?;
            self.kafka.produce(&message).await?;
        }
        debug!("Delivered {} events to Kafka", batch.len());
        Ok(())
    }
}
