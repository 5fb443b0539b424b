use crate::error::{CaptureError, CaptureResult};
use crate::kafka::config::KafkaConfig;
use crate::kafka::message::{KafkaMessage, RawKafkaMessageKeyValue};
use log::debug;
use rdkafka::admin::{AdminClient, AdminOptions, NewTopic, TopicReplication};
use rdkafka::client::DefaultClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use rdkafka::{Message, Offset, TopicPartitionList};
use std::collections::HashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

pub struct Kafka {
    pub config: KafkaConfig,
    pub admin: AdminClient<DefaultClientContext>,
    pub producer: FutureProducer,
}

impl Kafka {
    pub fn new(config: &KafkaConfig) -> CaptureResult<Self> {
        let mut admin_config = ClientConfig::new();
        admin_config.set("bootstrap.servers", &config.bootstrap_servers);
        let admin: AdminClient<DefaultClientContext> = admin_config.create()?;

        let mut producer_config = ClientConfig::new();
        producer_config.set("bootstrap.servers", &config.bootstrap_servers);
        producer_config.set("enable.idempotence", "true");
        let producer: FutureProducer = producer_config.create()?;

        Ok(Kafka {
            config: config.clone(),
            admin,
            producer,
        })
    }

    pub async fn create_topic(&self, topic_name: &str, clean_up_policy: &str) -> CaptureResult<()> {
        let topic = NewTopic::new(topic_name, 1, TopicReplication::Fixed(1))
            .set("cleanup.policy", clean_up_policy);
        let options = AdminOptions::new();
        let result = self.admin.create_topics(&[topic], &options).await?;
        debug!("Create topic {}: {:?}", topic_name, result);
        Ok(())
    }

    pub async fn produce(&self, message: &KafkaMessage) -> CaptureResult<()> {
        let mut record = FutureRecord::to(&message.topic).payload(&message.value);
        if let Some(key) = &message.key {
            record = record.key(key);
        }

        match self.producer.send(record, Duration::from_secs(0)).await {
            Ok(delivery_status) => {
                debug!("Send success - {:?} {:?}", message.topic, delivery_status);
                Ok(())
            }
            Err((err, _)) => {
                debug!("Send failed to {}: {:?}", message.topic, err);
                Err(err.into())
            }
        }
    }

    /// Reads every message of `topic` up to the high watermarks taken
    /// when the read starts. Fails rather than returning a partial read if
    /// that takes longer than `timeout`.
    pub async fn read_to_end(
        &self,
        topic: &str,
        timeout: Duration,
    ) -> CaptureResult<Vec<RawKafkaMessageKeyValue>> {
        let mut config = ClientConfig::new();
        config.set("group.id", Uuid::new_v4().to_string());
        config.set("bootstrap.servers", &self.config.bootstrap_servers);
        config.set("enable.auto.commit", "false");
        let consumer: BaseConsumer = config.create()?;
        let topic = topic.to_string();

        tokio::task::spawn_blocking(move || -> CaptureResult<Vec<RawKafkaMessageKeyValue>> {
            let deadline = Instant::now() + timeout;
            let metadata = consumer.fetch_metadata(Some(&topic), timeout)?;
            let partitions: Vec<i32> = metadata
                .topics()
                .iter()
                .filter(|t| t.name() == topic && t.error().is_none())
                .flat_map(|t| t.partitions().iter().map(|p| p.id()))
                .collect();

            let mut assignment = TopicPartitionList::new();
            let mut watermarks = vec![];
            for partition in partitions {
                assignment.add_partition_offset(&topic, partition, Offset::Beginning)?;
                let (low, high) = consumer.fetch_watermarks(&topic, partition, timeout)?;
                watermarks.push((partition, low, high));
            }
            let mut progress = ReadProgress::new(watermarks);
            if progress.is_done() {
                debug!("Topic {} is empty", topic);
                return Ok(vec![]);
            }
            consumer.assign(&assignment)?;

            let mut messages = vec![];
            while !progress.is_done() {
                let left = deadline.saturating_duration_since(Instant::now());
                if left.is_zero() {
                    return Err(CaptureError::Timeout(format!(
                        "reading {} stopped {} messages short of the end",
                        topic,
                        progress.missing()
                    )));
                }
                match consumer.poll(left) {
                    Some(Ok(message)) => {
                        if !progress.record(message.partition(), message.offset()) {
                            continue;
                        }
                        let key = match message.key() {
                            Some(key) => Some(std::str::from_utf8(key)?.to_string()),
                            None => None,
                        };
                        let value = match message.payload() {
                            Some(value) => Some(std::str::from_utf8(value)?.to_string()),
                            None => None,
                        };
                        messages.push(RawKafkaMessageKeyValue::new(key, value));
                    }
                    Some(Err(err)) => return Err(err.into()),
                    None => {}
                }
            }
            debug!("Read {} messages from {}", messages.len(), topic);
            Ok(messages)
        })
        .await
        .map_err(|err| CaptureError::Transient(format!("kafka read task failed: {}", err)))?
    }
}

/// Tracks how far each partition still has to be read.
struct ReadProgress {
    /// Partition to its high watermark, for partitions not yet read up to it.
    remaining: HashMap<i32, i64>,
    /// Partition to the next offset expected.
    next: HashMap<i32, i64>,
}

impl ReadProgress {
    fn new(watermarks: impl IntoIterator<Item = (i32, i64, i64)>) -> Self {
        let mut remaining = HashMap::new();
        let mut next = HashMap::new();
        for (partition, low, high) in watermarks {
            if high > low {
                remaining.insert(partition, high);
                next.insert(partition, low);
            }
        }
        ReadProgress { remaining, next }
    }

    /// Records a message; false when it lies past the watermark taken at start.
    fn record(&mut self, partition: i32, offset: i64) -> bool {
        let high = match self.remaining.get(&partition) {
            Some(high) => *high,
            None => return false,
        };
        if offset >= high {
            self.remaining.remove(&partition);
            return false;
        }
        self.next.insert(partition, offset + 1);
        if offset + 1 >= high {
            self.remaining.remove(&partition);
        }
        true
    }

    fn is_done(&self) -> bool {
        self.remaining.is_empty()
    }

    fn missing(&self) -> i64 {
        self.remaining
            .iter()
            .map(|(partition, high)| high - self.next.get(partition).copied().unwrap_or(0))
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_read_progress_stops_at_high_watermarks() {
        let mut progress = ReadProgress::new(vec![(0, 0, 2), (1, 5, 6)]);
        assert!(!progress.is_done());
        assert_eq!(progress.missing(), 3);

        assert!(progress.record(0, 0));
        assert!(progress.record(1, 5));
        assert!(!progress.is_done());
        assert!(progress.record(0, 1));
        assert!(progress.is_done());

        // Written after the read started.
        assert!(!progress.record(0, 2));
    }

    #[test]
    fn test_read_progress_skips_empty_and_compacted_partitions() {
        let mut progress = ReadProgress::new(vec![(0, 3, 3), (1, 10, 14)]);
        assert_eq!(progress.missing(), 4);

        // Compaction leaves gaps below the high watermark.
        assert!(progress.record(1, 13));
        assert!(progress.is_done());
        assert!(ReadProgress::new(vec![(0, 0, 0)]).is_done());
    }
}
