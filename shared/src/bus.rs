use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{Consumer, StreamConsumer};
use rdkafka::producer::{FutureProducer, FutureRecord};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum BusError {
    #[error("kafka client error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("publish to {topic} failed: {reason}")]
    Publish { topic: String, reason: String },
}

/// Publishing seam of the message bus. Delivery is at-least-once; ordering is
/// guaranteed only among messages sharing a partition key.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError>;
}

/// Kafka-backed publisher. An explicitly owned handle: constructed at service
/// start, dropped on shutdown.
#[derive(Clone)]
pub struct KafkaEventPublisher {
    producer: FutureProducer,
}

impl KafkaEventPublisher {
    pub fn connect(brokers: &str) -> Result<Self, BusError> {
        let producer: FutureProducer = ClientConfig::new()
            .set("bootstrap.servers", brokers)
            .set("message.timeout.ms", "5000")
            .create()?;
        Ok(Self { producer })
    }
}

#[async_trait]
impl EventPublisher for KafkaEventPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError> {
        let record = FutureRecord::to(topic).payload(payload).key(key);
        self.producer
            .send(record, Duration::from_secs(5))
            .await
            .map_err(|(e, _)| BusError::Publish {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        Ok(())
    }
}

/// Build a subscribed consumer. Auto-commit is disabled: offsets are committed
/// by the consuming loop only after a message is fully processed.
pub fn build_consumer(
    brokers: &str,
    group_id: &str,
    topic_list: &[&str],
) -> Result<StreamConsumer, BusError> {
    let consumer: StreamConsumer = ClientConfig::new()
        .set("group.id", group_id)
        .set("bootstrap.servers", brokers)
        .set("enable.partition.eof", "false")
        .set("session.timeout.ms", "6000")
        .set("enable.auto.commit", "false")
        .set("auto.offset.reset", "earliest")
        .create()?;
    consumer.subscribe(topic_list)?;
    Ok(consumer)
}

/// A message captured by [`MemoryEventPublisher`].
#[derive(Debug, Clone)]
pub struct PublishedRecord {
    pub topic: String,
    pub key: String,
    pub payload: Vec<u8>,
}

/// In-memory publisher for tests and single-process runs. Thread-safe and
/// cheaply cloneable; clones share the same record log.
#[derive(Clone, Default)]
pub struct MemoryEventPublisher {
    records: Arc<Mutex<Vec<PublishedRecord>>>,
}

impl MemoryEventPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn records(&self) -> Vec<PublishedRecord> {
        self.records.lock().unwrap().clone()
    }

    pub fn on_topic(&self, topic: &str) -> Vec<PublishedRecord> {
        self.records
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.topic == topic)
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.records.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().unwrap().is_empty()
    }
}

#[async_trait]
impl EventPublisher for MemoryEventPublisher {
    async fn publish(&self, topic: &str, key: &str, payload: &[u8]) -> Result<(), BusError> {
        self.records.lock().unwrap().push(PublishedRecord {
            topic: topic.to_string(),
            key: key.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn memory_publisher_records_in_order() {
        let publisher = MemoryEventPublisher::new();

        publisher.publish("topic.a", "1", b"first").await.unwrap();
        publisher.publish("topic.b", "2", b"second").await.unwrap();
        publisher.publish("topic.a", "3", b"third").await.unwrap();

        assert_eq!(publisher.len(), 3);
        let on_a = publisher.on_topic("topic.a");
        assert_eq!(on_a.len(), 2);
        assert_eq!(on_a[0].payload, b"first");
        assert_eq!(on_a[1].key, "3");
    }

    #[tokio::test]
    async fn clones_share_the_record_log() {
        let publisher = MemoryEventPublisher::new();
        let clone = publisher.clone();

        clone.publish("topic.a", "1", b"payload").await.unwrap();

        assert_eq!(publisher.len(), 1);
        assert_eq!(publisher.records()[0].topic, "topic.a");
    }
}
