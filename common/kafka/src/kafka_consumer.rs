use std::sync::{Arc, Weak};
use std::time::Duration;

use rdkafka::{
    consumer::{CommitMode, Consumer, StreamConsumer},
    error::KafkaError,
    message::OwnedMessage,
    Message, TopicPartitionList,
};
use tracing::{debug, info};

use crate::config::{ConsumerConfig, KafkaConfig};

/// A consumer that never commits on its own. Every received message hands back an
/// [`Offset`], and the caller decides whether to commit past it or rewind to it.
#[derive(Clone)]
pub struct ManualCommitConsumer {
    inner: Arc<Inner>,
}

struct Inner {
    consumer: StreamConsumer,
    topics: Vec<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum RecvErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
}

#[derive(Debug, thiserror::Error)]
pub enum OffsetErr {
    #[error("Kafka error: {0}")]
    Kafka(#[from] KafkaError),
    #[error("Consumer gone")]
    Gone,
}

impl ManualCommitConsumer {
    pub fn new(
        common_config: &KafkaConfig,
        consumer_config: &ConsumerConfig,
        topics: &[String],
    ) -> Result<Self, KafkaError> {
        let mut client_config = common_config.client_config();
        client_config
            .set("statistics.interval.ms", "10000")
            .set("group.id", &consumer_config.kafka_consumer_group)
            .set(
                "auto.offset.reset",
                &consumer_config.kafka_consumer_offset_reset,
            )
            .set("enable.auto.commit", "false")
            .set("enable.auto.offset.store", "false")
            .set("enable.partition.eof", "false");

        let consumer: StreamConsumer = client_config.create()?;
        let subscription: Vec<&str> = topics.iter().map(String::as_str).collect();
        consumer.subscribe(&subscription)?;

        info!(
            topics = ?topics,
            group_id = consumer_config.kafka_consumer_group,
            "Kafka consumer subscribed"
        );

        let inner = Inner {
            consumer,
            topics: topics.to_vec(),
        };
        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn topics(&self) -> &[String] {
        &self.inner.topics
    }

    /// Waits up to `timeout` for the next message. `Ok(None)` means nothing arrived.
    pub async fn recv(&self, timeout: Duration) -> Result<Option<(OwnedMessage, Offset)>, RecvErr> {
        let message = match tokio::time::timeout(timeout, self.inner.consumer.recv()).await {
            Ok(message) => message?,
            Err(_) => return Ok(None),
        };

        let offset = Offset {
            handle: Arc::downgrade(&self.inner),
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
        };

        Ok(Some((message.detach(), offset)))
    }
}

pub struct Offset {
    handle: Weak<Inner>,
    topic: String,
    partition: i32,
    offset: i64,
}

impl Offset {
    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn partition(&self) -> i32 {
        self.partition
    }

    pub fn offset(&self) -> i64 {
        self.offset
    }

    /// Commits the position just past this message, for this partition only.
    pub fn commit(self) -> Result<(), OffsetErr> {
        let inner = self.handle.upgrade().ok_or(OffsetErr::Gone)?;
        let mut list = TopicPartitionList::new();
        list.add_partition_offset(
            &self.topic,
            self.partition,
            rdkafka::Offset::Offset(self.offset + 1),
        )?;
        inner.consumer.commit(&list, CommitMode::Async)?;
        debug!(
            topic = self.topic,
            partition = self.partition,
            offset = self.offset,
            "committed offset"
        );
        Ok(())
    }

    /// Moves the partition's fetch position back to this message, so the next
    /// receive delivers it again.
    pub fn rewind(self, timeout: Duration) -> Result<(), OffsetErr> {
        let inner = self.handle.upgrade().ok_or(OffsetErr::Gone)?;
        inner.consumer.seek(
            &self.topic,
            self.partition,
            rdkafka::Offset::Offset(self.offset),
            timeout,
        )?;
        debug!(
            topic = self.topic,
            partition = self.partition,
            offset = self.offset,
            "rewound partition"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::{Duration, Instant};

    use rdkafka::producer::FutureRecord;

    use super::*;
    use crate::test::{create_mock_kafka, mock_consumer_config, mock_kafka_config};

    #[tokio::test]
    async fn test_recv_and_commit() {
        let (cluster, producer) = create_mock_kafka().await;
        cluster
            .create_topic("relay_in", 1, 1)
            .expect("failed to create topic");

        producer
            .send(
                FutureRecord::<(), str>::to("relay_in").payload("{\"text\":\"hello\"}"),
                Duration::from_secs(5),
            )
            .await
            .expect("failed to produce");

        let consumer = ManualCommitConsumer::new(
            &mock_kafka_config(cluster.bootstrap_servers()),
            &mock_consumer_config("relay_test_group"),
            &["relay_in".to_string()],
        )
        .unwrap();
        assert_eq!(consumer.topics(), &["relay_in".to_string()]);

        // Group join on the mock cluster takes a few seconds
        let started = Instant::now();
        let (message, offset) = loop {
            if let Some(received) = consumer.recv(Duration::from_secs(1)).await.unwrap() {
                break received;
            }
            assert!(
                started.elapsed() < Duration::from_secs(30),
                "no message received"
            );
        };

        assert_eq!(message.topic(), "relay_in");
        assert_eq!(message.payload(), Some("{\"text\":\"hello\"}".as_bytes()));
        assert_eq!(offset.topic(), "relay_in");
        assert_eq!(offset.offset(), 0);
        offset.commit().unwrap();
    }

    #[tokio::test]
    async fn test_offset_outliving_consumer() {
        let (cluster, _producer) = create_mock_kafka().await;
        let consumer = ManualCommitConsumer::new(
            &mock_kafka_config(cluster.bootstrap_servers()),
            &mock_consumer_config("relay_gone_group"),
            &["relay_gone".to_string()],
        )
        .unwrap();

        let offset = Offset {
            handle: Arc::downgrade(&consumer.inner),
            topic: "relay_gone".to_string(),
            partition: 0,
            offset: 4,
        };
        drop(consumer);

        assert!(matches!(offset.commit(), Err(OffsetErr::Gone)));
    }
}
