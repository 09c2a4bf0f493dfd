use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use common_kafka::kafka_producer::{
    send_keyed_iter_to_kafka, send_raw_to_kafka, KafkaContext, KafkaProduceError,
};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, Producer};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::error::PublishError;
use crate::message::CanonicalMessage;
use crate::metrics_consts::{PUBLISH_ATTEMPTS, PUBLISH_TIME, RECORDS_PUBLISHED};

/// The broker side of the relay. Implementations send every message of a call in
/// order and return only once the broker acknowledged all of them.
#[async_trait]
pub trait RelaySink: Send + Sync {
    async fn send_batch(
        &self,
        topic: &str,
        key: &str,
        messages: &[CanonicalMessage],
    ) -> Result<(), PublishError>;

    /// Forwards an opaque payload untouched, used for dead-lettering.
    async fn send_raw(
        &self,
        topic: &str,
        payload: &[u8],
        headers: &[(&'static str, String)],
    ) -> Result<(), PublishError>;
}

pub struct KafkaRelaySink {
    producer: FutureProducer<KafkaContext>,
    timeout: Duration,
}

impl KafkaRelaySink {
    pub fn new(producer: FutureProducer<KafkaContext>, timeout: Duration) -> Self {
        Self { producer, timeout }
    }

    /// Waits for queued messages to be delivered, called once on shutdown.
    pub fn flush(&self) {
        if let Err(e) = self.producer.flush(self.timeout) {
            error!("failed to flush producer: {}", e);
        }
    }
}

#[async_trait]
impl RelaySink for KafkaRelaySink {
    async fn send_batch(
        &self,
        topic: &str,
        key: &str,
        messages: &[CanonicalMessage],
    ) -> Result<(), PublishError> {
        let results = send_keyed_iter_to_kafka(
            &self.producer,
            topic,
            |_| Some(key.to_string()),
            messages.iter(),
            self.timeout,
        )
        .await;

        let total = results.len();
        let mut failures = results.into_iter().filter_map(Result::err);
        let Some(first) = failures.next() else {
            return Ok(());
        };
        let failed = 1 + failures.count();

        Err(match first {
            KafkaProduceError::KafkaProduceTimeout(timeout) => PublishError::Timeout(timeout),
            source => PublishError::Produce {
                topic: topic.to_string(),
                failed,
                total,
                source,
            },
        })
    }

    async fn send_raw(
        &self,
        topic: &str,
        payload: &[u8],
        headers: &[(&'static str, String)],
    ) -> Result<(), PublishError> {
        let headers = headers
            .iter()
            .fold(OwnedHeaders::new(), |acc, (key, value)| {
                acc.insert(Header {
                    key: *key,
                    value: Some(value.as_bytes()),
                })
            });

        send_raw_to_kafka(
            &self.producer,
            topic,
            None,
            payload,
            Some(headers),
            self.timeout,
        )
        .await
        .map_err(|source| match source {
            KafkaProduceError::KafkaProduceTimeout(timeout) => PublishError::Timeout(timeout),
            source => PublishError::Produce {
                topic: topic.to_string(),
                failed: 1,
                total: 1,
                source,
            },
        })
    }
}

#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            base_delay: Duration::from_millis(200),
        }
    }
}

/// Publishes chunks of canonical messages, one broker message per record, retrying a
/// failed chunk as a whole. Resending is safe: the consumer side is idempotent on the
/// content hash.
#[derive(Clone)]
pub struct RelayPublisher {
    sink: Arc<dyn RelaySink>,
    retry: RetryPolicy,
}

impl RelayPublisher {
    pub fn new(sink: Arc<dyn RelaySink>, retry: RetryPolicy) -> Self {
        Self { sink, retry }
    }

    /// Publishes the records under a fresh partition key, so the whole chunk lands on
    /// one partition in order. Returns the number of records published.
    pub async fn publish_batch(
        &self,
        topic: &str,
        records: &[CanonicalMessage],
    ) -> Result<usize, PublishError> {
        let key = Uuid::now_v7().to_string();
        self.publish_keyed(topic, &key, records).await
    }

    pub async fn publish_keyed(
        &self,
        topic: &str,
        key: &str,
        records: &[CanonicalMessage],
    ) -> Result<usize, PublishError> {
        if records.is_empty() {
            return Ok(0);
        }

        let attempts = self.retry.attempts.max(1);
        let start = Instant::now();
        let mut attempt = 1;
        loop {
            match self.sink.send_batch(topic, key, records).await {
                Ok(()) => {
                    metrics::counter!(PUBLISH_ATTEMPTS, "result" => "success").increment(1);
                    metrics::counter!(RECORDS_PUBLISHED).increment(records.len() as u64);
                    metrics::histogram!(PUBLISH_TIME).record(start.elapsed().as_millis() as f64);
                    info!(topic, count = records.len(), attempt, "published chunk");
                    return Ok(records.len());
                }
                Err(e) if attempt >= attempts => {
                    metrics::counter!(PUBLISH_ATTEMPTS, "result" => "failed").increment(1);
                    error!(topic, attempt, "giving up on chunk: {}", e);
                    return Err(PublishError::RetriesExhausted {
                        topic: topic.to_string(),
                        attempts: attempt,
                        last: Box::new(e),
                    });
                }
                Err(e) => {
                    metrics::counter!(PUBLISH_ATTEMPTS, "result" => "retry").increment(1);
                    warn!(topic, attempt, "publish failed, retrying: {}", e);
                    let jitter = Duration::from_millis(rand::random::<u64>() % 50);
                    tokio::time::sleep(self.retry.base_delay * attempt + jitter).await;
                    attempt += 1;
                }
            }
        }
    }

    pub async fn dead_letter(
        &self,
        topic: &str,
        payload: &[u8],
        headers: &[(&'static str, String)],
    ) -> Result<(), PublishError> {
        self.sink.send_raw(topic, payload, headers).await
    }
}
