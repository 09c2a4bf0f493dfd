use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use common_kafka::kafka_consumer::{ManualCommitConsumer, Offset, OffsetErr, RecvErr};
use rdkafka::Message;
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::health::HealthHandle;
use crate::message::{normalize_at, RawRecord};
use crate::metrics_consts::{
    COMMIT_FAILURES, HASH_MISMATCHES, MESSAGES_ALREADY_STORED, MESSAGES_DEAD_LETTERED,
    MESSAGES_DROPPED, MESSAGES_IGNORED, MESSAGES_PERSISTED, MESSAGES_RECEIVED, PERSIST_FAILURES,
    RECV_ERRORS,
};
use crate::publish::RelayPublisher;
use crate::store::{Classification, MessageStore, StoredMessage};

#[derive(Debug, Error)]
pub enum SourceError {
    #[error(transparent)]
    Recv(#[from] RecvErr),
    #[error(transparent)]
    Offset(#[from] OffsetErr),
    #[error("inbound source closed")]
    Closed,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    /// Broker-side timestamp, identical on every redelivery.
    pub timestamp: Option<DateTime<Utc>>,
    pub payload: Option<Vec<u8>>,
}

/// Settles one delivered message: either move the committed position past it, or
/// put the partition back so it is delivered again.
pub trait Acknowledge: Send {
    fn commit(self: Box<Self>) -> Result<(), SourceError>;
    fn rewind(self: Box<Self>) -> Result<(), SourceError>;
}

pub struct Delivery {
    pub message: InboundMessage,
    ack: Box<dyn Acknowledge>,
}

impl Delivery {
    pub fn new(message: InboundMessage, ack: Box<dyn Acknowledge>) -> Self {
        Self { message, ack }
    }
}

#[async_trait]
pub trait InboundSource: Send + Sync {
    /// Waits at most `timeout` for the next message.
    async fn recv(&self, timeout: Duration) -> Result<Option<Delivery>, SourceError>;
}

pub struct KafkaInboundSource {
    consumer: ManualCommitConsumer,
    seek_timeout: Duration,
}

impl KafkaInboundSource {
    pub fn new(consumer: ManualCommitConsumer, seek_timeout: Duration) -> Self {
        Self {
            consumer,
            seek_timeout,
        }
    }
}

struct KafkaAck {
    offset: Offset,
    seek_timeout: Duration,
}

impl Acknowledge for KafkaAck {
    fn commit(self: Box<Self>) -> Result<(), SourceError> {
        Ok(self.offset.commit()?)
    }

    fn rewind(self: Box<Self>) -> Result<(), SourceError> {
        Ok(self.offset.rewind(self.seek_timeout)?)
    }
}

#[async_trait]
impl InboundSource for KafkaInboundSource {
    async fn recv(&self, timeout: Duration) -> Result<Option<Delivery>, SourceError> {
        let Some((message, offset)) = self.consumer.recv(timeout).await? else {
            return Ok(None);
        };
        let inbound = InboundMessage {
            topic: message.topic().to_string(),
            partition: message.partition(),
            offset: message.offset(),
            timestamp: message
                .timestamp()
                .to_millis()
                .and_then(DateTime::from_timestamp_millis),
            payload: message.payload().map(<[u8]>::to_vec),
        };
        Ok(Some(Delivery::new(
            inbound,
            Box::new(KafkaAck {
                offset,
                seek_timeout: self.seek_timeout,
            }),
        )))
    }
}

#[derive(Debug, Clone)]
pub struct ConsumerSettings {
    pub topic: String,
    pub dead_letter_topic: Option<String>,
    pub poll_timeout: Duration,
    pub retry_delay: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PollOutcome {
    /// Nothing arrived within the poll timeout.
    Idle,
    /// The message belongs to another topic and was left alone.
    Ignored,
    Persisted,
    /// A row with the same content hash already existed.
    AlreadyStored,
    /// Malformed or invalid, committed past (and dead-lettered if configured).
    Dropped,
    /// Persisting or dead-lettering failed; the partition was rewound.
    Retrying,
    RecvFailed,
}

/// Reads canonical messages off the inbound topic and writes them to the store,
/// committing each offset only after its row is safely written.
pub struct RelayConsumer {
    source: Arc<dyn InboundSource>,
    store: Arc<dyn MessageStore>,
    dead_letters: Option<RelayPublisher>,
    settings: ConsumerSettings,
}

impl RelayConsumer {
    pub fn new(
        source: Arc<dyn InboundSource>,
        store: Arc<dyn MessageStore>,
        dead_letters: Option<RelayPublisher>,
        settings: ConsumerSettings,
    ) -> Self {
        Self {
            source,
            store,
            dead_letters,
            settings,
        }
    }

    pub async fn run(&self, shutdown: watch::Receiver<bool>, liveness: HealthHandle) {
        info!(topic = self.settings.topic, "starting relay consumer");
        loop {
            if *shutdown.borrow() {
                info!("shutdown signal received, stopping relay consumer");
                break;
            }
            liveness.report_healthy();

            if self.poll_once().await == PollOutcome::RecvFailed {
                tokio::time::sleep(self.settings.retry_delay).await;
            }
        }
    }

    pub async fn poll_once(&self) -> PollOutcome {
        let delivery = match self.source.recv(self.settings.poll_timeout).await {
            Ok(Some(delivery)) => delivery,
            Ok(None) => return PollOutcome::Idle,
            Err(e) => {
                metrics::counter!(RECV_ERRORS).increment(1);
                error!("failed to receive from {}: {}", self.settings.topic, e);
                return PollOutcome::RecvFailed;
            }
        };
        metrics::counter!(MESSAGES_RECEIVED).increment(1);

        let Delivery { message, ack } = delivery;
        if message.topic != self.settings.topic {
            metrics::counter!(MESSAGES_IGNORED).increment(1);
            debug!(topic = message.topic, "ignoring message from foreign topic");
            return PollOutcome::Ignored;
        }

        let stored = match decode(&message) {
            Ok(stored) => stored,
            Err(reason) => return self.drop_message(message, ack, reason).await,
        };

        match self.store.create_message(&stored).await {
            Ok(inserted) => {
                let outcome = match inserted {
                    Some(id) => {
                        metrics::counter!(MESSAGES_PERSISTED).increment(1);
                        debug!(%id, offset = message.offset, "persisted message");
                        PollOutcome::Persisted
                    }
                    None => {
                        metrics::counter!(MESSAGES_ALREADY_STORED).increment(1);
                        debug!(offset = message.offset, "message already stored");
                        PollOutcome::AlreadyStored
                    }
                };
                commit(&message, ack);
                outcome
            }
            Err(e) => {
                metrics::counter!(PERSIST_FAILURES).increment(1);
                error!(
                    topic = message.topic,
                    partition = message.partition,
                    offset = message.offset,
                    "failed to persist message: {}",
                    e
                );
                self.retry_later(&message, ack).await
            }
        }
    }

    async fn drop_message(
        &self,
        message: InboundMessage,
        ack: Box<dyn Acknowledge>,
        reason: String,
    ) -> PollOutcome {
        warn!(
            topic = message.topic,
            partition = message.partition,
            offset = message.offset,
            "dropping message: {}",
            reason
        );

        if let (Some(publisher), Some(topic)) =
            (&self.dead_letters, &self.settings.dead_letter_topic)
        {
            let headers = [
                ("source_topic", message.topic.clone()),
                ("source_partition", message.partition.to_string()),
                ("source_offset", message.offset.to_string()),
                ("error", reason),
            ];
            let payload = message.payload.as_deref().unwrap_or_default();
            if let Err(e) = publisher.dead_letter(topic, payload, &headers).await {
                error!("failed to dead-letter message: {}", e);
                return self.retry_later(&message, ack).await;
            }
            metrics::counter!(MESSAGES_DEAD_LETTERED).increment(1);
        }

        metrics::counter!(MESSAGES_DROPPED).increment(1);
        commit(&message, ack);
        PollOutcome::Dropped
    }

    async fn retry_later(&self, message: &InboundMessage, ack: Box<dyn Acknowledge>) -> PollOutcome {
        if let Err(e) = ack.rewind() {
            // Without the seek the message is still redelivered after a rebalance or restart
            warn!(offset = message.offset, "failed to rewind partition: {}", e);
        }
        tokio::time::sleep(self.settings.retry_delay).await;
        PollOutcome::Retrying
    }
}

fn commit(message: &InboundMessage, ack: Box<dyn Acknowledge>) {
    if let Err(e) = ack.commit() {
        metrics::counter!(COMMIT_FAILURES).increment(1);
        warn!(
            topic = message.topic,
            partition = message.partition,
            offset = message.offset,
            "failed to commit offset: {}",
            e
        );
    }
}

/// Turns a payload into a storable row, or a reason to drop it.
fn decode(message: &InboundMessage) -> Result<StoredMessage, String> {
    let payload = match message.payload.as_deref() {
        Some(p) if !p.is_empty() => p,
        _ => return Err("empty payload".to_string()),
    };

    let value: Value =
        serde_json::from_slice(payload).map_err(|e| format!("invalid JSON: {e}"))?;
    if !value.is_object() {
        return Err("payload is not a JSON object".to_string());
    }

    let raw = RawRecord::deserialize(&value).map_err(|e| format!("invalid record: {e}"))?;
    let classification = Classification::deserialize(&value)
        .map_err(|e| format!("invalid classification: {e}"))?;
    classification.validate().map_err(|e| e.to_string())?;

    // Undated records take the broker timestamp so a redelivery hashes the same
    let dated = raw
        .timestamp
        .as_deref()
        .is_some_and(|t| !t.trim().is_empty());
    let fallback = match message.timestamp {
        Some(ts) => ts,
        None if dated => Utc::now(),
        None => return Err("record has no timestamp and the broker supplied none".to_string()),
    };
    let canonical = normalize_at(raw, fallback).map_err(|e| e.to_string())?;

    let supplied = value
        .get("contentHash")
        .or_else(|| value.get("content_hash"))
        .and_then(Value::as_str);
    if let Some(supplied) = supplied {
        if supplied != canonical.content_hash() {
            metrics::counter!(HASH_MISMATCHES).increment(1);
            warn!(
                offset = message.offset,
                supplied,
                computed = canonical.content_hash(),
                "content hash mismatch, using computed hash"
            );
        }
    }

    Ok(StoredMessage::new(canonical, classification))
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;
    use serde_json::json;

    use super::*;
    use crate::health::HealthRegistry;
    use crate::publish::RetryPolicy;
    use crate::test_utils::{MemorySink, MemorySource, MemoryStore};

    const INBOUND: &str = "appeals_in";

    struct Harness {
        source: Arc<MemorySource>,
        store: Arc<MemoryStore>,
        sink: Arc<MemorySink>,
        consumer: RelayConsumer,
    }

    fn harness(dead_letter: bool) -> Harness {
        let source = Arc::new(MemorySource::default());
        let store = Arc::new(MemoryStore::default());
        let sink = Arc::new(MemorySink::default());
        let publisher = RelayPublisher::new(sink.clone(), RetryPolicy::default());
        let consumer = RelayConsumer::new(
            source.clone(),
            store.clone(),
            Some(publisher),
            ConsumerSettings {
                topic: INBOUND.to_string(),
                dead_letter_topic: dead_letter.then(|| "appeals_dlq".to_string()),
                poll_timeout: Duration::from_millis(10),
                retry_delay: Duration::from_millis(1),
            },
        );
        Harness {
            source,
            store,
            sink,
            consumer,
        }
    }

    fn appeal(text: &str) -> Vec<u8> {
        serde_json::to_vec(&json!({
            "externalId": "e-1",
            "userId": "u-1",
            "text": text,
            "timestamp": "2024-03-10T14:05:09Z",
            "sentimentLabel": "negative",
            "sentimentScore": 0.91,
            "categoryLevel2": ["refund"]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_persists_then_commits() {
        let h = harness(false);
        h.source.push(INBOUND, appeal("refund please"));

        assert_eq!(h.consumer.poll_once().await, PollOutcome::Persisted);
        assert_eq!(h.source.committed(), vec![(INBOUND.to_string(), 0, 0)]);

        let rows = h.store.messages();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message.text(), "refund please");
        assert_eq!(rows[0].classification.sentiment_score, Some(0.91));

        assert_eq!(h.consumer.poll_once().await, PollOutcome::Idle);
    }

    #[tokio::test]
    async fn test_redelivery_after_crash_creates_no_duplicate() {
        let h = harness(false);
        // The first copy was persisted but its commit never happened
        h.source.push(INBOUND, appeal("card blocked"));
        h.source.push(INBOUND, appeal("card blocked"));

        assert_eq!(h.consumer.poll_once().await, PollOutcome::Persisted);
        assert_eq!(h.consumer.poll_once().await, PollOutcome::AlreadyStored);
        assert_eq!(h.store.messages().len(), 1);
        assert_eq!(h.source.committed().len(), 2);
    }

    #[tokio::test]
    async fn test_persist_failure_rewinds_and_retries() {
        let h = harness(false);
        h.store.fail_next_writes(1);
        h.source.push(INBOUND, appeal("late delivery"));

        assert_eq!(h.consumer.poll_once().await, PollOutcome::Retrying);
        assert!(h.source.committed().is_empty());
        assert_eq!(h.source.rewinds(), 1);

        assert_eq!(h.consumer.poll_once().await, PollOutcome::Persisted);
        assert_eq!(h.store.messages().len(), 1);
        assert_eq!(h.source.committed().len(), 1);
    }

    #[tokio::test]
    async fn test_foreign_topic_is_ignored() {
        let h = harness(false);
        h.source.push("somebody_elses_topic", appeal("not for us"));

        assert_eq!(h.consumer.poll_once().await, PollOutcome::Ignored);
        assert!(h.store.messages().is_empty());
        assert!(h.source.committed().is_empty());
    }

    #[tokio::test]
    async fn test_malformed_payload_is_committed_and_dead_lettered() {
        let h = harness(true);
        h.source.push(INBOUND, b"{not json".to_vec());

        assert_eq!(h.consumer.poll_once().await, PollOutcome::Dropped);
        assert_eq!(h.source.committed().len(), 1);

        let raw = h.sink.raw_messages();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].topic, "appeals_dlq");
        assert_eq!(raw[0].payload, b"{not json".to_vec());
        assert!(raw[0]
            .headers
            .contains(&("source_topic".to_string(), INBOUND.to_string())));
    }

    #[tokio::test]
    async fn test_dead_letter_failure_keeps_message() {
        let h = harness(true);
        h.sink.fail_next(1);
        h.source.push(INBOUND, b"[]".to_vec());

        assert_eq!(h.consumer.poll_once().await, PollOutcome::Retrying);
        assert!(h.source.committed().is_empty());
        assert_eq!(h.consumer.poll_once().await, PollOutcome::Dropped);
    }

    #[tokio::test]
    async fn test_invalid_records_are_dropped() {
        let h = harness(false);
        for payload in [
            json!({"text": "   "}),
            json!({"text": "ok", "timestamp": "not-a-date"}),
            json!({"text": "ok", "emotionScore": 3.5}),
            json!({"text": "ok", "userId": 17}),
        ] {
            h.source.push(INBOUND, serde_json::to_vec(&payload).unwrap());
            assert_eq!(h.consumer.poll_once().await, PollOutcome::Dropped, "{payload}");
        }
        assert!(h.store.messages().is_empty());
        assert_eq!(h.source.committed().len(), 4);
    }

    #[tokio::test]
    async fn test_undated_payload_uses_broker_timestamp() {
        let h = harness(false);
        let sent_at = Utc.with_ymd_and_hms(2024, 5, 2, 9, 0, 0).unwrap();
        let payload = serde_json::to_vec(&json!({"text": "undated appeal", "userId": "u"})).unwrap();
        // The same message handed out twice, as after a crash before commit
        h.source.push_at(INBOUND, payload.clone(), Some(sent_at));
        h.source.push_at(INBOUND, payload, Some(sent_at));

        assert_eq!(h.consumer.poll_once().await, PollOutcome::Persisted);
        assert_eq!(h.consumer.poll_once().await, PollOutcome::AlreadyStored);

        let rows = h.store.messages();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].message.timestamp(), sent_at);
    }

    #[tokio::test]
    async fn test_undated_payload_without_broker_timestamp_is_dropped() {
        let h = harness(false);
        let payload = serde_json::to_vec(&json!({"text": "undated appeal", "userId": "u"})).unwrap();
        h.source.push(INBOUND, payload.clone());
        h.source.push(INBOUND, payload);

        assert_eq!(h.consumer.poll_once().await, PollOutcome::Dropped);
        assert_eq!(h.consumer.poll_once().await, PollOutcome::Dropped);
        assert!(h.store.messages().is_empty());
        assert_eq!(h.source.committed().len(), 2);
    }

    #[tokio::test]
    async fn test_snake_case_and_hash_mismatch() {
        let h = harness(false);
        let payload = json!({
            "external_id": "e-9",
            "user_id": "u-9",
            "text": "snake",
            "timestamp": "2024-03-10T14:05:09Z",
            "content_hash": "bogus",
            "category_level_1": "billing"
        });
        h.source.push(INBOUND, serde_json::to_vec(&payload).unwrap());

        assert_eq!(h.consumer.poll_once().await, PollOutcome::Persisted);
        let row = &h.store.messages()[0];
        assert_eq!(row.message.user_id(), Some("u-9"));
        assert_ne!(row.content_hash(), "bogus");
        assert_eq!(row.classification.category_level_1.as_deref(), Some("billing"));
    }

    #[tokio::test]
    async fn test_run_stops_on_shutdown() {
        let h = harness(false);
        h.source.push(INBOUND, appeal("before shutdown"));
        let registry = HealthRegistry::new("liveness");
        let liveness = registry.register("relay_consumer", Duration::from_secs(30));

        let (tx, rx) = watch::channel(false);
        let consumer = Arc::new(h.consumer);
        let task = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run(rx, liveness).await })
        };

        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while h.store.messages().is_empty() && tokio::time::Instant::now() < deadline {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tx.send(true).unwrap();
        task.await.unwrap();

        assert_eq!(h.store.messages().len(), 1);
        assert!(registry.get_status().healthy);
    }
}
