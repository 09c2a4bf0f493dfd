use std::time::Duration;

use metrics::gauge;
use rdkafka::error::KafkaError;
use rdkafka::message::OwnedHeaders;
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use rdkafka::ClientContext;
use serde::Serialize;
use serde_json::error::Error as SerdeError;
use thiserror::Error;
use tokio::time::Instant;
use tracing::{debug, error, info};

use crate::config::KafkaConfig;

pub struct KafkaContext;

impl rdkafka::ClientContext for KafkaContext {
    fn stats(&self, stats: rdkafka::Statistics) {
        gauge!("kafka_callback_queue_depth").set(stats.replyq as f64);
        gauge!("kafka_producer_queue_depth").set(stats.msg_cnt as f64);
        gauge!("kafka_producer_queue_depth_limit").set(stats.msg_max as f64);
        gauge!("kafka_producer_queue_bytes").set(stats.msg_size as f64);
        gauge!("kafka_producer_queue_bytes_limit").set(stats.msg_size_max as f64);

        for (_, stats) in stats.brokers {
            let id_string = format!("{}", stats.nodeid);
            if let Some(rtt) = stats.rtt {
                gauge!(
                    "kafka_produce_rtt_latency_us",
                    "quantile" => "p50",
                    "broker" => id_string.clone()
                )
                .set(rtt.p50 as f64);
                gauge!(
                    "kafka_produce_rtt_latency_us",
                    "quantile" => "p99",
                    "broker" => id_string.clone()
                )
                .set(rtt.p99 as f64);
            }
            gauge!(
                "kafka_broker_requests_pending",
                "broker" => id_string
            )
            .set(stats.outbuf_cnt as f64);
        }
    }
}

pub async fn create_kafka_producer(
    config: &KafkaConfig,
) -> Result<FutureProducer<KafkaContext>, KafkaError> {
    let mut client_config = config.client_config();
    client_config
        .set("statistics.interval.ms", "10000")
        .set("linger.ms", config.kafka_producer_linger_ms.to_string())
        .set(
            "message.timeout.ms",
            config.kafka_message_timeout_ms.to_string(),
        )
        .set(
            "message.max.bytes",
            config.kafka_producer_message_max_bytes.to_string(),
        )
        .set(
            "compression.codec",
            config.kafka_compression_codec.to_owned(),
        )
        .set(
            "queue.buffering.max.kbytes",
            (config.kafka_producer_queue_mib * 1024).to_string(),
        )
        .set(
            "queue.buffering.max.messages",
            config.kafka_producer_queue_messages.to_string(),
        )
        // Retries must not reorder messages sharing a partition key
        .set("enable.idempotence", "true");

    debug!("rdkafka configuration: {:?}", client_config);
    let api: FutureProducer<KafkaContext> = client_config.create_with_context(KafkaContext)?;

    // "Ping" the Kafka brokers by requesting metadata
    match api
        .client()
        .fetch_metadata(None, std::time::Duration::from_secs(15))
    {
        Ok(metadata) => {
            info!(
                "Successfully connected to Kafka brokers. Found {} topics.",
                metadata.topics().len()
            );
        }
        Err(error) => {
            error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
            return Err(error);
        }
    }

    Ok(api)
}

#[derive(Error, Debug)]
pub enum KafkaProduceError {
    #[error("failed to serialize: {error}")]
    SerializationError { error: SerdeError },
    #[error("failed to produce to kafka: {error}")]
    KafkaProduceError { error: KafkaError },
    #[error("failed to produce to kafka (canceled)")]
    KafkaProduceCanceled,
    #[error("failed to produce to kafka (no ack within {0:?})")]
    KafkaProduceTimeout(Duration),
}

/// Serializes every item as JSON and produces it to `topic`, in iteration order,
/// then waits for all acknowledgements. Results come back in the passed-in order.
/// Acks still outstanding once `timeout` elapses resolve to `KafkaProduceTimeout`.
pub async fn send_keyed_iter_to_kafka<T, C: ClientContext + 'static>(
    kafka_producer: &FutureProducer<C>,
    topic: &str,
    key_extractor: impl Fn(&T) -> Option<String>,
    iter: impl IntoIterator<Item = T>,
    timeout: Duration,
) -> Vec<Result<(), KafkaProduceError>>
where
    T: Serialize,
{
    let deadline = Instant::now() + timeout;
    let mut results = Vec::new();
    let mut handles = Vec::new();

    for (index, item) in iter.into_iter().enumerate() {
        let key = key_extractor(&item);
        let payload = match serde_json::to_string(&item)
            .map_err(|e| KafkaProduceError::SerializationError { error: e })
        {
            Ok(p) => p,
            Err(e) => {
                results.push((index, Err(e)));
                continue;
            }
        };

        let record = FutureRecord {
            topic,
            key: key.as_deref(),
            payload: Some(&payload),
            timestamp: None,
            partition: None,
            headers: None,
        };

        let future_handle = match kafka_producer.send_result(record) {
            Ok(f) => f,
            Err((e, _)) => {
                results.push((
                    index,
                    Err(KafkaProduceError::KafkaProduceError { error: e }),
                ));
                continue;
            }
        };

        handles.push((index, future_handle));
    }

    for (index, future_handle) in handles {
        match tokio::time::timeout_at(deadline, future_handle).await {
            Ok(Ok(Ok(_))) => results.push((index, Ok(()))),
            Ok(Ok(Err((e, _)))) => results.push((
                index,
                Err(KafkaProduceError::KafkaProduceError { error: e }),
            )),
            Ok(Err(_)) => results.push((index, Err(KafkaProduceError::KafkaProduceCanceled))),
            Err(_) => results.push((index, Err(KafkaProduceError::KafkaProduceTimeout(timeout)))),
        }
    }

    // Sort to return in passed-in order
    results.sort_by_key(|e| e.0);

    results.into_iter().map(|(_, r)| r).collect()
}

/// Produces an already-encoded payload, used to forward messages verbatim.
pub async fn send_raw_to_kafka<C: ClientContext + 'static>(
    kafka_producer: &FutureProducer<C>,
    topic: &str,
    key: Option<&[u8]>,
    payload: &[u8],
    headers: Option<OwnedHeaders>,
    timeout: Duration,
) -> Result<(), KafkaProduceError> {
    let record = FutureRecord {
        topic,
        key,
        payload: Some(payload),
        timestamp: None,
        partition: None,
        headers,
    };

    let future_handle = kafka_producer
        .send_result(record)
        .map_err(|(error, _)| KafkaProduceError::KafkaProduceError { error })?;

    match tokio::time::timeout(timeout, future_handle).await {
        Ok(Ok(Ok(_))) => Ok(()),
        Ok(Ok(Err((error, _)))) => Err(KafkaProduceError::KafkaProduceError { error }),
        Ok(Err(_)) => Err(KafkaProduceError::KafkaProduceCanceled),
        Err(_) => Err(KafkaProduceError::KafkaProduceTimeout(timeout)),
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde::Serialize;

    use super::*;
    use crate::test::create_mock_kafka;

    #[derive(Serialize)]
    struct Item {
        id: u32,
        owner: String,
    }

    #[tokio::test]
    async fn test_send_keyed_iter_preserves_order_of_results() {
        let (_cluster, producer) = create_mock_kafka().await;
        let items = vec![
            Item {
                id: 1,
                owner: "a".to_string(),
            },
            Item {
                id: 2,
                owner: "b".to_string(),
            },
            Item {
                id: 3,
                owner: "a".to_string(),
            },
        ];

        let results = send_keyed_iter_to_kafka(
            &producer,
            "relay_test",
            |item: &Item| Some(item.owner.clone()),
            items,
            Duration::from_secs(10),
        )
        .await;

        assert_eq!(results.len(), 3);
        assert!(results.iter().all(|r| r.is_ok()));
    }

    #[tokio::test]
    async fn test_send_raw() {
        let (_cluster, producer) = create_mock_kafka().await;
        let result = send_raw_to_kafka(
            &producer,
            "relay_test_raw",
            None,
            b"not json at all",
            None,
            Duration::from_secs(10),
        )
        .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn test_empty_iter_sends_nothing() {
        let (_cluster, producer) = create_mock_kafka().await;
        let results = send_keyed_iter_to_kafka(
            &producer,
            "relay_test_empty",
            |_: &Item| None,
            Vec::new(),
            Duration::from_secs(1),
        )
        .await;
        assert!(results.is_empty());
    }
}
