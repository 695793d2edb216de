use std::time::Duration;

use async_trait::async_trait;
use event_queue::{Ack, ConfigError, ProducerTransport, Record, TransportError};
use futures::FutureExt;
use rdkafka::error::{KafkaError, RDKafkaErrorCode};
use rdkafka::message::{Header, OwnedHeaders};
use rdkafka::producer::{FutureProducer, FutureRecord, Producer};
use tracing::{debug, error, info};

use crate::config::{redacted, KafkaProducerConfig};
use crate::context::KafkaContext;

/// Maps a librdkafka error onto the queue's transport error, keeping whether
/// retrying can help.
pub fn transport_error(err: &KafkaError) -> TransportError {
    let transient = match err {
        KafkaError::Canceled => true,
        _ => matches!(
            err.rdkafka_error_code(),
            Some(
                RDKafkaErrorCode::QueueFull
                    | RDKafkaErrorCode::OperationTimedOut
                    | RDKafkaErrorCode::MessageTimedOut
                    | RDKafkaErrorCode::RequestTimedOut
                    | RDKafkaErrorCode::AllBrokersDown
                    | RDKafkaErrorCode::BrokerTransportFailure
                    | RDKafkaErrorCode::NetworkException
                    | RDKafkaErrorCode::LeaderNotAvailable
                    | RDKafkaErrorCode::NotLeaderForPartition
                    | RDKafkaErrorCode::NotEnoughReplicas
                    | RDKafkaErrorCode::RebalanceInProgress
            )
        ),
    };
    if transient {
        TransportError::transient(err.to_string())
    } else {
        TransportError::fatal(err.to_string())
    }
}

/// Producer transport on top of an rdkafka `FutureProducer`.
///
/// Creating it does not contact the brokers; use [`KafkaProducer::ping`] to
/// check connectivity up front.
pub struct KafkaProducer {
    producer: FutureProducer<KafkaContext>,
    flush_timeout: Duration,
}

impl KafkaProducer {
    pub fn new(config: &KafkaProducerConfig) -> Result<Self, ConfigError> {
        let client_config = config.client_config()?;
        debug!("rdkafka configuration: {:?}", redacted(&client_config));

        let producer: FutureProducer<KafkaContext> = client_config
            .create_with_context(KafkaContext::producer())
            .map_err(|e| ConfigError::Transport(transport_error(&e)))?;

        info!(
            brokers = %config.kafka.kafka_hosts,
            compression = %config.kafka_compression.codec(),
            "kafka producer created"
        );
        Ok(KafkaProducer {
            producer,
            flush_timeout: Duration::from_millis(u64::from(config.kafka_message_timeout_ms)),
        })
    }

    /// "Ping" the brokers by requesting cluster metadata.
    pub async fn ping(&self, timeout: Duration) -> Result<(), TransportError> {
        let producer = self.producer.clone();
        let metadata = tokio::task::spawn_blocking(move || {
            producer
                .client()
                .fetch_metadata(None, timeout)
                .map(|metadata| metadata.topics().len())
        })
        .await
        .map_err(|e| TransportError::fatal(e.to_string()))?;

        match metadata {
            Ok(topics) => {
                info!("Successfully connected to Kafka brokers. Found {} topics.", topics);
                Ok(())
            }
            Err(error) => {
                error!("Failed to fetch metadata from Kafka brokers: {:?}", error);
                Err(transport_error(&error))
            }
        }
    }
}

#[async_trait]
impl ProducerTransport for KafkaProducer {
    fn send(&self, record: Record) -> Result<Ack, TransportError> {
        let mut headers = OwnedHeaders::new_with_capacity(record.headers.len());
        for header in &record.headers {
            headers = headers.insert(Header {
                key: header.key.as_str(),
                value: Some(header.value.as_slice()),
            });
        }

        let future_record = FutureRecord::<(), [u8]>::to(record.topic.as_str())
            .payload(record.payload.as_slice())
            .headers(headers);

        match self.producer.send_result(future_record) {
            Ok(delivery) => Ok(async move {
                match delivery.await {
                    Ok(Ok(_)) => Ok(()),
                    Ok(Err((err, _))) => Err(transport_error(&err)),
                    // Cancelled due to timeout while retrying
                    Err(_) => Err(TransportError::Canceled),
                }
            }
            .boxed()),
            Err((err, _)) => Err(transport_error(&err)),
        }
    }

    async fn close(&self) -> Result<(), TransportError> {
        let producer = self.producer.clone();
        let timeout = self.flush_timeout;
        tokio::task::spawn_blocking(move || producer.flush(timeout))
            .await
            .map_err(|e| TransportError::fatal(e.to_string()))?
            .map_err(|e| transport_error(&e))?;
        info!("kafka producer flushed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use event_queue::{
        queuecontext, Context, DeliveryMode, FixedTopic, JsonCodec, Metadata, ProduceError,
        ProducerConfig, Topic,
    };
    use rdkafka::consumer::{Consumer, StreamConsumer};
    use rdkafka::message::{Headers, Message};
    use rdkafka::{ClientConfig, Offset, TopicPartitionList};
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::config::{Compression, CompressionPreference, KafkaConfig};
    use crate::new_producer;
    use crate::test::{create_mock_cluster, mock_producer_config};

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Span {
        id: u64,
    }

    fn producer_config(mode: DeliveryMode) -> ProducerConfig<Span> {
        ProducerConfig::<Span>::new(Arc::new(JsonCodec), Arc::new(FixedTopic(Topic::from("spans"))))
            .with_mode(mode)
    }

    #[test]
    fn test_producer_without_running_broker() {
        let config = KafkaProducerConfig::new(KafkaConfig::for_brokers("localhost:9092"));
        assert!(KafkaProducer::new(&config).is_ok());
    }

    #[test]
    fn test_producer_with_invalid_port() {
        let config = KafkaProducerConfig::new(KafkaConfig::for_brokers("localhost:invalidport"));
        assert!(matches!(
            KafkaProducer::new(&config),
            Err(ConfigError::InvalidBroker { .. })
        ));
    }

    #[test]
    fn test_producer_with_compression_preference() {
        let preference = CompressionPreference::new(vec![
            Compression::Zstd,
            Compression::Lz4,
            Compression::Snappy,
            Compression::Gzip,
            Compression::None,
        ])
        .unwrap();
        let config = KafkaProducerConfig::new(KafkaConfig::for_brokers("localhost:9092"))
            .with_compression(preference);
        assert_eq!(
            config.client_config().unwrap().get("compression.codec"),
            Some("zstd")
        );
        assert!(KafkaProducer::new(&config).is_ok());
    }

    #[test]
    fn test_error_classification() {
        assert!(transport_error(&KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull))
            .is_transient());
        assert!(transport_error(&KafkaError::Canceled).is_transient());
        assert!(!transport_error(&KafkaError::MessageProduction(
            RDKafkaErrorCode::MessageSizeTooLarge
        ))
        .is_transient());
    }

    #[tokio::test]
    async fn test_sync_produce_to_mock_cluster() {
        let cluster = create_mock_cluster();
        cluster
            .create_topic("spans", 1, 1)
            .expect("failed to create mock topic");

        let producer = new_producer(
            &mock_producer_config(&cluster),
            producer_config(DeliveryMode::Sync),
        )
        .unwrap();
        let ctx = queuecontext::with_metadata(
            &Context::background(),
            Metadata::from_iter([("a", "b"), ("c", "d")]),
        );
        let mut batch: Vec<Span> = (0..3).map(|id| Span { id }).collect();
        producer.process_batch(&ctx, &mut batch).await.unwrap();
        producer.close().await.unwrap();

        let consumer: StreamConsumer = ClientConfig::new()
            .set("bootstrap.servers", cluster.bootstrap_servers())
            .set("group.id", "mock-reader")
            .create()
            .unwrap();
        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset("spans", 0, Offset::Beginning)
            .unwrap();
        consumer.assign(&assignment).unwrap();

        for expected in 0..3 {
            let message = tokio::time::timeout(Duration::from_secs(10), consumer.recv())
                .await
                .expect("timed out waiting for message")
                .unwrap();
            let span: Span = serde_json_payload(message.payload().unwrap());
            assert_eq!(span, Span { id: expected });

            let headers = message.headers().expect("headers missing");
            let pairs: Vec<(String, Vec<u8>)> = headers
                .iter()
                .map(|h| (h.key.to_string(), h.value.unwrap_or_default().to_vec()))
                .collect();
            assert!(pairs.contains(&("a".to_string(), b"b".to_vec())));
            assert!(pairs.contains(&("c".to_string(), b"d".to_vec())));
        }
    }

    #[tokio::test]
    async fn test_closed_kafka_producer() {
        let cluster = create_mock_cluster();
        let producer = new_producer(
            &mock_producer_config(&cluster),
            producer_config(DeliveryMode::Async),
        )
        .unwrap();
        producer.close().await.unwrap();
        producer.close().await.unwrap();

        let mut batch = vec![Span { id: 1 }];
        assert!(matches!(
            producer.process_batch(&Context::background(), &mut batch).await,
            Err(ProduceError::Closed)
        ));
    }

    fn serde_json_payload(payload: &[u8]) -> Span {
        event_queue::Codec::decode(&JsonCodec, payload).unwrap()
    }
}
