use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use event_queue::record::{committable_offsets, earliest_positions};
use event_queue::{
    ConfigError, ConsumedRecord, ConsumerTransport, Header, Position, Record, Subscription,
    Topic, TransportError,
};
use rdkafka::consumer::{CommitMode, Consumer, StreamConsumer};
use rdkafka::message::{BorrowedMessage, Headers, Message};
use rdkafka::{Offset, TopicPartitionList};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::{redacted, KafkaConsumerConfig};
use crate::context::KafkaContext;
use crate::kafka_producer::transport_error;

const SEEK_TIMEOUT: Duration = Duration::from_secs(5);

/// Consumer transport on top of an rdkafka `StreamConsumer` in a consumer
/// group. Offsets are committed synchronously and only on request.
pub struct KafkaConsumer {
    config: KafkaConsumerConfig,
    consumer: Option<StreamConsumer<KafkaContext>>,
    batch_timeout: Duration,
    closed: AtomicBool,
}

impl KafkaConsumer {
    pub fn new(config: KafkaConsumerConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        let batch_timeout = Duration::from_millis(config.kafka_consumer_batch_timeout_ms);
        Ok(KafkaConsumer {
            config,
            consumer: None,
            batch_timeout,
            closed: AtomicBool::new(false),
        })
    }

    fn consumer(&self) -> Result<&StreamConsumer<KafkaContext>, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        self.consumer.as_ref().ok_or(TransportError::NotSubscribed)
    }
}

fn consumed_record(message: &BorrowedMessage<'_>) -> ConsumedRecord {
    let headers = message
        .headers()
        .map(|headers| {
            headers
                .iter()
                .map(|h| Header::new(h.key, h.value.unwrap_or_default()))
                .collect()
        })
        .unwrap_or_default();
    let topic = Topic::from(message.topic());
    let payload = message.payload().map(<[u8]>::to_vec).unwrap_or_default();

    ConsumedRecord {
        record: Record::new(topic.clone(), payload).with_headers(headers),
        position: Position {
            topic,
            partition: message.partition(),
            offset: message.offset(),
        },
    }
}

#[async_trait]
impl ConsumerTransport for KafkaConsumer {
    fn subscribe(&mut self, subscription: &Subscription) -> Result<(), TransportError> {
        let client_config = self
            .config
            .client_config(&subscription.group_id)
            .map_err(|e| TransportError::fatal(e.to_string()))?;
        debug!("rdkafka configuration: {:?}", redacted(&client_config));

        let consumer: StreamConsumer<KafkaContext> = client_config
            .create_with_context(KafkaContext::consumer(&subscription.group_id))
            .map_err(|e| transport_error(&e))?;
        let topics: Vec<&str> = subscription.topics.iter().map(Topic::as_str).collect();
        consumer
            .subscribe(&topics)
            .map_err(|e| transport_error(&e))?;

        info!(
            group_id = %subscription.group_id,
            topics = ?topics,
            "kafka consumer subscribed"
        );
        self.consumer = Some(consumer);
        Ok(())
    }

    async fn poll(&self, max_records: usize) -> Result<Vec<ConsumedRecord>, TransportError> {
        let consumer = self.consumer()?;

        // Block for the first record, then keep filling until the batch is
        // full or the batch timeout runs out.
        let first = consumed_record(&consumer.recv().await.map_err(|e| transport_error(&e))?);
        let mut batch = Vec::with_capacity(max_records.min(1024));
        batch.push(first);

        let deadline = Instant::now() + self.batch_timeout;
        while batch.len() < max_records {
            match tokio::time::timeout_at(deadline, consumer.recv()).await {
                Ok(Ok(message)) => batch.push(consumed_record(&message)),
                Ok(Err(e)) => {
                    warn!(error = %e, records = batch.len(), "kafka error while filling batch");
                    break;
                }
                Err(_) => break,
            }
        }
        Ok(batch)
    }

    async fn commit(&self, records: &[ConsumedRecord]) -> Result<(), TransportError> {
        let consumer = self.consumer()?;
        let mut offsets = TopicPartitionList::new();
        for position in committable_offsets(records) {
            offsets
                .add_partition_offset(
                    position.topic.as_str(),
                    position.partition,
                    Offset::Offset(position.offset),
                )
                .map_err(|e| transport_error(&e))?;
        }
        if offsets.count() == 0 {
            return Ok(());
        }
        consumer
            .commit(&offsets, CommitMode::Sync)
            .map_err(|e| transport_error(&e))
    }

    async fn nack(&self, records: &[ConsumedRecord]) -> Result<(), TransportError> {
        let consumer = self.consumer()?;
        for position in earliest_positions(records) {
            debug!(position = %position, "rewinding partition");
            consumer
                .seek(
                    position.topic.as_str(),
                    position.partition,
                    Offset::Offset(position.offset),
                    SEEK_TIMEOUT,
                )
                .map_err(|e| transport_error(&e))?;
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        if let Some(consumer) = &self.consumer {
            consumer.unsubscribe();
        }
        info!("kafka consumer closed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;
    use std::sync::atomic::AtomicUsize;
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use event_queue::{
        Batch, BatchProcessor, ConsumerConfig, Context, DeliveryMode, FixedTopic, JsonCodec,
        ProducerConfig,
    };
    use rdkafka::consumer::BaseConsumer;
    use rdkafka::ClientConfig;
    use serde::{Deserialize, Serialize};

    use super::*;
    use crate::config::KafkaConfig;
    use crate::test::{create_mock_cluster, mock_consumer_config, mock_producer_config};
    use crate::{new_consumer, new_producer};

    const GROUP_ID: &str = "spans-mock-group";

    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    struct Span {
        id: u64,
    }

    /// Fails its first `failures` batches, then collects span ids.
    struct Collector {
        ids: Mutex<BTreeSet<u64>>,
        calls: AtomicUsize,
        failures: AtomicUsize,
    }

    impl Collector {
        fn failing(failures: usize) -> Self {
            Collector {
                ids: Mutex::new(BTreeSet::new()),
                calls: AtomicUsize::new(0),
                failures: AtomicUsize::new(failures),
            }
        }

        fn ids(&self) -> Vec<u64> {
            self.ids.lock().unwrap().iter().copied().collect()
        }
    }

    #[async_trait]
    impl BatchProcessor<Span> for Collector {
        async fn process_batch(&self, _: &Context, batch: &mut Batch<Span>) -> anyhow::Result<()> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self
                .failures
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok()
            {
                anyhow::bail!("downstream unavailable");
            }
            self.ids.lock().unwrap().extend(batch.iter().map(|s| s.id));
            Ok(())
        }
    }

    #[test]
    fn test_invalid_consumer_config() {
        let mut config = KafkaConsumerConfig::new(KafkaConfig::for_brokers("localhost:9092"));
        config.kafka_consumer_offset_reset = "sometimes".to_string();
        assert!(KafkaConsumer::new(config).is_err());

        let config = KafkaConsumerConfig::new(KafkaConfig::for_brokers("localhost:invalidport"));
        assert!(matches!(
            KafkaConsumer::new(config),
            Err(ConfigError::InvalidBroker { .. })
        ));
    }

    #[tokio::test]
    async fn test_poll_before_subscribe() {
        let consumer =
            KafkaConsumer::new(KafkaConsumerConfig::new(KafkaConfig::for_brokers("localhost:9092")))
                .unwrap();
        assert_eq!(consumer.poll(1).await, Err(TransportError::NotSubscribed));
    }

    #[tokio::test]
    async fn test_subscribe_without_running_broker() {
        let mut consumer =
            KafkaConsumer::new(KafkaConsumerConfig::new(KafkaConfig::for_brokers("localhost:9092")))
                .unwrap();
        consumer
            .subscribe(&Subscription {
                topics: vec![Topic::from("spans")],
                group_id: "group".to_string(),
            })
            .unwrap();
        consumer.close().await.unwrap();
        assert_eq!(consumer.poll(1).await, Err(TransportError::Closed));
    }

    #[tokio::test]
    async fn test_consume_from_mock_cluster() {
        let cluster = create_mock_cluster();
        let topic = Topic::from("spans").with_suffix("-consumed");
        cluster
            .create_topic(topic.as_str(), 1, 1)
            .expect("failed to create mock topic");

        let producer = new_producer(
            &mock_producer_config(&cluster),
            ProducerConfig::<Span>::new(Arc::new(JsonCodec), Arc::new(FixedTopic(topic.clone())))
                .with_mode(DeliveryMode::Sync),
        )
        .unwrap();
        let mut batch: Vec<Span> = (0..5).map(|id| Span { id }).collect();
        producer
            .process_batch(&Context::background(), &mut batch)
            .await
            .unwrap();
        producer.close().await.unwrap();

        // the first batch fails and has to come back through a seek
        let processor = Arc::new(Collector::failing(1));
        let consumer = Arc::new(
            new_consumer(
                mock_consumer_config(&cluster),
                ConsumerConfig::<Span>::new(
                    vec![topic.clone()],
                    GROUP_ID,
                    Arc::new(JsonCodec),
                    processor.clone(),
                )
                .with_retry_backoff(Duration::from_millis(10)),
            )
            .unwrap(),
        );
        let run = {
            let consumer = consumer.clone();
            tokio::spawn(async move { consumer.run(&Context::background()).await })
        };

        tokio::time::timeout(Duration::from_secs(30), async {
            while processor.ids().len() < 5 {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        })
        .await
        .expect("did not consume all spans in time");
        consumer.close().await.unwrap();
        run.await.unwrap().unwrap();

        assert_eq!(processor.ids(), vec![0, 1, 2, 3, 4]);
        assert!(processor.calls.load(Ordering::SeqCst) >= 2);

        let reader: BaseConsumer = ClientConfig::new()
            .set("bootstrap.servers", cluster.bootstrap_servers())
            .set("group.id", GROUP_ID)
            .create()
            .unwrap();
        let mut partitions = TopicPartitionList::new();
        partitions.add_partition(topic.as_str(), 0);
        let committed = reader
            .committed_offsets(partitions, Duration::from_secs(10))
            .unwrap();
        let offset = committed
            .find_partition(topic.as_str(), 0)
            .expect("partition missing from committed offsets")
            .offset();
        assert_eq!(offset, Offset::Offset(5));
    }
}
