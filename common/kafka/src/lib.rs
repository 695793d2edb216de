pub mod config;
pub mod context;
pub mod kafka_consumer;
pub mod kafka_producer;

use event_queue::{ConfigError, Consumer, ConsumerConfig, Producer, ProducerConfig};

use crate::config::{KafkaConsumerConfig, KafkaProducerConfig};
use crate::kafka_consumer::KafkaConsumer;
use crate::kafka_producer::KafkaProducer;

/// A queue producer writing to Kafka.
pub fn new_producer<E>(
    kafka: &KafkaProducerConfig,
    config: ProducerConfig<E>,
) -> Result<Producer<E>, ConfigError> {
    let transport = KafkaProducer::new(kafka)?;
    Ok(Producer::new(config, transport))
}

/// A queue consumer reading `config.topics` from Kafka as `config.group_id`.
pub fn new_consumer<E: Send>(
    kafka: KafkaConsumerConfig,
    config: ConsumerConfig<E>,
) -> Result<Consumer<E>, ConfigError> {
    let transport = KafkaConsumer::new(kafka)?;
    Consumer::new(config, transport)
}
