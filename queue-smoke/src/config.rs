use envconfig::Envconfig;
use event_queue::DeliveryMode;
use event_queue_kafka::config::{KafkaConsumerConfig, KafkaProducerConfig};

#[derive(Envconfig, Clone, Debug)]
pub struct Config {
    #[envconfig(nested = true)]
    pub producer: KafkaProducerConfig,

    #[envconfig(nested = true)]
    pub consumer: KafkaConsumerConfig,

    #[envconfig(default = "event-queue-smoke")]
    pub smoke_topic: String,

    #[envconfig(default = "event-queue-smoke")]
    pub smoke_group_id: String,

    #[envconfig(default = "100")]
    pub smoke_events: usize,

    #[envconfig(default = "sync")]
    pub smoke_delivery_mode: DeliveryMode,

    #[envconfig(default = "60")]
    pub smoke_timeout_secs: u64, // give up consuming after this long

    #[envconfig(default = "15")]
    pub smoke_ping_timeout_secs: u64,
}
