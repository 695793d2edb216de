use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::codec::Codec;
use crate::processor::BatchProcessor;
use crate::router::TopicRouter;
use crate::topic::Topic;
use crate::transport::TransportError;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("at least one broker address is required")]
    NoBrokers,
    #[error("invalid broker address {address}: {reason}")]
    InvalidBroker { address: String, reason: String },
    #[error("at least one topic is required")]
    NoTopics,
    #[error("topic names cannot be empty")]
    EmptyTopic,
    #[error("consumer group id is required")]
    NoGroupId,
    #[error("invalid credentials: {0}")]
    InvalidCredentials(String),
    #[error("invalid value for {name}: {reason}")]
    Invalid { name: &'static str, reason: String },
    #[error("failed to set up transport: {0}")]
    Transport(#[from] TransportError),
}

/// Whether `process_batch` waits for broker acknowledgements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeliveryMode {
    /// Return once every record is enqueued; delivery failures are logged.
    #[default]
    Async,
    /// Return once every record is acknowledged, or on the first failure.
    Sync,
}

impl std::str::FromStr for DeliveryMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_ref() {
            "async" => Ok(DeliveryMode::Async),
            "sync" => Ok(DeliveryMode::Sync),
            _ => Err(format!("Unknown delivery mode: {s}, must be sync or async")),
        }
    }
}

/// What a consumer does with a record its codec cannot decode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DecodeErrorPolicy {
    /// Log the record, leave it out of the batch and commit past it.
    #[default]
    Skip,
    /// Stop the consumer with an error, without committing the poll cycle.
    Abort,
}

pub struct ProducerConfig<E> {
    pub codec: Arc<dyn Codec<E>>,
    pub router: Arc<dyn TopicRouter<E>>,
    pub mode: DeliveryMode,
}

impl<E> ProducerConfig<E> {
    pub fn new(codec: Arc<dyn Codec<E>>, router: Arc<dyn TopicRouter<E>>) -> Self {
        ProducerConfig {
            codec,
            router,
            mode: DeliveryMode::default(),
        }
    }

    pub fn with_mode(mut self, mode: DeliveryMode) -> Self {
        self.mode = mode;
        self
    }
}

pub struct ConsumerConfig<E: Send> {
    pub topics: Vec<Topic>,
    pub group_id: String,
    pub codec: Arc<dyn Codec<E>>,
    pub processor: Arc<dyn BatchProcessor<E>>,
    // upper bound on records handed to the processor at once
    pub max_poll_records: usize,
    pub decode_error_policy: DecodeErrorPolicy,
    // pause after a failed batch before polling again
    pub retry_backoff: Duration,
}

impl<E: Send> ConsumerConfig<E> {
    pub fn new(
        topics: Vec<Topic>,
        group_id: impl Into<String>,
        codec: Arc<dyn Codec<E>>,
        processor: Arc<dyn BatchProcessor<E>>,
    ) -> Self {
        ConsumerConfig {
            topics,
            group_id: group_id.into(),
            codec,
            processor,
            max_poll_records: 500,
            decode_error_policy: DecodeErrorPolicy::default(),
            retry_backoff: Duration::from_millis(100),
        }
    }

    pub fn with_max_poll_records(mut self, max_poll_records: usize) -> Self {
        self.max_poll_records = max_poll_records;
        self
    }

    pub fn with_decode_error_policy(mut self, policy: DecodeErrorPolicy) -> Self {
        self.decode_error_policy = policy;
        self
    }

    pub fn with_retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.topics.is_empty() {
            return Err(ConfigError::NoTopics);
        }
        if self.topics.iter().any(Topic::is_empty) {
            return Err(ConfigError::EmptyTopic);
        }
        if self.group_id.trim().is_empty() {
            return Err(ConfigError::NoGroupId);
        }
        if self.max_poll_records == 0 {
            return Err(ConfigError::Invalid {
                name: "max_poll_records",
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }
}

/// Checks a list of `host:port` broker addresses.
pub fn validate_brokers<S: AsRef<str>>(brokers: &[S]) -> Result<(), ConfigError> {
    if brokers.is_empty() {
        return Err(ConfigError::NoBrokers);
    }
    for broker in brokers {
        let address = broker.as_ref();
        let invalid = |reason: &str| ConfigError::InvalidBroker {
            address: address.to_string(),
            reason: reason.to_string(),
        };
        let Some((host, port)) = address.rsplit_once(':') else {
            return Err(invalid("expected host:port"));
        };
        if host.is_empty() {
            return Err(invalid("missing host"));
        }
        if port.parse::<u16>().is_err() {
            return Err(invalid("port must be a number between 0 and 65535"));
        }
    }
    Ok(())
}
