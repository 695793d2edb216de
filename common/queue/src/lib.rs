//! Broker-agnostic batched event queue.
//!
//! A [`Producer`] routes, encodes and sends batches of events; a [`Consumer`]
//! polls, decodes and hands batches to a [`BatchProcessor`], committing only
//! what was processed. Both sit on top of the [`transport`] traits, which a
//! backend (Kafka, or the in-process [`memory`] broker) implements.

pub mod codec;
pub mod config;
pub mod consumer;
pub mod context;
pub mod memory;
pub mod metrics_consts;
pub mod processor;
pub mod producer;
pub mod queuecontext;
pub mod record;
pub mod router;
pub mod topic;
pub mod transport;

pub use codec::{Codec, CodecError, JsonCodec};
pub use config::{
    validate_brokers, ConfigError, ConsumerConfig, DecodeErrorPolicy, DeliveryMode,
    ProducerConfig,
};
pub use consumer::{Consumer, ConsumerError, ConsumerState};
pub use context::{Context, ContextError};
pub use processor::{Batch, BatchProcessor};
pub use producer::{ProduceError, Producer};
pub use queuecontext::Metadata;
pub use record::{ConsumedRecord, Header, Position, Record};
pub use router::{FixedTopic, TopicRouter};
pub use topic::Topic;
pub use transport::{Ack, ConsumerTransport, ProducerTransport, Subscription, TransportError};
