//! The seam between the queue pipelines and a concrete broker.
//!
//! A backend implements [`ProducerTransport`] for the write path and
//! [`ConsumerTransport`] for the read path. The producer and consumer only
//! ever talk to these traits.

use async_trait::async_trait;
use futures::future::BoxFuture;
use thiserror::Error;

use crate::record::{ConsumedRecord, Record};
use crate::topic::Topic;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("{message}")]
    Backend { message: String, transient: bool },
    #[error("delivery canceled before acknowledgement")]
    Canceled,
    #[error("transport is closed")]
    Closed,
    #[error("transport has no subscription")]
    NotSubscribed,
}

impl TransportError {
    /// A failure worth retrying, e.g. a broker that is temporarily unreachable.
    pub fn transient(message: impl Into<String>) -> Self {
        TransportError::Backend {
            message: message.into(),
            transient: true,
        }
    }

    pub fn fatal(message: impl Into<String>) -> Self {
        TransportError::Backend {
            message: message.into(),
            transient: false,
        }
    }

    pub fn is_transient(&self) -> bool {
        match self {
            TransportError::Backend { transient, .. } => *transient,
            TransportError::Canceled => true,
            TransportError::Closed | TransportError::NotSubscribed => false,
        }
    }
}

/// Resolves once the broker acknowledged (or rejected) a sent record.
pub type Ack = BoxFuture<'static, Result<(), TransportError>>;

/// Topics and consumer group a consumer reads under.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub topics: Vec<Topic>,
    pub group_id: String,
}

#[async_trait]
pub trait ProducerTransport: Send + Sync {
    /// Enqueues `record` for delivery without waiting for the broker.
    ///
    /// An error here means the record never left the process; delivery
    /// failures are reported through the returned [`Ack`].
    fn send(&self, record: Record) -> Result<Ack, TransportError>;

    /// Flushes outstanding records and releases the connection.
    async fn close(&self) -> Result<(), TransportError>;
}

#[async_trait]
pub trait ConsumerTransport: Send + Sync {
    /// Joins `subscription.group_id` and starts reading `subscription.topics`.
    /// Called once, before any other method.
    fn subscribe(&mut self, subscription: &Subscription) -> Result<(), TransportError>;

    /// Waits for records, returning at most `max_records` in fetch order.
    ///
    /// May return an empty batch when the backend gives up waiting. Records
    /// taken by a poll whose future is dropped are never committed.
    async fn poll(&self, max_records: usize) -> Result<Vec<ConsumedRecord>, TransportError>;

    /// Advances the group's read position past `records`.
    async fn commit(&self, records: &[ConsumedRecord]) -> Result<(), TransportError>;

    /// Rewinds the read position so `records` are delivered again.
    async fn nack(&self, records: &[ConsumedRecord]) -> Result<(), TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}
