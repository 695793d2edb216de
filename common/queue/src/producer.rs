use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use metrics::counter;
use thiserror::Error;
use tokio::task::JoinSet;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, info_span, Instrument};

use crate::codec::{Codec, CodecError};
use crate::config::{DeliveryMode, ProducerConfig};
use crate::context::{Context, ContextError};
use crate::metrics_consts::{PRODUCER_RECORDS_DROPPED, PRODUCER_RECORDS_FAILED, PRODUCER_RECORDS_PRODUCED};
use crate::processor::{Batch, BatchProcessor};
use crate::queuecontext;
use crate::record::{Header, Record};
use crate::router::TopicRouter;
use crate::topic::Topic;
use crate::transport::{ProducerTransport, TransportError};

#[derive(Error, Debug)]
pub enum ProduceError {
    #[error("event {index} was routed to an empty topic")]
    Routing { index: usize },
    #[error("failed to encode event {index} for {topic}: {source}")]
    Encode {
        index: usize,
        topic: Topic,
        #[source]
        source: CodecError,
    },
    #[error("failed to produce event {index} to {topic}: {source}")]
    Transport {
        index: usize,
        topic: Topic,
        #[source]
        source: TransportError,
    },
    #[error("acknowledgement task failed: {0}")]
    AckTask(#[from] tokio::task::JoinError),
    #[error("produce cancelled")]
    Cancelled,
    #[error("produce timed out waiting for acknowledgement")]
    Timeout,
    #[error("producer is closed")]
    Closed,
    #[error("failed to close producer: {0}")]
    Close(#[source] TransportError),
}

impl From<ContextError> for ProduceError {
    fn from(value: ContextError) -> Self {
        match value {
            ContextError::Cancelled => ProduceError::Cancelled,
            ContextError::DeadlineExceeded => ProduceError::Timeout,
        }
    }
}

/// Routes, encodes and sends batches of events through a transport.
///
/// A producer is shared freely between tasks: `process_batch` takes `&self`
/// and calls do not serialize each other.
pub struct Producer<E> {
    transport: Box<dyn ProducerTransport>,
    codec: Arc<dyn Codec<E>>,
    router: Arc<dyn TopicRouter<E>>,
    mode: DeliveryMode,
    // acknowledgements still outstanding from async batches
    pending: TaskTracker,
    closed: AtomicBool,
}

impl<E> Producer<E> {
    pub fn new<T>(config: ProducerConfig<E>, transport: T) -> Self
    where
        T: ProducerTransport + 'static,
    {
        Producer {
            transport: Box::new(transport),
            codec: config.codec,
            router: config.router,
            mode: config.mode,
            pending: TaskTracker::new(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn mode(&self) -> DeliveryMode {
        self.mode
    }

    /// Sends every event of `batch`, in order, with the metadata carried by
    /// `ctx` attached as headers.
    ///
    /// In [`DeliveryMode::Sync`] this returns once every record has been
    /// acknowledged, or with the first failure. In [`DeliveryMode::Async`] it
    /// returns once every record is enqueued and never fails because of `ctx`:
    /// delivery carries on in the background and failures are logged.
    pub async fn process_batch(&self, ctx: &Context, batch: &mut Batch<E>) -> Result<(), ProduceError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProduceError::Closed);
        }

        let headers = queuecontext::metadata(ctx)
            .map(|metadata| metadata.to_headers())
            .unwrap_or_default();

        match self.mode {
            DeliveryMode::Sync => {
                self.produce_sync(ctx, batch, &headers)
                    .instrument(info_span!("produce_sync", events = batch.len()))
                    .await
            }
            DeliveryMode::Async => {
                self.produce_async(batch, &headers);
                Ok(())
            }
        }
    }

    /// Stops accepting batches, flushes the transport and waits for
    /// outstanding acknowledgements. Closing twice is a no-op.
    pub async fn close(&self) -> Result<(), ProduceError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        info!("closing producer, flushing outstanding records");
        let flushed = self.transport.close().await;
        self.pending.close();
        self.pending.wait().await;
        flushed.map_err(ProduceError::Close)?;
        info!("producer closed");
        Ok(())
    }

    fn build_record(&self, index: usize, event: &E, headers: &[Header]) -> Result<Record, ProduceError> {
        let topic = self.router.route(event);
        if topic.is_empty() {
            return Err(ProduceError::Routing { index });
        }
        let payload = self
            .codec
            .encode(event)
            .map_err(|source| ProduceError::Encode {
                index,
                topic: topic.clone(),
                source,
            })?;
        Ok(Record::new(topic, payload).with_headers(headers.to_vec()))
    }

    async fn produce_sync(&self, ctx: &Context, batch: &Batch<E>, headers: &[Header]) -> Result<(), ProduceError> {
        if let Some(err) = ctx.err() {
            return Err(err.into());
        }

        // Dropping the set on an early return aborts the remaining waits.
        let mut acks = JoinSet::new();
        for (index, event) in batch.iter().enumerate() {
            if let Some(err) = ctx.err() {
                return Err(err.into());
            }
            let record = self.build_record(index, event, headers)?;
            let topic = record.topic.clone();
            let ack = match self.transport.send(record) {
                Ok(ack) => ack,
                Err(source) => {
                    counter!(PRODUCER_RECORDS_FAILED, "topic" => topic.to_string()).increment(1);
                    return Err(ProduceError::Transport { index, topic, source });
                }
            };
            acks.spawn(async move { (index, topic, ack.await) });
        }

        loop {
            tokio::select! {
                biased;
                err = ctx.done() => return Err(err.into()),
                next = acks.join_next() => match next {
                    None => break,
                    Some(Ok((_, topic, Ok(())))) => {
                        counter!(PRODUCER_RECORDS_PRODUCED, "topic" => topic.to_string()).increment(1);
                    }
                    Some(Ok((index, topic, Err(source)))) => {
                        counter!(PRODUCER_RECORDS_FAILED, "topic" => topic.to_string()).increment(1);
                        return Err(ProduceError::Transport { index, topic, source });
                    }
                    Some(Err(err)) => return Err(err.into()),
                },
            }
        }

        debug!(events = batch.len(), "batch acknowledged");
        Ok(())
    }

    fn produce_async(&self, batch: &Batch<E>, headers: &[Header]) {
        for (index, event) in batch.iter().enumerate() {
            let record = match self.build_record(index, event, headers) {
                Ok(record) => record,
                Err(err) => {
                    counter!(PRODUCER_RECORDS_DROPPED).increment(1);
                    error!(error = %err, "dropping event");
                    continue;
                }
            };

            let topic = record.topic.clone();
            match self.transport.send(record) {
                Ok(ack) => {
                    self.pending.spawn(async move {
                        match ack.await {
                            Ok(()) => {
                                counter!(PRODUCER_RECORDS_PRODUCED, "topic" => topic.to_string())
                                    .increment(1);
                            }
                            Err(err) => {
                                counter!(PRODUCER_RECORDS_FAILED, "topic" => topic.to_string())
                                    .increment(1);
                                error!(topic = %topic, error = %err, "failed to deliver record");
                            }
                        }
                    });
                }
                Err(err) => {
                    counter!(PRODUCER_RECORDS_FAILED, "topic" => topic.to_string()).increment(1);
                    error!(topic = %topic, index, error = %err, "failed to enqueue record");
                }
            }
        }
    }
}

#[async_trait]
impl<E> BatchProcessor<E> for Producer<E>
where
    E: Send + Sync,
{
    async fn process_batch(&self, ctx: &Context, batch: &mut Batch<E>) -> anyhow::Result<()> {
        Producer::process_batch(self, ctx, batch).await?;
        Ok(())
    }
}
