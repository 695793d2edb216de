use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::{counter, histogram};
use thiserror::Error;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::codec::{Codec, CodecError};
use crate::config::{ConfigError, ConsumerConfig, DecodeErrorPolicy};
use crate::context::Context;
use crate::metrics_consts::{
    CONSUMER_BATCHES_PROCESSED, CONSUMER_BATCH_SIZE, CONSUMER_COMMIT_FAILURES,
    CONSUMER_DECODE_ERRORS, CONSUMER_POLL_ERRORS, CONSUMER_PROCESSING_FAILURES,
};
use crate::processor::{Batch, BatchProcessor};
use crate::record::ConsumedRecord;
use crate::topic::Topic;
use crate::transport::{ConsumerTransport, Subscription, TransportError};

const POLL_RETRY_BASE: Duration = Duration::from_millis(100);
const POLL_RETRY_MAX_STEPS: u32 = 10;

#[derive(Error, Debug)]
pub enum ConsumerError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("failed to decode record at {topic}[{partition}]@{offset}: {source}")]
    Decode {
        topic: Topic,
        partition: i32,
        offset: i64,
        #[source]
        source: CodecError,
    },
    #[error("consumer is already running")]
    AlreadyStarted,
    #[error("consumer is closed")]
    Closed,
}

/// Lifecycle of a [`Consumer`].
///
/// `Created -> Running -> {Cancelled, Closed} -> Stopped`. A consumer closed
/// before it ever ran goes straight from `Created` to `Stopped`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerState {
    Created,
    Running,
    /// The context passed to `run` was cancelled or timed out.
    Cancelled,
    /// `close` was called.
    Closed,
    Stopped,
}

/// Polls a transport, decodes records into batches and hands them to a
/// [`BatchProcessor`], committing only what was processed successfully.
pub struct Consumer<E: Send> {
    transport: Box<dyn ConsumerTransport>,
    codec: Arc<dyn Codec<E>>,
    processor: Arc<dyn BatchProcessor<E>>,
    max_poll_records: usize,
    decode_error_policy: DecodeErrorPolicy,
    retry_backoff: Duration,
    shutdown: CancellationToken,
    state: watch::Sender<ConsumerState>,
    transport_closed: AtomicBool,
}

// Marks the consumer stopped however `run` exits, including when its future
// is dropped mid-cycle, so `close` never waits forever.
struct StoppedOnDrop<'a>(&'a watch::Sender<ConsumerState>);

impl Drop for StoppedOnDrop<'_> {
    fn drop(&mut self) {
        self.0.send_replace(ConsumerState::Stopped);
    }
}

impl<E: Send> Consumer<E> {
    /// Validates `config` and subscribes `transport` to its topics.
    pub fn new<T>(config: ConsumerConfig<E>, mut transport: T) -> Result<Self, ConfigError>
    where
        T: ConsumerTransport + 'static,
    {
        config.validate()?;
        transport.subscribe(&Subscription {
            topics: config.topics.clone(),
            group_id: config.group_id.clone(),
        })?;

        let (state, _initial) = watch::channel(ConsumerState::Created);
        Ok(Consumer {
            transport: Box::new(transport),
            codec: config.codec,
            processor: config.processor,
            max_poll_records: config.max_poll_records,
            decode_error_policy: config.decode_error_policy,
            retry_backoff: config.retry_backoff,
            shutdown: CancellationToken::new(),
            state,
            transport_closed: AtomicBool::new(false),
        })
    }

    pub fn state(&self) -> ConsumerState {
        *self.state.borrow()
    }

    /// Consumes until `ctx` is done, `close` is called or the transport fails
    /// fatally. Returns `Ok(())` on graceful shutdown.
    ///
    /// A poll cycle that has started always runs to completion: its batch is
    /// processed and committed (or rewound) before the loop notices shutdown.
    pub async fn run(&self, ctx: &Context) -> Result<(), ConsumerError> {
        let started = self.state.send_if_modified(|state| {
            if *state == ConsumerState::Created {
                *state = ConsumerState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            if self.shutdown.is_cancelled() {
                return Err(ConsumerError::Closed);
            }
            return Err(ConsumerError::AlreadyStarted);
        }

        let _stopped = StoppedOnDrop(&self.state);
        info!(max_poll_records = self.max_poll_records, "consumer started");
        let result = self.consume(ctx).await;
        match &result {
            Ok(()) => info!(state = ?self.state(), "consumer stopped"),
            Err(err) => error!(error = %err, "consumer stopped with error"),
        }
        result
    }

    /// Stops a running consumer after its current cycle and releases the
    /// transport. Safe to call repeatedly or concurrently, and before `run`.
    ///
    /// Must not be awaited from inside the batch processor: the running cycle
    /// would wait on itself.
    pub async fn close(&self) -> Result<(), ConsumerError> {
        self.shutdown.cancel();
        self.state.send_if_modified(|state| {
            if *state == ConsumerState::Created {
                *state = ConsumerState::Stopped;
                true
            } else {
                false
            }
        });

        let mut state = self.state.subscribe();
        state
            .wait_for(|state| *state == ConsumerState::Stopped)
            .await
            .map_err(|_| ConsumerError::Closed)?;

        if self.transport_closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        self.transport.close().await?;
        info!("consumer closed");
        Ok(())
    }

    async fn consume(&self, ctx: &Context) -> Result<(), ConsumerError> {
        let mut poll_failures: u32 = 0;

        loop {
            let polled = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => {
                    self.state.send_replace(ConsumerState::Closed);
                    return Ok(());
                }
                reason = ctx.done() => {
                    debug!(reason = %reason, "consumer context done");
                    self.state.send_replace(ConsumerState::Cancelled);
                    return Ok(());
                }
                polled = self.transport.poll(self.max_poll_records) => polled,
            };

            let records = match polled {
                Ok(records) => {
                    poll_failures = 0;
                    records
                }
                Err(err) if err.is_transient() => {
                    counter!(CONSUMER_POLL_ERRORS, "transient" => "true").increment(1);
                    poll_failures = poll_failures.saturating_add(1);
                    let delay = POLL_RETRY_BASE * poll_failures.min(POLL_RETRY_MAX_STEPS);
                    warn!(error = %err, retry_in = ?delay, "transient poll error");
                    self.backoff(ctx, delay).await;
                    continue;
                }
                Err(err) => {
                    counter!(CONSUMER_POLL_ERRORS, "transient" => "false").increment(1);
                    return Err(err.into());
                }
            };

            if records.is_empty() {
                continue;
            }
            self.process_cycle(ctx, records).await?;
        }
    }

    async fn process_cycle(&self, ctx: &Context, records: Vec<ConsumedRecord>) -> Result<(), ConsumerError> {
        let mut batch: Batch<E> = Vec::with_capacity(records.len());
        for consumed in &records {
            match self.codec.decode(&consumed.record.payload) {
                Ok(event) => batch.push(event),
                Err(source) => {
                    let position = &consumed.position;
                    counter!(CONSUMER_DECODE_ERRORS, "topic" => position.topic.to_string())
                        .increment(1);
                    error!(
                        topic = %position.topic,
                        partition = position.partition,
                        offset = position.offset,
                        error = %source,
                        "failed to decode record"
                    );
                    if self.decode_error_policy == DecodeErrorPolicy::Abort {
                        return Err(ConsumerError::Decode {
                            topic: position.topic.clone(),
                            partition: position.partition,
                            offset: position.offset,
                            source,
                        });
                    }
                }
            }
        }

        if !batch.is_empty() {
            histogram!(CONSUMER_BATCH_SIZE).record(batch.len() as f64);
            if let Err(err) = self.processor.process_batch(ctx, &mut batch).await {
                counter!(CONSUMER_PROCESSING_FAILURES).increment(1);
                warn!(
                    error = %err,
                    records = records.len(),
                    "batch processing failed, records will be redelivered"
                );
                if let Err(err) = self.transport.nack(&records).await {
                    error!(error = %err, "failed to rewind records after processing failure");
                }
                self.backoff(ctx, self.retry_backoff).await;
                return Ok(());
            }
            counter!(CONSUMER_BATCHES_PROCESSED).increment(1);
        }

        if let Err(err) = self.transport.commit(&records).await {
            counter!(CONSUMER_COMMIT_FAILURES).increment(1);
            error!(error = %err, records = records.len(), "failed to commit records");
        }
        Ok(())
    }

    async fn backoff(&self, ctx: &Context, delay: Duration) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = self.shutdown.cancelled() => {}
            _ = ctx.done() => {}
        }
    }
}
