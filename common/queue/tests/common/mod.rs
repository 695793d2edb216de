//! Shared helpers for the produce/consume integration tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use event_queue::memory::MemoryBroker;
use event_queue::{
    Batch, BatchProcessor, Consumer, ConsumerConfig, ConsumerError, Context, DeliveryMode,
    JsonCodec, Producer, ProducerConfig, Topic, TopicRouter,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

pub const GROUP_ID: &str = "integration-test-group";

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TestEvent {
    pub id: u64,
}

pub fn events(count: u64) -> Batch<TestEvent> {
    (0..count).map(|id| TestEvent { id }).collect()
}

/// Records every batch it is handed. Fails the first `failures` calls and
/// takes `delay` to process each batch.
#[derive(Default)]
pub struct RecordingProcessor {
    seen: Mutex<Vec<TestEvent>>,
    calls: AtomicUsize,
    failures: AtomicUsize,
    delay: Duration,
}

#[allow(dead_code)] // not every test file uses every helper
impl RecordingProcessor {
    pub fn failing(failures: usize) -> Self {
        RecordingProcessor {
            failures: AtomicUsize::new(failures),
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        RecordingProcessor {
            delay,
            ..Default::default()
        }
    }

    pub fn seen(&self) -> Vec<TestEvent> {
        self.seen.lock().unwrap().clone()
    }

    pub fn sorted_ids(&self) -> Vec<u64> {
        let mut ids: Vec<u64> = self.seen().into_iter().map(|e| e.id).collect();
        ids.sort_unstable();
        ids
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BatchProcessor<TestEvent> for RecordingProcessor {
    async fn process_batch(&self, _: &Context, batch: &mut Batch<TestEvent>) -> anyhow::Result<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let remaining = self.failures.load(Ordering::SeqCst);
        if remaining > 0 {
            self.failures.store(remaining - 1, Ordering::SeqCst);
            anyhow::bail!("processor unavailable");
        }
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.seen.lock().unwrap().extend(batch.iter().cloned());
        Ok(())
    }
}

#[allow(dead_code)]
pub fn producer<R>(broker: &MemoryBroker, router: R, mode: DeliveryMode) -> Producer<TestEvent>
where
    R: TopicRouter<TestEvent> + 'static,
{
    let config = ProducerConfig::<TestEvent>::new(Arc::new(JsonCodec), Arc::new(router))
        .with_mode(mode);
    Producer::new(config, broker.producer())
}

#[allow(dead_code)]
pub fn consumer_config(topics: &[&str], processor: Arc<RecordingProcessor>) -> ConsumerConfig<TestEvent> {
    ConsumerConfig::<TestEvent>::new(
        topics.iter().map(|t| Topic::from(*t)).collect(),
        GROUP_ID,
        Arc::new(JsonCodec),
        processor,
    )
    .with_retry_backoff(Duration::from_millis(10))
}

/// Starts `consumer.run` on its own task.
#[allow(dead_code)]
pub fn spawn_run(
    consumer: &Arc<Consumer<TestEvent>>,
    ctx: Context,
) -> JoinHandle<Result<(), ConsumerError>> {
    let consumer = consumer.clone();
    tokio::spawn(async move { consumer.run(&ctx).await })
}

/// Polls `condition` until it holds, panicking after a few seconds.
#[allow(dead_code)]
pub async fn eventually<F>(mut condition: F)
where
    F: FnMut() -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("condition not met in time");
}
