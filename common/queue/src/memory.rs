//! In-process broker backend.
//!
//! Topics are append-only vectors with a single partition, consumer groups
//! keep a committed offset per topic. Useful for tests and for embedding the
//! queue in a single process. Nothing is persisted.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use futures::FutureExt;
use tokio::sync::Notify;
use tracing::debug;

use crate::record::{committable_offsets, earliest_positions, ConsumedRecord, Position, Record};
use crate::topic::Topic;
use crate::transport::{Ack, ConsumerTransport, ProducerTransport, Subscription, TransportError};

const PARTITION: i32 = 0;

#[derive(Default)]
struct BrokerState {
    topics: HashMap<Topic, Vec<Record>>,
    committed: HashMap<(String, Topic), i64>,
    send_failures: VecDeque<TransportError>,
}

#[derive(Default)]
struct Shared {
    state: Mutex<BrokerState>,
    appended: Notify,
}

/// Handle to an in-process broker. Clones share the same topics.
#[derive(Clone, Default)]
pub struct MemoryBroker {
    inner: Arc<Shared>,
}

impl MemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, BrokerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Topics are also created on first send; this just makes them visible
    /// up front.
    pub fn create_topics<I>(&self, topics: I)
    where
        I: IntoIterator<Item = Topic>,
    {
        let mut state = self.lock();
        for topic in topics {
            state.topics.entry(topic).or_default();
        }
    }

    pub fn producer(&self) -> MemoryProducer {
        MemoryProducer {
            broker: self.clone(),
            closed: AtomicBool::new(false),
        }
    }

    pub fn consumer(&self) -> MemoryConsumer {
        MemoryConsumer {
            broker: self.clone(),
            subscription: None,
            cursors: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
        }
    }

    /// Every record ever appended to `topic`, in append order.
    pub fn records(&self, topic: &Topic) -> Vec<Record> {
        self.lock().topics.get(topic).cloned().unwrap_or_default()
    }

    /// The next offset `group_id` will read from `topic`, if it committed.
    pub fn committed_offset(&self, group_id: &str, topic: &Topic) -> Option<i64> {
        self.lock()
            .committed
            .get(&(group_id.to_string(), topic.clone()))
            .copied()
    }

    /// Makes the next `count` sends fail their acknowledgement with `error`.
    pub fn fail_next_sends(&self, count: usize, error: TransportError) {
        let mut state = self.lock();
        state
            .send_failures
            .extend(std::iter::repeat(error).take(count));
    }

    fn append(&self, record: Record) -> Result<(), TransportError> {
        {
            let mut state = self.lock();
            if let Some(err) = state.send_failures.pop_front() {
                return Err(err);
            }
            state
                .topics
                .entry(record.topic.clone())
                .or_default()
                .push(record);
        }
        self.inner.appended.notify_waiters();
        Ok(())
    }
}

pub struct MemoryProducer {
    broker: MemoryBroker,
    closed: AtomicBool,
}

#[async_trait]
impl ProducerTransport for MemoryProducer {
    fn send(&self, record: Record) -> Result<Ack, TransportError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(TransportError::Closed);
        }
        let delivered = self.broker.append(record);
        Ok(async move { delivered }.boxed())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

pub struct MemoryConsumer {
    broker: MemoryBroker,
    subscription: Option<Subscription>,
    // next offset to read, per subscribed topic
    cursors: Mutex<HashMap<Topic, usize>>,
    closed: AtomicBool,
}

impl MemoryConsumer {
    fn subscription(&self) -> Result<&Subscription, TransportError> {
        self.subscription
            .as_ref()
            .ok_or(TransportError::NotSubscribed)
    }

    fn cursors(&self) -> MutexGuard<'_, HashMap<Topic, usize>> {
        self.cursors.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn take(&self, max_records: usize) -> Result<Vec<ConsumedRecord>, TransportError> {
        let subscription = self.subscription()?;
        let mut cursors = self.cursors();
        let state = self.broker.lock();

        let mut batch = Vec::new();
        for topic in &subscription.topics {
            let Some(stored) = state.topics.get(topic) else {
                continue;
            };
            let cursor = cursors.entry(topic.clone()).or_insert(0);
            while *cursor < stored.len() && batch.len() < max_records {
                batch.push(ConsumedRecord {
                    record: stored[*cursor].clone(),
                    position: Position {
                        topic: topic.clone(),
                        partition: PARTITION,
                        offset: *cursor as i64,
                    },
                });
                *cursor += 1;
            }
        }
        Ok(batch)
    }
}

#[async_trait]
impl ConsumerTransport for MemoryConsumer {
    fn subscribe(&mut self, subscription: &Subscription) -> Result<(), TransportError> {
        let state = self.broker.lock();
        let cursors = subscription
            .topics
            .iter()
            .map(|topic| {
                let committed = state
                    .committed
                    .get(&(subscription.group_id.clone(), topic.clone()))
                    .copied()
                    .unwrap_or(0);
                (topic.clone(), usize::try_from(committed).unwrap_or(0))
            })
            .collect();
        drop(state);

        *self.cursors() = cursors;
        self.subscription = Some(subscription.clone());
        debug!(group_id = %subscription.group_id, topics = ?subscription.topics, "subscribed");
        Ok(())
    }

    async fn poll(&self, max_records: usize) -> Result<Vec<ConsumedRecord>, TransportError> {
        loop {
            // Register for wakeups before looking, so an append in between is
            // not missed.
            let appended = self.broker.inner.appended.notified();
            tokio::pin!(appended);
            appended.as_mut().enable();

            if self.closed.load(Ordering::Acquire) {
                return Err(TransportError::Closed);
            }
            let batch = self.take(max_records)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            appended.await;
        }
    }

    async fn commit(&self, records: &[ConsumedRecord]) -> Result<(), TransportError> {
        let group_id = self.subscription()?.group_id.clone();
        let mut state = self.broker.lock();
        for position in committable_offsets(records) {
            let committed = state
                .committed
                .entry((group_id.clone(), position.topic))
                .or_insert(position.offset);
            *committed = (*committed).max(position.offset);
        }
        Ok(())
    }

    async fn nack(&self, records: &[ConsumedRecord]) -> Result<(), TransportError> {
        self.subscription()?;
        let mut cursors = self.cursors();
        for position in earliest_positions(records) {
            let offset = usize::try_from(position.offset).unwrap_or(0);
            let cursor = cursors.entry(position.topic).or_insert(offset);
            *cursor = (*cursor).min(offset);
        }
        Ok(())
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.store(true, Ordering::Release);
        self.broker.inner.appended.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn subscription(group_id: &str, topics: &[&str]) -> Subscription {
        Subscription {
            topics: topics.iter().map(|t| Topic::from(*t)).collect(),
            group_id: group_id.to_string(),
        }
    }

    fn record(topic: &str, payload: &str) -> Record {
        Record::new(Topic::from(topic), payload.as_bytes().to_vec())
    }

    #[tokio::test]
    async fn test_poll_returns_appended_records_in_order() {
        let broker = MemoryBroker::new();
        let producer = broker.producer();
        let mut consumer = broker.consumer();
        consumer.subscribe(&subscription("group", &["events"])).unwrap();

        for payload in ["a", "b", "c"] {
            producer.send(record("events", payload)).unwrap().await.unwrap();
        }

        let polled = consumer.poll(2).await.unwrap();
        assert_eq!(polled.len(), 2);
        assert_eq!(polled[0].record.payload, b"a");
        assert_eq!(polled[1].position.offset, 1);

        let polled = consumer.poll(10).await.unwrap();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].record.payload, b"c");
    }

    #[tokio::test]
    async fn test_poll_wakes_on_append() {
        let broker = MemoryBroker::new();
        let mut consumer = broker.consumer();
        consumer.subscribe(&subscription("group", &["events"])).unwrap();

        let producer = broker.producer();
        let sender = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            producer.send(record("events", "late")).unwrap().await
        });

        let polled = tokio::time::timeout(Duration::from_secs(2), consumer.poll(10))
            .await
            .expect("poll should wake up")
            .unwrap();
        assert_eq!(polled[0].record.payload, b"late");
        sender.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_commit_survives_resubscribe() {
        let broker = MemoryBroker::new();
        let producer = broker.producer();
        for payload in ["a", "b", "c"] {
            producer.send(record("events", payload)).unwrap().await.unwrap();
        }

        let mut first = broker.consumer();
        first.subscribe(&subscription("group", &["events"])).unwrap();
        let polled = first.poll(2).await.unwrap();
        first.commit(&polled).await.unwrap();
        assert_eq!(broker.committed_offset("group", &Topic::from("events")), Some(2));

        let mut second = broker.consumer();
        second.subscribe(&subscription("group", &["events"])).unwrap();
        let polled = second.poll(10).await.unwrap();
        assert_eq!(polled.len(), 1);
        assert_eq!(polled[0].record.payload, b"c");

        // another group starts from the beginning
        let mut other = broker.consumer();
        other.subscribe(&subscription("other", &["events"])).unwrap();
        assert_eq!(other.poll(10).await.unwrap().len(), 3);
    }

    #[tokio::test]
    async fn test_nack_rewinds() {
        let broker = MemoryBroker::new();
        let producer = broker.producer();
        for payload in ["a", "b"] {
            producer.send(record("events", payload)).unwrap().await.unwrap();
        }

        let mut consumer = broker.consumer();
        consumer.subscribe(&subscription("group", &["events"])).unwrap();
        let first = consumer.poll(10).await.unwrap();
        consumer.nack(&first).await.unwrap();
        let again = consumer.poll(10).await.unwrap();
        assert_eq!(first, again);
    }

    #[tokio::test]
    async fn test_injected_send_failures() {
        let broker = MemoryBroker::new();
        let producer = broker.producer();
        broker.fail_next_sends(1, TransportError::transient("broker unavailable"));

        let failed = producer.send(record("events", "a")).unwrap().await;
        assert_eq!(failed, Err(TransportError::transient("broker unavailable")));
        producer.send(record("events", "b")).unwrap().await.unwrap();

        let stored = broker.records(&Topic::from("events"));
        assert_eq!(stored.len(), 1);
        assert_eq!(stored[0].payload, b"b");
    }

    #[tokio::test]
    async fn test_unsubscribed_and_closed() {
        let broker = MemoryBroker::new();
        let consumer = broker.consumer();
        assert_eq!(consumer.poll(1).await, Err(TransportError::NotSubscribed));

        let producer = broker.producer();
        producer.close().await.unwrap();
        assert!(matches!(
            producer.send(record("events", "a")),
            Err(TransportError::Closed)
        ));
    }
}
