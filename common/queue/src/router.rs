use crate::topic::Topic;

/// Picks the destination topic for an event.
///
/// Routing must be pure: the same event always maps to the same topic, so
/// retried batches land where the first attempt did. Any
/// `Fn(&E) -> Topic + Send + Sync` closure is a router.
pub trait TopicRouter<E>: Send + Sync {
    fn route(&self, event: &E) -> Topic;
}

impl<E, F> TopicRouter<E> for F
where
    F: Fn(&E) -> Topic + Send + Sync,
{
    fn route(&self, event: &E) -> Topic {
        self(event)
    }
}

/// Sends every event to the same topic.
#[derive(Debug, Clone)]
pub struct FixedTopic(pub Topic);

impl<E> TopicRouter<E> for FixedTopic {
    fn route(&self, _: &E) -> Topic {
        self.0.clone()
    }
}
