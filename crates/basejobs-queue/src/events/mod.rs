//! Job event bus.

mod local;
mod redis;

use std::pin::Pin;
use std::task::{Context, Poll};

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};

use basejobs_models::EventMessage;

use crate::error::QueueResult;

pub use local::LocalEventBus;
pub use self::redis::RedisEventBus;

/// Unfiltered stream of bus events.
pub type EventStream = Pin<Box<dyn Stream<Item = EventMessage> + Send>>;

/// Filter applied to a subscription.
pub type EventPredicate = Box<dyn Fn(&EventMessage) -> bool + Send + Sync>;

#[async_trait]
pub trait EventBus: Send + Sync {
    /// Publish an event to every current subscriber.
    async fn publish(&self, event: &EventMessage) -> QueueResult<()>;

    /// Open a new subscription receiving every event published from now on.
    async fn subscribe(&self) -> QueueResult<EventStream>;
}

/// A filtered subscription to the event bus.
///
/// Dropping the subscription (or calling [`EventSubscription::close`])
/// unsubscribes; publishers and other subscribers are unaffected.
pub struct EventSubscription {
    inner: Option<EventStream>,
}

impl EventSubscription {
    pub fn new(stream: EventStream, predicate: EventPredicate) -> Self {
        let filtered = stream.filter(move |event| futures_util::future::ready(predicate(event)));
        Self {
            inner: Some(Box::pin(filtered)),
        }
    }

    /// Stop delivery. Further polls yield `None`.
    pub fn close(&mut self) {
        self.inner = None;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.is_none()
    }
}

impl Stream for EventSubscription {
    type Item = EventMessage;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        match self.inner.as_mut() {
            Some(stream) => stream.as_mut().poll_next(cx),
            None => Poll::Ready(None),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use basejobs_models::{Job, JobType, Room};
    use serde_json::json;

    #[tokio::test]
    async fn test_subscription_filters_and_closes() {
        let a = Job::new(JobType::Export, json!({}), Room::new("a"));
        let b = Job::new(JobType::Export, json!({}), Room::new("b"));
        let events = vec![EventMessage::progress(&b, 0.1), EventMessage::progress(&a, 0.2)];
        let stream: EventStream = Box::pin(futures_util::stream::iter(events));

        let mut sub = EventSubscription::new(
            stream,
            Box::new(|e: &EventMessage| e.owner_context.as_str() == "a"),
        );
        let first = sub.next().await.unwrap();
        assert_eq!(first.job_id, a.id);

        sub.close();
        assert!(sub.is_closed());
        assert!(sub.next().await.is_none());
    }
}
