use async_trait::async_trait;
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio::sync::Mutex;
use tracing::{trace, warn};

use basejobs_models::EventMessage;

use super::{EventBus, EventStream};
use crate::error::QueueResult;

/// Events buffered per subscriber before it counts as stalled.
pub const SUBSCRIBER_BUFFER_SIZE: usize = 1024;

/// In-process event bus for the fallback backend.
///
/// Every subscriber owns a bounded channel and publishes never wait on it.
/// A subscriber whose buffer is full is dropped: its stream ends after the
/// events already buffered, so it never sees a gap in a job's sequence.
/// Channels whose receiver was dropped are pruned on the next publish.
#[derive(Debug)]
pub struct LocalEventBus {
    subscribers: Mutex<Vec<mpsc::Sender<EventMessage>>>,
    buffer_size: usize,
}

impl Default for LocalEventBus {
    fn default() -> Self {
        Self::with_buffer_size(SUBSCRIBER_BUFFER_SIZE)
    }
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_buffer_size(buffer_size: usize) -> Self {
        Self {
            subscribers: Mutex::new(Vec::new()),
            buffer_size: buffer_size.max(1),
        }
    }

    pub async fn subscriber_count(&self) -> usize {
        self.subscribers.lock().await.len()
    }
}

#[async_trait]
impl EventBus for LocalEventBus {
    async fn publish(&self, event: &EventMessage) -> QueueResult<()> {
        let mut subscribers = self.subscribers.lock().await;
        subscribers.retain(|tx| match tx.try_send(event.clone()) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(job_id = %event.job_id, "Dropping event subscriber with a full buffer");
                false
            }
            Err(TrySendError::Closed(_)) => false,
        });
        trace!(job_id = %event.job_id, kind = event.kind(), receivers = subscribers.len(), "Published event");
        Ok(())
    }

    async fn subscribe(&self) -> QueueResult<EventStream> {
        let (tx, rx) = mpsc::channel(self.buffer_size);
        self.subscribers.lock().await.push(tx);

        let stream = futures_util::stream::unfold(rx, |mut rx| async move {
            rx.recv().await.map(|event| (event, rx))
        });
        Ok(Box::pin(stream))
    }
}
