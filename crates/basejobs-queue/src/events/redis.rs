use async_trait::async_trait;
use futures_util::StreamExt;
use redis::AsyncCommands;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use basejobs_models::EventMessage;

use super::{EventBus, EventStream};
use crate::error::QueueResult;

/// Event bus over a Redis pub/sub channel shared by every process.
///
/// Publishes go through one cached multiplexed connection so events from a
/// job reach Redis, and therefore subscribers, in the order they were emitted.
pub struct RedisEventBus {
    client: redis::Client,
    channel: String,
    publisher: Mutex<Option<redis::aio::MultiplexedConnection>>,
}

impl RedisEventBus {
    pub fn new(client: redis::Client, channel: impl Into<String>) -> Self {
        Self {
            client,
            channel: channel.into(),
            publisher: Mutex::new(None),
        }
    }
}

#[async_trait]
impl EventBus for RedisEventBus {
    async fn publish(&self, event: &EventMessage) -> QueueResult<()> {
        let payload = serde_json::to_string(event)?;

        // Held across the publish to keep per-process ordering.
        let mut publisher = self.publisher.lock().await;
        let mut conn = match publisher.as_ref() {
            Some(conn) => conn.clone(),
            None => {
                let conn = self.client.get_multiplexed_async_connection().await?;
                *publisher = Some(conn.clone());
                conn
            }
        };

        if let Err(e) = conn.publish::<_, _, ()>(&self.channel, payload).await {
            // Reconnect on the next publish
            *publisher = None;
            return Err(e.into());
        }

        debug!(job_id = %event.job_id, kind = event.kind(), "Published event to {}", self.channel);
        Ok(())
    }

    async fn subscribe(&self) -> QueueResult<EventStream> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.subscribe(&self.channel).await?;

        let stream = pubsub.into_on_message().filter_map(|msg| async move {
            let payload: String = msg.get_payload().ok()?;
            match serde_json::from_str::<EventMessage>(&payload) {
                Ok(event) => Some(event),
                Err(e) => {
                    warn!("Dropping malformed event payload: {}", e);
                    None
                }
            }
        });

        Ok(Box::pin(stream))
    }
}
