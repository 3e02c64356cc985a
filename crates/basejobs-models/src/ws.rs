//! Live channel (WebSocket) message types.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::event::EventMessage;
use crate::job::Room;

/// Messages sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Start receiving events for a room
    Subscribe { room: Room },

    /// Stop receiving events for a room
    Unsubscribe { room: Room },

    /// Application-level keepalive
    Ping,
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// A job event for one of the client's rooms
    Event {
        #[serde(flatten)]
        event: EventMessage,
    },

    /// Subscription acknowledged
    Subscribed { room: Room },

    /// Unsubscription acknowledged
    Unsubscribed { room: Room },

    /// Reply to a client ping
    Pong,

    /// Protocol error (unparseable message etc.)
    Error {
        message: String,
        timestamp: DateTime<Utc>,
    },
}

impl ServerMessage {
    /// Wrap a job event.
    pub fn event(event: EventMessage) -> Self {
        ServerMessage::Event { event }
    }

    /// Create an error message.
    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            timestamp: Utc::now(),
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            ServerMessage::Event { .. } => "event",
            ServerMessage::Subscribed { .. } => "subscribed",
            ServerMessage::Unsubscribed { .. } => "unsubscribed",
            ServerMessage::Pong => "pong",
            ServerMessage::Error { .. } => "error",
        }
    }
}
