//! Live status gateway.
//!
//! Every live client owns a bounded channel of [`ServerMessage`]s and a set of
//! rooms. A single relay task per process subscribes to the queue backend and
//! fans each event out to the clients whose rooms contain the event's owner
//! context. The relay never waits on a client: one whose buffer is full is
//! disconnected, and dropping its sender ends its socket task.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::StreamExt;
use tokio::sync::{mpsc, watch, RwLock};
use tracing::{debug, info, warn};

use basejobs_models::{EventMessage, Room, ServerMessage};
use basejobs_queue::SharedQueue;

use crate::metrics;

/// Identifier of one live connection.
pub type ClientId = u64;

/// Per-client buffer of outbound messages.
pub const CLIENT_BUFFER_SIZE: usize = 32;

const RESUBSCRIBE_BACKOFF_START: Duration = Duration::from_secs(1);
const RESUBSCRIBE_BACKOFF_MAX: Duration = Duration::from_secs(30);

struct Client {
    tx: mpsc::Sender<ServerMessage>,
    rooms: HashSet<Room>,
}

#[derive(Default)]
struct GatewayState {
    clients: HashMap<ClientId, Client>,
    rooms: HashMap<Room, HashSet<ClientId>>,
}

impl GatewayState {
    fn leave(&mut self, id: ClientId, room: &Room) {
        if let Some(members) = self.rooms.get_mut(room) {
            members.remove(&id);
            if members.is_empty() {
                self.rooms.remove(room);
            }
        }
    }
}

/// Room table plus the fan-out of bus events to live clients.
pub struct LiveGateway {
    state: RwLock<GatewayState>,
    next_id: AtomicU64,
}

impl LiveGateway {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(GatewayState::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a new client with no rooms.
    pub async fn connect(&self) -> (ClientId, mpsc::Receiver<ServerMessage>) {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER_SIZE);

        let mut state = self.state.write().await;
        state.clients.insert(
            id,
            Client {
                tx,
                rooms: HashSet::new(),
            },
        );
        metrics::set_ws_active_connections(state.clients.len() as i64);
        debug!(client_id = id, "Live client connected");
        (id, rx)
    }

    /// Add `room` to a client's room set. Returns false for unknown clients.
    pub async fn subscribe(&self, id: ClientId, room: Room) -> bool {
        let mut state = self.state.write().await;
        let Some(client) = state.clients.get_mut(&id) else {
            return false;
        };
        client.rooms.insert(room.clone());
        state.rooms.entry(room).or_default().insert(id);
        true
    }

    /// Remove `room` from a client's room set. Returns false for unknown clients.
    pub async fn unsubscribe(&self, id: ClientId, room: &Room) -> bool {
        let mut state = self.state.write().await;
        let Some(client) = state.clients.get_mut(&id) else {
            return false;
        };
        client.rooms.remove(room);
        state.leave(id, room);
        true
    }

    /// Drop a client and all its room memberships.
    pub async fn disconnect(&self, id: ClientId) {
        let mut state = self.state.write().await;
        let Some(client) = state.clients.remove(&id) else {
            return;
        };
        for room in &client.rooms {
            state.leave(id, room);
        }
        metrics::set_ws_active_connections(state.clients.len() as i64);
        debug!(client_id = id, "Live client disconnected");
    }

    pub async fn client_count(&self) -> usize {
        self.state.read().await.clients.len()
    }

    /// Number of rooms with at least one member.
    pub async fn room_count(&self) -> usize {
        self.state.read().await.rooms.len()
    }

    /// Rooms a client is currently in.
    pub async fn rooms_of(&self, id: ClientId) -> Vec<Room> {
        let state = self.state.read().await;
        let mut rooms: Vec<Room> = state
            .clients
            .get(&id)
            .map(|c| c.rooms.iter().cloned().collect())
            .unwrap_or_default();
        rooms.sort();
        rooms
    }

    /// Deliver one event to every client in its room.
    ///
    /// Returns the number of clients that received it. Clients that are gone
    /// or whose buffer is full are disconnected.
    pub async fn relay(&self, event: &EventMessage) -> usize {
        let targets: Vec<(ClientId, mpsc::Sender<ServerMessage>)> = {
            let state = self.state.read().await;
            match state.rooms.get(&event.owner_context) {
                Some(members) => members
                    .iter()
                    .filter_map(|id| state.clients.get(id).map(|c| (*id, c.tx.clone())))
                    .collect(),
                None => return 0,
            }
        };

        let message = ServerMessage::event(event.clone());
        let mut delivered = 0;
        let mut dropped = Vec::new();

        for (id, tx) in targets {
            match tx.try_send(message.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!(client_id = id, "Live client too slow, disconnecting");
                    metrics::record_ws_client_dropped("slow");
                    dropped.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => dropped.push(id),
            }
        }

        for id in dropped {
            self.disconnect(id).await;
        }

        metrics::record_ws_event_relayed(delivered);
        delivered
    }

    /// Relay backend events until `shutdown` flips to true.
    ///
    /// The subscription is reopened with backoff whenever it fails or ends.
    pub async fn run(self: Arc<Self>, queue: SharedQueue, mut shutdown: watch::Receiver<bool>) {
        let mut backoff = RESUBSCRIBE_BACKOFF_START;

        loop {
            if *shutdown.borrow() {
                break;
            }

            match queue.subscribe_events(Box::new(|_| true)).await {
                Ok(mut events) => {
                    info!("Live gateway subscribed to job events");
                    backoff = RESUBSCRIBE_BACKOFF_START;

                    loop {
                        tokio::select! {
                            event = events.next() => match event {
                                Some(event) => {
                                    self.relay(&event).await;
                                }
                                None => {
                                    warn!("Job event subscription ended");
                                    break;
                                }
                            },
                            _ = shutdown.changed() => {
                                events.close();
                                info!("Live gateway stopped");
                                return;
                            }
                        }
                    }
                }
                Err(e) => {
                    warn!(error = %e, backoff_secs = backoff.as_secs(), "Failed to subscribe to job events");
                }
            }

            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = shutdown.changed() => break,
            }
            backoff = (backoff * 2).min(RESUBSCRIBE_BACKOFF_MAX);
        }

        info!("Live gateway stopped");
    }
}

impl Default for LiveGateway {
    fn default() -> Self {
        Self::new()
    }
}
