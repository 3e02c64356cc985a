//! Live job status WebSocket with backpressure support.
//!
//! Clients join rooms with `{"type":"subscribe","room":...}` and then receive
//! every event of the jobs owned by those rooms. There is no replay; a
//! reconnecting client reads `GET /api/jobs/:jobId` and continues live.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::interval;
use tracing::{debug, info, warn};

use basejobs_models::{ClientMessage, ServerMessage};

use crate::gateway::{ClientId, LiveGateway};
use crate::metrics;
use crate::state::AppState;

const ENDPOINT: &str = "jobs";

/// Global counter for upgraded sockets, including ones not yet in a room.
static ACTIVE_WS_CONNECTIONS: AtomicI64 = AtomicI64::new(0);

/// Configuration for WebSocket backpressure.
const WS_SEND_BUFFER_SIZE: usize = 32;
const WS_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const WS_CLIENT_TIMEOUT: Duration = Duration::from_secs(60);

/// Send a WebSocket message with backpressure handling.
async fn send_ws_message(tx: &mpsc::Sender<Message>, msg: &ServerMessage) -> bool {
    let json = match serde_json::to_string(msg) {
        Ok(j) => j,
        Err(_) => return false,
    };
    metrics::record_ws_message_sent(ENDPOINT, msg.type_name());

    match tx.try_send(Message::Text(json)) {
        Ok(_) => true,
        Err(mpsc::error::TrySendError::Full(msg)) => {
            debug!("WebSocket send buffer full, applying backpressure");
            tx.send(msg).await.is_ok()
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

/// Live job status endpoint.
pub async fn ws_jobs(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    let gateway = state.gateway.clone();
    let send_timeout = state.config.ws_send_timeout;

    ws.on_failed_upgrade(|e| warn!(error = %e, "WebSocket upgrade failed"))
        .on_upgrade(move |socket| async move {
            let count = ACTIVE_WS_CONNECTIONS.fetch_add(1, Ordering::SeqCst) + 1;
            debug!(open_sockets = count, "WebSocket upgraded");
            metrics::record_ws_connection(ENDPOINT);

            handle_jobs_socket(socket, gateway, send_timeout).await;
            ACTIVE_WS_CONNECTIONS.fetch_sub(1, Ordering::SeqCst);
        })
}

/// Apply one client message and build the reply.
pub async fn handle_client_message(
    gateway: &LiveGateway,
    client_id: ClientId,
    text: &str,
) -> ServerMessage {
    let message: ClientMessage = match serde_json::from_str(text) {
        Ok(m) => m,
        Err(e) => return ServerMessage::error(format!("Invalid message: {}", e)),
    };

    match message {
        ClientMessage::Subscribe { room } => {
            if room.as_str().trim().is_empty() {
                return ServerMessage::error("Room must not be empty");
            }
            gateway.subscribe(client_id, room.clone()).await;
            ServerMessage::Subscribed { room }
        }
        ClientMessage::Unsubscribe { room } => {
            gateway.unsubscribe(client_id, &room).await;
            ServerMessage::Unsubscribed { room }
        }
        ClientMessage::Ping => ServerMessage::Pong,
    }
}

async fn handle_jobs_socket(socket: WebSocket, gateway: Arc<LiveGateway>, send_timeout: Duration) {
    let (ws_sender, mut receiver) = socket.split();

    // Create a bounded channel for backpressure
    let (tx, mut rx) = mpsc::channel::<Message>(WS_SEND_BUFFER_SIZE);

    let send_task = tokio::spawn(async move {
        let mut ws_sender = ws_sender;
        while let Some(msg) = rx.recv().await {
            match tokio::time::timeout(send_timeout, ws_sender.send(msg)).await {
                Ok(Ok(())) => {}
                Ok(Err(_)) => break,
                Err(_) => {
                    warn!("WebSocket write timed out, closing");
                    break;
                }
            }
        }
        let _ = tokio::time::timeout(send_timeout, ws_sender.close()).await;
    });

    let (client_id, mut events) = gateway.connect().await;
    info!(client_id, "Live status client connected");

    let mut heartbeat = interval(WS_HEARTBEAT_INTERVAL);
    heartbeat.tick().await;
    let mut last_activity = Instant::now();

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(msg) => {
                        if !send_ws_message(&tx, &msg).await {
                            warn!(client_id, "WebSocket send failed, client disconnected");
                            break;
                        }
                    }
                    None => {
                        // Dropped by the gateway as too slow
                        break;
                    }
                }
            }
            _ = heartbeat.tick() => {
                if last_activity.elapsed() > WS_CLIENT_TIMEOUT {
                    info!(client_id, "Live status client timed out");
                    break;
                }
                if tx.send(Message::Ping(vec![])).await.is_err() {
                    warn!(client_id, "Heartbeat failed, client disconnected");
                    break;
                }
            }
            client_msg = receiver.next() => {
                match client_msg {
                    Some(Ok(Message::Text(text))) => {
                        last_activity = Instant::now();
                        metrics::record_ws_message_received(ENDPOINT);
                        let reply = handle_client_message(&gateway, client_id, &text).await;
                        if !send_ws_message(&tx, &reply).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Binary(_))) => {
                        last_activity = Instant::now();
                        let reply = ServerMessage::error("Expected a JSON text message");
                        if !send_ws_message(&tx, &reply).await {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => {
                        last_activity = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(client_id, "Client closed connection");
                        break;
                    }
                    Some(Err(e)) => {
                        debug!(client_id, error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }

    gateway.disconnect(client_id).await;
    drop(tx);
    let _ = send_task.await;
    info!(client_id, "Live status client disconnected");
}
